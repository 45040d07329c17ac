//! The ordered, editable stage chain.

use std::sync::{Arc, RwLock};

use super::context::MessageContext;
use super::errors::PipelineError;
use super::stages::{Dispatcher, PreProcessStage, ProcessStage, RespondStage, Stage};
use crate::sync::{read, write};

pub struct Pipeline {
    stages: RwLock<Vec<Arc<dyn Stage>>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self {
            stages: RwLock::new(stages),
        }
    }

    /// PreProcess, Process (backed by `dispatcher`), Respond.
    pub fn standard(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self::new(vec![
            Arc::new(PreProcessStage),
            Arc::new(ProcessStage::new(dispatcher)),
            Arc::new(RespondStage),
        ])
    }

    pub fn stage_names(&self) -> Vec<String> {
        read(&self.stages)
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    pub fn insert_before(&self, anchor: &str, stage: Arc<dyn Stage>) -> Result<(), PipelineError> {
        self.insert_at(anchor, stage, 0)
    }

    pub fn insert_after(&self, anchor: &str, stage: Arc<dyn Stage>) -> Result<(), PipelineError> {
        self.insert_at(anchor, stage, 1)
    }

    fn insert_at(&self, anchor: &str, stage: Arc<dyn Stage>, offset: usize) -> Result<(), PipelineError> {
        let mut stages = write(&self.stages);
        if stages.iter().any(|s| s.name() == stage.name()) {
            return Err(PipelineError::DuplicateStage {
                name: stage.name().to_string(),
            });
        }
        let index = stages
            .iter()
            .position(|s| s.name() == anchor)
            .ok_or_else(|| PipelineError::UnknownStage {
                name: anchor.to_string(),
            })?;
        tracing::debug!(stage = %stage.name(), anchor = %anchor, "stage inserted");
        stages.insert(index + offset, stage);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut stages = write(&self.stages);
        let before = stages.len();
        stages.retain(|s| s.name() != name);
        stages.len() != before
    }

    /// Run every stage over `ctx`.
    ///
    /// A stage error is recorded on the context and aborts the chain; stages
    /// marked `always_run` still execute afterwards.
    pub async fn run(&self, ctx: &mut MessageContext) {
        let stages: Vec<Arc<dyn Stage>> = read(&self.stages).clone();

        for stage in stages {
            if ctx.is_aborted() && !stage.always_run() {
                tracing::debug!(stage = %stage.name(), "skipped after abort");
                continue;
            }
            if let Err(e) = stage.process(ctx).await {
                tracing::warn!(
                    stage = %stage.name(),
                    channel = %ctx.channel_id(),
                    error = %e,
                    "stage failed"
                );
                ctx.set_error(e.to_string());
                ctx.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::pipeline::stages::{PROCESS, RESPOND};
    use crate::pipeline::types::{ClientChannel, InboundKind, InboundMessage, OutboundKind};

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl Stage for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn process(&self, _ctx: &mut MessageContext) -> Result<(), PipelineError> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                return Err(PipelineError::stage(self.name, "model unavailable"));
            }
            Ok(())
        }
    }

    struct Echo;

    #[async_trait]
    impl Dispatcher for Echo {
        async fn dispatch(&self, ctx: &mut MessageContext) -> Result<(), PipelineError> {
            let text = ctx.message.text.clone().unwrap_or_default();
            ctx.add_dialogue(format!("echo: {text}"));
            Ok(())
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>, fail: bool) -> Arc<dyn Stage> {
        Arc::new(Recorder {
            name,
            log: log.clone(),
            fail,
        })
    }

    #[tokio::test]
    async fn test_standard_pipeline_flushes_replies() {
        let pipeline = Pipeline::standard(Arc::new(Echo));
        let (channel, mut rx) = ClientChannel::pair("ch1");
        let mut ctx = MessageContext::new(InboundMessage::user_input("hi"), channel);

        pipeline.run(&mut ctx).await;

        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.kind, OutboundKind::Dialogue);
        assert_eq!(reply.text.as_deref(), Some("echo: hi"));
        assert_eq!(reply.response_id, ctx.response_id);
        assert!(ctx.message.timestamp.is_some());
    }

    #[tokio::test]
    async fn test_insert_before_after_and_remove() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::standard(Arc::new(Echo));
        pipeline
            .insert_before(PROCESS, recorder("guard", &log, false))
            .unwrap();
        pipeline
            .insert_after(PROCESS, recorder("audit", &log, false))
            .unwrap();
        assert_eq!(
            pipeline.stage_names(),
            vec!["pre_process", "guard", "process", "audit", "respond"]
        );

        assert!(matches!(
            pipeline.insert_after("missing", recorder("x", &log, false)),
            Err(PipelineError::UnknownStage { .. })
        ));
        assert!(matches!(
            pipeline.insert_after(PROCESS, recorder("guard", &log, false)),
            Err(PipelineError::DuplicateStage { .. })
        ));

        assert!(pipeline.remove("audit"));
        assert!(!pipeline.remove("audit"));
    }

    #[tokio::test]
    async fn test_failure_skips_later_stages_but_respond_runs() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::standard(Arc::new(Echo));
        pipeline
            .insert_before(PROCESS, recorder("broken", &log, true))
            .unwrap();
        pipeline
            .insert_before(RESPOND, recorder("after", &log, false))
            .unwrap();

        let (channel, mut rx) = ClientChannel::pair("ch1");
        let mut ctx = MessageContext::new(InboundMessage::new(InboundKind::UserInput), channel);
        pipeline.run(&mut ctx).await;

        assert_eq!(*log.lock().unwrap(), vec!["broken"]);
        let reply = rx.try_recv().unwrap();
        assert!(reply.text.unwrap().contains("model unavailable"));
        assert!(rx.try_recv().is_err());
    }
}
