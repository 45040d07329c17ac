//! Stage contract and the three standard stages.

use std::sync::Arc;

use async_trait::async_trait;

use super::context::MessageContext;
use super::errors::PipelineError;
use super::types::{InboundKind, Priority};

pub const PRE_PROCESS: &str = "pre_process";
pub const PROCESS: &str = "process";
pub const RESPOND: &str = "respond";

/// Timestamps below this are taken to be in seconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// One link in the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Run even after an earlier stage aborted the chain.
    fn always_run(&self) -> bool {
        false
    }

    async fn process(&self, ctx: &mut MessageContext) -> Result<(), PipelineError>;
}

/// Business logic behind the Process stage.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, ctx: &mut MessageContext) -> Result<(), PipelineError>;
}

// ─── PreProcess ─────────────────────────────────────────────────────────────

pub struct PreProcessStage;

#[async_trait]
impl Stage for PreProcessStage {
    fn name(&self) -> &str {
        PRE_PROCESS
    }

    async fn process(&self, ctx: &mut MessageContext) -> Result<(), PipelineError> {
        ctx.message.timestamp = Some(normalize_timestamp(ctx.message.timestamp));
        ctx.priority = classify(ctx.message.kind);

        tracing::debug!(
            channel = %ctx.channel_id(),
            kind = ?ctx.message.kind,
            response_id = %ctx.response_id,
            priority = ?ctx.priority,
            "inbound message"
        );
        Ok(())
    }
}

/// Epoch millis; missing or non-positive values become now.
pub fn normalize_timestamp(ts: Option<i64>) -> i64 {
    match ts {
        Some(ts) if ts > 0 && ts < MILLIS_THRESHOLD => ts * 1000,
        Some(ts) if ts > 0 => ts,
        _ => chrono::Utc::now().timestamp_millis(),
    }
}

/// User-initiated turns interrupt ongoing output; bookkeeping never does.
pub fn classify(kind: InboundKind) -> Priority {
    match kind {
        InboundKind::UserInput | InboundKind::FileUpload | InboundKind::CommandExecute => {
            Priority::High
        }
        InboundKind::TapEvent | InboundKind::PluginMessage => Priority::Normal,
        InboundKind::ToolConfirmResponse
        | InboundKind::PluginResponse
        | InboundKind::PluginStatus
        | InboundKind::ModelInfo
        | InboundKind::CharacterInfo
        | InboundKind::Unknown => Priority::Low,
    }
}

// ─── Process ────────────────────────────────────────────────────────────────

pub struct ProcessStage {
    dispatcher: Arc<dyn Dispatcher>,
}

impl ProcessStage {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Stage for ProcessStage {
    fn name(&self) -> &str {
        PROCESS
    }

    async fn process(&self, ctx: &mut MessageContext) -> Result<(), PipelineError> {
        self.dispatcher.dispatch(ctx).await
    }
}

// ─── Respond ────────────────────────────────────────────────────────────────

/// Flushes buffered replies. Runs even when the chain was aborted, so a
/// recorded fault still reaches the client.
pub struct RespondStage;

#[async_trait]
impl Stage for RespondStage {
    fn name(&self) -> &str {
        RESPOND
    }

    fn always_run(&self) -> bool {
        true
    }

    async fn process(&self, ctx: &mut MessageContext) -> Result<(), PipelineError> {
        if let Some(error) = ctx.error().map(str::to_string) {
            ctx.add_dialogue(format!("Sorry, something went wrong: {error}"));
        }

        let replies = ctx.take_replies();
        let mut delivered = 0;
        for reply in replies {
            if !ctx.channel.send(reply) {
                return Err(PipelineError::ChannelClosed {
                    channel: ctx.channel_id().to_string(),
                });
            }
            delivered += 1;
        }
        ctx.record_flushed(delivered);

        if ctx.error().is_some() || delivered > 0 {
            tracing::debug!(response_id = %ctx.response_id, delivered, "replies flushed");
        }
        Ok(())
    }
}
