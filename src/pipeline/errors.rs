//! Pipeline error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The raw frame is not a message envelope.
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    #[error("no stage named '{name}'")]
    UnknownStage { name: String },

    #[error("a stage named '{name}' already exists")]
    DuplicateStage { name: String },

    /// A stage gave up on the message. `reason` is shown to the user.
    #[error("{reason}")]
    StageFailed { stage: String, reason: String },

    #[error("channel '{channel}' is closed")]
    ChannelClosed { channel: String },
}

impl PipelineError {
    pub fn stage(stage: &str, reason: impl Into<String>) -> Self {
        PipelineError::StageFailed {
            stage: stage.to_string(),
            reason: reason.into(),
        }
    }
}
