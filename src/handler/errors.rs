//! Handler error types.

use thiserror::Error;

use crate::agent_core::AgentError;
use crate::pipeline::{PipelineError, PROCESS};
use crate::providers::ProviderError;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("unknown command: '{name}'")]
    UnknownCommand { name: String },

    #[error("command '{name}' is already registered")]
    DuplicateCommand { name: String },

    #[error("command '{name}' failed: {reason}")]
    CommandFailed { name: String, reason: String },

    /// A client message is missing a field the handler needs.
    #[error("invalid {kind} message: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error(transparent)]
    Storage(#[from] AgentError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl HandlerError {
    pub fn payload(kind: &str, reason: impl Into<String>) -> Self {
        HandlerError::InvalidPayload {
            kind: kind.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<HandlerError> for PipelineError {
    fn from(e: HandlerError) -> Self {
        PipelineError::stage(PROCESS, e.to_string())
    }
}
