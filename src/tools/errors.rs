//! Tool registry error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    /// No enabled tool with this name or id.
    #[error("unknown tool: '{name}'")]
    NotFound { name: String },

    /// Another enabled tool already exposes this name to the model.
    #[error("tool name '{name}' is already registered as '{existing_id}'")]
    DuplicateName { name: String, existing_id: String },

    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("tool '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// The handler ran and reported failure.
    #[error("tool '{tool}' failed: {reason}")]
    ExecutionFailed { tool: String, reason: String },

    #[error("Tool '{tool}' was rejected by the user.")]
    Rejected { tool: String },

    /// Mirroring to durable storage failed.
    #[error("tool storage error: {reason}")]
    Storage { reason: String },
}

impl ToolError {
    pub fn failed(tool: &str, reason: impl Into<String>) -> Self {
        ToolError::ExecutionFailed {
            tool: tool.to_string(),
            reason: reason.into(),
        }
    }
}
