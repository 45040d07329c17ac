//! Agent core error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Database operation failed.
    #[error("database error: {reason}")]
    DatabaseError { reason: String },

    #[error("conversation not found: '{conversation_id}'")]
    ConversationNotFound { conversation_id: String },

    /// A stored row could not be decoded.
    #[error("corrupt record in '{table}': {reason}")]
    CorruptRecord { table: String, reason: String },

    #[error("serialization error: {reason}")]
    SerializationError { reason: String },
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::DatabaseError {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::SerializationError {
            reason: e.to_string(),
        }
    }
}
