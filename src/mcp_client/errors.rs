//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// I/O or framing failure; the connection is no longer usable.
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("server '{server}' did not answer '{method}' within {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    #[error("server '{name}' is not connected")]
    NotConnected { name: String },

    #[error("unknown server: '{name}'")]
    UnknownServer { name: String },

    #[error("server '{name}' is already configured")]
    DuplicateServer { name: String },

    /// Configuration error (bad server record, unreadable list file).
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl McpError {
    /// Whether the failure means the connection itself is gone, so a
    /// reconnect may help.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            McpError::TransportError { .. } | McpError::NotConnected { .. }
        )
    }
}
