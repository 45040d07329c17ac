//! Provider error types.
//!
//! Carries enough context for structured logging at the call site; the
//! handler turns any of these into a user-visible error reply.

use thiserror::Error;

/// Errors raised by provider instances and the provider registry.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// No provider kind registered under this name.
    #[error("unknown provider kind: '{kind}'")]
    UnknownKind { kind: String },

    /// No instance with this id.
    #[error("provider instance not found: '{instance_id}'")]
    InstanceNotFound { instance_id: String },

    /// An instance with this id already exists.
    #[error("provider instance already exists: '{instance_id}'")]
    DuplicateInstance { instance_id: String },

    /// Instance configuration failed schema validation.
    #[error("invalid config for '{instance_id}': {reason}")]
    InvalidConfig { instance_id: String, reason: String },

    /// The instance is disabled and will not be connected.
    #[error("provider instance '{instance_id}' is disabled")]
    Disabled { instance_id: String },

    /// The instance belongs to a different family than requested.
    #[error("provider instance '{instance_id}' is not a {expected} provider")]
    WrongFamily { instance_id: String, expected: String },

    /// `initialize()` failed; the instance is now in `error` status.
    #[error("provider '{instance_id}' failed to initialize: {reason}")]
    InitFailed { instance_id: String, reason: String },

    /// TCP/HTTP connection to the vendor endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The endpoint did not answer in time.
    #[error("provider timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// SSE stream parsing or chunk-level error.
    #[error("stream error: {reason}")]
    StreamError { reason: String },

    /// The response body could not be interpreted.
    #[error("malformed response: {reason}")]
    MalformedResponse { reason: String },

    /// The provider does not implement this operation.
    #[error("operation not supported: {operation}")]
    Unsupported { operation: String },
}

impl ProviderError {
    /// Map a `reqwest` send failure the way every HTTP provider does.
    pub(crate) fn from_reqwest(endpoint: &str, err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout {
                duration_secs: timeout_secs,
            }
        } else {
            ProviderError::ConnectionFailed {
                endpoint: endpoint.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = ProviderError::InvalidConfig {
            instance_id: "openai-main".into(),
            reason: "missing required field 'base_url'".into(),
        };
        let text = err.to_string();
        assert!(text.contains("openai-main"));
        assert!(text.contains("base_url"));
    }
}
