//! JSON-RPC transports.
//!
//! [`Transport`] is the seam between the client and a live connection. The
//! stdio implementation speaks line-delimited JSON over a child process's
//! stdin/stdout; the SSE implementation lives in `sse.rs`.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::types::{
    error_codes, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, McpServerConfig,
};

/// Grace period for a server to exit after stdin closes.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest stderr excerpt attached to a failure.
const STDERR_MAX_BYTES: usize = 2000;

// ─── Request ID Generator ───────────────────────────────────────────────────

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ──────────────────────────────────────────────────────────────

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and return its `result`.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError>;

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), McpError>;

    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// Server-side diagnostics (captured stderr) to attach to a failure.
    async fn diagnostics(&self) -> Option<String> {
        None
    }
}

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Stdio ──────────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    writer: Mutex<ChildStdin>,
    reader: Mutex<BufReader<ChildStdout>>,
    stderr: Mutex<Option<ChildStderr>>,
    child: Mutex<Child>,
    closed: AtomicBool,
}

impl StdioTransport {
    /// Spawn the configured command with piped stdio.
    pub fn spawn(config: &McpServerConfig) -> Result<Self, McpError> {
        let name = config.name.as_str();
        let program = config
            .command
            .as_ref()
            .and_then(|c| c.resolve())
            .ok_or_else(|| McpError::SpawnFailed {
                name: name.to_string(),
                reason: "no command for this platform".into(),
            })?;

        let mut cmd = Command::new(program);
        cmd.args(&config.args);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &config.working_directory {
            cmd.current_dir(dir);
        }

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{program}: {e}"),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take();

        tracing::debug!(server = %name, program = %program, pid = ?child.id(), "spawned MCP server");

        Ok(Self {
            server_name: name.to_string(),
            writer: Mutex::new(stdin),
            reader: Mutex::new(BufReader::new(stdout)),
            stderr: Mutex::new(stderr),
            child: Mutex::new(child),
            closed: AtomicBool::new(false),
        })
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }

    async fn write_line(&self, json: String) -> Result<(), McpError> {
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        result.map_err(|e| {
            self.closed.store(true, Ordering::SeqCst);
            self.transport_error(format!("failed to write to stdin: {e}"))
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        if self.is_closed() {
            return Err(self.transport_error("transport is closed".into()));
        }

        let id = next_request_id();
        let json = serde_json::to_string(&JsonRpcRequest::new(id, method, params))
            .map_err(|e| self.transport_error(format!("failed to serialize request: {e}")))?;
        self.write_line(json).await?;

        let mut line_buf = String::new();
        let mut reader = self.reader.lock().await;

        loop {
            line_buf.clear();
            let bytes_read = reader.read_line(&mut line_buf).await.map_err(|e| {
                self.closed.store(true, Ordering::SeqCst);
                self.transport_error(format!("failed to read from stdout: {e}"))
            })?;

            if bytes_read == 0 {
                self.closed.store(true, Ordering::SeqCst);
                return Err(self.transport_error(
                    "server stdout closed (process may have exited)".into(),
                ));
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            // Stale responses (from timed-out requests), server notifications
            // and stray log lines are skipped.
            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == Some(id) => return extract_result(resp),
                Ok(_) => continue,
                Err(_) => {
                    tracing::trace!(server = %self.server_name, line = %trimmed, "non-JSON-RPC output");
                    continue;
                }
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(self.transport_error("transport is closed".into()));
        }
        let json = serde_json::to_string(&JsonRpcNotification::new(method, params))
            .map_err(|e| self.transport_error(format!("failed to serialize notification: {e}")))?;
        self.write_line(json).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }

        let mut child = self.child.lock().await;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.server_name, %status, "MCP server exited");
            }
            _ => {
                tracing::warn!(server = %self.server_name, "MCP server did not exit, killing");
                let _ = child.kill().await;
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn diagnostics(&self) -> Option<String> {
        let mut stderr = self.stderr.lock().await.take()?;
        let mut buf = Vec::new();
        let _ = tokio::time::timeout(Duration::from_millis(500), stderr.read_to_end(&mut buf)).await;
        if buf.is_empty() {
            return None;
        }
        let mut text = String::from_utf8_lossy(&buf).trim().to_string();
        if text.len() > STDERR_MAX_BYTES {
            text = crate::agent_core::tokens::truncate_utf8(&text, STDERR_MAX_BYTES).to_string();
            text.push_str("...(truncated)");
        }
        Some(text)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::types::JsonRpcError;

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            id: Some(1),
            result: None,
            error: Some(JsonRpcError {
                code: error_codes::METHOD_NOT_FOUND,
                message: "Method not found".into(),
                data: None,
            }),
        };
        match extract_result(resp).unwrap_err() {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, error_codes::METHOD_NOT_FOUND);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            id: Some(1),
            result: None,
            error: None,
        };
        assert!(matches!(
            extract_result(resp),
            Err(McpError::ServerError { .. })
        ));
    }

    #[test]
    fn test_spawn_without_command_fails() {
        let mut config = McpServerConfig::stdio("broken", "x", &[]);
        config.command = None;
        assert!(matches!(
            StdioTransport::spawn(&config),
            Err(McpError::SpawnFailed { .. })
        ));
    }
}
