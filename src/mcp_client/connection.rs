//! Opening a server connection and running the MCP handshake.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::errors::McpError;
use super::sse::SseTransport;
use super::transport::{StdioTransport, Transport};
use super::types::{
    InitializeResult, McpServerConfig, McpToolDefinition, ToolsListResult, TransportKind,
    PROTOCOL_VERSION,
};

/// Timeout for the whole handshake (`initialize` + `tools/list`).
///
/// Generous because some servers import large frameworks at startup.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens raw transports for server configs.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, config: &McpServerConfig) -> Result<Arc<dyn Transport>, McpError>;
}

/// Spawns stdio servers and dials SSE servers.
pub struct ProcessConnector;

#[async_trait]
impl Connector for ProcessConnector {
    async fn open(&self, config: &McpServerConfig) -> Result<Arc<dyn Transport>, McpError> {
        match config.transport {
            TransportKind::Stdio => Ok(Arc::new(StdioTransport::spawn(config)?)),
            TransportKind::Sse => {
                let url = config.url.as_deref().ok_or_else(|| McpError::ConfigError {
                    reason: format!("server '{}' has no url", config.name),
                })?;
                Ok(Arc::new(SseTransport::connect(&config.name, url).await?))
            }
        }
    }
}

/// A connected server: its transport and the tools it offered.
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub tools: Vec<McpToolDefinition>,
}

/// Open a transport and run `initialize`, `notifications/initialized` and
/// `tools/list`. On failure the transport is closed and server stderr, if
/// any, is folded into the error.
pub async fn establish(
    connector: &dyn Connector,
    config: &McpServerConfig,
) -> Result<Connection, McpError> {
    let transport = connector.open(config).await?;

    match tokio::time::timeout(INIT_TIMEOUT, handshake(transport.as_ref(), &config.name)).await {
        Ok(Ok(tools)) => Ok(Connection { transport, tools }),
        Ok(Err(e)) => Err(fail(transport, &config.name, e.to_string()).await),
        Err(_) => {
            let reason = format!("initialization timed out after {}s", INIT_TIMEOUT.as_secs());
            Err(fail(transport, &config.name, reason).await)
        }
    }
}

async fn fail(transport: Arc<dyn Transport>, name: &str, reason: String) -> McpError {
    let stderr = transport.diagnostics().await;
    transport.close().await;
    let reason = match stderr {
        Some(stderr) => {
            tracing::warn!(server = %name, stderr = %stderr, "server stderr captured on failure");
            format!("{reason} | stderr: {stderr}")
        }
        None => reason,
    };
    McpError::InitFailed {
        name: name.to_string(),
        reason,
    }
}

async fn handshake(
    transport: &dyn Transport,
    server_name: &str,
) -> Result<Vec<McpToolDefinition>, McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "deskpet-agent",
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let result = transport.request("initialize", Some(params)).await?;
    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::InitFailed {
            name: server_name.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    if let Some(info) = &init.server_info {
        tracing::debug!(
            server = %server_name,
            remote_name = ?info.name,
            remote_version = ?info.version,
            protocol = ?init.protocol_version,
            "MCP server initialized"
        );
    }

    transport.notify("notifications/initialized", None).await?;

    let listed = transport.request("tools/list", None).await?;
    let list: ToolsListResult =
        serde_json::from_value(listed).map_err(|e| McpError::InitFailed {
            name: server_name.to_string(),
            reason: format!("failed to parse tools/list response: {e}"),
        })?;
    Ok(list.tools)
}
