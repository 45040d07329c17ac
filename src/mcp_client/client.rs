//! MCP Client: one connection per configured server, bridged into the
//! shared [`ToolRegistry`].
//!
//! Every tool a server lists on connect becomes an `mcp`-sourced tool whose
//! handler forwards `tools/call` to the live connection. A call that finds
//! the connection gone reconnects once and retries before failing.
//! Disconnecting a server unregisters all of its tools in one step.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;

use super::connection::{establish, Connector, ProcessConnector};
use super::errors::McpError;
use super::transport::Transport;
use super::types::{CallToolResult, McpServerConfig};
use crate::sync::{read, write};
use crate::tools::{ToolError, ToolHandler, ToolRegistry, ToolSource, ToolSpec};

/// Timeout for one `tools/call` round-trip.
const CALL_TIMEOUT: Duration = Duration::from_secs(60);

// ─── Status ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerStatus {
    pub name: String,
    pub enabled: bool,
    pub connected: bool,
    pub tool_count: usize,
}

// ─── McpClient ──────────────────────────────────────────────────────────────

struct LiveServer {
    transport: Arc<dyn Transport>,
    tool_ids: Vec<String>,
}

struct Inner {
    tools: Arc<ToolRegistry>,
    connector: Arc<dyn Connector>,
    configs: RwLock<Vec<McpServerConfig>>,
    live: RwLock<HashMap<String, LiveServer>>,
    /// Serializes connect, reconnect and disconnect.
    lifecycle: tokio::sync::Mutex<()>,
}

/// Cheap to clone; all clones share the same connections.
#[derive(Clone)]
pub struct McpClient {
    inner: Arc<Inner>,
}

impl McpClient {
    pub fn new(tools: Arc<ToolRegistry>, configs: Vec<McpServerConfig>) -> Self {
        Self::with_connector(tools, configs, Arc::new(ProcessConnector))
    }

    pub fn with_connector(
        tools: Arc<ToolRegistry>,
        configs: Vec<McpServerConfig>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tools,
                connector,
                configs: RwLock::new(configs),
                live: RwLock::new(HashMap::new()),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    // ─── Configuration ──────────────────────────────────────────────────

    pub fn configs(&self) -> Vec<McpServerConfig> {
        read(&self.inner.configs).clone()
    }

    fn config(&self, name: &str) -> Result<McpServerConfig, McpError> {
        read(&self.inner.configs)
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| McpError::UnknownServer {
                name: name.to_string(),
            })
    }

    /// Add a server record. It is connected when enabled and auto-start.
    pub async fn add_server(&self, config: McpServerConfig) -> Result<(), McpError> {
        config
            .validate()
            .map_err(|reason| McpError::ConfigError { reason })?;
        {
            let mut configs = write(&self.inner.configs);
            if configs.iter().any(|c| c.name == config.name) {
                return Err(McpError::DuplicateServer { name: config.name });
            }
            configs.push(config.clone());
        }
        if config.enabled && config.auto_start {
            self.connect(&config.name).await?;
        }
        Ok(())
    }

    /// Disconnect and forget a server.
    pub async fn remove_server(&self, name: &str) -> Result<(), McpError> {
        self.disconnect(name).await;
        let mut configs = write(&self.inner.configs);
        let before = configs.len();
        configs.retain(|c| c.name != name);
        if configs.len() == before {
            return Err(McpError::UnknownServer {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Enable or disable a server. Disabling disconnects it.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), McpError> {
        {
            let mut configs = write(&self.inner.configs);
            let config = configs
                .iter_mut()
                .find(|c| c.name == name)
                .ok_or_else(|| McpError::UnknownServer {
                    name: name.to_string(),
                })?;
            config.enabled = enabled;
        }
        if !enabled {
            self.disconnect(name).await;
        }
        Ok(())
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Connect a server and register its tools. Already-connected servers
    /// are left as they are.
    pub async fn connect(&self, name: &str) -> Result<usize, McpError> {
        let config = self.config(name)?;
        if !config.enabled {
            return Err(McpError::ConfigError {
                reason: format!("server '{name}' is disabled"),
            });
        }

        let _guard = self.inner.lifecycle.lock().await;
        let existing = read(&self.inner.live)
            .get(name)
            .filter(|l| !l.transport.is_closed())
            .map(|l| l.tool_ids.len());
        if let Some(count) = existing {
            return Ok(count);
        }
        self.connect_locked(&config).await.map(|(_, count)| count)
    }

    /// Connect every enabled auto-start server. Failures are logged and
    /// returned; they never stop the others.
    pub async fn connect_all_auto(&self) -> Vec<(String, McpError)> {
        let names: Vec<String> = read(&self.inner.configs)
            .iter()
            .filter(|c| c.enabled && c.auto_start)
            .map(|c| c.name.clone())
            .collect();

        let results =
            futures::future::join_all(names.iter().map(|name| self.connect(name))).await;

        let mut errors = Vec::new();
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(count) => tracing::info!(server = %name, tools = count, "MCP server connected"),
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "MCP server failed to start");
                    errors.push((name, e));
                }
            }
        }
        errors
    }

    /// Close a server's connection and unregister its tools.
    pub async fn disconnect(&self, name: &str) -> bool {
        let _guard = self.inner.lifecycle.lock().await;
        let live = write(&self.inner.live).remove(name);
        let unregistered = self.inner.tools.unregister_mcp_server(name);
        match live {
            Some(live) => {
                live.transport.close().await;
                tracing::info!(server = %name, tools = unregistered.len(), "MCP server disconnected");
                true
            }
            None => false,
        }
    }

    pub async fn shutdown_all(&self) {
        let names: Vec<String> = read(&self.inner.live).keys().cloned().collect();
        for name in names {
            self.disconnect(&name).await;
        }
    }

    /// Caller holds the lifecycle lock.
    async fn connect_locked(
        &self,
        config: &McpServerConfig,
    ) -> Result<(Arc<dyn Transport>, usize), McpError> {
        let name = config.name.as_str();
        let stale = write(&self.inner.live).remove(name);
        if let Some(stale) = stale {
            stale.transport.close().await;
        }
        self.inner.tools.unregister_mcp_server(name);

        let connection = establish(self.inner.connector.as_ref(), config).await?;

        let mut tool_ids = Vec::with_capacity(connection.tools.len());
        for tool in &connection.tools {
            let spec = ToolSpec {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.input_schema.clone(),
                source: ToolSource::Mcp,
                owner: Some(name.to_string()),
                timeout: Some(CALL_TIMEOUT * 2 + Duration::from_secs(5)),
            };
            let handler = Arc::new(McpToolHandler {
                client: Arc::downgrade(&self.inner),
                server: name.to_string(),
                tool: tool.name.clone(),
            });
            match self.inner.tools.register(spec, handler) {
                Ok(def) => tool_ids.push(def.id),
                Err(e) => {
                    tracing::warn!(server = %name, tool = %tool.name, error = %e, "skipping MCP tool");
                }
            }
        }

        let count = tool_ids.len();
        let transport = Arc::clone(&connection.transport);
        write(&self.inner.live).insert(
            name.to_string(),
            LiveServer {
                transport: connection.transport,
                tool_ids,
            },
        );
        Ok((transport, count))
    }

    // ─── Tool Calls ─────────────────────────────────────────────────────

    /// Call a tool on a server, reconnecting once if the connection was
    /// lost.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, McpError> {
        let transport = self.transport(server)?;
        let params = serde_json::json!({ "name": tool, "arguments": arguments });

        match call_once(transport.as_ref(), server, params.clone()).await {
            Err(e) if e.is_connection_lost() => {
                tracing::warn!(server = %server, tool = %tool, error = %e, "MCP connection lost, reconnecting");
                let transport = self.reconnect(server, &transport).await?;
                call_once(transport.as_ref(), server, params).await
            }
            other => other,
        }
    }

    fn transport(&self, server: &str) -> Result<Arc<dyn Transport>, McpError> {
        read(&self.inner.live)
            .get(server)
            .map(|l| Arc::clone(&l.transport))
            .ok_or_else(|| McpError::NotConnected {
                name: server.to_string(),
            })
    }

    /// Replace `failed` with a fresh connection, unless another caller
    /// already did. Servers disconnected on purpose stay disconnected.
    async fn reconnect(
        &self,
        server: &str,
        failed: &Arc<dyn Transport>,
    ) -> Result<Arc<dyn Transport>, McpError> {
        let _guard = self.inner.lifecycle.lock().await;
        let current = read(&self.inner.live)
            .get(server)
            .map(|l| Arc::clone(&l.transport));
        match current {
            None => Err(McpError::NotConnected {
                name: server.to_string(),
            }),
            Some(current) if !Arc::ptr_eq(&current, failed) && !current.is_closed() => Ok(current),
            Some(_) => {
                let config = self.config(server)?;
                self.connect_locked(&config).await.map(|(transport, _)| transport)
            }
        }
    }

    // ─── Status ─────────────────────────────────────────────────────────

    pub fn is_connected(&self, name: &str) -> bool {
        read(&self.inner.live)
            .get(name)
            .is_some_and(|l| !l.transport.is_closed())
    }

    pub fn status(&self) -> Vec<McpServerStatus> {
        let live = read(&self.inner.live);
        read(&self.inner.configs)
            .iter()
            .map(|c| {
                let server = live.get(&c.name);
                McpServerStatus {
                    name: c.name.clone(),
                    enabled: c.enabled,
                    connected: server.is_some_and(|l| !l.transport.is_closed()),
                    tool_count: server.map(|l| l.tool_ids.len()).unwrap_or(0),
                }
            })
            .collect()
    }

    // ─── Persistence ────────────────────────────────────────────────────

    pub fn save_configs(&self, path: &Path) -> Result<(), McpError> {
        save_server_configs(path, &self.configs())
    }
}

async fn call_once(
    transport: &dyn Transport,
    server: &str,
    params: serde_json::Value,
) -> Result<CallToolResult, McpError> {
    let result = tokio::time::timeout(CALL_TIMEOUT, transport.request("tools/call", Some(params)))
        .await
        .map_err(|_| McpError::Timeout {
            server: server.to_string(),
            method: "tools/call".into(),
            timeout_ms: CALL_TIMEOUT.as_millis() as u64,
        })??;
    serde_json::from_value(result).map_err(|e| McpError::TransportError {
        server: server.to_string(),
        reason: format!("malformed tools/call result: {e}"),
    })
}

// ─── Tool Handler ───────────────────────────────────────────────────────────

/// Forwards a registry call to the owning server. Holds the client weakly so
/// registered tools do not keep a shut-down client alive.
struct McpToolHandler {
    client: Weak<Inner>,
    server: String,
    tool: String,
}

#[async_trait]
impl ToolHandler for McpToolHandler {
    async fn call(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let inner = self
            .client
            .upgrade()
            .ok_or_else(|| ToolError::failed(&self.tool, "MCP client has shut down"))?;
        let client = McpClient { inner };

        let result = client
            .call_tool(&self.server, &self.tool, arguments)
            .await
            .map_err(|e| ToolError::failed(&self.tool, e.to_string()))?;

        if result.is_error {
            return Err(ToolError::failed(&self.tool, result.text()));
        }
        Ok(serde_json::Value::String(result.text()))
    }
}

// ─── Server List File ───────────────────────────────────────────────────────

/// Read the flat JSON server list. A missing file is an empty list.
pub fn load_server_configs(path: &Path) -> Result<Vec<McpServerConfig>, McpError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(McpError::ConfigError {
                reason: format!("cannot read {}: {e}", path.display()),
            })
        }
    };
    let configs: Vec<McpServerConfig> =
        serde_json::from_str(&raw).map_err(|e| McpError::ConfigError {
            reason: format!("invalid server list {}: {e}", path.display()),
        })?;
    for config in &configs {
        if let Err(reason) = config.validate() {
            tracing::warn!(server = %config.name, reason = %reason, "invalid MCP server record");
        }
    }
    Ok(configs)
}

/// Write the server list atomically (temp file + rename).
pub fn save_server_configs(path: &Path, configs: &[McpServerConfig]) -> Result<(), McpError> {
    let io_err = |e: std::io::Error| McpError::ConfigError {
        reason: format!("cannot write {}: {e}", path.display()),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let json = serde_json::to_string_pretty(configs).map_err(|e| McpError::ConfigError {
        reason: e.to_string(),
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::mcp_client::connection::testing::FakeConnector;

    fn client_with(connector: FakeConnector, configs: Vec<McpServerConfig>) -> (McpClient, Arc<ToolRegistry>, Arc<FakeConnector>) {
        let tools = Arc::new(ToolRegistry::default());
        let connector = Arc::new(connector);
        let client = McpClient::with_connector(tools.clone(), configs, connector.clone());
        (client, tools, connector)
    }

    #[tokio::test]
    async fn test_connect_registers_and_disconnect_unregisters() {
        let (client, tools, _) = client_with(
            FakeConnector::default()
                .with_server("files", &["read_text", "list_files"])
                .with_server("web", &["fetch"]),
            vec![
                McpServerConfig::stdio("files", "unused", &[]),
                McpServerConfig::stdio("web", "unused", &[]),
            ],
        );

        assert!(client.connect_all_auto().await.is_empty());
        assert_eq!(tools.len(), 3);
        assert!(client.is_connected("files"));

        assert!(client.disconnect("files").await);
        let remaining = tools.all_tools();
        assert_eq!(
            remaining
                .iter()
                .filter(|t| t.mcp_server.as_deref() == Some("files"))
                .count(),
            0
        );
        assert_eq!(remaining.len(), 1);
        assert!(!client.is_connected("files"));
    }

    #[tokio::test]
    async fn test_tool_call_flattens_text_content() {
        let (client, tools, _) = client_with(
            FakeConnector::default().with_server("files", &["read_text", "explode"]),
            vec![McpServerConfig::stdio("files", "unused", &[])],
        );
        client.connect("files").await.unwrap();

        let ok = tools
            .execute_tool("read_text", serde_json::json!({"path": "/tmp/a"}))
            .await;
        assert!(ok.success);
        assert!(ok.model_text().starts_with("called read_text\n"));

        let failed = tools.execute_tool("explode", serde_json::json!({})).await;
        assert!(!failed.success);
        assert!(failed.error.unwrap().contains("it blew up"));
    }

    #[tokio::test]
    async fn test_lost_connection_reconnects_once_and_retries() {
        let connector = FakeConnector::default().with_server("files", &["read_text"]);
        connector.drop_next_calls.store(1, Ordering::SeqCst);
        let (client, tools, connector) =
            client_with(connector, vec![McpServerConfig::stdio("files", "unused", &[])]);
        client.connect("files").await.unwrap();

        let result = tools.execute_tool("read_text", serde_json::json!({})).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(connector.open_count("files"), 2);
        assert_eq!(tools.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_happens_only_once() {
        let connector = FakeConnector::default().with_server("files", &["read_text"]);
        connector.drop_next_calls.store(1, Ordering::SeqCst);
        let (client, _, connector) =
            client_with(connector, vec![McpServerConfig::stdio("files", "unused", &[])]);
        client.connect("files").await.unwrap();
        // The reconnected server fails too.
        connector.drop_next_calls.store(1, Ordering::SeqCst);

        let err = client
            .call_tool("files", "read_text", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_connection_lost());
        assert_eq!(connector.open_count("files"), 2);
    }

    #[tokio::test]
    async fn test_disabled_and_manual_servers_not_auto_connected() {
        let mut disabled = McpServerConfig::stdio("off", "unused", &[]);
        disabled.enabled = false;
        let mut manual = McpServerConfig::stdio("manual", "unused", &[]);
        manual.auto_start = false;
        let (client, _, connector) = client_with(
            FakeConnector::default()
                .with_server("off", &["a"])
                .with_server("manual", &["b"]),
            vec![disabled, manual],
        );

        assert!(client.connect_all_auto().await.is_empty());
        assert_eq!(connector.open_count("off"), 0);
        assert_eq!(connector.open_count("manual"), 0);
        assert!(client.connect("off").await.is_err());
        assert_eq!(client.connect("manual").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_enabled_false_disconnects() {
        let (client, tools, _) = client_with(
            FakeConnector::default().with_server("files", &["read_text"]),
            vec![McpServerConfig::stdio("files", "unused", &[])],
        );
        client.connect("files").await.unwrap();
        client.set_enabled("files", false).await.unwrap();
        assert!(tools.is_empty());
        assert!(!client.status()[0].enabled);
    }

    #[tokio::test]
    async fn test_add_and_remove_server() {
        let (client, tools, _) = client_with(
            FakeConnector::default().with_server("web", &["fetch"]),
            Vec::new(),
        );
        client
            .add_server(McpServerConfig::stdio("web", "unused", &[]))
            .await
            .unwrap();
        assert_eq!(tools.len(), 1);
        assert!(matches!(
            client.add_server(McpServerConfig::stdio("web", "unused", &[])).await,
            Err(McpError::DuplicateServer { .. })
        ));

        client.remove_server("web").await.unwrap();
        assert!(tools.is_empty());
        assert!(client.configs().is_empty());
    }

    #[test]
    fn test_server_list_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_servers.json");
        assert!(load_server_configs(&path).unwrap().is_empty());

        let configs = vec![
            McpServerConfig::stdio("files", "npx", &["-y", "server-files"]),
            McpServerConfig::sse("remote", "http://localhost:9000/sse"),
        ];
        save_server_configs(&path, &configs).unwrap();
        assert_eq!(load_server_configs(&path).unwrap(), configs);
    }
}
