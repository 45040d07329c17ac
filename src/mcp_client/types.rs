//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures and the persisted
//! server configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// MCP revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// Notifications carry no id and get no response.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
///
/// `id` is optional so server-initiated notifications on the same stream
/// still deserialize and can be skipped.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── MCP Protocol Types ─────────────────────────────────────────────────────

/// A tool as listed by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, rename = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl CallToolResult {
    /// Text parts joined by newlines. Non-text parts are noted by type.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|item| match &item.text {
                Some(text) => text.clone(),
                None => format!("[{}]", item.kind),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

// ─── Server Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Sse,
}

/// One command for every platform, or per-platform overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlatformCommand {
    Single(String),
    PerPlatform {
        #[serde(default)]
        default: Option<String>,
        #[serde(default)]
        windows: Option<String>,
        #[serde(default)]
        macos: Option<String>,
        #[serde(default)]
        linux: Option<String>,
    },
}

impl PlatformCommand {
    /// The command for the running OS, falling back to `default`.
    pub fn resolve(&self) -> Option<&str> {
        match self {
            PlatformCommand::Single(cmd) => Some(cmd.as_str()),
            PlatformCommand::PerPlatform {
                default,
                windows,
                macos,
                linux,
            } => {
                let specific = if cfg!(target_os = "windows") {
                    windows
                } else if cfg!(target_os = "macos") {
                    macos
                } else {
                    linux
                };
                specific.as_deref().or(default.as_deref())
            }
        }
    }
}

fn default_true() -> bool {
    true
}

/// A configured external tool server, persisted as an entry of a flat list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    pub name: String,
    pub transport: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<PlatformCommand>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl McpServerConfig {
    pub fn stdio(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            transport: TransportKind::Stdio,
            command: Some(PlatformCommand::Single(command.to_string())),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            url: None,
            working_directory: None,
            auto_start: true,
            enabled: true,
        }
    }

    pub fn sse(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            transport: TransportKind::Sse,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url.to_string()),
            working_directory: None,
            auto_start: true,
            enabled: true,
        }
    }

    /// Check that the record names what its transport needs.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("server name is empty".into());
        }
        match self.transport {
            TransportKind::Stdio => {
                if self.command.as_ref().and_then(|c| c.resolve()).is_none() {
                    return Err(format!(
                        "server '{}' has no command for this platform",
                        self.name
                    ));
                }
            }
            TransportKind::Sse => {
                if self.url.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    return Err(format!("server '{}' has no url", self.name));
                }
            }
        }
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
