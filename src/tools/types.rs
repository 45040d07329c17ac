//! Tool definitions, handlers and call results.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::errors::ToolError;

/// Where a tool comes from. Plugin-sourced tools require user confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolSource {
    Function,
    Mcp,
    Plugin,
}

impl ToolSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolSource::Function => "function",
            ToolSource::Mcp => "mcp",
            ToolSource::Plugin => "plugin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "function" => Some(ToolSource::Function),
            "mcp" => Some(ToolSource::Mcp),
            "plugin" => Some(ToolSource::Plugin),
            _ => None,
        }
    }
}

/// A registered tool as exposed to models and persisted in `tool_definitions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: serde_json::Value,
    pub source: ToolSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_server: Option<String>,
    /// Owning plugin, for plugin-sourced tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    pub enabled: bool,
}

impl ToolDefinition {
    /// OpenAI function-calling schema.
    pub fn to_openai(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// What a caller supplies to register a tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub source: ToolSource,
    /// MCP server name or plugin name.
    pub owner: Option<String>,
    /// Overrides the registry's default timeout.
    pub timeout: Option<Duration>,
}

impl ToolSpec {
    pub fn function(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
            source: ToolSource::Function,
            owner: None,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of one tool execution. Never an `Err`: failures are data.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub tool_name: String,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

impl ToolCallResult {
    pub fn ok(tool_name: &str, result: serde_json::Value, execution_time_ms: u64) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            success: true,
            result: Some(result),
            error: None,
            execution_time_ms,
        }
    }

    pub fn failed(tool_name: &str, error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            success: false,
            result: None,
            error: Some(error.into()),
            execution_time_ms,
        }
    }

    /// Text fed back to the model as the `tool` message content.
    pub fn model_text(&self) -> String {
        if self.success {
            match &self.result {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(value) => value.to_string(),
                None => String::new(),
            }
        } else {
            format!("Error: {}", self.error.as_deref().unwrap_or("unknown error"))
        }
    }
}

// ─── Handlers ───────────────────────────────────────────────────────────────

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, ToolError>> + Send + 'static,
{
    async fn call(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        (self.0)(arguments).await
    }
}

/// Wrap an async closure as a tool handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, ToolError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

// ─── Persistence Seam ───────────────────────────────────────────────────────

/// Durable mirror of tool definitions, so enabled flags survive restarts.
pub trait ToolStore: Send + Sync {
    fn upsert_tool(&self, tool: &ToolDefinition) -> Result<(), ToolError>;

    fn set_tool_enabled(&self, id: &str, enabled: bool) -> Result<(), ToolError>;

    /// The persisted enabled flag, if this tool was seen before.
    fn tool_enabled(&self, id: &str) -> Result<Option<bool>, ToolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_text() {
        let ok = ToolCallResult::ok("get_weather", serde_json::json!("sunny"), 3);
        assert_eq!(ok.model_text(), "sunny");

        let structured = ToolCallResult::ok("x", serde_json::json!({"t": 21}), 3);
        assert_eq!(structured.model_text(), "{\"t\":21}");

        let failed = ToolCallResult::failed("x", "boom", 3);
        assert_eq!(failed.model_text(), "Error: boom");
    }

    #[test]
    fn test_to_openai_shape() {
        let def = ToolDefinition {
            id: "function_get_weather".into(),
            name: "get_weather".into(),
            description: "Weather lookup".into(),
            parameters: serde_json::json!({"type": "object"}),
            source: ToolSource::Function,
            mcp_server: None,
            plugin: None,
            enabled: true,
        };
        let schema = def.to_openai();
        assert_eq!(schema["type"], "function");
        assert_eq!(schema["function"]["name"], "get_weather");
    }
}
