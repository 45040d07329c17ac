//! Provider-neutral request/response types.
//!
//! Every LLM or TTS backend is driven through these shapes; vendor wire
//! formats live inside the concrete provider modules.

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use super::errors::ProviderError;
use super::tool_call_parser::parse_arguments_lenient;

// ─── Chat ───────────────────────────────────────────────────────────────────

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// A tool call requested by the model.
///
/// `arguments` is kept as the raw string the model produced. It may be
/// malformed; use [`ToolCallRequest::parsed_arguments`] to read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCallRequest {
    /// Parse the argument payload, degrading to `{}` when it is irreparable.
    pub fn parsed_arguments(&self) -> serde_json::Value {
        parse_arguments_lenient(&self.arguments)
    }
}

/// One message of conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Inline images as data URLs (user turns only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_call_id: None,
            tool_calls: Vec::new(),
            images: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Assistant turn that requests tool calls.
    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_call_id: None,
            tool_calls: calls,
            images: Vec::new(),
        }
    }

    /// Result of a tool call, linked back by id.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: Vec::new(),
            images: Vec::new(),
        }
    }
}

/// How the model may use the offered tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
}

impl ToolChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolChoice::Auto => "auto",
            ToolChoice::None => "none",
            ToolChoice::Required => "required",
        }
    }
}

/// A chat request: ordered history plus optional system prompt and tools.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub system_prompt: Option<String>,
    /// OpenAI-function-style tool schemas.
    pub tools: Vec<serde_json::Value>,
    pub tool_choice: ToolChoice,
}

/// Token accounting reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    /// The tool-call loop hit its iteration bound.
    MaxIterations,
    Error,
}

impl FinishReason {
    /// Map an OpenAI-style `finish_reason` string. Unknown values read as `stop`.
    pub fn from_api(reason: &str) -> Self {
        match reason {
            "length" => FinishReason::Length,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    }
}

/// A complete (non-streamed) chat response.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub text: String,
    pub usage: Option<TokenUsage>,
    pub finish_reason: FinishReason,
    pub tool_calls: Vec<ToolCallRequest>,
}

/// A tool-call fragment from a streamed response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// One streamed increment.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatDelta {
    Text(String),
    ToolCall(ToolCallDelta),
    Done {
        finish_reason: FinishReason,
        usage: Option<TokenUsage>,
    },
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatDelta, ProviderError>> + Send>>;

// ─── Speech ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct TtsRequest {
    pub text: String,
    pub voice: Option<String>,
    pub speed: Option<f32>,
}

/// Raw audio plus its MIME type. Streams yield one of these per chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioData {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

pub type AudioStream = Pin<Box<dyn Stream<Item = Result<AudioData, ProviderError>> + Send>>;

// ─── Registry Types ─────────────────────────────────────────────────────────

/// Provider family; at most one primary instance exists per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFamily {
    Llm,
    Tts,
}

impl std::fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderFamily::Llm => write!(f, "LLM"),
            ProviderFamily::Tts => write!(f, "TTS"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// Value type of a configuration field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    /// A string that must never be logged (API keys).
    Secret,
}

/// One typed field of a self-described configuration schema.
///
/// Shared by provider kinds and plugin `config_schema.json` files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub description: String,
}

impl ConfigField {
    pub fn new(name: &str, field_type: FieldType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            required: false,
            default: None,
            description: description.to_string(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Whether `value` has this field's type.
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        match self.field_type {
            FieldType::String | FieldType::Secret => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
        }
    }
}

/// Apply schema defaults and check required fields and types.
///
/// Returns the resolved object. Unknown keys are kept untouched.
pub fn resolve_config(
    fields: &[ConfigField],
    config: &serde_json::Value,
) -> Result<serde_json::Value, String> {
    let mut resolved = match config {
        serde_json::Value::Object(map) => map.clone(),
        serde_json::Value::Null => serde_json::Map::new(),
        other => return Err(format!("config must be an object, got {other}")),
    };

    for field in fields {
        match resolved.get(&field.name) {
            Some(value) if !value.is_null() => {
                if !field.accepts(value) {
                    return Err(format!(
                        "field '{}' expects {:?}, got {value}",
                        field.name, field.field_type
                    ));
                }
            }
            _ => {
                if let Some(default) = &field.default {
                    resolved.insert(field.name.clone(), default.clone());
                } else if field.required {
                    return Err(format!("missing required field '{}'", field.name));
                }
            }
        }
    }

    Ok(serde_json::Value::Object(resolved))
}

/// Self-description of a provider kind.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderDescriptor {
    pub kind: String,
    pub family: ProviderFamily,
    pub display_name: String,
    pub fields: Vec<ConfigField>,
}

fn default_true() -> bool {
    true
}

/// User configuration for one named provider instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInstanceConfig {
    pub instance_id: String,
    pub kind: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Public snapshot of a provider instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInstanceInfo {
    pub instance_id: String,
    pub provider_kind: String,
    pub display_name: String,
    pub family: ProviderFamily,
    pub enabled: bool,
    pub primary: bool,
    pub status: ConnectionStatus,
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> Vec<ConfigField> {
        vec![
            ConfigField::new("base_url", FieldType::String, "").required(),
            ConfigField::new("stream", FieldType::Boolean, "")
                .with_default(serde_json::json!(true)),
            ConfigField::new("temperature", FieldType::Number, ""),
        ]
    }

    #[test]
    fn test_resolve_config_applies_defaults() {
        let resolved =
            resolve_config(&fields(), &serde_json::json!({"base_url": "http://x"})).unwrap();
        assert_eq!(resolved["stream"], true);
        assert!(resolved.get("temperature").is_none());
    }

    #[test]
    fn test_resolve_config_missing_required() {
        let err = resolve_config(&fields(), &serde_json::Value::Null).unwrap_err();
        assert!(err.contains("base_url"));
    }

    #[test]
    fn test_resolve_config_type_mismatch() {
        let err = resolve_config(
            &fields(),
            &serde_json::json!({"base_url": "http://x", "temperature": "hot"}),
        )
        .unwrap_err();
        assert!(err.contains("temperature"));
    }

    #[test]
    fn test_finish_reason_from_api() {
        assert_eq!(FinishReason::from_api("tool_calls"), FinishReason::ToolCalls);
        assert_eq!(FinishReason::from_api("length"), FinishReason::Length);
        assert_eq!(FinishReason::from_api("whatever"), FinishReason::Stop);
    }

    #[test]
    fn test_connection_status_serialization() {
        let json = serde_json::to_value(ConnectionStatus::Error("boom".into())).unwrap();
        assert_eq!(json["state"], "error");
        assert_eq!(json["message"], "boom");
    }
}
