//! Conversation store records.

use serde::{Deserialize, Serialize};

use crate::providers::{ChatMessage, Role, ToolCallRequest};

// ─── Message Type ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    File,
    ToolCall,
    ToolResult,
    System,
    Command,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::File => "file",
            MessageType::ToolCall => "tool_call",
            MessageType::ToolResult => "tool_result",
            MessageType::System => "system",
            MessageType::Command => "command",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageType::Text),
            "image" => Some(MessageType::Image),
            "file" => Some(MessageType::File),
            "tool_call" => Some(MessageType::ToolCall),
            "tool_result" => Some(MessageType::ToolResult),
            "system" => Some(MessageType::System),
            "command" => Some(MessageType::Command),
            _ => None,
        }
    }
}

// ─── Records ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub session_id: String,
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub metadata: serde_json::Value,
}

/// A persisted message. Never mutated after write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub message_type: MessageType,
    pub content: String,
    /// Attachments, tool-call payloads or tool-result linkage.
    pub extra: serde_json::Value,
    pub token_count: u32,
    pub created_at: String,
}

impl StoredMessage {
    /// Rebuild the provider-facing message, or `None` for records that are
    /// never replayed to a model (commands, system notes).
    pub fn to_chat_message(&self) -> Option<ChatMessage> {
        match (self.role, self.message_type) {
            (_, MessageType::Command | MessageType::System) | (Role::System, _) => None,
            (Role::Assistant, MessageType::ToolCall) => {
                let calls: Vec<ToolCallRequest> = self
                    .extra
                    .get("toolCalls")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                let content = (!self.content.is_empty()).then(|| self.content.clone());
                Some(ChatMessage::assistant_tool_calls(content, calls))
            }
            (Role::Tool, _) => {
                let call_id = self.extra.get("toolCallId").and_then(|v| v.as_str())?;
                Some(ChatMessage::tool_result(call_id, self.content.clone()))
            }
            (Role::User, MessageType::Image) => {
                let mut msg = ChatMessage::user(self.content.clone());
                if let Some(url) = self.extra.get("dataUrl").and_then(|v| v.as_str()) {
                    msg.images.push(url.to_string());
                }
                Some(msg)
            }
            (role, _) => Some(ChatMessage::new(role, self.content.clone())),
        }
    }
}

/// Input to an append.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub role: Role,
    pub message_type: MessageType,
    pub content: String,
    pub extra: serde_json::Value,
}

impl NewMessage {
    pub fn new(role: Role, message_type: MessageType, content: impl Into<String>) -> Self {
        Self {
            role,
            message_type,
            content: content.into(),
            extra: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn user_text(content: impl Into<String>) -> Self {
        Self::new(Role::User, MessageType::Text, content)
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, MessageType::Text, content)
    }

    pub fn command(content: impl Into<String>) -> Self {
        Self::new(Role::User, MessageType::Command, content)
    }

    /// The assistant turn that requested tool calls.
    pub fn assistant_tool_calls(content: Option<&str>, calls: &[ToolCallRequest]) -> Self {
        let mut msg = Self::new(Role::Assistant, MessageType::ToolCall, content.unwrap_or(""));
        msg.extra = serde_json::json!({ "toolCalls": calls });
        msg
    }

    pub fn tool_result(tool_call_id: &str, tool_name: &str, content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, MessageType::ToolResult, content);
        msg.extra = serde_json::json!({ "toolCallId": tool_call_id, "toolName": tool_name });
        msg
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = extra;
        self
    }
}
