//! Message envelopes exchanged with the rendering client.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::errors::PipelineError;

// ─── Inbound ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundKind {
    UserInput,
    TapEvent,
    FileUpload,
    PluginMessage,
    CommandExecute,
    ToolConfirmResponse,
    PluginResponse,
    PluginStatus,
    ModelInfo,
    CharacterInfo,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: InboundKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    /// Client clock, epoch milliseconds (seconds are accepted and scaled).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl InboundMessage {
    pub fn new(kind: InboundKind) -> Self {
        Self {
            kind,
            text: None,
            data: serde_json::Value::Null,
            timestamp: None,
        }
    }

    pub fn user_input(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::new(InboundKind::UserInput)
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Parse one JSON frame from the channel.
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(raw).map_err(|e| PipelineError::InvalidMessage {
            reason: e.to_string(),
        })
    }

    /// A string field of `data`.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }
}

// ─── Outbound ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    Dialogue,
    DialogueStreamStart,
    DialogueStreamChunk,
    DialogueStreamEnd,
    AudioStreamStart,
    AudioStreamChunk,
    AudioStreamEnd,
    ToolStatus,
    ToolConfirm,
    PluginInvoke,
    CommandResponse,
    CommandsRegister,
}

/// Interruption precedence: a receiver may cut an in-flight response short
/// for a newer one of equal or higher priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: OutboundKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    /// Groups every message produced for one inbound message.
    pub response_id: String,
    pub priority: Priority,
    pub timestamp: i64,
}

impl OutboundMessage {
    /// A message outside any inbound response, under its own response id.
    pub fn new(kind: OutboundKind, text: Option<String>, data: serde_json::Value) -> Self {
        Self {
            kind,
            text,
            data,
            response_id: uuid::Uuid::new_v4().to_string(),
            priority: Priority::Normal,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

// ─── Channel ────────────────────────────────────────────────────────────────

/// The sending half of one client connection.
#[derive(Debug, Clone)]
pub struct ClientChannel {
    id: String,
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl ClientChannel {
    pub fn new(id: impl Into<String>, tx: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self { id: id.into(), tx }
    }

    /// A channel plus the receiver its messages arrive on.
    pub fn pair(id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(id, tx), rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns false once the receiving side is gone.
    pub fn send(&self, message: OutboundMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
