//! Per-message processing context.

use super::types::{ClientChannel, InboundMessage, OutboundKind, OutboundMessage, Priority};

/// State carried through every stage for one inbound message.
///
/// Replies go out two ways: `add_reply` buffers until the Respond stage,
/// `send` delivers immediately (stream chunks, confirmation requests).
pub struct MessageContext {
    pub message: InboundMessage,
    pub channel: ClientChannel,
    pub response_id: String,
    pub priority: Priority,
    /// Scratch space shared between stages and plugin hooks.
    pub metadata: serde_json::Map<String, serde_json::Value>,
    replies: Vec<OutboundMessage>,
    sent: usize,
    error: Option<String>,
    aborted: bool,
}

impl MessageContext {
    pub fn new(message: InboundMessage, channel: ClientChannel) -> Self {
        Self {
            message,
            channel,
            response_id: uuid::Uuid::new_v4().to_string(),
            priority: Priority::Normal,
            metadata: serde_json::Map::new(),
            replies: Vec::new(),
            sent: 0,
            error: None,
            aborted: false,
        }
    }

    pub fn channel_id(&self) -> &str {
        self.channel.id()
    }

    /// An envelope stamped with this context's response id and priority.
    pub fn outbound(
        &self,
        kind: OutboundKind,
        text: Option<String>,
        data: serde_json::Value,
    ) -> OutboundMessage {
        OutboundMessage {
            kind,
            text,
            data,
            response_id: self.response_id.clone(),
            priority: self.priority,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Buffer a reply for the Respond stage.
    pub fn add_reply(&mut self, kind: OutboundKind, text: Option<String>, data: serde_json::Value) {
        let message = self.outbound(kind, text, data);
        self.replies.push(message);
    }

    pub fn add_dialogue(&mut self, text: impl Into<String>) {
        self.add_reply(OutboundKind::Dialogue, Some(text.into()), serde_json::Value::Null);
    }

    /// Deliver now. Returns false when the client is gone.
    pub fn send(&mut self, kind: OutboundKind, text: Option<String>, data: serde_json::Value) -> bool {
        let message = self.outbound(kind, text, data);
        let delivered = self.channel.send(message);
        if delivered {
            self.sent += 1;
        } else {
            tracing::debug!(channel = %self.channel.id(), kind = ?kind, "dropped message for closed channel");
        }
        delivered
    }

    /// Move buffered replies out for delivery.
    pub fn take_replies(&mut self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.replies)
    }

    pub fn pending_replies(&self) -> &[OutboundMessage] {
        &self.replies
    }

    /// Messages already delivered through `send`.
    pub fn sent_count(&self) -> usize {
        self.sent
    }

    pub(crate) fn record_flushed(&mut self, count: usize) {
        self.sent += count;
    }

    /// Record a fault. The first one wins.
    pub fn set_error(&mut self, error: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(error.into());
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Skip the remaining stages, except those that always run.
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::InboundKind;

    #[test]
    fn test_send_is_immediate_and_replies_buffer() {
        let (channel, mut rx) = ClientChannel::pair("ch1");
        let mut ctx = MessageContext::new(InboundMessage::new(InboundKind::UserInput), channel);
        ctx.priority = Priority::High;

        ctx.add_dialogue("later");
        assert!(ctx.send(OutboundKind::DialogueStreamStart, None, serde_json::Value::Null));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.kind, OutboundKind::DialogueStreamStart);
        assert_eq!(first.response_id, ctx.response_id);
        assert_eq!(first.priority, Priority::High);
        assert!(rx.try_recv().is_err());
        assert_eq!(ctx.take_replies().len(), 1);
    }

    #[test]
    fn test_first_error_wins() {
        let (channel, _rx) = ClientChannel::pair("ch1");
        let mut ctx = MessageContext::new(InboundMessage::new(InboundKind::UserInput), channel);
        ctx.set_error("first");
        ctx.set_error("second");
        assert_eq!(ctx.error(), Some("first"));
    }
}
