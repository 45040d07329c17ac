//! Provider capability traits.
//!
//! A provider kind registers a factory that builds one of these from a
//! validated config object. The registry only ever sees the trait objects.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;

use super::errors::ProviderError;
use super::types::{
    AudioData, AudioStream, ChatDelta, ChatRequest, ChatResponse, ChatStream, ProviderFamily,
    ToolCallDelta, TtsRequest,
};

// ─── LLM ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Establish whatever the provider needs before its first request.
    async fn initialize(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn dispose(&self) {}

    /// One complete chat turn.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Streamed chat turn. The default runs [`chat`](Self::chat) and replays
    /// the result as deltas.
    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream, ProviderError> {
        let response = self.chat(request).await?;
        Ok(response_to_stream(response))
    }
}

/// Replay a complete response as a delta stream: text, tool calls, then `Done`.
pub fn response_to_stream(response: ChatResponse) -> ChatStream {
    let mut deltas = Vec::with_capacity(response.tool_calls.len() + 2);
    if !response.text.is_empty() {
        deltas.push(Ok(ChatDelta::Text(response.text)));
    }
    for (index, call) in response.tool_calls.into_iter().enumerate() {
        deltas.push(Ok(ChatDelta::ToolCall(ToolCallDelta {
            index: index as u32,
            id: Some(call.id),
            name: Some(call.name),
            arguments: Some(call.arguments),
        })));
    }
    deltas.push(Ok(ChatDelta::Done {
        finish_reason: response.finish_reason,
        usage: response.usage,
    }));
    Box::pin(stream::iter(deltas))
}

// ─── TTS ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait TtsProvider: Send + Sync {
    async fn initialize(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn dispose(&self) {}

    async fn synthesize(&self, request: TtsRequest) -> Result<AudioData, ProviderError>;

    /// Chunked synthesis. The default yields the whole clip as one chunk.
    async fn synthesize_stream(&self, request: TtsRequest) -> Result<AudioStream, ProviderError> {
        let audio = self.synthesize(request).await?;
        Ok(Box::pin(stream::iter(vec![Ok(audio)])))
    }
}

// ─── Handles ────────────────────────────────────────────────────────────────

/// A constructed provider of either family.
#[derive(Clone)]
pub enum ProviderHandle {
    Llm(Arc<dyn LlmProvider>),
    Tts(Arc<dyn TtsProvider>),
}

impl ProviderHandle {
    pub fn family(&self) -> ProviderFamily {
        match self {
            ProviderHandle::Llm(_) => ProviderFamily::Llm,
            ProviderHandle::Tts(_) => ProviderFamily::Tts,
        }
    }

    pub(crate) async fn initialize(&self) -> Result<(), ProviderError> {
        match self {
            ProviderHandle::Llm(p) => p.initialize().await,
            ProviderHandle::Tts(p) => p.initialize().await,
        }
    }

    pub(crate) async fn dispose(&self) {
        match self {
            ProviderHandle::Llm(p) => p.dispose().await,
            ProviderHandle::Tts(p) => p.dispose().await,
        }
    }
}

/// Builds a provider from its resolved config object.
pub type ProviderFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<ProviderHandle, ProviderError> + Send + Sync>;

/// A connected LLM instance as handed to callers.
#[derive(Clone)]
pub struct LlmHandle {
    pub instance_id: String,
    pub provider: Arc<dyn LlmProvider>,
    /// Whether replies should be streamed to the client.
    pub streaming: bool,
}

/// A connected TTS instance as handed to callers.
#[derive(Clone)]
pub struct TtsHandle {
    pub instance_id: String,
    pub provider: Arc<dyn TtsProvider>,
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::providers::types::{FinishReason, ToolCallRequest};

    struct Canned;

    #[async_trait]
    impl LlmProvider for Canned {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                text: "checking".into(),
                usage: None,
                finish_reason: FinishReason::ToolCalls,
                tool_calls: vec![ToolCallRequest {
                    id: "call_1".into(),
                    name: "get_current_time".into(),
                    arguments: "{}".into(),
                }],
            })
        }
    }

    #[tokio::test]
    async fn test_default_chat_stream_replays_response() {
        let deltas: Vec<_> = Canned
            .chat_stream(ChatRequest::default())
            .await
            .unwrap()
            .map(|d| d.unwrap())
            .collect()
            .await;

        assert_eq!(deltas.len(), 3);
        assert_eq!(deltas[0], ChatDelta::Text("checking".into()));
        assert!(matches!(&deltas[1], ChatDelta::ToolCall(tc) if tc.name.as_deref() == Some("get_current_time")));
        assert!(matches!(
            deltas[2],
            ChatDelta::Done { finish_reason: FinishReason::ToolCalls, .. }
        ));
    }
}
