//! OpenAI-compatible chat completion parsing, streamed and non-streamed.
//!
//! Streamed bodies are decoded with [`SseDecoder`]; every `data:` chunk is
//! turned into zero or more [`ChatDelta`]s. Tool-call fragments are passed
//! through untouched; stitching them together is the caller's job
//! (see [`ToolCallAccumulator`](super::tool_call_parser::ToolCallAccumulator)).

use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;

use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use super::errors::ProviderError;
use super::tool_call_parser::ToolCallAccumulator;
use super::types::{
    ChatDelta, ChatResponse, ChatStream, FinishReason, TokenUsage, ToolCallDelta,
};
use crate::sse::SseDecoder;

// ─── Wire Types ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChunkFunction>,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

// ─── Streaming ──────────────────────────────────────────────────────────────

struct StreamState<S> {
    bytes: Pin<Box<S>>,
    decoder: SseDecoder,
    ready: VecDeque<Result<ChatDelta, ProviderError>>,
    finish_reason: Option<FinishReason>,
    usage: Option<TokenUsage>,
    done: bool,
}

impl<S> StreamState<S> {
    /// Handle one decoded SSE payload. Returns `true` on the `[DONE]` sentinel.
    fn handle_data(&mut self, data: &str) -> bool {
        let data = data.trim();
        if data.is_empty() {
            return false;
        }
        if data == "[DONE]" {
            return true;
        }

        let chunk: CompletionChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                self.ready.push_back(Err(ProviderError::StreamError {
                    reason: format!("failed to parse SSE chunk: {e}"),
                }));
                return false;
            }
        };

        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        for choice in chunk.choices {
            if let Some(delta) = choice.delta {
                if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                    self.ready.push_back(Ok(ChatDelta::Text(text)));
                }
                for call in delta.tool_calls.unwrap_or_default() {
                    let (name, arguments) = match call.function {
                        Some(f) => (f.name, f.arguments),
                        None => (None, None),
                    };
                    self.ready.push_back(Ok(ChatDelta::ToolCall(ToolCallDelta {
                        index: call.index,
                        id: call.id,
                        name,
                        arguments,
                    })));
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(FinishReason::from_api(&reason));
            }
        }
        false
    }

    fn push_done(&mut self) {
        if !self.done {
            self.done = true;
            self.ready.push_back(Ok(ChatDelta::Done {
                finish_reason: self.finish_reason.unwrap_or_default(),
                usage: self.usage,
            }));
        }
    }
}

/// Turn an SSE byte stream into chat deltas.
///
/// Exactly one `Done` is emitted, on `[DONE]` or at end of input, whichever
/// comes first. A transport error ends the stream after being yielded.
pub fn parse_sse_stream<S, B, E>(bytes: S) -> ChatStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = StreamState {
        bytes: Box::pin(bytes),
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
        finish_reason: None,
        usage: None,
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }

            if let Some(event) = state.decoder.next_event() {
                if state.handle_data(&event.data) {
                    state.push_done();
                }
                continue;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => state.decoder.push(chunk.as_ref()),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((
                        Err(ProviderError::StreamError {
                            reason: format!("stream read error: {e}"),
                        }),
                        state,
                    ));
                }
                None => {
                    if let Some(event) = state.decoder.finish() {
                        state.handle_data(&event.data);
                    }
                    state.push_done();
                }
            }
        }
    }))
}

// ─── Non-streaming ──────────────────────────────────────────────────────────

/// Parse a complete `/chat/completions` response body.
pub fn parse_chat_response(body: &str) -> Result<ChatResponse, ProviderError> {
    #[derive(Deserialize)]
    struct Response {
        #[serde(default)]
        choices: Vec<Choice>,
        #[serde(default)]
        usage: Option<TokenUsage>,
    }

    #[derive(Deserialize)]
    struct Choice {
        message: Message,
        #[serde(default)]
        finish_reason: Option<String>,
    }

    #[derive(Deserialize)]
    struct Message {
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        tool_calls: Option<Vec<ChunkToolCall>>,
    }

    let resp: Response =
        serde_json::from_str(body).map_err(|e| ProviderError::MalformedResponse {
            reason: format!("failed to parse chat response: {e}"),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(ProviderError::MalformedResponse {
            reason: "empty choices array".into(),
        })?;

    let mut acc = ToolCallAccumulator::new();
    for (position, call) in choice.message.tool_calls.unwrap_or_default().into_iter().enumerate() {
        let (name, arguments) = match call.function {
            Some(f) => (f.name, f.arguments),
            None => (None, None),
        };
        acc.push(&ToolCallDelta {
            index: position as u32,
            id: call.id,
            name,
            arguments,
        });
    }
    let tool_calls = acc.finish();

    let finish_reason = match choice.finish_reason.as_deref() {
        _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
        Some(reason) => FinishReason::from_api(reason),
        None => FinishReason::Stop,
    };

    Ok(ChatResponse {
        text: choice.message.content.unwrap_or_default(),
        usage: resp.usage,
        finish_reason,
        tool_calls,
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_stream(chunks: Vec<&'static str>) -> impl Stream<Item = Result<Vec<u8>, String>> + Send + Unpin {
        stream::iter(chunks.into_iter().map(|c| Ok(c.as_bytes().to_vec())))
    }

    async fn collect(chunks: Vec<&'static str>) -> Vec<ChatDelta> {
        parse_sse_stream(byte_stream(chunks))
            .map(|r| r.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_text_deltas_then_done() {
        let deltas = collect(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
        ])
        .await;

        assert_eq!(deltas.len(), 3);
        assert_eq!(deltas[0], ChatDelta::Text("Hel".into()));
        assert_eq!(deltas[1], ChatDelta::Text("lo".into()));
        match &deltas[2] {
            ChatDelta::Done { finish_reason, usage } => {
                assert_eq!(*finish_reason, FinishReason::Stop);
                assert_eq!(usage.unwrap().total_tokens, 5);
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tool_call_fragments_split_across_chunks() {
        let deltas = collect(vec![
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_a\",\"function\":{\"name\":\"get_weather\",\"arguments\":\"{\\\"city\\\"\"}}]}}]}\n",
            "\ndata: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\":\\\"Paris\\\"}\"}}]},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: [DONE]\n\n",
        ])
        .await;

        let mut acc = ToolCallAccumulator::new();
        for d in &deltas {
            if let ChatDelta::ToolCall(tc) = d {
                acc.push(tc);
            }
        }
        let calls = acc.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].parsed_arguments()["city"], "Paris");
        assert!(matches!(
            deltas.last(),
            Some(ChatDelta::Done { finish_reason: FinishReason::ToolCalls, .. })
        ));
    }

    #[tokio::test]
    async fn test_done_emitted_without_sentinel() {
        let deltas = collect(vec!["data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}"]).await;
        assert_eq!(deltas.len(), 2);
        assert!(matches!(deltas[1], ChatDelta::Done { .. }));
    }

    #[tokio::test]
    async fn test_transport_error_ends_stream() {
        let s = stream::iter(vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n".to_vec()),
            Err("connection reset".to_string()),
        ]);
        let items: Vec<_> = parse_sse_stream(s).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(ProviderError::StreamError { .. })));
    }

    #[test]
    fn test_parse_chat_response_with_tool_calls() {
        let body = r#"{
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let resp = parse_chat_response(body).unwrap();
        assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
        assert_eq!(resp.tool_calls[0].name, "get_weather");
        assert_eq!(resp.usage.unwrap().prompt_tokens, 10);
        assert!(resp.text.is_empty());
    }

    #[test]
    fn test_parse_chat_response_empty_choices() {
        assert!(matches!(
            parse_chat_response(r#"{"choices": []}"#),
            Err(ProviderError::MalformedResponse { .. })
        ));
    }
}
