//! The bounded tool-call loop.
//!
//! Each iteration asks the primary LLM for a reply. A reply without tool
//! calls ends the loop. Otherwise the calls are persisted, plugin-sourced
//! ones are put to the user for confirmation, everything approved runs
//! through the tool registry, and the results go back to the model.

use futures::StreamExt;
use serde_json::json;

use super::dispatch::Handler;
use super::errors::HandlerError;
use crate::agent_core::NewMessage;
use crate::pipeline::{MessageContext, OutboundKind};
use crate::providers::tool_call_parser::ToolCallAccumulator;
use crate::providers::{
    ChatDelta, ChatMessage, ChatRequest, ChatResponse, FinishReason, LlmHandle, ProviderError,
    TokenUsage, ToolCallRequest, ToolChoice,
};
use crate::tools::{ToolCallResult, ToolError, ToolSource};

pub(crate) const MAX_ITERATIONS_REPLY: &str =
    "Sorry, I got stuck going back and forth with my tools and had to stop. Could you try asking in a different way?";

/// Where one iteration's provider call stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopState {
    AwaitingProvider,
    StreamingText,
    AccumulatingToolCalls,
    Resolved,
}

fn transition(state: &mut LoopState, next: LoopState) {
    if *state != next {
        tracing::trace!(from = ?*state, to = ?next, "tool loop state");
        *state = next;
    }
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub text: String,
    pub finish_reason: FinishReason,
    /// Provider calls made.
    pub iterations: usize,
    pub usage: TokenUsage,
    /// Whether the text already reached the client as stream chunks.
    pub streamed: bool,
}

impl Handler {
    pub(crate) async fn run_tool_loop(
        &self,
        ctx: &mut MessageContext,
        llm: &LlmHandle,
        system_prompt: String,
        mut messages: Vec<ChatMessage>,
    ) -> Result<LoopOutcome, HandlerError> {
        let mut stream_open = false;
        let mut usage = TokenUsage::default();
        let max_iterations = self.config.max_tool_iterations.max(1);

        for iteration in 1..=max_iterations {
            let request = ChatRequest {
                messages: messages.clone(),
                system_prompt: Some(system_prompt.clone()),
                tools: self.tools.to_openai_tools_for_channel(ctx.channel_id()),
                tool_choice: ToolChoice::Auto,
            };

            let response = if llm.streaming {
                self.stream_reply(ctx, llm, request, &mut stream_open).await
            } else {
                llm.provider.chat(request).await
            };
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    if stream_open {
                        ctx.send(
                            OutboundKind::DialogueStreamEnd,
                            None,
                            json!({ "error": e.to_string() }),
                        );
                    }
                    return Err(e.into());
                }
            };
            if let Some(u) = response.usage {
                usage.prompt_tokens += u.prompt_tokens;
                usage.completion_tokens += u.completion_tokens;
                usage.total_tokens += u.total_tokens;
            }

            if response.tool_calls.is_empty() {
                if stream_open {
                    ctx.send(
                        OutboundKind::DialogueStreamEnd,
                        Some(response.text.clone()),
                        serde_json::Value::Null,
                    );
                }
                return Ok(LoopOutcome {
                    text: response.text,
                    finish_reason: response.finish_reason,
                    iterations: iteration,
                    usage,
                    streamed: stream_open,
                });
            }

            tracing::debug!(
                iteration,
                calls = response.tool_calls.len(),
                "model requested tool calls"
            );
            if let Err(e) = self
                .run_tool_calls(ctx, iteration, response, &mut messages)
                .await
            {
                if stream_open {
                    ctx.send(
                        OutboundKind::DialogueStreamEnd,
                        None,
                        json!({ "error": e.to_string() }),
                    );
                }
                return Err(e);
            }
        }

        tracing::warn!(
            channel = %ctx.channel_id(),
            iterations = max_iterations,
            "tool loop hit its iteration bound"
        );
        if stream_open {
            ctx.send(
                OutboundKind::DialogueStreamChunk,
                Some(MAX_ITERATIONS_REPLY.to_string()),
                serde_json::Value::Null,
            );
            ctx.send(
                OutboundKind::DialogueStreamEnd,
                Some(MAX_ITERATIONS_REPLY.to_string()),
                serde_json::Value::Null,
            );
        }
        Ok(LoopOutcome {
            text: MAX_ITERATIONS_REPLY.to_string(),
            finish_reason: FinishReason::MaxIterations,
            iterations: max_iterations,
            usage,
            streamed: stream_open,
        })
    }

    /// Consume a streamed reply: text goes to the client as it arrives,
    /// tool-call fragments are collected silently.
    async fn stream_reply(
        &self,
        ctx: &mut MessageContext,
        llm: &LlmHandle,
        request: ChatRequest,
        stream_open: &mut bool,
    ) -> Result<ChatResponse, ProviderError> {
        let mut state = LoopState::AwaitingProvider;
        let mut stream = llm.provider.chat_stream(request).await?;

        let mut text = String::new();
        let mut calls = ToolCallAccumulator::new();
        let mut finish_reason = FinishReason::Stop;
        let mut usage = None;

        while let Some(delta) = stream.next().await {
            match delta? {
                ChatDelta::Text(chunk) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    transition(&mut state, LoopState::StreamingText);
                    if !*stream_open {
                        ctx.send(OutboundKind::DialogueStreamStart, None, serde_json::Value::Null);
                        *stream_open = true;
                    }
                    ctx.send(
                        OutboundKind::DialogueStreamChunk,
                        Some(chunk.clone()),
                        serde_json::Value::Null,
                    );
                    text.push_str(&chunk);
                }
                ChatDelta::ToolCall(fragment) => {
                    transition(&mut state, LoopState::AccumulatingToolCalls);
                    calls.push(&fragment);
                }
                ChatDelta::Done {
                    finish_reason: reason,
                    usage: reported,
                } => {
                    finish_reason = reason;
                    usage = reported;
                    break;
                }
            }
        }
        transition(&mut state, LoopState::Resolved);

        let tool_calls = calls.finish();
        if !tool_calls.is_empty() {
            finish_reason = FinishReason::ToolCalls;
        }
        Ok(ChatResponse {
            text,
            usage,
            finish_reason,
            tool_calls,
        })
    }

    /// Persist the assistant's tool-call turn, confirm and run the calls,
    /// and append their results to `messages`.
    async fn run_tool_calls(
        &self,
        ctx: &mut MessageContext,
        iteration: usize,
        response: ChatResponse,
        messages: &mut Vec<ChatMessage>,
    ) -> Result<(), HandlerError> {
        let channel_id = ctx.channel_id().to_string();
        let calls = response.tool_calls;
        let content = (!response.text.is_empty()).then_some(response.text);

        self.sessions.record(
            &channel_id,
            &NewMessage::assistant_tool_calls(content.as_deref(), &calls),
        )?;
        messages.push(ChatMessage::assistant_tool_calls(content, calls.clone()));

        let gated: Vec<&ToolCallRequest> = calls
            .iter()
            .filter(|c| self.requires_confirmation(&channel_id, &c.name))
            .collect();
        let approved = gated.is_empty() || self.request_confirmation(ctx, &gated).await;

        ctx.send(
            OutboundKind::ToolStatus,
            None,
            json!({
                "iteration": iteration,
                "status": "running",
                "calls": calls.iter().map(|c| json!({
                    "id": c.id,
                    "name": c.name,
                    "arguments": c.parsed_arguments(),
                })).collect::<Vec<_>>(),
            }),
        );

        let mut results = Vec::with_capacity(calls.len());
        for call in &calls {
            let rejected = !approved && gated.iter().any(|g| g.id == call.id);
            let (result, model_text) = if rejected {
                let reason = ToolError::Rejected {
                    tool: call.name.clone(),
                }
                .to_string();
                (ToolCallResult::failed(&call.name, reason.clone(), 0), reason)
            } else {
                let result = self
                    .tools
                    .execute_tool_for_channel(&channel_id, &call.name, call.parsed_arguments())
                    .await;
                let text = result.model_text();
                (result, text)
            };

            self.sessions.record(
                &channel_id,
                &NewMessage::tool_result(&call.id, &call.name, model_text.clone()),
            )?;
            messages.push(ChatMessage::tool_result(call.id.clone(), model_text));

            results.push(json!({
                "id": call.id,
                "name": call.name,
                "success": result.success,
                "rejected": rejected,
                "error": result.error,
                "executionTimeMs": result.execution_time_ms,
            }));
        }

        ctx.send(
            OutboundKind::ToolStatus,
            None,
            json!({ "iteration": iteration, "status": "completed", "results": results }),
        );
        Ok(())
    }

    fn requires_confirmation(&self, channel_id: &str, tool_name: &str) -> bool {
        self.tools
            .get_by_name_for_channel(channel_id, tool_name)
            .map(|t| t.source == ToolSource::Plugin)
            .unwrap_or(false)
    }

    /// Ask the user to approve a batch of plugin tool calls. No answer within
    /// the timeout, or a closed channel, counts as denial.
    async fn request_confirmation(
        &self,
        ctx: &mut MessageContext,
        calls: &[&ToolCallRequest],
    ) -> bool {
        let ticket = self.confirmations.register(ctx.channel_id());
        let timeout = self.config.confirm_timeout;
        let data = json!({
            "requestId": ticket.id(),
            "tools": calls.iter().map(|c| json!({
                "id": c.id,
                "name": c.name,
                "arguments": c.parsed_arguments(),
                "plugin": self
                    .tools
                    .get_by_name_for_channel(ctx.channel_id(), &c.name)
                    .and_then(|t| t.plugin),
            })).collect::<Vec<_>>(),
            "timeoutMs": timeout.as_millis() as u64,
        });
        let request_id = ticket.id().to_string();

        if !ctx.send(OutboundKind::ToolConfirm, None, data) {
            return false;
        }
        let approved = ticket.wait(timeout, false).await;
        tracing::info!(
            request_id = %request_id,
            tools = calls.len(),
            approved,
            "tool confirmation settled"
        );
        approved
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::agent_core::{AgentDatabase, ConversationStore, SessionManager};
    use crate::handler::commands::CommandRegistry;
    use crate::handler::dispatch::HandlerConfig;
    use crate::pipeline::{ClientChannel, InboundMessage, OutboundMessage};
    use crate::providers::{LlmProvider, ProviderRegistry, Role};
    use crate::tools::{handler_fn, ToolRegistry, ToolSpec};

    /// Replays scripted responses and records every request it receives.
    struct Scripted {
        responses: Mutex<Vec<ChatResponse>>,
        fallback: ChatResponse,
        requests: Arc<Mutex<Vec<ChatRequest>>>,
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.requests.lock().unwrap().push(request);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(self.fallback.clone())
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    fn tool_call(id: &str, name: &str, args: &str) -> ChatResponse {
        ChatResponse {
            tool_calls: vec![ToolCallRequest {
                id: id.into(),
                name: name.into(),
                arguments: args.into(),
            }],
            finish_reason: FinishReason::ToolCalls,
            ..Default::default()
        }
    }

    fn text(reply: &str) -> ChatResponse {
        ChatResponse {
            text: reply.into(),
            ..Default::default()
        }
    }

    struct Fixture {
        handler: Handler,
        requests: Arc<Mutex<Vec<ChatRequest>>>,
        llm: LlmHandle,
    }

    fn fixture(script: Vec<ChatResponse>, fallback: ChatResponse, config: HandlerConfig) -> Fixture {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let provider = Arc::new(Scripted {
            responses: Mutex::new(script),
            fallback,
            requests: requests.clone(),
        });
        let llm = LlmHandle {
            instance_id: "scripted".into(),
            provider,
            streaming: false,
        };

        let store = Arc::new(ConversationStore::new(AgentDatabase::open(":memory:").unwrap()));
        let handler = Handler::new(
            config,
            Arc::new(ProviderRegistry::new()),
            Arc::new(ToolRegistry::new(Duration::from_secs(5))),
            Arc::new(SessionManager::new(store)),
            Arc::new(CommandRegistry::new()),
        );
        Fixture {
            handler,
            requests,
            llm,
        }
    }

    fn context(channel_id: &str) -> (MessageContext, UnboundedReceiver<OutboundMessage>) {
        let (channel, rx) = ClientChannel::pair(channel_id);
        (MessageContext::new(InboundMessage::user_input("hi"), channel), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<OutboundMessage>) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn register_weather(handler: &Handler, calls: &Arc<AtomicUsize>) {
        let calls = calls.clone();
        handler
            .tools
            .register(
                ToolSpec::function(
                    "get_weather",
                    "Weather for a city",
                    json!({"type": "object", "properties": {"city": {"type": "string"}}}),
                ),
                handler_fn(move |args| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        Ok::<_, ToolError>(json!(format!(
                            "Sunny in {}",
                            args["city"].as_str().unwrap_or("?")
                        )))
                    }
                }),
            )
            .unwrap();
    }

    fn register_plugin_tool(handler: &Handler, calls: &Arc<AtomicUsize>) {
        let calls = calls.clone();
        handler
            .tools
            .register(
                ToolSpec {
                    name: "lamp_on".into(),
                    description: "Turn on the lamp".into(),
                    parameters: json!({"type": "object"}),
                    source: ToolSource::Plugin,
                    owner: Some("lamp".into()),
                    timeout: None,
                },
                handler_fn(move |_args| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, ToolError>(json!("on")) }
                }),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_function_tool_runs_without_confirmation() {
        let f = fixture(
            vec![tool_call("c1", "get_weather", r#"{"city":"Paris"}"#), text("It's sunny.")],
            text("unused"),
            HandlerConfig::default(),
        );
        let executed = Arc::new(AtomicUsize::new(0));
        register_weather(&f.handler, &executed);

        let (mut ctx, mut rx) = context("ch1");
        f.handler
            .sessions
            .record("ch1", &NewMessage::user_text("Weather in Paris?"))
            .unwrap();
        let history = f.handler.sessions.history("ch1", 40).unwrap();

        let outcome = f
            .handler
            .run_tool_loop(&mut ctx, &f.llm, "sys".into(), history)
            .await
            .unwrap();

        assert_eq!(outcome.text, "It's sunny.");
        assert_eq!(outcome.iterations, 2);
        assert_eq!(executed.load(Ordering::SeqCst), 1);

        let sent = drain(&mut rx);
        assert!(sent.iter().all(|m| m.kind != OutboundKind::ToolConfirm));
        assert_eq!(sent.iter().filter(|m| m.kind == OutboundKind::ToolStatus).count(), 2);

        let requests = f.requests.lock().unwrap();
        let second = &requests[1].messages;
        let tool_msg = second.last().unwrap();
        assert_eq!(tool_msg.role, Role::Tool);
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("c1"));
        assert_eq!(tool_msg.content.as_deref(), Some("Sunny in Paris"));
        assert_eq!(second[second.len() - 2].tool_calls.len(), 1);

        // Persisted order: user, assistant tool call, tool result.
        let conversation = f.handler.sessions.current_conversation("ch1").unwrap();
        let stored = f.handler.sessions.store().get_messages(&conversation).unwrap();
        let roles: Vec<Role> = stored.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool]);
    }

    #[tokio::test]
    async fn test_loop_stops_at_iteration_bound() {
        let f = fixture(
            Vec::new(),
            tool_call("loop", "get_weather", "{}"),
            HandlerConfig::default(),
        );
        let executed = Arc::new(AtomicUsize::new(0));
        register_weather(&f.handler, &executed);
        let (mut ctx, _rx) = context("ch1");

        let outcome = f
            .handler
            .run_tool_loop(&mut ctx, &f.llm, "sys".into(), vec![ChatMessage::user("go")])
            .await
            .unwrap();

        assert_eq!(outcome.finish_reason, FinishReason::MaxIterations);
        assert_eq!(outcome.iterations, 10);
        assert_eq!(f.requests.lock().unwrap().len(), 10);
        assert_eq!(executed.load(Ordering::SeqCst), 10);
        assert_eq!(outcome.text, MAX_ITERATIONS_REPLY);
    }

    #[tokio::test]
    async fn test_malformed_arguments_degrade_to_empty_object() {
        let f = fixture(
            vec![tool_call("c1", "get_weather", "{not json"), text("done")],
            text("unused"),
            HandlerConfig::default(),
        );
        let executed = Arc::new(AtomicUsize::new(0));
        register_weather(&f.handler, &executed);
        let (mut ctx, _rx) = context("ch1");

        let outcome = f
            .handler
            .run_tool_loop(&mut ctx, &f.llm, "sys".into(), vec![ChatMessage::user("go")])
            .await
            .unwrap();
        assert_eq!(outcome.text, "done");
        assert_eq!(executed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_plugin_call_is_reported_and_loop_continues() {
        let f = fixture(
            vec![tool_call("c1", "lamp_on", "{}"), text("Okay, I won't.")],
            text("unused"),
            HandlerConfig::default(),
        );
        let executed = Arc::new(AtomicUsize::new(0));
        register_plugin_tool(&f.handler, &executed);
        let handler = Arc::new(f.handler);

        let (mut ctx, mut rx) = context("ch1");
        let responder = {
            let handler = handler.clone();
            tokio::spawn(async move {
                loop {
                    let msg = rx.recv().await.unwrap();
                    if msg.kind == OutboundKind::ToolConfirm {
                        assert_eq!(msg.data["tools"][0]["name"], "lamp_on");
                        let id = msg.data["requestId"].as_str().unwrap().to_string();
                        assert!(handler.confirmations.resolve("ch1", &id, false));
                        return;
                    }
                }
            })
        };

        let outcome = handler
            .run_tool_loop(&mut ctx, &f.llm, "sys".into(), vec![ChatMessage::user("light")])
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(outcome.text, "Okay, I won't.");
        assert_eq!(executed.load(Ordering::SeqCst), 0);
        let requests = f.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let tool_msg = requests[1].messages.last().unwrap();
        assert_eq!(
            tool_msg.content.as_deref(),
            Some("Tool 'lamp_on' was rejected by the user.")
        );
        assert!(handler.confirmations.is_empty());
    }

    #[tokio::test]
    async fn test_confirmation_timeout_denies() {
        let config = HandlerConfig {
            confirm_timeout: Duration::from_millis(30),
            ..HandlerConfig::default()
        };
        let f = fixture(
            vec![tool_call("c1", "lamp_on", "{}"), text("No answer, skipping.")],
            text("unused"),
            config,
        );
        let executed = Arc::new(AtomicUsize::new(0));
        register_plugin_tool(&f.handler, &executed);
        let (mut ctx, mut rx) = context("ch1");

        let outcome = f
            .handler
            .run_tool_loop(&mut ctx, &f.llm, "sys".into(), vec![ChatMessage::user("light")])
            .await
            .unwrap();

        assert_eq!(outcome.text, "No answer, skipping.");
        assert_eq!(executed.load(Ordering::SeqCst), 0);
        assert!(f.handler.confirmations.is_empty());
        let confirm = drain(&mut rx)
            .into_iter()
            .find(|m| m.kind == OutboundKind::ToolConfirm)
            .unwrap();
        assert_eq!(confirm.data["timeoutMs"], 30);
    }

    #[tokio::test]
    async fn test_streaming_forwards_text_and_hides_tool_fragments() {
        let f = fixture(
            vec![tool_call("c1", "get_weather", r#"{"city":"Oslo"}"#), text("Cold in Oslo.")],
            text("unused"),
            HandlerConfig::default(),
        );
        let executed = Arc::new(AtomicUsize::new(0));
        register_weather(&f.handler, &executed);
        let llm = LlmHandle {
            streaming: true,
            ..f.llm.clone()
        };
        let (mut ctx, mut rx) = context("ch1");

        let outcome = f
            .handler
            .run_tool_loop(&mut ctx, &llm, "sys".into(), vec![ChatMessage::user("Oslo?")])
            .await
            .unwrap();
        assert!(outcome.streamed);
        assert_eq!(outcome.text, "Cold in Oslo.");

        let kinds: Vec<OutboundKind> = drain(&mut rx)
            .into_iter()
            .map(|m| m.kind)
            .filter(|k| *k != OutboundKind::ToolStatus)
            .collect();
        assert_eq!(
            kinds,
            vec![
                OutboundKind::DialogueStreamStart,
                OutboundKind::DialogueStreamChunk,
                OutboundKind::DialogueStreamEnd,
            ]
        );
    }

    #[tokio::test]
    async fn test_storage_failure_mid_loop_closes_stream() {
        let f = fixture(
            vec![ChatResponse {
                text: "Checking the sky.".into(),
                ..tool_call("c1", "get_weather", r#"{"city":"Oslo"}"#)
            }],
            text("unused"),
            HandlerConfig::default(),
        );
        let executed = Arc::new(AtomicUsize::new(0));
        register_weather(&f.handler, &executed);
        f.handler
            .sessions
            .store()
            .execute_batch(
                "CREATE TRIGGER reject_messages BEFORE INSERT ON messages
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();
        let llm = LlmHandle {
            streaming: true,
            ..f.llm.clone()
        };
        let (mut ctx, mut rx) = context("ch1");

        let result = f
            .handler
            .run_tool_loop(&mut ctx, &llm, "sys".into(), vec![ChatMessage::user("Oslo?")])
            .await;
        assert!(matches!(result, Err(HandlerError::Storage(_))));
        assert_eq!(executed.load(Ordering::SeqCst), 0);

        let sent = drain(&mut rx);
        assert_eq!(sent.first().map(|m| m.kind), Some(OutboundKind::DialogueStreamStart));
        let end = sent.last().unwrap();
        assert_eq!(end.kind, OutboundKind::DialogueStreamEnd);
        assert!(end.data["error"].as_str().unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn test_provider_failure_propagates() {
        struct Down;

        #[async_trait]
        impl LlmProvider for Down {
            async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
                Err(ProviderError::ConnectionFailed {
                    endpoint: "http://localhost:1".into(),
                    reason: "connection refused".into(),
                })
            }
        }

        let f = fixture(Vec::new(), text("unused"), HandlerConfig::default());
        let llm = LlmHandle {
            instance_id: "down".into(),
            provider: Arc::new(Down),
            streaming: false,
        };
        let (mut ctx, _rx) = context("ch1");
        let result = f
            .handler
            .run_tool_loop(&mut ctx, &llm, "sys".into(), vec![ChatMessage::user("hi")])
            .await;
        assert!(matches!(result, Err(HandlerError::Provider(_))));
    }
}
