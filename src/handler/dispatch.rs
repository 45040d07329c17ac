//! Default business logic behind the Process stage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::commands::{CommandInvocation, CommandRegistry};
use super::errors::HandlerError;
use super::frontend::InvokeOutcome;
use super::prompt::{self, CHARACTER_INFO_KEY, MODEL_INFO_KEY};
use crate::agent_core::{AgentError, MessageType, NewMessage, PendingRequests, SessionManager};
use crate::pipeline::{
    ClientChannel, Dispatcher, InboundKind, MessageContext, OutboundKind, OutboundMessage,
    PipelineError,
};
use crate::plugins::PluginManager;
use crate::providers::{ProviderRegistry, Role};
use crate::tools::ToolRegistry;

pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 10;
pub const DEFAULT_HISTORY_LIMIT: usize = 40;
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PLUGIN_INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) const NO_PROVIDER_REPLY: &str =
    "No LLM provider is configured yet. Add one in settings so I can chat with you.";

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub system_prompt: String,
    pub max_tool_iterations: usize,
    /// Most recent messages sent to the model per turn.
    pub history_limit: usize,
    pub confirm_timeout: Duration,
    pub plugin_invoke_timeout: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            system_prompt: prompt::DEFAULT_SYSTEM_PROMPT.to_string(),
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
            plugin_invoke_timeout: DEFAULT_PLUGIN_INVOKE_TIMEOUT,
        }
    }
}

pub struct Handler {
    pub(crate) config: HandlerConfig,
    pub(crate) providers: Arc<ProviderRegistry>,
    pub(crate) tools: Arc<ToolRegistry>,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) commands: Arc<CommandRegistry>,
    plugins: Option<Arc<PluginManager>>,
    pub(crate) confirmations: PendingRequests<bool>,
    pub(crate) invocations: PendingRequests<InvokeOutcome>,
    /// channel id → frontend plugin id → bridged tool ids
    pub(crate) bridged: Mutex<HashMap<String, HashMap<String, Vec<String>>>>,
}

impl Handler {
    pub fn new(
        config: HandlerConfig,
        providers: Arc<ProviderRegistry>,
        tools: Arc<ToolRegistry>,
        sessions: Arc<SessionManager>,
        commands: Arc<CommandRegistry>,
    ) -> Self {
        Self {
            config,
            providers,
            tools,
            sessions,
            commands,
            plugins: None,
            confirmations: PendingRequests::new(),
            invocations: PendingRequests::new(),
            bridged: Mutex::new(HashMap::new()),
        }
    }

    /// Offer messages to Handler plugins before the default logic.
    pub fn with_plugins(mut self, plugins: Arc<PluginManager>) -> Self {
        self.plugins = Some(plugins);
        self
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    // ─── Connection Lifecycle ───────────────────────────────────────────

    /// Bind the channel to its session and announce the command list.
    pub fn on_connect(&self, channel: &ClientChannel) -> Result<(), HandlerError> {
        let session = self.sessions.attach(channel.id())?;
        channel.send(self.commands_register_message());
        tracing::info!(
            channel = %channel.id(),
            conversation = ?session.current_conversation_id,
            "client connected"
        );
        Ok(())
    }

    /// Settle everything still waiting on this channel and drop its
    /// bridged tools.
    pub fn on_disconnect(&self, channel_id: &str) {
        let confirmations = self.confirmations.cancel_channel(channel_id, || false);
        let invocations = self
            .invocations
            .cancel_channel(channel_id, || Err("client disconnected".to_string()));
        let tools = self.unbridge_channel(channel_id);
        self.sessions.detach(channel_id);
        tracing::info!(
            channel = %channel_id,
            confirmations,
            invocations,
            tools,
            "client disconnected"
        );
    }

    pub fn commands_register_message(&self) -> OutboundMessage {
        OutboundMessage::new(
            OutboundKind::CommandsRegister,
            None,
            json!({ "commands": self.commands.list() }),
        )
    }

    // ─── Chat ───────────────────────────────────────────────────────────

    async fn on_user_input(&self, ctx: &mut MessageContext) -> Result<(), HandlerError> {
        let text = ctx
            .message
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| HandlerError::payload("user_input", "text is empty"))?
            .to_string();
        self.sessions
            .record(ctx.channel_id(), &NewMessage::user_text(text))?;
        self.chat_turn(ctx).await
    }

    async fn on_tap_event(&self, ctx: &mut MessageContext) -> Result<(), HandlerError> {
        let area = ctx
            .message
            .data_str("hitArea")
            .or_else(|| ctx.message.data_str("area"))
            .unwrap_or("body")
            .to_string();
        let prompt = format!("(The user touched your {area})");
        self.sessions
            .record(ctx.channel_id(), &NewMessage::user_text(prompt))?;
        self.chat_turn(ctx).await
    }

    /// One user turn: model call with tools, persisted answer, speech.
    async fn chat_turn(&self, ctx: &mut MessageContext) -> Result<(), HandlerError> {
        let channel_id = ctx.channel_id().to_string();

        let llm = match self.providers.primary_llm().await {
            Ok(Some(llm)) => llm,
            Ok(None) => {
                ctx.add_dialogue(NO_PROVIDER_REPLY);
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(channel = %channel_id, error = %e, "primary LLM unavailable");
                ctx.add_dialogue(format!("I can't reach my language model right now: {e}"));
                return Ok(());
            }
        };

        let history = self.sessions.history(&channel_id, self.config.history_limit)?;
        let system_prompt = prompt::build_system_prompt(
            &self.config.system_prompt,
            self.sessions.metadata(&channel_id, MODEL_INFO_KEY).as_ref(),
            self.sessions.metadata(&channel_id, CHARACTER_INFO_KEY).as_ref(),
        );

        let outcome = match self.run_tool_loop(ctx, &llm, system_prompt, history).await {
            Ok(outcome) => outcome,
            Err(HandlerError::Provider(e)) => {
                tracing::warn!(channel = %channel_id, instance = %llm.instance_id, error = %e, "chat request failed");
                ctx.add_dialogue(format!("Sorry, I couldn't come up with a reply: {e}"));
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            channel = %channel_id,
            instance = %llm.instance_id,
            iterations = outcome.iterations,
            finish_reason = ?outcome.finish_reason,
            total_tokens = outcome.usage.total_tokens,
            "turn complete"
        );

        if !outcome.text.is_empty() {
            let message = NewMessage::assistant_text(outcome.text.clone()).with_extra(json!({
                "finishReason": outcome.finish_reason,
                "provider": llm.instance_id,
            }));
            self.sessions.record(&channel_id, &message)?;
        }

        // Sent at once so the text reaches the client ahead of any audio.
        if !outcome.streamed {
            ctx.send(OutboundKind::Dialogue, Some(outcome.text.clone()), serde_json::Value::Null);
        }
        self.speak(ctx, &outcome.text).await;
        Ok(())
    }

    // ─── Attachments & Commands ─────────────────────────────────────────

    async fn on_file_upload(&self, ctx: &mut MessageContext) -> Result<(), HandlerError> {
        let name = ctx
            .message
            .data_str("name")
            .or_else(|| ctx.message.data_str("fileName"))
            .ok_or_else(|| HandlerError::payload("file_upload", "missing file name"))?
            .to_string();
        let mime_type = ctx
            .message
            .data_str("mimeType")
            .unwrap_or("application/octet-stream")
            .to_string();
        let is_image = mime_type.starts_with("image/");

        let mut extra = json!({
            "fileName": name,
            "mimeType": mime_type,
            "size": ctx.message.data.get("size").cloned().unwrap_or(serde_json::Value::Null),
        });
        if is_image {
            if let Some(url) = ctx.message.data_str("dataUrl") {
                extra["dataUrl"] = json!(url);
            }
        }

        let caption = ctx
            .message
            .text
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| format!("[Uploaded {name}]"));
        let message_type = if is_image {
            MessageType::Image
        } else {
            MessageType::File
        };
        self.sessions.record(
            ctx.channel_id(),
            &NewMessage::new(Role::User, message_type, caption).with_extra(extra),
        )?;

        ctx.add_dialogue(format!("Got your file \"{name}\"."));
        Ok(())
    }

    async fn on_command(&self, ctx: &mut MessageContext) -> Result<(), HandlerError> {
        let name = ctx
            .message
            .data_str("command")
            .or(ctx.message.text.as_deref())
            .map(|c| c.trim().trim_start_matches('/').to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| HandlerError::payload("command_execute", "missing command name"))?;
        let args = ctx
            .message
            .data
            .get("args")
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        self.sessions
            .record(ctx.channel_id(), &NewMessage::command(format!("/{name}")))?;

        let invocation = CommandInvocation {
            name: name.clone(),
            args,
            channel_id: ctx.channel_id().to_string(),
        };
        let (text, data) = match self.commands.execute(invocation).await {
            Ok(result) => (result.clone(), json!({ "command": name, "success": true, "result": result })),
            Err(e) => {
                tracing::debug!(command = %name, error = %e, "command failed");
                let error = e.to_string();
                (error.clone(), json!({ "command": name, "success": false, "error": error }))
            }
        };
        ctx.add_reply(OutboundKind::CommandResponse, Some(text), data);
        Ok(())
    }

    // ─── Client Bookkeeping ─────────────────────────────────────────────

    fn on_confirm_response(&self, ctx: &MessageContext) -> Result<(), HandlerError> {
        let request_id = ctx
            .message
            .data_str("requestId")
            .ok_or_else(|| HandlerError::payload("tool_confirm_response", "missing requestId"))?;
        let approved = ctx
            .message
            .data
            .get("approved")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !self.confirmations.resolve(ctx.channel_id(), request_id, approved) {
            tracing::debug!(channel = %ctx.channel_id(), request_id = %request_id, "confirmation for unknown, settled or foreign request");
        }
        Ok(())
    }

    fn on_plugin_response(&self, ctx: &MessageContext) -> Result<(), HandlerError> {
        let data = &ctx.message.data;
        let request_id = ctx
            .message
            .data_str("requestId")
            .ok_or_else(|| HandlerError::payload("plugin_response", "missing requestId"))?;
        let success = data.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
        let outcome = if success {
            Ok(data.get("result").cloned().unwrap_or(serde_json::Value::Null))
        } else {
            Err(data
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("plugin reported failure")
                .to_string())
        };
        if !self.invocations.resolve(ctx.channel_id(), request_id, outcome) {
            tracing::debug!(channel = %ctx.channel_id(), request_id = %request_id, "plugin response for unknown, settled or foreign request");
        }
        Ok(())
    }

    fn store_info(&self, ctx: &MessageContext, key: &str) {
        self.sessions
            .set_metadata(ctx.channel_id(), key, ctx.message.data.clone());
        tracing::debug!(channel = %ctx.channel_id(), key = %key, "session info updated");
    }
}

#[async_trait]
impl Dispatcher for Handler {
    async fn dispatch(&self, ctx: &mut MessageContext) -> Result<(), PipelineError> {
        if let Some(plugins) = &self.plugins {
            if plugins.dispatch_hook(ctx).await {
                return Ok(());
            }
        }

        let result = match ctx.message.kind {
            InboundKind::UserInput => self.on_user_input(ctx).await,
            InboundKind::TapEvent => self.on_tap_event(ctx).await,
            InboundKind::FileUpload => self.on_file_upload(ctx).await,
            InboundKind::CommandExecute => self.on_command(ctx).await,
            InboundKind::ToolConfirmResponse => self.on_confirm_response(ctx),
            InboundKind::PluginResponse => self.on_plugin_response(ctx),
            InboundKind::PluginStatus => self.on_plugin_status(ctx),
            InboundKind::ModelInfo => {
                self.store_info(ctx, MODEL_INFO_KEY);
                Ok(())
            }
            InboundKind::CharacterInfo => {
                self.store_info(ctx, CHARACTER_INFO_KEY);
                Ok(())
            }
            InboundKind::PluginMessage => {
                tracing::debug!(channel = %ctx.channel_id(), "plugin message not handled by any plugin");
                Ok(())
            }
            InboundKind::Unknown => Err(HandlerError::payload("inbound", "unsupported message type")),
        };

        result.map_err(|e| {
            if let HandlerError::Storage(AgentError::DatabaseError { .. }) = &e {
                tracing::error!(channel = %ctx.channel_id(), error = %e, "conversation store failure");
            }
            PipelineError::from(e)
        })
    }
}
