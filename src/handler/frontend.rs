//! Frontend plugins: client-side capabilities bridged in as tools.
//!
//! The client reports its plugins with `plugin_status`. Each action becomes
//! a plugin-sourced tool whose handler sends `plugin_invoke` over the
//! reporting channel and waits for the matching `plugin_response`. Bridged
//! tools are scoped to the reporting channel, so two clients may offer the
//! same plugin without touching each other's tools.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::dispatch::Handler;
use super::errors::HandlerError;
use crate::agent_core::PendingRequests;
use crate::pipeline::{ClientChannel, MessageContext, OutboundKind, OutboundMessage};
use crate::sync::lock;
use crate::tools::{ToolError, ToolHandler, ToolSource, ToolSpec};

/// What a `plugin_response` settles an invocation with.
pub(crate) type InvokeOutcome = Result<serde_json::Value, String>;

/// Headroom so the invocation's own timeout fires before the registry's.
const REGISTRY_TIMEOUT_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrontendPluginStatus {
    plugin_id: String,
    #[serde(default = "default_true")]
    connected: bool,
    #[serde(default)]
    actions: Vec<FrontendAction>,
}

#[derive(Debug, Clone, Deserialize)]
struct FrontendAction {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "empty_schema")]
    parameters: serde_json::Value,
}

fn default_true() -> bool {
    true
}

fn empty_schema() -> serde_json::Value {
    json!({ "type": "object", "properties": {} })
}

/// Accepts `{plugins: [...]}` or a single status object.
fn parse_statuses(data: &serde_json::Value) -> Result<Vec<FrontendPluginStatus>, String> {
    match data.get("plugins") {
        Some(list) => serde_json::from_value(list.clone()).map_err(|e| e.to_string()),
        None => serde_json::from_value(data.clone())
            .map(|status| vec![status])
            .map_err(|e| e.to_string()),
    }
}

/// Tool names must satisfy `^[a-zA-Z0-9_-]+$`.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ─── Tool Handler ───────────────────────────────────────────────────────────

struct FrontendPluginTool {
    channel: ClientChannel,
    plugin_id: String,
    action: String,
    invocations: PendingRequests<InvokeOutcome>,
    timeout: Duration,
}

#[async_trait]
impl ToolHandler for FrontendPluginTool {
    async fn call(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let tool = format!("{}_{}", self.plugin_id, self.action);
        let ticket = self.invocations.register(self.channel.id());
        let message = OutboundMessage::new(
            OutboundKind::PluginInvoke,
            None,
            json!({
                "requestId": ticket.id(),
                "pluginId": self.plugin_id,
                "action": self.action,
                "params": arguments,
            }),
        );
        if !self.channel.send(message) {
            return Err(ToolError::failed(&tool, "client disconnected"));
        }

        let timed_out = format!(
            "plugin '{}' did not respond within {}ms",
            self.plugin_id,
            self.timeout.as_millis()
        );
        ticket
            .wait(self.timeout, Err(timed_out))
            .await
            .map_err(|reason| ToolError::failed(&tool, reason))
    }
}

// ─── Handler Side ───────────────────────────────────────────────────────────

impl Handler {
    pub(crate) fn on_plugin_status(&self, ctx: &MessageContext) -> Result<(), HandlerError> {
        let statuses = parse_statuses(&ctx.message.data)
            .map_err(|reason| HandlerError::payload("plugin_status", reason))?;

        for status in statuses {
            let plugin_id = sanitize(&status.plugin_id);
            let removed = self.unbridge(ctx.channel_id(), &plugin_id);

            if !status.connected {
                tracing::info!(channel = %ctx.channel_id(), plugin = %plugin_id, tools = removed, "frontend plugin disconnected");
                continue;
            }

            let mut ids = Vec::with_capacity(status.actions.len());
            for action in status.actions {
                let action_name = sanitize(&action.name);
                let spec = ToolSpec {
                    name: format!("{plugin_id}_{action_name}"),
                    description: action.description,
                    parameters: action.parameters,
                    source: ToolSource::Plugin,
                    owner: Some(plugin_id.clone()),
                    timeout: Some(self.config.plugin_invoke_timeout + REGISTRY_TIMEOUT_MARGIN),
                };
                let handler = std::sync::Arc::new(FrontendPluginTool {
                    channel: ctx.channel.clone(),
                    plugin_id: plugin_id.clone(),
                    action: action_name,
                    invocations: self.invocations.clone(),
                    timeout: self.config.plugin_invoke_timeout,
                });
                match self.tools.register_for_channel(ctx.channel_id(), spec, handler) {
                    Ok(def) => ids.push(def.id),
                    Err(e) => {
                        tracing::warn!(channel = %ctx.channel_id(), plugin = %plugin_id, error = %e, "frontend action not bridged")
                    }
                }
            }

            tracing::info!(channel = %ctx.channel_id(), plugin = %plugin_id, tools = ids.len(), "frontend plugin connected");
            lock(&self.bridged)
                .entry(ctx.channel_id().to_string())
                .or_default()
                .insert(plugin_id, ids);
        }
        Ok(())
    }

    /// Unregister one frontend plugin's tools for a channel.
    fn unbridge(&self, channel_id: &str, plugin_id: &str) -> usize {
        let ids = lock(&self.bridged)
            .get_mut(channel_id)
            .and_then(|plugins| plugins.remove(plugin_id))
            .unwrap_or_default();
        self.tools.unregister_many(&ids)
    }

    /// Unregister every tool a channel bridged in.
    pub(crate) fn unbridge_channel(&self, channel_id: &str) -> usize {
        let plugins: HashMap<String, Vec<String>> =
            lock(&self.bridged).remove(channel_id).unwrap_or_default();
        plugins
            .values()
            .map(|ids| self.tools.unregister_many(ids))
            .sum()
    }
}
