//! Slash-style commands run through `command_execute`.
//!
//! Built-ins are registered by the handler; plugins register their own under
//! a `<plugin>.` prefix. Every change bumps a watch counter so connected
//! channels can be sent a fresh `commands_register`.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;

use super::errors::HandlerError;
use crate::agent_core::SessionManager;
use crate::sync::{read, write};
use crate::tools::ToolRegistry;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDefinition {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<String>,
    /// Registering plugin, `None` for built-ins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
}

impl CommandDefinition {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            usage: None,
            plugin: None,
        }
    }

    pub fn with_usage(mut self, usage: &str) -> Self {
        self.usage = Some(usage.to_string());
        self
    }
}

/// One `command_execute` request.
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    pub name: String,
    pub args: serde_json::Value,
    pub channel_id: String,
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Returns the text shown to the user.
    async fn execute(&self, invocation: CommandInvocation) -> anyhow::Result<String>;
}

struct FnCommand<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnCommand<F>
where
    F: Fn(CommandInvocation) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    async fn execute(&self, invocation: CommandInvocation) -> anyhow::Result<String> {
        (self.0)(invocation).await
    }
}

pub fn command_fn<F, Fut>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(CommandInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    Arc::new(FnCommand(f))
}

// ─── Registry ───────────────────────────────────────────────────────────────

struct CommandEntry {
    definition: CommandDefinition,
    handler: Arc<dyn CommandHandler>,
}

pub struct CommandRegistry {
    commands: RwLock<BTreeMap<String, CommandEntry>>,
    revision: watch::Sender<u64>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            commands: RwLock::new(BTreeMap::new()),
            revision,
        }
    }

    pub fn register(
        &self,
        definition: CommandDefinition,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), HandlerError> {
        {
            let mut commands = write(&self.commands);
            if commands.contains_key(&definition.name) {
                return Err(HandlerError::DuplicateCommand {
                    name: definition.name,
                });
            }
            tracing::debug!(command = %definition.name, plugin = ?definition.plugin, "command registered");
            commands.insert(
                definition.name.clone(),
                CommandEntry {
                    definition,
                    handler,
                },
            );
        }
        self.bump();
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = write(&self.commands).remove(name).is_some();
        if removed {
            self.bump();
        }
        removed
    }

    /// Remove every command a plugin registered.
    pub fn unregister_plugin(&self, plugin: &str) -> Vec<String> {
        let removed: Vec<String> = {
            let mut commands = write(&self.commands);
            let names: Vec<String> = commands
                .values()
                .filter(|c| c.definition.plugin.as_deref() == Some(plugin))
                .map(|c| c.definition.name.clone())
                .collect();
            for name in &names {
                commands.remove(name);
            }
            names
        };
        if !removed.is_empty() {
            self.bump();
        }
        removed
    }

    /// Sorted by name.
    pub fn list(&self) -> Vec<CommandDefinition> {
        read(&self.commands)
            .values()
            .map(|c| c.definition.clone())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        read(&self.commands).contains_key(name)
    }

    /// Ticks on every registration change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub async fn execute(&self, invocation: CommandInvocation) -> Result<String, HandlerError> {
        let handler = read(&self.commands)
            .get(&invocation.name)
            .map(|c| Arc::clone(&c.handler))
            .ok_or_else(|| HandlerError::UnknownCommand {
                name: invocation.name.clone(),
            })?;

        let name = invocation.name.clone();
        handler
            .execute(invocation)
            .await
            .map_err(|e| HandlerError::CommandFailed {
                name,
                reason: format!("{e:#}"),
            })
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

// ─── Built-ins ──────────────────────────────────────────────────────────────

/// Register `new`, `help` and `tools`.
pub fn register_builtin_commands(
    commands: &Arc<CommandRegistry>,
    sessions: Arc<SessionManager>,
    tools: Arc<ToolRegistry>,
) -> Result<(), HandlerError> {
    commands.register(
        CommandDefinition::new("new", "Start a fresh conversation"),
        command_fn(move |inv: CommandInvocation| {
            let sessions = Arc::clone(&sessions);
            async move {
                sessions.start_new(&inv.channel_id);
                Ok("Started a new conversation.".to_string())
            }
        }),
    )?;

    let registry = Arc::downgrade(commands);
    commands.register(
        CommandDefinition::new("help", "List available commands"),
        command_fn(move |_inv: CommandInvocation| {
            let listing = registry
                .upgrade()
                .map(|r| format_command_list(&r.list()))
                .unwrap_or_default();
            async move { Ok(listing) }
        }),
    )?;

    commands.register(
        CommandDefinition::new("tools", "List tools the assistant can use"),
        command_fn(move |_inv: CommandInvocation| {
            let mut lines: Vec<String> = tools
                .all_tools()
                .into_iter()
                .filter(|t| t.enabled)
                .map(|t| format!("{} ({}): {}", t.name, t.source.as_str(), t.description))
                .collect();
            if lines.is_empty() {
                lines.push("No tools are available.".to_string());
            }
            let text = lines.join("\n");
            async move { Ok(text) }
        }),
    )?;

    Ok(())
}

fn format_command_list(commands: &[CommandDefinition]) -> String {
    commands
        .iter()
        .map(|c| match &c.usage {
            Some(usage) => format!("/{} {}: {}", c.name, usage, c.description),
            None => format!("/{}: {}", c.name, c.description),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::agent_core::{AgentDatabase, ConversationStore, NewMessage};

    fn invocation(name: &str, channel: &str) -> CommandInvocation {
        CommandInvocation {
            name: name.to_string(),
            args: serde_json::Value::Null,
            channel_id: channel.to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_execute_and_revision() {
        let registry = CommandRegistry::new();
        let mut rx = registry.subscribe();

        registry
            .register(
                CommandDefinition::new("ping", "Reply with pong"),
                command_fn(|_inv: CommandInvocation| async { Ok("pong".to_string()) }),
            )
            .unwrap();
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        assert_eq!(registry.execute(invocation("ping", "ch1")).await.unwrap(), "pong");
        assert!(matches!(
            registry.execute(invocation("missing", "ch1")).await,
            Err(HandlerError::UnknownCommand { .. })
        ));
        assert!(matches!(
            registry.register(
                CommandDefinition::new("ping", "again"),
                command_fn(|_inv: CommandInvocation| async { Ok(String::new()) }),
            ),
            Err(HandlerError::DuplicateCommand { .. })
        ));

        assert!(registry.unregister("ping"));
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_failing_command_reports_reason() {
        let registry = CommandRegistry::new();
        registry
            .register(
                CommandDefinition::new("boom", ""),
                command_fn(|_inv: CommandInvocation| async { Err(anyhow::anyhow!("disk full")) }),
            )
            .unwrap();
        let err = registry.execute(invocation("boom", "ch1")).await.unwrap_err();
        assert!(err.to_string().contains("disk full"));
    }

    #[tokio::test]
    async fn test_unregister_plugin_commands() {
        let registry = CommandRegistry::new();
        let mut def = CommandDefinition::new("weather.today", "");
        def.plugin = Some("weather".into());
        registry
            .register(def, command_fn(|_inv: CommandInvocation| async { Ok(String::new()) }))
            .unwrap();
        registry
            .register(
                CommandDefinition::new("help", ""),
                command_fn(|_inv: CommandInvocation| async { Ok(String::new()) }),
            )
            .unwrap();

        assert_eq!(registry.unregister_plugin("weather"), vec!["weather.today"]);
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn test_builtin_new_detaches_conversation() {
        let store = Arc::new(ConversationStore::new(AgentDatabase::open(":memory:").unwrap()));
        let sessions = Arc::new(SessionManager::new(store));
        let tools = Arc::new(ToolRegistry::new(Duration::from_secs(5)));
        let commands = Arc::new(CommandRegistry::new());
        register_builtin_commands(&commands, Arc::clone(&sessions), tools).unwrap();

        sessions.record("ch1", &NewMessage::user_text("hi")).unwrap();
        assert!(sessions.current_conversation("ch1").is_some());

        commands.execute(invocation("new", "ch1")).await.unwrap();
        assert!(sessions.current_conversation("ch1").is_none());

        let help = commands.execute(invocation("help", "ch1")).await.unwrap();
        assert!(help.contains("/new"));
        assert!(help.contains("/tools"));

        let tools_text = commands.execute(invocation("tools", "ch1")).await.unwrap();
        assert_eq!(tools_text, "No tools are available.");
    }
}
