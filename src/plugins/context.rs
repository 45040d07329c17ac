//! The capability-scoped context handed to a plugin on activation.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use super::errors::PluginError;
use crate::handler::commands::{CommandDefinition, CommandHandler, CommandRegistry};
use crate::providers::{
    resolve_config, ConfigField, LlmHandle, ProviderError, ProviderInstanceInfo,
    ProviderRegistry, TtsHandle,
};
use crate::sync::{lock, read, write};
use crate::tools::{ToolHandler, ToolRegistry, ToolSource, ToolSpec};

/// Shared services every plugin context draws from.
pub struct PluginServices {
    pub tools: Arc<ToolRegistry>,
    pub commands: Arc<CommandRegistry>,
    pub providers: Arc<ProviderRegistry>,
    /// Runtime config lives here as `<name>.json`, outside plugin sources.
    pub config_dir: PathBuf,
    /// Parent of each plugin's private data directory.
    pub data_dir: PathBuf,
}

impl PluginServices {
    pub fn config_path(&self, plugin: &str) -> PathBuf {
        self.config_dir.join(format!("{plugin}.json"))
    }

    pub fn plugin_data_dir(&self, plugin: &str) -> PathBuf {
        self.data_dir.join(plugin)
    }
}

// ─── Logger ─────────────────────────────────────────────────────────────────

/// Tracing events stamped with the plugin's name.
#[derive(Debug, Clone)]
pub struct PluginLogger {
    plugin: String,
}

impl PluginLogger {
    pub fn new(plugin: &str) -> Self {
        Self {
            plugin: plugin.to_string(),
        }
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(plugin = %self.plugin, "{message}");
    }

    pub fn info(&self, message: &str) {
        tracing::info!(plugin = %self.plugin, "{message}");
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(plugin = %self.plugin, "{message}");
    }

    pub fn error(&self, message: &str) {
        tracing::error!(plugin = %self.plugin, "{message}");
    }
}

// ─── Context ────────────────────────────────────────────────────────────────

struct ContextInner {
    name: String,
    services: Arc<PluginServices>,
    schema: Vec<ConfigField>,
    config: RwLock<serde_json::Value>,
    tool_ids: Mutex<Vec<String>>,
    command_names: Mutex<Vec<String>>,
    logger: PluginLogger,
}

/// Everything a plugin may touch. Registrations made through it are
/// tracked so deactivation removes exactly what the plugin added.
#[derive(Clone)]
pub struct PluginContext {
    inner: Arc<ContextInner>,
}

impl PluginContext {
    pub(crate) fn new(
        name: &str,
        services: Arc<PluginServices>,
        schema: Vec<ConfigField>,
        config: serde_json::Value,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                name: name.to_string(),
                services,
                schema,
                config: RwLock::new(config),
                tool_ids: Mutex::new(Vec::new()),
                command_names: Mutex::new(Vec::new()),
                logger: PluginLogger::new(name),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn logger(&self) -> &PluginLogger {
        &self.inner.logger
    }

    /// Private directory, created on activation.
    pub fn data_dir(&self) -> PathBuf {
        self.inner.services.plugin_data_dir(&self.inner.name)
    }

    // ─── Tools & Commands ───────────────────────────────────────────────

    /// Register a tool exposed to the model as `<plugin>_<name>`.
    ///
    /// Plugin tools always go through user confirmation before running.
    pub fn register_tool(
        &self,
        name: &str,
        description: &str,
        parameters: serde_json::Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<String, PluginError> {
        let spec = ToolSpec {
            name: format!("{}_{name}", self.inner.name),
            description: description.to_string(),
            parameters,
            source: ToolSource::Plugin,
            owner: Some(self.inner.name.clone()),
            timeout: None,
        };
        let def = self
            .inner
            .services
            .tools
            .register(spec, handler)
            .map_err(|e| self.registration_error(e))?;
        lock(&self.inner.tool_ids).push(def.id.clone());
        Ok(def.id)
    }

    pub fn unregister_tool(&self, name: &str) -> bool {
        let id = crate::tools::tool_id(
            ToolSource::Plugin,
            Some(&self.inner.name),
            &format!("{}_{name}", self.inner.name),
        );
        lock(&self.inner.tool_ids).retain(|t| t != &id);
        self.inner.services.tools.unregister(&id)
    }

    /// Register a command invoked as `<plugin>.<name>`.
    pub fn register_command(
        &self,
        name: &str,
        description: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<String, PluginError> {
        let mut definition =
            CommandDefinition::new(&format!("{}.{name}", self.inner.name), description);
        definition.plugin = Some(self.inner.name.clone());
        let full_name = definition.name.clone();
        self.inner
            .services
            .commands
            .register(definition, handler)
            .map_err(|e| self.registration_error(e))?;
        lock(&self.inner.command_names).push(full_name.clone());
        Ok(full_name)
    }

    fn registration_error(&self, e: impl std::fmt::Display) -> PluginError {
        PluginError::Registration {
            name: self.inner.name.clone(),
            reason: e.to_string(),
        }
    }

    /// Remove every tool and command registered through this context.
    pub(crate) fn release(&self) {
        let tool_ids = std::mem::take(&mut *lock(&self.inner.tool_ids));
        let commands = std::mem::take(&mut *lock(&self.inner.command_names));
        let removed_tools = self.inner.services.tools.unregister_many(&tool_ids);
        for name in &commands {
            self.inner.services.commands.unregister(name);
        }
        tracing::debug!(
            plugin = %self.inner.name,
            tools = removed_tools,
            commands = commands.len(),
            "plugin registrations released"
        );
    }

    pub fn registered_tools(&self) -> Vec<String> {
        lock(&self.inner.tool_ids).clone()
    }

    pub fn registered_commands(&self) -> Vec<String> {
        lock(&self.inner.command_names).clone()
    }

    // ─── Config ─────────────────────────────────────────────────────────

    /// Resolved config: persisted values over schema defaults.
    pub fn config(&self) -> serde_json::Value {
        read(&self.inner.config).clone()
    }

    pub fn config_value(&self, key: &str) -> Option<serde_json::Value> {
        read(&self.inner.config).get(key).cloned()
    }

    /// Validate, persist and apply one config key.
    pub fn set_config(&self, key: &str, value: serde_json::Value) -> Result<(), PluginError> {
        let mut updated = self.config();
        if let Some(map) = updated.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        let resolved = resolve_config(&self.inner.schema, &updated).map_err(|reason| {
            PluginError::Config {
                name: self.inner.name.clone(),
                reason,
            }
        })?;
        save_plugin_config(&self.inner.services.config_path(&self.inner.name), &resolved)?;
        self.replace_config(resolved);
        Ok(())
    }

    pub(crate) fn replace_config(&self, config: serde_json::Value) {
        *write(&self.inner.config) = config;
    }

    // ─── Providers ──────────────────────────────────────────────────────

    pub fn provider_instances(&self) -> Vec<ProviderInstanceInfo> {
        self.inner.services.providers.instances()
    }

    pub async fn llm(&self, instance_id: &str) -> Result<LlmHandle, ProviderError> {
        self.inner.services.providers.llm(instance_id).await
    }

    pub async fn primary_llm(&self) -> Result<Option<LlmHandle>, ProviderError> {
        self.inner.services.providers.primary_llm().await
    }

    pub async fn tts(&self, instance_id: &str) -> Result<TtsHandle, ProviderError> {
        self.inner.services.providers.tts(instance_id).await
    }

    pub async fn primary_tts(&self) -> Result<Option<TtsHandle>, ProviderError> {
        self.inner.services.providers.primary_tts().await
    }
}

// ─── Config Files ───────────────────────────────────────────────────────────

/// Persisted config resolved against `schema`. A missing file means defaults.
pub(crate) fn load_plugin_config(
    name: &str,
    path: &Path,
    schema: &[ConfigField],
) -> Result<serde_json::Value, PluginError> {
    let stored = match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).map_err(|e| PluginError::Config {
            name: name.to_string(),
            reason: format!("{}: {e}", path.display()),
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => serde_json::Value::Null,
        Err(e) => return Err(PluginError::io(path, e)),
    };
    resolve_config(schema, &stored).map_err(|reason| PluginError::Config {
        name: name.to_string(),
        reason,
    })
}

pub(crate) fn save_plugin_config(path: &Path, config: &serde_json::Value) -> Result<(), PluginError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PluginError::io(parent, e))?;
    }
    let json = serde_json::to_string_pretty(config).map_err(|e| PluginError::io(path, e))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| PluginError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| PluginError::io(path, e))?;
    Ok(())
}
