//! Plugin discovery, dependency-ordered activation and hook dispatch.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use futures::FutureExt;

use super::api::{HandlerHooks, Plugin};
use super::context::{load_plugin_config, save_plugin_config, PluginContext, PluginServices};
use super::errors::PluginError;
use super::types::{PluginInfo, PluginMetadata, PluginStatus};
use crate::pipeline::{InboundKind, MessageContext};
use crate::providers::{resolve_config, ConfigField};
use crate::sync::{read, write};

const METADATA_FILE: &str = "metadata.json";
const CONFIG_SCHEMA_FILE: &str = "config_schema.json";

/// Builds a fresh plugin instance. Registered under the name plugins use as
/// their `entry`.
pub type PluginFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

struct PluginRecord {
    metadata: PluginMetadata,
    dir: Option<PathBuf>,
    schema: Vec<ConfigField>,
    status: PluginStatus,
    error: Option<String>,
    instance: Option<Arc<dyn Plugin>>,
    context: Option<PluginContext>,
}

pub struct PluginManager {
    services: Arc<PluginServices>,
    factories: RwLock<HashMap<String, PluginFactory>>,
    plugins: RwLock<BTreeMap<String, PluginRecord>>,
    /// Active plugins in activation order; hooks run in this order.
    active: RwLock<Vec<String>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl PluginManager {
    pub fn new(services: PluginServices) -> Self {
        Self {
            services: Arc::new(services),
            factories: RwLock::new(HashMap::new()),
            plugins: RwLock::new(BTreeMap::new()),
            active: RwLock::new(Vec::new()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn register_factory(&self, entry: &str, factory: PluginFactory) {
        write(&self.factories).insert(entry.to_string(), factory);
    }

    // ─── Discovery ──────────────────────────────────────────────────────

    /// Load every plugin directory under `dir`.
    ///
    /// Directories with unreadable or invalid metadata are skipped with a
    /// warning. Returns the names that were added.
    pub fn discover(&self, dir: &Path) -> Result<Vec<String>, PluginError> {
        if !dir.exists() {
            tracing::debug!(dir = %dir.display(), "plugin directory does not exist");
            return Ok(Vec::new());
        }

        let mut dirs: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| PluginError::io(dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        let mut added = Vec::new();
        for plugin_dir in dirs {
            let loaded = read_plugin_dir(&plugin_dir)
                .and_then(|(metadata, schema)| self.add(metadata, schema, Some(plugin_dir.clone())));
            match loaded {
                Ok(name) => added.push(name),
                Err(e) => {
                    tracing::warn!(dir = %plugin_dir.display(), error = %e, "skipping plugin directory");
                }
            }
        }

        tracing::info!(dir = %dir.display(), count = added.len(), "plugins discovered");
        Ok(added)
    }

    /// Add a plugin in the `loaded` state.
    pub fn add(
        &self,
        metadata: PluginMetadata,
        schema: Vec<ConfigField>,
        dir: Option<PathBuf>,
    ) -> Result<String, PluginError> {
        let location = dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| metadata.name.clone());
        metadata
            .validate_name()
            .map_err(|reason| PluginError::InvalidMetadata {
                path: location.clone(),
                reason,
            })?;
        metadata
            .parsed_version()
            .map_err(|e| PluginError::InvalidVersion {
                name: metadata.name.clone(),
                version: metadata.version.clone(),
                reason: e.to_string(),
            })?;
        metadata
            .parsed_dependencies()
            .map_err(|reason| PluginError::InvalidMetadata {
                path: location,
                reason,
            })?;

        let name = metadata.name.clone();
        let mut plugins = write(&self.plugins);
        if plugins.contains_key(&name) {
            return Err(PluginError::Duplicate { name });
        }
        plugins.insert(
            name.clone(),
            PluginRecord {
                metadata,
                dir,
                schema,
                status: PluginStatus::Loaded,
                error: None,
                instance: None,
                context: None,
            },
        );
        tracing::debug!(plugin = %name, "plugin loaded");
        Ok(name)
    }

    // ─── Activation ─────────────────────────────────────────────────────

    /// Activate `name`, activating its dependencies first.
    pub async fn activate(&self, name: &str) -> Result<(), PluginError> {
        let _guard = self.lifecycle.lock().await;
        self.activate_locked(name).await
    }

    /// Activate every `loaded` plugin. Failures are recorded on the failing
    /// plugin and returned; they never stop the others.
    pub async fn activate_all(&self) -> Vec<(String, PluginError)> {
        let _guard = self.lifecycle.lock().await;
        let candidates: Vec<String> = read(&self.plugins)
            .iter()
            .filter(|(_, r)| r.status == PluginStatus::Loaded)
            .map(|(name, _)| name.clone())
            .collect();

        let mut failures = Vec::new();
        for name in candidates {
            if self.status(&name) != Some(PluginStatus::Loaded) {
                continue;
            }
            if let Err(e) = self.activate_locked(&name).await {
                failures.push((name, e));
            }
        }
        failures
    }

    async fn activate_locked(&self, root: &str) -> Result<(), PluginError> {
        let order = match self.activation_order(root) {
            Ok(order) => order,
            Err(e) => {
                self.mark_error(root, &e);
                return Err(e);
            }
        };

        for name in order {
            if let Err(e) = self.activate_one(&name).await {
                self.mark_error(&name, &e);
                if name != root {
                    let e = PluginError::DependencyFailed {
                        name: root.to_string(),
                        dependency: name,
                    };
                    self.mark_error(root, &e);
                    return Err(e);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// `root` and its transitive dependencies, dependencies first.
    fn activation_order(&self, root: &str) -> Result<Vec<String>, PluginError> {
        let plugins = read(&self.plugins);
        let mut order = Vec::new();
        let mut visiting = Vec::new();
        visit(&plugins, root, &mut visiting, &mut order)?;
        Ok(order)
    }

    async fn activate_one(&self, name: &str) -> Result<(), PluginError> {
        let (metadata, schema, status) = {
            let plugins = read(&self.plugins);
            let record = plugins.get(name).ok_or_else(|| PluginError::NotFound {
                name: name.to_string(),
            })?;
            (record.metadata.clone(), record.schema.clone(), record.status)
        };
        match status {
            PluginStatus::Active => return Ok(()),
            PluginStatus::Disabled => {
                return Err(PluginError::Disabled {
                    name: name.to_string(),
                })
            }
            PluginStatus::Loaded | PluginStatus::Error => {}
        }

        let factory = read(&self.factories)
            .get(&metadata.entry)
            .cloned()
            .ok_or_else(|| PluginError::UnknownEntry {
                name: name.to_string(),
                entry: metadata.entry.clone(),
            })?;

        let config = load_plugin_config(name, &self.services.config_path(name), &schema)?;
        let data_dir = self.services.plugin_data_dir(name);
        std::fs::create_dir_all(&data_dir).map_err(|e| PluginError::io(&data_dir, e))?;

        let ctx = PluginContext::new(name, Arc::clone(&self.services), schema, config);
        let plugin = factory();

        let outcome = AssertUnwindSafe(plugin.initialize(ctx.clone()))
            .catch_unwind()
            .await;
        let reason = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(panic) => Some(panic_message(panic)),
        };
        if let Some(reason) = reason {
            ctx.release();
            return Err(PluginError::InitFailed {
                name: name.to_string(),
                reason,
            });
        }

        if let Some(record) = write(&self.plugins).get_mut(name) {
            record.status = PluginStatus::Active;
            record.error = None;
            record.instance = Some(plugin);
            record.context = Some(ctx.clone());
        }
        write(&self.active).push(name.to_string());

        tracing::info!(
            plugin = %name,
            version = %metadata.version,
            tools = ctx.registered_tools().len(),
            commands = ctx.registered_commands().len(),
            "plugin activated"
        );
        Ok(())
    }

    fn mark_error(&self, name: &str, error: &PluginError) {
        if let Some(record) = write(&self.plugins).get_mut(name) {
            if !matches!(record.status, PluginStatus::Active | PluginStatus::Disabled) {
                record.status = PluginStatus::Error;
                record.error = Some(error.to_string());
            }
        }
        tracing::warn!(plugin = %name, error = %error, "plugin activation failed");
    }

    // ─── Deactivation ───────────────────────────────────────────────────

    /// Deactivate `name` and every active plugin that depends on it.
    pub async fn deactivate(&self, name: &str) -> Result<(), PluginError> {
        let _guard = self.lifecycle.lock().await;
        if !read(&self.plugins).contains_key(name) {
            return Err(PluginError::NotFound {
                name: name.to_string(),
            });
        }
        for dependent in self.dependents_of(name).into_iter().rev() {
            self.deactivate_one(&dependent, PluginStatus::Loaded, None).await;
        }
        Ok(())
    }

    /// Active plugins that need `name`, including itself, in activation order.
    fn dependents_of(&self, name: &str) -> Vec<String> {
        let active = read(&self.active).clone();
        let plugins = read(&self.plugins);
        let mut affected: Vec<String> = Vec::new();
        for candidate in active {
            let depends = plugins
                .get(&candidate)
                .and_then(|r| r.metadata.parsed_dependencies().ok())
                .map(|deps| deps.iter().any(|d| affected.contains(&d.name)))
                .unwrap_or(false);
            if candidate == name || depends {
                affected.push(candidate);
            }
        }
        affected
    }

    async fn deactivate_one(&self, name: &str, next: PluginStatus, error: Option<String>) {
        let (instance, context) = {
            let mut plugins = write(&self.plugins);
            match plugins.get_mut(name) {
                Some(record) => {
                    record.status = next;
                    record.error = error;
                    (record.instance.take(), record.context.take())
                }
                None => return,
            }
        };
        write(&self.active).retain(|n| n != name);

        if let Some(plugin) = instance {
            let outcome = AssertUnwindSafe(plugin.terminate()).catch_unwind().await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(plugin = %name, error = %format!("{e:#}"), "plugin terminate failed")
                }
                Err(panic) => {
                    tracing::warn!(plugin = %name, error = %panic_message(panic), "plugin terminate panicked")
                }
            }
        }
        if let Some(ctx) = context {
            ctx.release();
        }
        tracing::info!(plugin = %name, status = ?next, "plugin deactivated");
    }

    /// Enable or disable a plugin. Disabling an active plugin deactivates it.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), PluginError> {
        let _guard = self.lifecycle.lock().await;
        let status = self.status(name).ok_or_else(|| PluginError::NotFound {
            name: name.to_string(),
        })?;

        if enabled {
            if status == PluginStatus::Disabled {
                if let Some(record) = write(&self.plugins).get_mut(name) {
                    record.status = PluginStatus::Loaded;
                }
            }
            return Ok(());
        }

        for dependent in self.dependents_of(name).into_iter().rev() {
            self.deactivate_one(&dependent, PluginStatus::Loaded, None).await;
        }
        if let Some(record) = write(&self.plugins).get_mut(name) {
            record.status = PluginStatus::Disabled;
            record.error = None;
        }
        Ok(())
    }

    /// Deactivate everything in reverse activation order.
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        let active = read(&self.active).clone();
        for name in active.into_iter().rev() {
            self.deactivate_one(&name, PluginStatus::Loaded, None).await;
        }
    }

    // ─── Hooks ──────────────────────────────────────────────────────────

    /// Offer the message to every active Handler plugin in activation order.
    ///
    /// Returns true once a hook reports the message as handled. A hook
    /// error or panic faults that plugin and the message moves on.
    pub async fn dispatch_hook(&self, ctx: &mut MessageContext) -> bool {
        if !is_hookable(ctx.message.kind) {
            return false;
        }

        let active: Vec<(String, Arc<dyn Plugin>)> = {
            let order = read(&self.active);
            let plugins = read(&self.plugins);
            order
                .iter()
                .filter_map(|n| {
                    plugins
                        .get(n)
                        .and_then(|r| r.instance.clone())
                        .map(|p| (n.clone(), p))
                })
                .collect()
        };

        for (name, plugin) in active {
            let Some(hooks) = plugin.handler_hooks() else {
                continue;
            };
            let outcome = AssertUnwindSafe(call_hook(hooks, ctx)).catch_unwind().await;
            let reason = match outcome {
                Ok(Ok(true)) => {
                    tracing::debug!(plugin = %name, kind = ?ctx.message.kind, "message handled by plugin");
                    return true;
                }
                Ok(Ok(false)) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => panic_message(panic),
            };
            tracing::warn!(plugin = %name, error = %reason, "plugin hook failed");
            let _guard = self.lifecycle.lock().await;
            self.deactivate_one(&name, PluginStatus::Error, Some(reason)).await;
        }
        false
    }

    // ─── Queries & Config ───────────────────────────────────────────────

    pub fn status(&self, name: &str) -> Option<PluginStatus> {
        read(&self.plugins).get(name).map(|r| r.status)
    }

    pub fn list(&self) -> Vec<PluginInfo> {
        read(&self.plugins)
            .values()
            .map(|r| PluginInfo {
                name: r.metadata.name.clone(),
                version: r.metadata.version.clone(),
                author: r.metadata.author.clone(),
                description: r.metadata.desc.clone(),
                status: r.status,
                error: r.error.clone(),
                dir: r.dir.as_ref().map(|d| d.display().to_string()),
                tools: r
                    .context
                    .as_ref()
                    .map(|c| c.registered_tools())
                    .unwrap_or_default(),
                commands: r
                    .context
                    .as_ref()
                    .map(|c| c.registered_commands())
                    .unwrap_or_default(),
            })
            .collect()
    }

    pub fn config_schema(&self, name: &str) -> Option<Vec<ConfigField>> {
        read(&self.plugins).get(name).map(|r| r.schema.clone())
    }

    /// Resolved config of any known plugin, active or not.
    pub fn plugin_config(&self, name: &str) -> Result<serde_json::Value, PluginError> {
        let schema = self.config_schema(name).ok_or_else(|| PluginError::NotFound {
            name: name.to_string(),
        })?;
        load_plugin_config(name, &self.services.config_path(name), &schema)
    }

    /// Replace a plugin's config. An active plugin sees the change at once.
    pub fn update_config(
        &self,
        name: &str,
        config: serde_json::Value,
    ) -> Result<serde_json::Value, PluginError> {
        let (schema, context) = {
            let plugins = read(&self.plugins);
            let record = plugins.get(name).ok_or_else(|| PluginError::NotFound {
                name: name.to_string(),
            })?;
            (record.schema.clone(), record.context.clone())
        };
        let resolved = resolve_config(&schema, &config).map_err(|reason| PluginError::Config {
            name: name.to_string(),
            reason,
        })?;
        save_plugin_config(&self.services.config_path(name), &resolved)?;
        if let Some(ctx) = context {
            ctx.replace_config(resolved.clone());
        }
        Ok(resolved)
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn read_plugin_dir(dir: &Path) -> Result<(PluginMetadata, Vec<ConfigField>), PluginError> {
    let metadata_path = dir.join(METADATA_FILE);
    let raw = std::fs::read_to_string(&metadata_path).map_err(|e| PluginError::io(&metadata_path, e))?;
    let metadata: PluginMetadata =
        serde_json::from_str(&raw).map_err(|e| PluginError::InvalidMetadata {
            path: metadata_path.display().to_string(),
            reason: e.to_string(),
        })?;

    let schema_path = dir.join(CONFIG_SCHEMA_FILE);
    let schema = match std::fs::read_to_string(&schema_path) {
        Ok(raw) => serde_json::from_str(&raw).map_err(|e| PluginError::InvalidMetadata {
            path: schema_path.display().to_string(),
            reason: e.to_string(),
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(PluginError::io(&schema_path, e)),
    };
    Ok((metadata, schema))
}

fn visit(
    plugins: &BTreeMap<String, PluginRecord>,
    name: &str,
    visiting: &mut Vec<String>,
    order: &mut Vec<String>,
) -> Result<(), PluginError> {
    if order.iter().any(|n| n == name) {
        return Ok(());
    }
    if visiting.iter().any(|n| n == name) {
        let mut path = visiting.clone();
        path.push(name.to_string());
        return Err(PluginError::DependencyCycle {
            name: name.to_string(),
            path: path.join(" -> "),
        });
    }

    let record = plugins.get(name).ok_or_else(|| PluginError::NotFound {
        name: name.to_string(),
    })?;
    if record.status == PluginStatus::Disabled {
        return Err(PluginError::Disabled {
            name: name.to_string(),
        });
    }

    let dependencies = record
        .metadata
        .parsed_dependencies()
        .map_err(|reason| PluginError::InvalidMetadata {
            path: name.to_string(),
            reason,
        })?;

    visiting.push(name.to_string());
    for dep in dependencies {
        let dep_record = plugins
            .get(&dep.name)
            .ok_or_else(|| PluginError::MissingDependency {
                name: name.to_string(),
                dependency: dep.name.clone(),
            })?;
        if let Some(requirement) = &dep.requirement {
            let satisfied = dep_record
                .metadata
                .parsed_version()
                .map(|v| requirement.matches(&v))
                .unwrap_or(false);
            if !satisfied {
                return Err(PluginError::VersionMismatch {
                    name: name.to_string(),
                    dependency: dep.name.clone(),
                    required: requirement.to_string(),
                    found: dep_record.metadata.version.clone(),
                });
            }
        }
        visit(plugins, &dep.name, visiting, order)?;
    }
    visiting.pop();
    order.push(name.to_string());
    Ok(())
}

fn is_hookable(kind: InboundKind) -> bool {
    matches!(
        kind,
        InboundKind::UserInput
            | InboundKind::TapEvent
            | InboundKind::FileUpload
            | InboundKind::PluginMessage
            | InboundKind::CommandExecute
    )
}

async fn call_hook(hooks: &dyn HandlerHooks, ctx: &mut MessageContext) -> anyhow::Result<bool> {
    match ctx.message.kind {
        InboundKind::UserInput => hooks.on_user_input(ctx).await,
        InboundKind::TapEvent => hooks.on_tap_event(ctx).await,
        InboundKind::FileUpload => hooks.on_file_upload(ctx).await,
        InboundKind::PluginMessage => hooks.on_plugin_message(ctx).await,
        InboundKind::CommandExecute => hooks.on_command(ctx).await,
        _ => Ok(false),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::handler::commands::CommandRegistry;
    use crate::pipeline::{ClientChannel, InboundMessage};
    use crate::providers::{FieldType, ProviderRegistry};
    use crate::tools::{handler_fn, ToolError, ToolRegistry};

    #[derive(Default)]
    struct Counters {
        init: AtomicUsize,
        terminate: AtomicUsize,
    }

    struct Greeter {
        counters: Arc<Counters>,
        fail: bool,
        handles_input: bool,
    }

    #[async_trait]
    impl Plugin for Greeter {
        async fn initialize(&self, ctx: PluginContext) -> anyhow::Result<()> {
            self.counters.init.fetch_add(1, Ordering::SeqCst);
            ctx.register_tool(
                "wave",
                "Wave at the user",
                json!({"type": "object"}),
                handler_fn(|_args| async { Ok::<_, ToolError>(json!("waved")) }),
            )?;
            if self.fail {
                anyhow::bail!("missing api key");
            }
            Ok(())
        }

        async fn terminate(&self) -> anyhow::Result<()> {
            self.counters.terminate.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn handler_hooks(&self) -> Option<&dyn HandlerHooks> {
            Some(self)
        }
    }

    #[async_trait]
    impl HandlerHooks for Greeter {
        async fn on_user_input(&self, ctx: &mut MessageContext) -> anyhow::Result<bool> {
            if ctx.message.text.as_deref() == Some("crash") {
                anyhow::bail!("hook exploded");
            }
            if self.handles_input {
                ctx.add_dialogue("handled by greeter");
            }
            Ok(self.handles_input)
        }
    }

    fn test_manager(dir: &Path) -> (PluginManager, Arc<ToolRegistry>) {
        let tools = Arc::new(ToolRegistry::default());
        let manager = PluginManager::new(PluginServices {
            tools: tools.clone(),
            commands: Arc::new(CommandRegistry::new()),
            providers: Arc::new(ProviderRegistry::new()),
            config_dir: dir.join("config"),
            data_dir: dir.join("data"),
        });
        (manager, tools)
    }

    fn factory(counters: &Arc<Counters>, fail: bool, handles_input: bool) -> PluginFactory {
        let counters = counters.clone();
        Arc::new(move || -> Arc<dyn Plugin> {
            Arc::new(Greeter {
                counters: counters.clone(),
                fail,
                handles_input,
            })
        })
    }

    fn write_plugin(root: &Path, dir: &str, metadata: serde_json::Value) {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join(METADATA_FILE), metadata.to_string()).unwrap();
    }

    #[test]
    fn test_discover_reads_metadata_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let plugins_dir = dir.path().join("plugins");
        write_plugin(
            &plugins_dir,
            "greeter",
            json!({"name": "greeter", "author": "pet", "desc": "Says hi", "version": "0.1.0", "entry": "greeter"}),
        );
        std::fs::write(
            plugins_dir.join("greeter").join(CONFIG_SCHEMA_FILE),
            json!([{"name": "greeting", "type": "string", "default": "hello"}]).to_string(),
        )
        .unwrap();
        write_plugin(
            &plugins_dir,
            "broken",
            json!({"name": "broken", "version": "one", "entry": "x"}),
        );

        let (manager, _) = test_manager(dir.path());
        let added = manager.discover(&plugins_dir).unwrap();
        assert_eq!(added, vec!["greeter"]);
        assert_eq!(manager.config_schema("greeter").unwrap()[0].field_type, FieldType::String);
        assert_eq!(manager.plugin_config("greeter").unwrap()["greeting"], "hello");
        assert!(manager.discover(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_activate_and_deactivate_track_tools() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, tools) = test_manager(dir.path());
        let counters = Arc::new(Counters::default());
        manager.register_factory("greeter", factory(&counters, false, false));
        manager
            .add(PluginMetadata::new("greeter", "1.0.0", "greeter"), Vec::new(), None)
            .unwrap();

        manager.activate("greeter").await.unwrap();
        assert_eq!(manager.status("greeter"), Some(PluginStatus::Active));
        assert!(tools.get("plugin_greeter_wave").is_some());
        assert!(dir.path().join("data").join("greeter").is_dir());
        assert_eq!(manager.list()[0].tools, vec!["plugin_greeter_wave"]);

        manager.deactivate("greeter").await.unwrap();
        assert_eq!(manager.status("greeter"), Some(PluginStatus::Loaded));
        assert!(tools.is_empty());
        assert_eq!(counters.terminate.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_init_failure_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, tools) = test_manager(dir.path());
        let good = Arc::new(Counters::default());
        let bad = Arc::new(Counters::default());
        manager.register_factory("good", factory(&good, false, false));
        manager.register_factory("bad", factory(&bad, true, false));
        manager
            .add(PluginMetadata::new("alpha", "1.0.0", "bad"), Vec::new(), None)
            .unwrap();
        manager
            .add(PluginMetadata::new("beta", "1.0.0", "good"), Vec::new(), None)
            .unwrap();
        manager
            .add(PluginMetadata::new("gamma", "1.0.0", "nowhere"), Vec::new(), None)
            .unwrap();

        let failures = manager.activate_all().await;
        assert_eq!(failures.len(), 2);
        assert_eq!(manager.status("alpha"), Some(PluginStatus::Error));
        assert_eq!(manager.status("beta"), Some(PluginStatus::Active));
        assert_eq!(manager.status("gamma"), Some(PluginStatus::Error));
        assert!(tools.get("plugin_alpha_wave").is_none());
        assert!(tools.get("plugin_beta_wave").is_some());

        let info = manager.list();
        let alpha = info.iter().find(|p| p.name == "alpha").unwrap();
        assert!(alpha.error.as_deref().unwrap().contains("missing api key"));
    }

    #[tokio::test]
    async fn test_dependencies_activate_first_and_cycles_fail() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = test_manager(dir.path());
        let counters = Arc::new(Counters::default());
        manager.register_factory("greeter", factory(&counters, false, false));

        manager
            .add(
                PluginMetadata::new("app", "1.0.0", "greeter").with_dependency("base@^2"),
                Vec::new(),
                None,
            )
            .unwrap();
        manager
            .add(PluginMetadata::new("base", "2.1.0", "greeter"), Vec::new(), None)
            .unwrap();
        manager.activate("app").await.unwrap();
        assert_eq!(manager.status("base"), Some(PluginStatus::Active));

        // Deactivating a dependency takes its dependents down too.
        manager.deactivate("base").await.unwrap();
        assert_eq!(manager.status("app"), Some(PluginStatus::Loaded));

        manager
            .add(
                PluginMetadata::new("ping", "1.0.0", "greeter").with_dependency("pong"),
                Vec::new(),
                None,
            )
            .unwrap();
        manager
            .add(
                PluginMetadata::new("pong", "1.0.0", "greeter").with_dependency("ping"),
                Vec::new(),
                None,
            )
            .unwrap();
        assert!(matches!(
            manager.activate("ping").await,
            Err(PluginError::DependencyCycle { .. })
        ));

        manager
            .add(
                PluginMetadata::new("lonely", "1.0.0", "greeter").with_dependency("ghost"),
                Vec::new(),
                None,
            )
            .unwrap();
        assert!(matches!(
            manager.activate("lonely").await,
            Err(PluginError::MissingDependency { .. })
        ));
        assert_eq!(manager.status("lonely"), Some(PluginStatus::Error));

        manager
            .add(
                PluginMetadata::new("picky", "1.0.0", "greeter").with_dependency("base@^3"),
                Vec::new(),
                None,
            )
            .unwrap();
        assert!(matches!(
            manager.activate("picky").await,
            Err(PluginError::VersionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_hooks_handle_and_faults_deactivate() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, tools) = test_manager(dir.path());
        let counters = Arc::new(Counters::default());
        manager.register_factory("greeter", factory(&counters, false, true));
        manager
            .add(PluginMetadata::new("greeter", "1.0.0", "greeter"), Vec::new(), None)
            .unwrap();
        manager.activate("greeter").await.unwrap();

        let (channel, _rx) = ClientChannel::pair("ch1");
        let mut ctx = MessageContext::new(InboundMessage::user_input("hi"), channel.clone());
        assert!(manager.dispatch_hook(&mut ctx).await);
        assert_eq!(ctx.pending_replies().len(), 1);

        let mut bookkeeping = MessageContext::new(
            InboundMessage::new(InboundKind::ToolConfirmResponse),
            channel.clone(),
        );
        assert!(!manager.dispatch_hook(&mut bookkeeping).await);

        let mut crash = MessageContext::new(InboundMessage::user_input("crash"), channel);
        assert!(!manager.dispatch_hook(&mut crash).await);
        assert_eq!(manager.status("greeter"), Some(PluginStatus::Error));
        assert!(tools.is_empty());
    }

    #[tokio::test]
    async fn test_update_config_validates_and_applies() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = test_manager(dir.path());
        let counters = Arc::new(Counters::default());
        manager.register_factory("greeter", factory(&counters, false, false));
        let schema = vec![ConfigField::new("volume", FieldType::Number, "").with_default(json!(5))];
        manager
            .add(PluginMetadata::new("greeter", "1.0.0", "greeter"), schema, None)
            .unwrap();

        assert!(manager.update_config("greeter", json!({"volume": "loud"})).is_err());
        let resolved = manager.update_config("greeter", json!({"volume": 9})).unwrap();
        assert_eq!(resolved["volume"], 9);
        assert_eq!(manager.plugin_config("greeter").unwrap()["volume"], 9);

        manager.set_enabled("greeter", false).await.unwrap();
        assert!(matches!(
            manager.activate("greeter").await,
            Err(PluginError::Disabled { .. })
        ));
        manager.set_enabled("greeter", true).await.unwrap();
        manager.activate("greeter").await.unwrap();
    }
}
