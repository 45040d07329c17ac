//! Unified tool registry.
//!
//! Native functions, MCP-discovered tools and plugin-bridged tools live in
//! one map keyed by `<origin>_<name>` ids. The set of enabled tools is
//! exported verbatim as the `tools` parameter of a chat request.
//!
//! Tools bridged in from a client are scoped to that client's channel: their
//! ids carry an `@<channel>` suffix, they are invisible to other channels and
//! they are never mirrored to storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use super::errors::ToolError;
use super::types::{
    ToolCallResult, ToolDefinition, ToolHandler, ToolSource, ToolSpec, ToolStore,
};
use crate::sync;

/// Default per-call timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

struct ToolEntry {
    def: ToolDefinition,
    handler: Arc<dyn ToolHandler>,
    timeout: Duration,
    /// Owning channel for client-bridged tools; `None` is visible everywhere.
    scope: Option<String>,
}

impl ToolEntry {
    fn visible_to(&self, channel_id: Option<&str>) -> bool {
        match &self.scope {
            None => true,
            Some(own) => channel_id == Some(own.as_str()),
        }
    }
}

pub struct ToolRegistry {
    tools: RwLock<HashMap<String, ToolEntry>>,
    default_timeout: Duration,
    store: Option<Arc<dyn ToolStore>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_TIMEOUT)
    }
}

/// Registry id for a tool: `function_<name>`, `mcp_<server>_<name>` or
/// `plugin_<name>`.
pub fn tool_id(source: ToolSource, owner: Option<&str>, name: &str) -> String {
    match (source, owner) {
        (ToolSource::Mcp, Some(server)) => format!("mcp_{server}_{name}"),
        _ => format!("{}_{name}", source.as_str()),
    }
}

/// Registry id for a tool visible only to `channel_id`.
pub fn scoped_tool_id(channel_id: &str, source: ToolSource, owner: Option<&str>, name: &str) -> String {
    format!("{}@{channel_id}", tool_id(source, owner, name))
}

impl ToolRegistry {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            default_timeout,
            store: None,
        }
    }

    /// Mirror every registration to durable storage.
    pub fn with_store(mut self, store: Arc<dyn ToolStore>) -> Self {
        self.store = Some(store);
        self
    }

    // ─── Registration ───────────────────────────────────────────────────

    /// Register (or replace) a tool visible to every channel.
    ///
    /// A tool that was disabled in a previous run comes back disabled.
    /// Registering an enabled tool whose name is already taken by another
    /// enabled tool fails with [`ToolError::DuplicateName`].
    pub fn register(
        &self,
        spec: ToolSpec,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<ToolDefinition, ToolError> {
        self.insert(spec, handler, None)
    }

    /// Register (or replace) a tool visible only to `channel_id`.
    ///
    /// The name must not clash with an enabled global tool or with another
    /// enabled tool of the same channel; other channels may reuse it.
    pub fn register_for_channel(
        &self,
        channel_id: &str,
        spec: ToolSpec,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<ToolDefinition, ToolError> {
        self.insert(spec, handler, Some(channel_id))
    }

    fn insert(
        &self,
        spec: ToolSpec,
        handler: Arc<dyn ToolHandler>,
        scope: Option<&str>,
    ) -> Result<ToolDefinition, ToolError> {
        let id = match scope {
            Some(channel_id) => {
                scoped_tool_id(channel_id, spec.source, spec.owner.as_deref(), &spec.name)
            }
            None => tool_id(spec.source, spec.owner.as_deref(), &spec.name),
        };

        let enabled = match (&self.store, scope) {
            (Some(store), None) => store.tool_enabled(&id).unwrap_or_else(|e| {
                tracing::warn!(tool = %id, error = %e, "failed to read persisted tool state");
                None
            }),
            _ => None,
        }
        .unwrap_or(true);

        let def = ToolDefinition {
            id: id.clone(),
            name: spec.name.clone(),
            description: spec.description,
            parameters: normalize_schema(spec.parameters),
            mcp_server: (spec.source == ToolSource::Mcp)
                .then(|| spec.owner.clone())
                .flatten(),
            plugin: (spec.source == ToolSource::Plugin)
                .then(|| spec.owner.clone())
                .flatten(),
            source: spec.source,
            enabled,
        };

        {
            let mut tools = sync::write(&self.tools);
            if enabled {
                if let Some(existing) = find_conflict(&tools, &def.name, scope) {
                    if existing != id {
                        return Err(ToolError::DuplicateName {
                            name: def.name,
                            existing_id: existing,
                        });
                    }
                }
            }
            tools.insert(
                id.clone(),
                ToolEntry {
                    def: def.clone(),
                    handler,
                    timeout: spec.timeout.unwrap_or(self.default_timeout),
                    scope: scope.map(str::to_string),
                },
            );
        }

        if scope.is_none() {
            self.mirror(|store| store.upsert_tool(&def));
        }
        tracing::debug!(tool = %id, source = def.source.as_str(), enabled, "tool registered");
        Ok(def)
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = sync::write(&self.tools).remove(id).is_some();
        if removed {
            tracing::debug!(tool = %id, "tool unregistered");
        }
        removed
    }

    /// Remove several tools under one write lock.
    pub fn unregister_many(&self, ids: &[String]) -> usize {
        let mut tools = sync::write(&self.tools);
        ids.iter().filter(|id| tools.remove(id.as_str()).is_some()).count()
    }

    /// Remove every tool contributed by an MCP server, atomically.
    pub fn unregister_mcp_server(&self, server: &str) -> Vec<String> {
        let mut tools = sync::write(&self.tools);
        let ids: Vec<String> = tools
            .values()
            .filter(|e| e.def.mcp_server.as_deref() == Some(server))
            .map(|e| e.def.id.clone())
            .collect();
        for id in &ids {
            tools.remove(id);
        }
        drop(tools);

        if !ids.is_empty() {
            tracing::info!(server = %server, count = ids.len(), "unregistered MCP server tools");
        }
        ids
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), ToolError> {
        let scoped = {
            let mut tools = sync::write(&self.tools);
            let (name, scope) = tools
                .get(id)
                .map(|e| (e.def.name.clone(), e.scope.clone()))
                .ok_or_else(|| ToolError::NotFound {
                    name: id.to_string(),
                })?;
            if enabled {
                if let Some(existing) = find_conflict(&tools, &name, scope.as_deref()) {
                    if existing != id {
                        return Err(ToolError::DuplicateName {
                            name,
                            existing_id: existing,
                        });
                    }
                }
            }
            if let Some(entry) = tools.get_mut(id) {
                entry.def.enabled = enabled;
            }
            scope.is_some()
        };
        if !scoped {
            self.mirror(|store| store.set_tool_enabled(id, enabled));
        }
        Ok(())
    }

    fn mirror(&self, op: impl FnOnce(&dyn ToolStore) -> Result<(), ToolError>) {
        if let Some(store) = &self.store {
            if let Err(e) = op(store.as_ref()) {
                tracing::warn!(error = %e, "failed to mirror tool definition");
            }
        }
    }

    // ─── Queries ────────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<ToolDefinition> {
        sync::read(&self.tools).get(id).map(|e| e.def.clone())
    }

    /// The enabled global tool exposed under `name`.
    pub fn get_by_name(&self, name: &str) -> Option<ToolDefinition> {
        self.lookup(None, name)
    }

    /// The enabled tool exposed under `name` to `channel_id`.
    pub fn get_by_name_for_channel(&self, channel_id: &str, name: &str) -> Option<ToolDefinition> {
        self.lookup(Some(channel_id), name)
    }

    fn lookup(&self, channel_id: Option<&str>, name: &str) -> Option<ToolDefinition> {
        sync::read(&self.tools)
            .values()
            .find(|e| e.def.enabled && e.def.name == name && e.visible_to(channel_id))
            .map(|e| e.def.clone())
    }

    /// Every registered tool, enabled or not, ordered by id.
    pub fn all_tools(&self) -> Vec<ToolDefinition> {
        let mut all: Vec<_> = sync::read(&self.tools)
            .values()
            .map(|e| e.def.clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Enabled global tools in OpenAI function-calling format, ordered by name.
    pub fn to_openai_tools(&self) -> Vec<serde_json::Value> {
        self.export(None)
    }

    /// Enabled tools visible to `channel_id`: the global ones plus the ones
    /// that channel bridged in.
    pub fn to_openai_tools_for_channel(&self, channel_id: &str) -> Vec<serde_json::Value> {
        self.export(Some(channel_id))
    }

    fn export(&self, channel_id: Option<&str>) -> Vec<serde_json::Value> {
        let tools = sync::read(&self.tools);
        let mut enabled: Vec<&ToolDefinition> = tools
            .values()
            .filter(|e| e.def.enabled && e.visible_to(channel_id))
            .map(|e| &e.def)
            .collect();
        enabled.sort_by(|a, b| a.name.cmp(&b.name));
        enabled.into_iter().map(ToolDefinition::to_openai).collect()
    }

    pub fn len(&self) -> usize {
        sync::read(&self.tools).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ─── Execution ──────────────────────────────────────────────────────

    /// Execute an enabled global tool by name, racing it against its timeout.
    ///
    /// Always returns a result; unknown tools, handler errors, panics and
    /// timeouts become `success: false`.
    pub async fn execute_tool(&self, name: &str, arguments: serde_json::Value) -> ToolCallResult {
        self.execute(None, name, arguments).await
    }

    /// Execute a tool by name as seen from `channel_id`.
    pub async fn execute_tool_for_channel(
        &self,
        channel_id: &str,
        name: &str,
        arguments: serde_json::Value,
    ) -> ToolCallResult {
        self.execute(Some(channel_id), name, arguments).await
    }

    async fn execute(
        &self,
        channel_id: Option<&str>,
        name: &str,
        arguments: serde_json::Value,
    ) -> ToolCallResult {
        let start = Instant::now();
        let found = sync::read(&self.tools)
            .values()
            .find(|e| e.def.enabled && e.def.name == name && e.visible_to(channel_id))
            .map(|e| (e.def.id.clone(), e.handler.clone(), e.timeout));

        let Some((id, handler, timeout)) = found else {
            tracing::warn!(tool = %name, "call to unknown tool");
            return ToolCallResult::failed(name, format!("Unknown tool: {name}"), 0);
        };

        let mut task = tokio::spawn(async move { handler.call(arguments).await });
        let outcome = tokio::time::timeout(timeout, &mut task).await;
        let elapsed = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(Ok(value))) => {
                tracing::info!(tool = %id, elapsed_ms = elapsed, "tool call succeeded");
                ToolCallResult::ok(name, value, elapsed)
            }
            Ok(Ok(Err(e))) => {
                tracing::warn!(tool = %id, error = %e, elapsed_ms = elapsed, "tool call failed");
                ToolCallResult::failed(name, e.to_string(), elapsed)
            }
            Ok(Err(join_err)) => {
                tracing::error!(tool = %id, error = %join_err, "tool handler panicked");
                ToolCallResult::failed(name, format!("tool handler crashed: {join_err}"), elapsed)
            }
            Err(_) => {
                task.abort();
                let err = ToolError::Timeout {
                    tool: name.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                tracing::warn!(tool = %id, timeout_ms = timeout.as_millis() as u64, "tool call timed out");
                ToolCallResult::failed(name, err.to_string(), elapsed)
            }
        }
    }
}

/// The enabled tool a registration under `scope` would clash with. A global
/// name clashes with every channel; a scoped one only within its channel.
fn find_conflict(
    tools: &HashMap<String, ToolEntry>,
    name: &str,
    scope: Option<&str>,
) -> Option<String> {
    tools
        .values()
        .find(|e| e.def.enabled && e.def.name == name && (scope.is_none() || e.visible_to(scope)))
        .map(|e| e.def.id.clone())
}

/// Models reject non-object parameter schemas; coerce to an empty object schema.
fn normalize_schema(schema: serde_json::Value) -> serde_json::Value {
    if schema.is_object() {
        schema
    } else {
        serde_json::json!({"type": "object", "properties": {}})
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
