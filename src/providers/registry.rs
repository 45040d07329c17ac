//! Provider registry: kinds, named instances, and per-family primaries.
//!
//! Instances are built lazily from their kind's factory. Initialization is
//! serialized per instance id; a caller that queued behind an in-flight
//! attempt receives that attempt's outcome instead of starting another.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use super::errors::ProviderError;
use super::traits::{LlmHandle, ProviderFactory, ProviderHandle, TtsHandle};
use super::types::{
    resolve_config, ConnectionStatus, ProviderDescriptor, ProviderFamily, ProviderInstanceConfig,
    ProviderInstanceInfo,
};
use super::{openai, tts};
use crate::sync;

struct KindEntry {
    descriptor: ProviderDescriptor,
    factory: ProviderFactory,
}

struct InstanceEntry {
    config: ProviderInstanceConfig,
    family: ProviderFamily,
    status: ConnectionStatus,
    handle: Option<ProviderHandle>,
    /// Completed initialization attempts.
    attempts: u64,
}

// ─── ProviderRegistry ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct ProviderRegistry {
    kinds: RwLock<HashMap<String, KindEntry>>,
    instances: RwLock<BTreeMap<String, InstanceEntry>>,
    primaries: RwLock<HashMap<ProviderFamily, String>>,
    init_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled OpenAI-compatible chat and speech kinds.
    pub fn with_builtin_kinds() -> Self {
        let registry = Self::new();
        registry.register_kind(openai::descriptor(), openai::factory());
        registry.register_kind(tts::descriptor(), tts::factory());
        registry
    }

    // ─── Kinds ──────────────────────────────────────────────────────────

    pub fn register_kind(&self, descriptor: ProviderDescriptor, factory: ProviderFactory) {
        tracing::debug!(kind = %descriptor.kind, family = %descriptor.family, "provider kind registered");
        sync::write(&self.kinds).insert(
            descriptor.kind.clone(),
            KindEntry {
                descriptor,
                factory,
            },
        );
    }

    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        let mut all: Vec<_> = sync::read(&self.kinds)
            .values()
            .map(|k| k.descriptor.clone())
            .collect();
        all.sort_by(|a, b| a.kind.cmp(&b.kind));
        all
    }

    // ─── Instances ──────────────────────────────────────────────────────

    /// Add an instance after validating its config against the kind schema.
    ///
    /// The first enabled instance of a family becomes that family's primary.
    pub fn add_instance(&self, mut config: ProviderInstanceConfig) -> Result<(), ProviderError> {
        let family = {
            let kinds = sync::read(&self.kinds);
            let kind = kinds
                .get(&config.kind)
                .ok_or_else(|| ProviderError::UnknownKind {
                    kind: config.kind.clone(),
                })?;
            config.config = resolve_config(&kind.descriptor.fields, &config.config).map_err(
                |reason| ProviderError::InvalidConfig {
                    instance_id: config.instance_id.clone(),
                    reason,
                },
            )?;
            if config.display_name.is_empty() {
                config.display_name = kind.descriptor.display_name.clone();
            }
            kind.descriptor.family
        };

        let id = config.instance_id.clone();
        let enabled = config.enabled;
        {
            let mut instances = sync::write(&self.instances);
            if instances.contains_key(&id) {
                return Err(ProviderError::DuplicateInstance { instance_id: id });
            }
            instances.insert(
                id.clone(),
                InstanceEntry {
                    config,
                    family,
                    status: ConnectionStatus::Disconnected,
                    handle: None,
                    attempts: 0,
                },
            );
        }

        if enabled {
            sync::write(&self.primaries)
                .entry(family)
                .or_insert_with(|| id.clone());
        }

        tracing::info!(instance = %id, family = %family, enabled, "provider instance added");
        Ok(())
    }

    /// Remove an instance, disposing its connection.
    pub async fn remove_instance(&self, instance_id: &str) -> Result<(), ProviderError> {
        let entry = sync::write(&self.instances)
            .remove(instance_id)
            .ok_or_else(|| ProviderError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;

        sync::write(&self.primaries).retain(|_, id| id != instance_id);
        sync::lock(&self.init_locks).remove(instance_id);

        if let Some(handle) = entry.handle {
            handle.dispose().await;
        }
        tracing::info!(instance = %instance_id, "provider instance removed");
        Ok(())
    }

    /// Enable or disable an instance. Disabling disposes any live connection.
    pub async fn set_enabled(&self, instance_id: &str, enabled: bool) -> Result<(), ProviderError> {
        let released = {
            let mut instances = sync::write(&self.instances);
            let entry = instances
                .get_mut(instance_id)
                .ok_or_else(|| ProviderError::InstanceNotFound {
                    instance_id: instance_id.to_string(),
                })?;
            entry.config.enabled = enabled;
            if enabled {
                None
            } else {
                entry.status = ConnectionStatus::Disconnected;
                entry.handle.take()
            }
        };

        if let Some(handle) = released {
            handle.dispose().await;
        }
        tracing::info!(instance = %instance_id, enabled, "provider instance toggled");
        Ok(())
    }

    /// Make `instance_id` the primary of its family, replacing any previous one.
    pub fn set_primary(&self, instance_id: &str) -> Result<(), ProviderError> {
        let family = sync::read(&self.instances)
            .get(instance_id)
            .map(|e| e.family)
            .ok_or_else(|| ProviderError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;
        sync::write(&self.primaries).insert(family, instance_id.to_string());
        tracing::info!(instance = %instance_id, family = %family, "primary provider set");
        Ok(())
    }

    pub fn primary_id(&self, family: ProviderFamily) -> Option<String> {
        sync::read(&self.primaries).get(&family).cloned()
    }

    pub fn status(&self, instance_id: &str) -> Option<ConnectionStatus> {
        sync::read(&self.instances)
            .get(instance_id)
            .map(|e| e.status.clone())
    }

    pub fn instances(&self) -> Vec<ProviderInstanceInfo> {
        let primaries = sync::read(&self.primaries).clone();
        sync::read(&self.instances)
            .values()
            .map(|e| ProviderInstanceInfo {
                instance_id: e.config.instance_id.clone(),
                provider_kind: e.config.kind.clone(),
                display_name: e.config.display_name.clone(),
                family: e.family,
                enabled: e.config.enabled,
                primary: primaries.get(&e.family) == Some(&e.config.instance_id),
                status: e.status.clone(),
            })
            .collect()
    }

    // ─── Initialization ─────────────────────────────────────────────────

    fn init_lock(&self, instance_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        sync::lock(&self.init_locks)
            .entry(instance_id.to_string())
            .or_default()
            .clone()
    }

    /// Connect an instance if it is not connected yet.
    ///
    /// Failures leave the instance in `error` status and are returned as
    /// [`ProviderError::InitFailed`].
    pub async fn initialize(&self, instance_id: &str) -> Result<(), ProviderError> {
        let seen_attempts = self.entry_attempts(instance_id)?;
        let lock = self.init_lock(instance_id);
        let _guard = lock.lock().await;

        let (factory, config) = {
            let mut instances = sync::write(&self.instances);
            let entry = instances
                .get_mut(instance_id)
                .ok_or_else(|| ProviderError::InstanceNotFound {
                    instance_id: instance_id.to_string(),
                })?;

            if !entry.config.enabled {
                return Err(ProviderError::Disabled {
                    instance_id: instance_id.to_string(),
                });
            }
            if entry.status == ConnectionStatus::Connected && entry.handle.is_some() {
                return Ok(());
            }
            if entry.attempts > seen_attempts {
                // Another caller finished an attempt while we waited.
                return match &entry.status {
                    ConnectionStatus::Error(reason) => Err(ProviderError::InitFailed {
                        instance_id: instance_id.to_string(),
                        reason: reason.clone(),
                    }),
                    _ => Ok(()),
                };
            }

            let factory = sync::read(&self.kinds)
                .get(&entry.config.kind)
                .map(|k| k.factory.clone())
                .ok_or_else(|| ProviderError::UnknownKind {
                    kind: entry.config.kind.clone(),
                })?;
            entry.status = ConnectionStatus::Connecting;
            (factory, entry.config.config.clone())
        };

        tracing::info!(instance = %instance_id, "initializing provider");

        let outcome = match factory(&config) {
            Ok(handle) => match handle.initialize().await {
                Ok(()) => Ok(handle),
                Err(e) => Err(e.to_string()),
            },
            Err(e) => Err(e.to_string()),
        };

        let mut instances = sync::write(&self.instances);
        let Some(entry) = instances.get_mut(instance_id) else {
            return Err(ProviderError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            });
        };
        entry.attempts += 1;

        match outcome {
            Ok(handle) => {
                entry.handle = Some(handle);
                entry.status = ConnectionStatus::Connected;
                tracing::info!(instance = %instance_id, "provider connected");
                Ok(())
            }
            Err(reason) => {
                tracing::warn!(instance = %instance_id, error = %reason, "provider initialization failed");
                entry.status = ConnectionStatus::Error(reason.clone());
                Err(ProviderError::InitFailed {
                    instance_id: instance_id.to_string(),
                    reason,
                })
            }
        }
    }

    fn entry_attempts(&self, instance_id: &str) -> Result<u64, ProviderError> {
        sync::read(&self.instances)
            .get(instance_id)
            .map(|e| e.attempts)
            .ok_or_else(|| ProviderError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })
    }

    /// Connect every enabled instance. Failures are logged, not returned.
    pub async fn initialize_all(&self) {
        let ids: Vec<String> = sync::read(&self.instances)
            .values()
            .filter(|e| e.config.enabled)
            .map(|e| e.config.instance_id.clone())
            .collect();
        for id in ids {
            if let Err(e) = self.initialize(&id).await {
                tracing::warn!(instance = %id, error = %e, "provider not available at startup");
            }
        }
    }

    // ─── Access ─────────────────────────────────────────────────────────

    async fn connected(&self, instance_id: &str) -> Result<(ProviderHandle, bool), ProviderError> {
        self.initialize(instance_id).await?;
        let instances = sync::read(&self.instances);
        let entry = instances
            .get(instance_id)
            .ok_or_else(|| ProviderError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;
        let handle = entry.handle.clone().ok_or_else(|| ProviderError::InitFailed {
            instance_id: instance_id.to_string(),
            reason: "instance was disconnected".into(),
        })?;
        let streaming = entry
            .config
            .config
            .get("stream")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok((handle, streaming))
    }

    pub async fn llm(&self, instance_id: &str) -> Result<LlmHandle, ProviderError> {
        match self.connected(instance_id).await? {
            (ProviderHandle::Llm(provider), streaming) => Ok(LlmHandle {
                instance_id: instance_id.to_string(),
                provider,
                streaming,
            }),
            _ => Err(ProviderError::WrongFamily {
                instance_id: instance_id.to_string(),
                expected: ProviderFamily::Llm.to_string(),
            }),
        }
    }

    pub async fn tts(&self, instance_id: &str) -> Result<TtsHandle, ProviderError> {
        match self.connected(instance_id).await? {
            (ProviderHandle::Tts(provider), _) => Ok(TtsHandle {
                instance_id: instance_id.to_string(),
                provider,
            }),
            _ => Err(ProviderError::WrongFamily {
                instance_id: instance_id.to_string(),
                expected: ProviderFamily::Tts.to_string(),
            }),
        }
    }

    /// The enabled primary of `family`, if one is configured.
    fn enabled_primary(&self, family: ProviderFamily) -> Option<String> {
        let id = self.primary_id(family)?;
        let enabled = sync::read(&self.instances)
            .get(&id)
            .map(|e| e.config.enabled)
            .unwrap_or(false);
        enabled.then_some(id)
    }

    /// Primary LLM, connected on demand. `Ok(None)` when none is configured.
    pub async fn primary_llm(&self) -> Result<Option<LlmHandle>, ProviderError> {
        match self.enabled_primary(ProviderFamily::Llm) {
            Some(id) => self.llm(&id).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn primary_tts(&self) -> Result<Option<TtsHandle>, ProviderError> {
        match self.enabled_primary(ProviderFamily::Tts) {
            Some(id) => self.tts(&id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Dispose every live connection.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, ProviderHandle)> = {
            let mut instances = sync::write(&self.instances);
            instances
                .values_mut()
                .filter_map(|e| {
                    e.status = ConnectionStatus::Disconnected;
                    e.handle.take().map(|h| (e.config.instance_id.clone(), h))
                })
                .collect()
        };
        for (id, handle) in handles {
            handle.dispose().await;
            tracing::debug!(instance = %id, "provider disposed");
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::providers::traits::LlmProvider;
    use crate::providers::types::{ChatRequest, ChatResponse, ConfigField, FieldType};

    struct SlowLlm {
        fail: bool,
    }

    #[async_trait]
    impl LlmProvider for SlowLlm {
        async fn initialize(&self) -> Result<(), ProviderError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                Err(ProviderError::ConnectionFailed {
                    endpoint: "stub".into(),
                    reason: "refused".into(),
                })
            } else {
                Ok(())
            }
        }

        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse::default())
        }
    }

    fn registry_with_stub(builds: Arc<AtomicUsize>) -> ProviderRegistry {
        let registry = ProviderRegistry::new();
        registry.register_kind(
            ProviderDescriptor {
                kind: "stub".into(),
                family: ProviderFamily::Llm,
                display_name: "Stub".into(),
                fields: vec![ConfigField::new("fail", FieldType::Boolean, "")
                    .with_default(json!(false))],
            },
            Arc::new(move |config: &serde_json::Value| {
                builds.fetch_add(1, Ordering::SeqCst);
                let fail = config["fail"].as_bool().unwrap_or(false);
                Ok(ProviderHandle::Llm(Arc::new(SlowLlm { fail })))
            }),
        );
        registry
    }

    fn instance(id: &str, config: serde_json::Value) -> ProviderInstanceConfig {
        ProviderInstanceConfig {
            instance_id: id.into(),
            kind: "stub".into(),
            display_name: String::new(),
            enabled: true,
            config,
        }
    }

    #[test]
    fn test_primary_uniqueness() {
        let registry = registry_with_stub(Arc::new(AtomicUsize::new(0)));
        registry.add_instance(instance("a", json!({}))).unwrap();
        registry.add_instance(instance("b", json!({}))).unwrap();
        assert_eq!(registry.primary_id(ProviderFamily::Llm).as_deref(), Some("a"));

        registry.set_primary("b").unwrap();

        let primaries: Vec<_> = registry
            .instances()
            .into_iter()
            .filter(|i| i.family == ProviderFamily::Llm && i.primary)
            .collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].instance_id, "b");
    }

    #[test]
    fn test_add_instance_validation() {
        let registry = registry_with_stub(Arc::new(AtomicUsize::new(0)));
        let mut unknown = instance("x", json!({}));
        unknown.kind = "nope".into();
        assert!(matches!(
            registry.add_instance(unknown),
            Err(ProviderError::UnknownKind { .. })
        ));
        assert!(matches!(
            registry.add_instance(instance("y", json!({"fail": "yes"}))),
            Err(ProviderError::InvalidConfig { .. })
        ));
        registry.add_instance(instance("z", json!({}))).unwrap();
        assert!(matches!(
            registry.add_instance(instance("z", json!({}))),
            Err(ProviderError::DuplicateInstance { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_initialize_builds_once() {
        let builds = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(registry_with_stub(builds.clone()));
        registry.add_instance(instance("main", json!({}))).unwrap();

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.initialize("main").await })
            })
            .collect();
        for task in futures::future::join_all(tasks).await {
            assert!(task.unwrap().is_ok());
        }

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(registry.status("main"), Some(ConnectionStatus::Connected));
    }

    #[tokio::test]
    async fn test_concurrent_failure_shared_by_waiters() {
        let builds = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(registry_with_stub(builds.clone()));
        registry
            .add_instance(instance("bad", json!({"fail": true})))
            .unwrap();

        let (a, b) = tokio::join!(registry.initialize("bad"), registry.initialize("bad"));
        assert!(matches!(a, Err(ProviderError::InitFailed { .. })));
        assert!(matches!(b, Err(ProviderError::InitFailed { .. })));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(matches!(registry.status("bad"), Some(ConnectionStatus::Error(_))));
    }

    #[tokio::test]
    async fn test_disabled_instance_never_connects() {
        let builds = Arc::new(AtomicUsize::new(0));
        let registry = registry_with_stub(builds.clone());
        let mut cfg = instance("off", json!({}));
        cfg.enabled = false;
        registry.add_instance(cfg).unwrap();

        assert!(matches!(
            registry.initialize("off").await,
            Err(ProviderError::Disabled { .. })
        ));
        assert!(registry.primary_llm().await.unwrap().is_none());
        assert_eq!(builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disable_disconnects_and_remove_clears_primary() {
        let registry = registry_with_stub(Arc::new(AtomicUsize::new(0)));
        registry.add_instance(instance("main", json!({}))).unwrap();
        assert!(registry.primary_llm().await.unwrap().is_some());

        registry.set_enabled("main", false).await.unwrap();
        assert_eq!(registry.status("main"), Some(ConnectionStatus::Disconnected));

        registry.remove_instance("main").await.unwrap();
        assert!(registry.primary_id(ProviderFamily::Llm).is_none());
    }

    #[test]
    fn test_builtin_kinds_describe_schema() {
        let registry = ProviderRegistry::with_builtin_kinds();
        let kinds: Vec<_> = registry.descriptors().into_iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec!["openai", "openai_tts"]);
    }
}
