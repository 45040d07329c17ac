//! Application configuration.
//!
//! Reads `config.yaml` from the data directory (or `DESKPET_CONFIG`) and
//! resolves environment variables. Every field has a default, so a missing
//! file yields a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::handler::HandlerConfig;
use crate::providers::ProviderInstanceConfig;

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "DESKPET_CONFIG";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },

    #[error("failed to write {path}: {reason}")]
    Write { path: String, reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub providers: Vec<ProviderInstanceConfig>,
    /// Overrides the first-enabled-wins primary selection.
    pub primary_llm: Option<String>,
    pub primary_tts: Option<String>,
    /// Flat JSON list of MCP servers.
    pub mcp_servers_file: PathBuf,
    pub plugins_dir: PathBuf,
    /// Runtime plugin config, kept apart from plugin sources.
    pub plugin_config_dir: PathBuf,
    pub plugin_data_dir: PathBuf,
    pub database_path: PathBuf,
    pub tool_timeout_secs: u64,
    pub confirm_timeout_secs: u64,
    pub plugin_invoke_timeout_secs: u64,
    pub max_tool_iterations: usize,
    pub history_limit: usize,
    pub max_conversations_per_session: usize,
    pub system_prompt: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::rooted_at(&crate::data_dir())
    }
}

impl AppConfig {
    /// Defaults with every path placed under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            providers: Vec::new(),
            primary_llm: None,
            primary_tts: None,
            mcp_servers_file: root.join("mcp-servers.json"),
            plugins_dir: root.join("plugins"),
            plugin_config_dir: root.join("plugin-config"),
            plugin_data_dir: root.join("plugin-data"),
            database_path: root.join("agent.db"),
            tool_timeout_secs: 30,
            confirm_timeout_secs: 60,
            plugin_invoke_timeout_secs: 30,
            max_tool_iterations: crate::handler::DEFAULT_MAX_TOOL_ITERATIONS,
            history_limit: crate::handler::DEFAULT_HISTORY_LIMIT,
            max_conversations_per_session: crate::agent_core::DEFAULT_MAX_CONVERSATIONS_PER_SESSION,
            system_prompt: crate::handler::prompt::DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    /// `DESKPET_CONFIG` if set, else `config.yaml` in the data directory.
    pub fn default_path() -> PathBuf {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(expand_tilde(path.trim())),
            _ => crate::data_dir().join("config.yaml"),
        }
    }

    /// Load and validate `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&raw)
    }

    /// Parse YAML after `${VAR}` / `${VAR:-default}` interpolation.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let interpolated = interpolate_env_vars(raw);
        if interpolated.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: AppConfig =
            serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tool_iterations == 0 {
            return Err(ConfigError::Invalid {
                reason: "max_tool_iterations must be at least 1".into(),
            });
        }
        if self.history_limit == 0 {
            return Err(ConfigError::Invalid {
                reason: "history_limit must be at least 1".into(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.instance_id.as_str()) {
                return Err(ConfigError::Invalid {
                    reason: format!("duplicate provider instance '{}'", provider.instance_id),
                });
            }
        }
        for (label, primary) in [("primary_llm", &self.primary_llm), ("primary_tts", &self.primary_tts)] {
            if let Some(id) = primary {
                if !seen.contains(id.as_str()) {
                    return Err(ConfigError::Invalid {
                        reason: format!("{label} names unknown instance '{id}'"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |e: &dyn std::fmt::Display| ConfigError::Write {
            path: path.display().to_string(),
            reason: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| write_err(&e))?;
        }
        let yaml = serde_yaml::to_string(self).map_err(|e| write_err(&e))?;
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, yaml).map_err(|e| write_err(&e))?;
        std::fs::rename(&tmp, path).map_err(|e| write_err(&e))?;
        tracing::info!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs.max(1))
    }

    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            system_prompt: self.system_prompt.clone(),
            max_tool_iterations: self.max_tool_iterations,
            history_limit: self.history_limit,
            confirm_timeout: Duration::from_secs(self.confirm_timeout_secs),
            plugin_invoke_timeout: Duration::from_secs(self.plugin_invoke_timeout_secs),
        }
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                result.push_str(&resolve_var_expr(&after[..end]));
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated: keep verbatim.
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_env_vars() {
        std::env::remove_var("__DESKPET_UNSET_VAR__");
        std::env::set_var("__DESKPET_SET_VAR__", "sk-test");
        assert_eq!(
            interpolate_env_vars("key: ${__DESKPET_SET_VAR__:-none}"),
            "key: sk-test"
        );
        assert_eq!(
            interpolate_env_vars("key: ${__DESKPET_UNSET_VAR__:-none}"),
            "key: none"
        );
        assert_eq!(interpolate_env_vars("key: ${__DESKPET_UNSET_VAR__}"), "key: ");
        assert_eq!(interpolate_env_vars("price: $5 ${oops"), "price: $5 ${oops");
        std::env::remove_var("__DESKPET_SET_VAR__");
    }

    #[test]
    fn test_tilde_in_default_expands() {
        std::env::remove_var("__DESKPET_PLUGINS__");
        let resolved = interpolate_env_vars("${__DESKPET_PLUGINS__:-~/pets}");
        assert!(!resolved.starts_with('~'));
        assert!(resolved.ends_with("/pets"));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.max_tool_iterations, 10);
        assert_eq!(config.history_limit, 40);
        assert_eq!(config.max_conversations_per_session, 50);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_parse_partial_config() {
        std::env::set_var("__DESKPET_KEY__", "sk-abc");
        let yaml = r#"
providers:
  - instance_id: main
    kind: openai
    config:
      api_key: "${__DESKPET_KEY__}"
      model: gpt-4o-mini
primary_llm: main
confirm_timeout_secs: 15
"#;
        let config = AppConfig::parse(yaml).unwrap();
        std::env::remove_var("__DESKPET_KEY__");

        assert_eq!(config.providers.len(), 1);
        assert!(config.providers[0].enabled);
        assert_eq!(config.providers[0].config["api_key"], "sk-abc");
        assert_eq!(config.handler_config().confirm_timeout, Duration::from_secs(15));
        assert_eq!(config.tool_timeout_secs, 30);
    }

    #[test]
    fn test_invalid_configs_are_errors() {
        assert!(matches!(
            AppConfig::parse("providers: 12"),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            AppConfig::parse("max_tool_iterations: 0"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            AppConfig::parse("primary_llm: ghost"),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let mut config = AppConfig::rooted_at(dir.path());
        config.history_limit = 12;
        config.system_prompt = "Be brief.".into();

        config.save(&path).unwrap();
        assert!(!path.with_extension("yaml.tmp").exists());
        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }
}
