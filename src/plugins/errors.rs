//! Plugin manager error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin not found: '{name}'")]
    NotFound { name: String },

    #[error("plugin '{name}' is already loaded")]
    Duplicate { name: String },

    #[error("invalid plugin metadata at {path}: {reason}")]
    InvalidMetadata { path: String, reason: String },

    #[error("plugin '{name}' has invalid version '{version}': {reason}")]
    InvalidVersion {
        name: String,
        version: String,
        reason: String,
    },

    /// `entry` does not name a registered factory.
    #[error("plugin '{name}' has unknown entry '{entry}'")]
    UnknownEntry { name: String, entry: String },

    #[error("plugin '{name}' depends on '{dependency}', which is not installed")]
    MissingDependency { name: String, dependency: String },

    #[error("plugin '{name}' requires '{dependency}' {required}, found {found}")]
    VersionMismatch {
        name: String,
        dependency: String,
        required: String,
        found: String,
    },

    #[error("dependency cycle through plugin '{name}': {path}")]
    DependencyCycle { name: String, path: String },

    #[error("plugin '{name}' could not start because '{dependency}' failed")]
    DependencyFailed { name: String, dependency: String },

    #[error("plugin '{name}' is disabled")]
    Disabled { name: String },

    #[error("plugin '{name}' failed to initialize: {reason}")]
    InitFailed { name: String, reason: String },

    #[error("invalid config for plugin '{name}': {reason}")]
    Config { name: String, reason: String },

    /// A tool or command registration was refused.
    #[error("plugin '{name}' registration failed: {reason}")]
    Registration { name: String, reason: String },

    #[error("I/O error at {path}: {reason}")]
    Io { path: String, reason: String },
}

impl PluginError {
    pub(crate) fn io(path: &std::path::Path, e: impl std::fmt::Display) -> Self {
        PluginError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
    }
}
