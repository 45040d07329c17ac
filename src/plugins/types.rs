//! Plugin metadata, status and public snapshots.

use serde::{Deserialize, Serialize};

/// Contents of a plugin's `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub desc: String,
    /// Semantic version.
    pub version: String,
    /// Name of a factory registered with the manager.
    pub entry: String,
    /// Plugin names, optionally constrained: `"base"` or `"base@^1.2"`.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl PluginMetadata {
    pub fn new(name: &str, version: &str, entry: &str) -> Self {
        Self {
            name: name.to_string(),
            author: String::new(),
            desc: String::new(),
            version: version.to_string(),
            entry: entry.to_string(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependency(mut self, dependency: &str) -> Self {
        self.dependencies.push(dependency.to_string());
        self
    }

    /// Names prefix tool ids and command names, so they stay identifier-like.
    pub fn validate_name(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("name is empty".into());
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(format!(
                "name '{}' may only contain letters, digits, '_' and '-'",
                self.name
            ));
        }
        if self.entry.is_empty() {
            return Err("entry is empty".into());
        }
        Ok(())
    }

    pub fn parsed_version(&self) -> Result<semver::Version, semver::Error> {
        semver::Version::parse(&self.version)
    }

    pub fn parsed_dependencies(&self) -> Result<Vec<Dependency>, String> {
        self.dependencies.iter().map(|d| Dependency::parse(d)).collect()
    }
}

/// One entry of `dependencies`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dependency {
    pub name: String,
    pub requirement: Option<semver::VersionReq>,
}

impl Dependency {
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.split_once('@') {
            Some((name, req)) => {
                let requirement = semver::VersionReq::parse(req.trim())
                    .map_err(|e| format!("dependency '{raw}': {e}"))?;
                Ok(Self {
                    name: name.trim().to_string(),
                    requirement: Some(requirement),
                })
            }
            None => Ok(Self {
                name: raw.trim().to_string(),
                requirement: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Loaded,
    Active,
    Error,
    Disabled,
}

/// Public snapshot of one plugin.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    pub status: PluginStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    pub tools: Vec<String>,
    pub commands: Vec<String>,
}
