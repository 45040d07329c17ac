//! Plugin system.
//!
//! Plugins are linked into the binary and registered as factories keyed by
//! entry name. Directories under the plugins root supply metadata and config
//! schemas; the manager activates them in dependency order and hands each a
//! scoped [`PluginContext`].
//!
//! Submodules:
//! - `api`: the Plugin and HandlerHooks traits
//! - `context`: PluginContext, PluginServices, PluginLogger
//! - `manager`: discovery, lifecycle and hook dispatch
//! - `types`: metadata and status
//! - `errors`: plugin error types

pub mod api;
pub mod context;
pub mod errors;
pub mod manager;
pub mod types;

pub use api::{HandlerHooks, Plugin};
pub use context::{PluginContext, PluginLogger, PluginServices};
pub use errors::PluginError;
pub use manager::{PluginFactory, PluginManager};
pub use types::{Dependency, PluginInfo, PluginMetadata, PluginStatus};
