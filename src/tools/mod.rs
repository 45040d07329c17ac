//! Tool system: registry, handlers and bundled native tools.

pub mod builtin;
pub mod errors;
pub mod registry;
pub mod types;

pub use errors::ToolError;
pub use registry::{scoped_tool_id, tool_id, ToolRegistry, DEFAULT_TOOL_TIMEOUT};
pub use types::{
    handler_fn, ToolCallResult, ToolDefinition, ToolHandler, ToolSource, ToolSpec, ToolStore,
};
