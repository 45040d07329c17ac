//! Handler: the default business logic behind the Process stage.
//!
//! Submodules:
//! - `dispatch`: per-message-type handling, chat turns, connection lifecycle
//! - `tool_loop`: the bounded tool-call loop and tool confirmation
//! - `frontend`: client-side plugins bridged in as tools
//! - `commands`: the command registry and built-in commands
//! - `tts`: speech delivery
//! - `prompt`: system prompt assembly
//! - `errors`: handler error types

pub mod commands;
pub mod dispatch;
pub mod errors;
mod frontend;
pub mod prompt;
pub mod tool_loop;
mod tts;

pub use commands::{
    command_fn, register_builtin_commands, CommandDefinition, CommandHandler, CommandInvocation,
    CommandRegistry,
};
pub use dispatch::{
    Handler, HandlerConfig, DEFAULT_CONFIRM_TIMEOUT, DEFAULT_HISTORY_LIMIT,
    DEFAULT_MAX_TOOL_ITERATIONS, DEFAULT_PLUGIN_INVOKE_TIMEOUT,
};
pub use errors::HandlerError;
pub use tool_loop::LoopOutcome;
