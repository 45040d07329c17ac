//! LLM and TTS provider abstraction.
//!
//! - `types`: provider-neutral chat/speech request and response types
//! - `traits`: `LlmProvider` / `TtsProvider` contracts and handles
//! - `registry`: kinds, named instances, primaries, guarded initialization
//! - `openai` / `tts`: OpenAI-compatible HTTP backends
//! - `streaming`: SSE chunk parsing for chat completions
//! - `tool_call_parser`: fragment accumulation and lenient argument parsing

pub mod errors;
pub mod openai;
pub mod registry;
pub mod streaming;
pub mod tool_call_parser;
pub mod traits;
pub mod tts;
pub mod types;

pub use errors::ProviderError;
pub use registry::ProviderRegistry;
pub use traits::{LlmHandle, LlmProvider, ProviderFactory, ProviderHandle, TtsHandle, TtsProvider};
pub use types::*;
