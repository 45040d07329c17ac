//! Token estimation for persisted messages.
//!
//! Character-based heuristics, deliberately on the high side:
//! - prose: ~3.2 chars/token
//! - JSON (tool arguments, tool results): ~2.8 chars/token

use crate::providers::{ChatMessage, Role};

const CHARS_PER_TOKEN: f64 = 3.2;

const JSON_CHARS_PER_TOKEN: f64 = 2.8;

/// Role label and formatting tokens.
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Per tool call, for the function wrapper.
const TOOL_CALL_OVERHEAD_TOKENS: u32 = 10;

/// Truncate to at most `max_bytes`, backing off to a char boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() as f64 / CHARS_PER_TOKEN).ceil() as u32
}

pub fn estimate_json_tokens(json_text: &str) -> u32 {
    (json_text.len() as f64 / JSON_CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate a message's cost in the context window.
pub fn estimate_message_tokens(message: &ChatMessage) -> u32 {
    let mut total = MESSAGE_OVERHEAD_TOKENS;

    if let Some(content) = &message.content {
        total += match message.role {
            Role::Tool => estimate_json_tokens(content),
            _ => estimate_tokens(content),
        };
    }

    for call in &message.tool_calls {
        total += TOOL_CALL_OVERHEAD_TOKENS;
        total += estimate_tokens(&call.name);
        total += estimate_json_tokens(&call.arguments);
    }

    total
}
