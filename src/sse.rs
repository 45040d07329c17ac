//! Incremental Server-Sent Events decoder.
//!
//! Shared by the OpenAI-compatible streaming parser and the MCP SSE
//! transport. Bytes are pushed as they arrive; complete events (terminated by
//! a blank line) are popped one at a time.

// ─── SseEvent ───────────────────────────────────────────────────────────────

/// A single decoded SSE event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, if any.
    pub event: Option<String>,
    /// Concatenated `data:` lines (joined with `\n`).
    pub data: String,
}

impl SseEvent {
    /// Event name, defaulting to `"message"` as the SSE spec prescribes.
    pub fn name(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

// ─── SseDecoder ─────────────────────────────────────────────────────────────

/// Buffers partial input across network chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the wire. `\r\n` is normalized to `\n`.
    pub fn push(&mut self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        if text.contains('\r') {
            self.buffer.push_str(&text.replace("\r\n", "\n").replace('\r', "\n"));
        } else {
            self.buffer.push_str(&text);
        }
    }

    /// Pop the next complete event, skipping comment-only and empty blocks.
    pub fn next_event(&mut self) -> Option<SseEvent> {
        loop {
            let end = self.buffer.find("\n\n")?;
            let raw = self.buffer[..end].to_string();
            self.buffer.drain(..end + 2);
            if let Some(event) = parse_event(&raw) {
                return Some(event);
            }
        }
    }

    /// Flush whatever remains when the stream ends without a trailing blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            return None;
        }
        parse_event(rest.trim_end())
    }
}

/// Parse one raw event block. Returns `None` for keep-alives and comments.
fn parse_event(raw: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };
        match field {
            "event" => event.event = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    if data_lines.is_empty() && event.event.is_none() {
        return None;
    }
    event.data = data_lines.join("\n");
    Some(event)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
