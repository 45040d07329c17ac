//! Tool-call argument handling.
//!
//! Models stream tool calls as fragments keyed by index; arguments arrive as
//! a JSON string that is occasionally malformed. The accumulator stitches
//! fragments back together and the lenient parser repairs the usual
//! breakages before giving up and substituting an empty object.

use std::collections::BTreeMap;

use uuid::Uuid;

use super::types::{ToolCallDelta, ToolCallRequest};

// ─── Accumulator ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Collects streamed tool-call fragments until the turn completes.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u32, PartialCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one fragment. Ids and names are taken from the first fragment
    /// that carries them; argument text is appended.
    pub fn push(&mut self, delta: &ToolCallDelta) {
        let entry = self.calls.entry(delta.index).or_default();
        if entry.id.is_none() {
            if let Some(id) = delta.id.as_ref().filter(|id| !id.is_empty()) {
                entry.id = Some(id.clone());
            }
        }
        if let Some(name) = &delta.name {
            if entry.name.is_empty() {
                entry.name = name.clone();
            } else if !entry.name.ends_with(name.as_str()) {
                entry.name.push_str(name);
            }
        }
        if let Some(args) = &delta.arguments {
            entry.arguments.push_str(args);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Finish accumulation in index order. Nameless fragments are dropped;
    /// missing ids are generated.
    pub fn finish(self) -> Vec<ToolCallRequest> {
        self.calls
            .into_values()
            .filter(|c| !c.name.trim().is_empty())
            .map(|c| ToolCallRequest {
                id: c.id.unwrap_or_else(|| format!("call_{}", Uuid::new_v4())),
                name: c.name.trim().to_string(),
                arguments: if c.arguments.trim().is_empty() {
                    "{}".to_string()
                } else {
                    c.arguments
                },
            })
            .collect()
    }
}

// ─── Lenient Parsing ────────────────────────────────────────────────────────

/// Parse tool arguments, repairing common breakage. Anything still
/// unparseable, or not an object, becomes `{}`.
pub fn parse_arguments_lenient(raw: &str) -> serde_json::Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return serde_json::json!({});
    }
    match repair_malformed_tool_call_json(trimmed) {
        Some(value) if value.is_object() => value,
        Some(_) => {
            tracing::warn!(raw = %truncate(trimmed), "tool arguments are not an object, using {{}}");
            serde_json::json!({})
        }
        None => {
            tracing::warn!(raw = %truncate(trimmed), "irreparable tool arguments, using {{}}");
            serde_json::json!({})
        }
    }
}

fn truncate(s: &str) -> &str {
    let mut end = s.len().min(200);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Try progressively more aggressive repairs on malformed argument JSON.
///
/// Handled breakage, in order: a doubled opening quote after a colon
/// (`"k":""v"`), trailing commas, missing closing braces, and stray control
/// characters. Returns `None` if nothing works.
pub fn repair_malformed_tool_call_json(raw: &str) -> Option<serde_json::Value> {
    let attempt = |s: &str| serde_json::from_str::<serde_json::Value>(s).ok();

    if let Some(v) = attempt(raw) {
        return Some(v);
    }

    let mut candidate = collapse_doubled_quotes(raw);
    if let Some(v) = attempt(&candidate) {
        return Some(v);
    }

    candidate = strip_trailing_commas(&candidate);
    if let Some(v) = attempt(&candidate) {
        return Some(v);
    }

    candidate = close_open_braces(&candidate);
    if let Some(v) = attempt(&candidate) {
        return Some(v);
    }

    candidate = candidate
        .chars()
        .filter(|&c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect();
    attempt(&candidate)
}

/// `:""value` becomes `:"value"`; a real empty string (`:""` followed by
/// `,` or `}`) is left alone.
fn collapse_doubled_quotes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find(":\"\"") {
        let after = &rest[pos + 3..];
        let is_empty_value = after.is_empty() || after.starts_with(',') || after.starts_with('}');
        out.push_str(&rest[..pos]);
        if is_empty_value {
            out.push_str(":\"\"");
        } else {
            out.push_str(":\"");
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

fn strip_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    for (i, &ch) in chars.iter().enumerate() {
        if ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(ch);
    }
    out
}

fn close_open_braces(input: &str) -> String {
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;

    for ch in input.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => depth -= 1,
            _ => {}
        }
    }

    let mut out = input.to_string();
    for _ in 0..depth.max(0) {
        out.push('}');
    }
    out
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(index: u32, id: Option<&str>, name: Option<&str>, args: Option<&str>) -> ToolCallDelta {
        ToolCallDelta {
            index,
            id: id.map(String::from),
            name: name.map(String::from),
            arguments: args.map(String::from),
        }
    }

    #[test]
    fn test_accumulator_joins_fragments() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&delta(0, Some("call_1"), Some("get_weather"), Some("{\"ci")));
        acc.push(&delta(0, None, None, Some("ty\":\"Paris\"}")));
        acc.push(&delta(1, Some("call_2"), Some("get_current_time"), None));

        let calls = acc.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].parsed_arguments()["city"], "Paris");
        assert_eq!(calls[1].arguments, "{}");
    }

    #[test]
    fn test_accumulator_generates_missing_id_and_drops_nameless() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&delta(0, None, Some("read_file"), Some("{}")));
        acc.push(&delta(1, Some("orphan"), None, Some("{}")));

        let calls = acc.finish();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].id.starts_with("call_"));
    }

    #[test]
    fn test_lenient_parse_falls_back_to_empty_object() {
        assert_eq!(parse_arguments_lenient("not json at all"), serde_json::json!({}));
        assert_eq!(parse_arguments_lenient(""), serde_json::json!({}));
        assert_eq!(parse_arguments_lenient("[1,2]"), serde_json::json!({}));
    }

    #[test]
    fn test_repair_doubled_quote() {
        let raw = r#"{"dest":""/tmp/a.png","src":"/tmp/b.png"}"#;
        let v = repair_malformed_tool_call_json(raw).unwrap();
        assert_eq!(v["dest"], "/tmp/a.png");
        assert_eq!(v["src"], "/tmp/b.png");
    }

    #[test]
    fn test_repair_keeps_real_empty_string() {
        let v = repair_malformed_tool_call_json(r#"{"a":"","b":1,}"#).unwrap();
        assert_eq!(v["a"], "");
        assert_eq!(v["b"], 1);
    }

    #[test]
    fn test_repair_missing_brace() {
        let v = repair_malformed_tool_call_json(r#"{"path": "/tmp", "deep": {"x": 1}"#).unwrap();
        assert_eq!(v["path"], "/tmp");
        assert_eq!(v["deep"]["x"], 1);
    }
}
