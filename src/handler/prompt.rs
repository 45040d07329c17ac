//! System prompt assembly from the base prompt and client-reported info.

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly desktop pet who lives on the user's screen. \
Keep replies short, warm and conversational. Use the available tools when they help.";

/// Session metadata keys written by `model_info` / `character_info`.
pub const MODEL_INFO_KEY: &str = "model_info";
pub const CHARACTER_INFO_KEY: &str = "character_info";

/// Fold character persona and model capabilities into `base`.
pub fn build_system_prompt(
    base: &str,
    model_info: Option<&serde_json::Value>,
    character_info: Option<&serde_json::Value>,
) -> String {
    let mut prompt = base.trim().to_string();

    if let Some(character) = character_info {
        let name = character.get("name").and_then(|v| v.as_str());
        let persona = ["persona", "description", "personality"]
            .iter()
            .find_map(|key| character.get(*key).and_then(|v| v.as_str()))
            .filter(|s| !s.trim().is_empty());

        if let Some(name) = name {
            prompt.push_str(&format!("\n\nYou are {name}."));
        }
        if let Some(persona) = persona {
            prompt.push_str(&format!("\n{}", persona.trim()));
        }
    }

    if let Some(model) = model_info {
        let sections = [
            ("motions", "Motions you can perform"),
            ("expressions", "Expressions you can show"),
            ("hitAreas", "Body areas the user can touch"),
        ];
        for (key, label) in sections {
            let names = names_of(model.get(key));
            if !names.is_empty() {
                prompt.push_str(&format!("\n{label}: {}.", names.join(", ")));
            }
        }
    }

    prompt
}

/// Names from a list of strings, a list of `{name}` objects, or an
/// object keyed by name (motion groups).
fn names_of(value: Option<&serde_json::Value>) -> Vec<String> {
    match value {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|item| {
                item.as_str()
                    .or_else(|| item.get("name").and_then(|n| n.as_str()))
                    .map(str::to_string)
            })
            .collect(),
        Some(serde_json::Value::Object(map)) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_base_prompt_alone() {
        assert_eq!(build_system_prompt("  Be nice. ", None, None), "Be nice.");
    }

    #[test]
    fn test_character_and_model_are_folded_in() {
        let character = json!({"name": "Mochi", "persona": "A sleepy cat."});
        let model = json!({
            "motions": {"idle": [], "wave": []},
            "expressions": [{"name": "smile"}, "blush"],
            "hitAreas": ["head", "body"]
        });
        let prompt = build_system_prompt("Base.", Some(&model), Some(&character));

        assert!(prompt.starts_with("Base.\n\nYou are Mochi.\nA sleepy cat."));
        assert!(prompt.contains("Motions you can perform: idle, wave."));
        assert!(prompt.contains("Expressions you can show: smile, blush."));
        assert!(prompt.contains("Body areas the user can touch: head, body."));
    }
}
