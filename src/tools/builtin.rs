//! Native tools bundled with the agent.

use std::path::PathBuf;

use serde_json::json;

use super::errors::ToolError;
use super::registry::ToolRegistry;
use super::types::{handler_fn, ToolSpec};

/// Longest file body returned to the model.
const READ_FILE_MAX_CHARS: usize = 8000;

/// Register `get_current_time`, `list_directory` and `read_file`.
pub fn register_builtin_tools(registry: &ToolRegistry) -> Result<(), ToolError> {
    registry.register(
        ToolSpec::function(
            "get_current_time",
            "Get the current local date, time and weekday.",
            json!({"type": "object", "properties": {}}),
        ),
        handler_fn(|_| async { Ok::<_, ToolError>(json!(current_time())) }),
    )?;

    registry.register(
        ToolSpec::function(
            "list_directory",
            "List the files and folders in a directory. Supports ~ for the home directory.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Directory path"}
                },
                "required": ["path"]
            }),
        ),
        handler_fn(|args| async move {
            let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".").to_string();
            tokio::task::spawn_blocking(move || list_directory(&path))
                .await
                .map_err(|e| ToolError::failed("list_directory", e.to_string()))?
                .map(serde_json::Value::String)
        }),
    )?;

    registry.register(
        ToolSpec::function(
            "read_file",
            "Read a UTF-8 text file. Long files are truncated.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path"}
                },
                "required": ["path"]
            }),
        ),
        handler_fn(|args| async move {
            let path = args
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ToolError::InvalidArguments {
                    tool: "read_file".into(),
                    reason: "missing 'path'".into(),
                })?
                .to_string();
            let content = tokio::fs::read_to_string(expand_home(&path))
                .await
                .map_err(|e| ToolError::failed("read_file", format!("cannot read {path}: {e}")))?;
            Ok::<_, ToolError>(json!(truncate_file_body(&content)))
        }),
    )?;

    Ok(())
}

fn current_time() -> String {
    let now = chrono::Local::now();
    now.format("%Y-%m-%d %H:%M:%S (%A) %:z").to_string()
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest.trim_start_matches(['/', '\\'])),
            None => PathBuf::from(path),
        },
        None => PathBuf::from(path),
    }
}

fn list_directory(path: &str) -> Result<String, ToolError> {
    let dir = expand_home(path);
    if !dir.is_dir() {
        return Err(ToolError::failed("list_directory", format!("not a directory: {path}")));
    }

    let read_dir = std::fs::read_dir(&dir)
        .map_err(|e| ToolError::failed("list_directory", format!("failed to read directory: {e}")))?;

    let mut entries: Vec<(bool, String, u64)> = Vec::new();
    for entry in read_dir.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        entries.push((metadata.is_dir(), name, metadata.len()));
    }

    if entries.is_empty() {
        return Ok("Directory is empty.".to_string());
    }

    // Directories first, then files, case-insensitive.
    entries.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then_with(|| a.1.to_lowercase().cmp(&b.1.to_lowercase()))
    });

    Ok(entries
        .into_iter()
        .map(|(is_dir, name, size)| {
            if is_dir {
                format!("[dir]  {name}/")
            } else {
                format!("[file] {name} ({})", format_size(size))
            }
        })
        .collect::<Vec<_>>()
        .join("\n"))
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    match bytes {
        b if b >= MB => format!("{:.1} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.1} KB", b as f64 / KB as f64),
        b => format!("{b} B"),
    }
}

fn truncate_file_body(content: &str) -> String {
    let total = content.chars().count();
    if total <= READ_FILE_MAX_CHARS {
        return content.to_string();
    }
    let head: String = content.chars().take(READ_FILE_MAX_CHARS).collect();
    format!("{head}\n\n[... truncated, showing first {READ_FILE_MAX_CHARS} of {total} chars]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builtins_registered_and_callable() {
        let registry = ToolRegistry::default();
        register_builtin_tools(&registry).unwrap();
        assert_eq!(registry.to_openai_tools().len(), 3);

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("notes")).unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        std::fs::write(dir.path().join(".hidden"), "x").unwrap();

        let listing = registry
            .execute_tool("list_directory", json!({"path": dir.path().to_string_lossy()}))
            .await;
        assert!(listing.success);
        let text = listing.model_text();
        assert!(text.starts_with("[dir]  notes/"));
        assert!(text.contains("a.txt (5 B)"));
        assert!(!text.contains(".hidden"));

        let file = registry
            .execute_tool(
                "read_file",
                json!({"path": dir.path().join("a.txt").to_string_lossy()}),
            )
            .await;
        assert_eq!(file.model_text(), "hello");
    }

    #[tokio::test]
    async fn test_read_file_missing_path_argument() {
        let registry = ToolRegistry::default();
        register_builtin_tools(&registry).unwrap();
        let result = registry.execute_tool("read_file", json!({})).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("path"));
    }

    #[test]
    fn test_truncate_file_body() {
        let long = "é".repeat(READ_FILE_MAX_CHARS + 10);
        let out = truncate_file_body(&long);
        assert!(out.contains("truncated"));
        assert!(out.starts_with(&"é".repeat(10)));
    }
}
