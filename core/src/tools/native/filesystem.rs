use crate::tools::{ExecutionContext, Tool, ToolError, ToolResult};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncReadExt;

/// Default cap on bytes returned by `read_file`
const DEFAULT_MAX_READ_BYTES: u64 = 256 * 1024;

/// Resolve `relative` inside `root` without touching the filesystem.
/// `..` may not climb above the root; absolute paths must already lie under it.
pub fn resolve_in_workspace(root: &Path, relative: &str) -> ToolResult<PathBuf> {
    let requested = Path::new(relative);
    let mut resolved = PathBuf::new();
    let mut depth = 0usize;

    let rest = if requested.is_absolute() {
        match requested.strip_prefix(root) {
            Ok(rest) => rest,
            Err(_) => {
                return Err(ToolError::PermissionDenied(format!(
                    "Path outside working directory: {relative}"
                )))
            }
        }
    } else {
        requested
    };

    for component in rest.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::ParentDir => {
                if depth == 0 {
                    return Err(ToolError::PermissionDenied(format!(
                        "Path traversal detected: {relative}"
                    )));
                }
                resolved.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ToolError::PermissionDenied(format!(
                    "Path outside working directory: {relative}"
                )))
            }
        }
    }
    Ok(root.join(resolved))
}

fn required_str<'a>(arguments: &'a Value, key: &str) -> ToolResult<&'a str> {
    arguments[key]
        .as_str()
        .ok_or_else(|| ToolError::InvalidArguments(format!("Missing '{key}' argument")))
}

// ─────────────────────────────────────────────────────────────────────────────
// read_file
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ReadFileTool;

impl ReadFileTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> String {
        "read_file".to_string()
    }

    fn description(&self) -> String {
        "Read a UTF-8 text file from the working directory".to_string()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the working directory"
                },
                "max_bytes": {
                    "type": "integer",
                    "description": "Truncate the returned content after this many bytes"
                }
            },
            "required": ["path"]
        })
    }

    async fn call(&self, arguments: Value, ctx: &ExecutionContext) -> ToolResult<Value> {
        let path_str = required_str(&arguments, "path")?;
        let max_bytes = arguments["max_bytes"]
            .as_u64()
            .unwrap_or(DEFAULT_MAX_READ_BYTES) as usize;
        let path = resolve_in_workspace(&ctx.working_directory, path_str)?;

        if !path.is_file() {
            return Err(ToolError::NotFound(format!("File not found: {}", path_str)));
        }

        // One byte past the limit is enough to tell whether we truncated
        let file = fs::File::open(&path)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to read file: {}", e)))?;
        let mut bytes = Vec::new();
        file.take((max_bytes as u64).saturating_add(1))
            .read_to_end(&mut bytes)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to read file: {}", e)))?;

        let truncated = bytes.len() > max_bytes;
        bytes.truncate(max_bytes);
        let content = match String::from_utf8(bytes) {
            Ok(content) => content,
            // A cut through a multi-byte character is dropped back to the boundary
            Err(e) if truncated && e.utf8_error().error_len().is_none() => {
                let valid = e.utf8_error().valid_up_to();
                let mut bytes = e.into_bytes();
                bytes.truncate(valid);
                String::from_utf8(bytes).map_err(|e| {
                    ToolError::ExecutionFailed(format!("File is not valid UTF-8: {}", e))
                })?
            }
            Err(e) => {
                return Err(ToolError::ExecutionFailed(format!(
                    "File is not valid UTF-8: {}",
                    e.utf8_error()
                )))
            }
        };

        Ok(json!({
            "path": path_str,
            "content": content,
            "truncated": truncated
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// write_file
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct WriteFileTool;

impl WriteFileTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> String {
        "write_file".to_string()
    }

    fn description(&self) -> String {
        "Write a text file in the working directory (creates parent directories if needed)"
            .to_string()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the working directory"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn call(&self, arguments: Value, ctx: &ExecutionContext) -> ToolResult<Value> {
        let path_str = required_str(&arguments, "path")?;
        let content = required_str(&arguments, "content")?;
        let path = resolve_in_workspace(&ctx.working_directory, path_str)?;

        if path == ctx.working_directory {
            return Err(ToolError::InvalidArguments(
                "Path must name a file".to_string(),
            ));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ToolError::ExecutionFailed(format!("Failed to create directories: {}", e))
            })?;
        }

        fs::write(&path, content)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to write file: {}", e)))?;

        Ok(json!({
            "path": path_str,
            "bytes_written": content.len()
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// list_dir
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ListDirTool;

impl ListDirTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> String {
        "list_dir".to_string()
    }

    fn description(&self) -> String {
        "List files and directories under a path in the working directory".to_string()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory relative to the working directory (default: the working directory itself)"
                }
            },
            "required": []
        })
    }

    async fn call(&self, arguments: Value, ctx: &ExecutionContext) -> ToolResult<Value> {
        let path_str = arguments["path"].as_str().unwrap_or(".");
        let path = resolve_in_workspace(&ctx.working_directory, path_str)?;

        if !path.is_dir() {
            return Err(ToolError::NotFound(format!(
                "Directory not found: {}",
                path_str
            )));
        }

        let mut entries = fs::read_dir(&path)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to read directory: {}", e)))?;

        let mut items = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to read entry: {}", e)))?
        {
            let metadata = entry.metadata().await.ok();
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = metadata.as_ref().map(|m| m.is_dir()).unwrap_or(false);
            let size = metadata.as_ref().map(|m| m.len()).unwrap_or(0);
            items.push((name, is_dir, size));
        }
        items.sort_by(|a, b| a.0.cmp(&b.0));

        let entries: Vec<Value> = items
            .into_iter()
            .map(|(name, is_dir, size)| json!({"name": name, "is_dir": is_dir, "size": size}))
            .collect();

        Ok(json!({
            "path": path_str,
            "entries": entries
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_nested_and_dot_segments() {
        let root = Path::new("/work");
        assert_eq!(
            resolve_in_workspace(root, "src/./lib.rs").unwrap(),
            PathBuf::from("/work/src/lib.rs")
        );
        assert_eq!(
            resolve_in_workspace(root, "src/../Cargo.toml").unwrap(),
            PathBuf::from("/work/Cargo.toml")
        );
        assert_eq!(
            resolve_in_workspace(root, "/work/a.txt").unwrap(),
            PathBuf::from("/work/a.txt")
        );
    }

    #[test]
    fn rejects_escapes() {
        let root = Path::new("/work");
        for bad in ["../secret", "a/../../b", "/etc/passwd"] {
            assert!(
                matches!(
                    resolve_in_workspace(root, bad),
                    Err(ToolError::PermissionDenied(_))
                ),
                "{bad} should be rejected"
            );
        }
    }
}
