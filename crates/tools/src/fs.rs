use async_trait::async_trait;
use bastion_core::ToolError;
use serde_json::{json, Value};

use crate::{Tool, ToolContext, ToolSchema};

fn path_param(params: &Value) -> Result<&str, ToolError> {
    params
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::invalid("missing path"))
}

fn path_resource(params: &Value) -> Option<String> {
    params.get("path").and_then(Value::as_str).map(str::to_string)
}

// ============ read_file ============

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "read_file".to_string(),
            description: "Read the contents of a UTF-8 text file".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "minLength": 1,
                        "description": "Path to the file, relative to the workspace or absolute"
                    }
                },
                "required": ["path"],
                "additionalProperties": false
            }),
        }
    }

    fn action(&self) -> String {
        "fs.read".to_string()
    }

    fn resource(&self, params: &Value) -> Option<String> {
        path_resource(params)
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<Value, ToolError> {
        let path = ctx.checked_path(path_param(&params)?)?;

        if !path.is_file() {
            return Err(ToolError::fault(format!("not a file: {}", path.display())));
        }

        let content = tokio::fs::read_to_string(&path).await?;
        Ok(json!({
            "path": path.display().to_string(),
            "content": content
        }))
    }
}

// ============ write_file ============

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "write_file".to_string(),
            description: "Write content to a file, creating parent directories if needed".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "minLength": 1,
                        "description": "Path to the file to write"
                    },
                    "content": {
                        "type": "string",
                        "description": "Content to write to the file"
                    }
                },
                "required": ["path", "content"],
                "additionalProperties": false
            }),
        }
    }

    fn action(&self) -> String {
        "fs.write".to_string()
    }

    fn resource(&self, params: &Value) -> Option<String> {
        path_resource(params)
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<Value, ToolError> {
        let path = ctx.checked_path(path_param(&params)?)?;
        let content = params
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::invalid("missing content"))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;

        Ok(json!({
            "path": path.display().to_string(),
            "bytes_written": content.len()
        }))
    }
}

// ============ edit_file ============

pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "edit_file".to_string(),
            description: "Edit a file by replacing old_text with new_text. old_text must match exactly and appear only once.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "minLength": 1},
                    "old_text": {"type": "string", "minLength": 1},
                    "new_text": {"type": "string"}
                },
                "required": ["path", "old_text", "new_text"],
                "additionalProperties": false
            }),
        }
    }

    fn action(&self) -> String {
        "fs.write".to_string()
    }

    fn resource(&self, params: &Value) -> Option<String> {
        path_resource(params)
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<Value, ToolError> {
        let path = ctx.checked_path(path_param(&params)?)?;
        let old_text = params["old_text"].as_str().unwrap_or_default();
        let new_text = params["new_text"].as_str().unwrap_or_default();

        let content = tokio::fs::read_to_string(&path).await?;
        match content.matches(old_text).count() {
            0 => {
                return Err(ToolError::fault(format!(
                    "old_text not found in {}",
                    path.display()
                )))
            }
            1 => {}
            n => {
                return Err(ToolError::fault(format!(
                    "old_text appears {} times; it must be unique",
                    n
                )))
            }
        }

        tokio::fs::write(&path, content.replacen(old_text, new_text, 1)).await?;
        Ok(json!({
            "path": path.display().to_string(),
            "status": "edited"
        }))
    }
}

// ============ list_dir ============

pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "list_dir".to_string(),
            description: "List contents of a directory".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path to the directory to list"
                    }
                },
                "required": ["path"],
                "additionalProperties": false
            }),
        }
    }

    fn action(&self) -> String {
        "fs.list".to_string()
    }

    fn resource(&self, params: &Value) -> Option<String> {
        path_resource(params)
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<Value, ToolError> {
        let path = ctx.checked_path(path_param(&params)?)?;

        if !path.is_dir() {
            return Err(ToolError::fault(format!("not a directory: {}", path.display())));
        }

        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&path).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let file_type = entry.file_type().await?;
            let kind = if file_type.is_dir() {
                "directory"
            } else if file_type.is_file() {
                "file"
            } else {
                "other"
            };
            entries.push(json!({
                "name": entry.file_name().to_string_lossy(),
                "type": kind
            }));
        }
        entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

        Ok(json!({
            "path": path.display().to_string(),
            "entries": entries
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context;
    use bastion_core::ToolErrorKind;
    use tempfile::TempDir;

    #[test]
    fn test_actions() {
        assert_eq!(ReadFileTool.action(), "fs.read");
        assert_eq!(WriteFileTool.action(), "fs.write");
        assert_eq!(EditFileTool.action(), "fs.write");
        assert_eq!(ListDirTool.action(), "fs.list");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_through_dangling_symlink_is_denied() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let target = outside.path().join("escaped.txt");
        std::os::unix::fs::symlink(&target, root.join("notes.txt")).unwrap();

        let mut ctx = context(&root);
        ctx.limits.path_prefixes = vec![root.clone()];
        let err = WriteFileTool
            .execute(ctx, json!({"path": "notes.txt", "content": "pwned"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::PolicyDenied);
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_write_read_edit_list() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());

        WriteFileTool
            .execute(ctx.clone(), json!({"path": "notes/a.txt", "content": "hello world"}))
            .await
            .unwrap();
        EditFileTool
            .execute(
                ctx.clone(),
                json!({"path": "notes/a.txt", "old_text": "world", "new_text": "there"}),
            )
            .await
            .unwrap();
        let read = ReadFileTool
            .execute(ctx.clone(), json!({"path": "notes/a.txt"}))
            .await
            .unwrap();
        assert_eq!(read["content"], "hello there");

        let listed = ListDirTool.execute(ctx, json!({"path": "notes"})).await.unwrap();
        assert_eq!(listed["entries"][0]["name"], "a.txt");
        assert_eq!(listed["entries"][0]["type"], "file");
    }

    #[tokio::test]
    async fn test_edit_requires_unique_match() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        std::fs::write(dir.path().join("f.txt"), "aa").unwrap();
        let err = EditFileTool
            .execute(ctx, json!({"path": "f.txt", "old_text": "a", "new_text": "b"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::ExecutionFault);
    }

    #[tokio::test]
    async fn test_write_outside_prefix_denied() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let allowed = root.join("allowed");
        std::fs::create_dir_all(&allowed).unwrap();
        let mut ctx = context(&root);
        ctx.limits.path_prefixes = vec![allowed];

        let err = WriteFileTool
            .execute(ctx.clone(), json!({"path": "secret.txt", "content": "x"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::PolicyDenied);
        assert!(!root.join("secret.txt").exists());

        WriteFileTool
            .execute(ctx, json!({"path": "allowed/ok.txt", "content": "x"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_read_missing_is_fault() {
        let dir = TempDir::new().unwrap();
        let err = ReadFileTool
            .execute(context(dir.path()), json!({"path": "nope.txt"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::ExecutionFault);
    }
}
