pub mod exec;
pub mod fs;
pub mod plugin;
pub mod registry;
pub mod runtime;
pub mod sandbox;
pub mod schema;
pub mod web;

use async_trait::async_trait;
use bastion_core::{Subject, ToolError};
use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use registry::{register_builtin, ToolRegistry};
pub use runtime::{CommandSpec, ExecutionLimits, ExecutionOutput, RuntimeAdapter, RuntimeFault};
pub use sandbox::{SandboxSettings, ToolSandbox};

/// Truncate a string to at most `max_bytes` bytes, respecting UTF-8 char boundaries.
pub fn safe_truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Everything a tool may use while executing. Built by the sandbox after the
/// invocation has been authorized.
#[derive(Clone)]
pub struct ToolContext {
    pub invocation_id: String,
    pub subject: Subject,
    pub session_key: Option<String>,
    pub workspace: PathBuf,
    /// Defaults tightened by the authorizing decision's constraints.
    pub limits: ExecutionLimits,
    pub runtime: Arc<dyn RuntimeAdapter>,
    pub cancel: CancellationToken,
}

impl ToolContext {
    /// Expand `~/` and resolve relative paths against the workspace.
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        if let Some(rest) = raw.strip_prefix("~/") {
            dirs::home_dir()
                .map(|h| h.join(rest))
                .unwrap_or_else(|| PathBuf::from(raw))
        } else if raw.starts_with('/') {
            PathBuf::from(raw)
        } else {
            self.workspace.join(raw)
        }
    }

    /// Resolve `raw` and refuse it when it falls outside the allowed prefixes.
    /// Symlinks are followed for the part of the path that exists. A symlink
    /// whose target does not exist is refused, since writing through it would
    /// create a file wherever it points.
    pub fn checked_path(&self, raw: &str) -> Result<PathBuf, ToolError> {
        let path = normalize(&self.resolve_path(raw));
        let resolved = canonicalize_existing(&path).ok_or_else(|| {
            ToolError::denied(format!("path '{}' goes through a dangling symlink", path.display()))
        })?;
        if !self.limits.allows_path(&resolved) {
            return Err(ToolError::denied(format!(
                "path '{}' is outside the allowed prefixes",
                resolved.display()
            )));
        }
        Ok(resolved)
    }

    pub fn check_network(&self) -> Result<(), ToolError> {
        if self.limits.deny_network {
            return Err(ToolError::denied("network access is denied for this invocation"));
        }
        Ok(())
    }
}

/// Lexically drop `.` and fold `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the longest existing ancestor and re-append the rest.
/// `None` when that ancestor is a symlink that cannot be resolved.
fn canonicalize_existing(path: &Path) -> Option<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();
    // symlink_metadata so a dangling link counts as present.
    while std::fs::symlink_metadata(&existing).is_err() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return Some(path.to_path_buf()),
        }
    }
    let mut resolved = existing.canonicalize().ok()?;
    for name in rest.into_iter().rev() {
        resolved.push(name);
    }
    Some(resolved)
}

#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSchema {
    /// OpenAI function-calling shape, which the provider adapters expect.
    pub fn to_function(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;

    /// Action identity the policy engine evaluates, e.g. `fs.read`.
    fn action(&self) -> String;

    /// Checks beyond the JSON schema. Runs before any policy evaluation.
    fn validate(&self, _params: &Value) -> Result<(), ToolError> {
        Ok(())
    }

    /// Preferred runtime adapter, if any.
    fn runtime(&self) -> Option<&str> {
        None
    }

    /// The resource an invocation touches, recorded with the decision.
    fn resource(&self, _params: &Value) -> Option<String> {
        None
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<Value, ToolError>;
}
