use async_trait::async_trait;
use bastion_core::ToolError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use crate::runtime::CommandSpec;
use crate::{Tool, ToolContext, ToolSchema};

/// Commands refused outright, whatever the policy says.
static DENY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"rm\s+-rf\s+/(\s|$)",
        r"rm\s+-rf\s+~",
        r"rm\s+-rf\s+\*",
        r"\bdd\b.*\bif=",
        r"\bshutdown\b",
        r"\breboot\b",
        r":\(\)\s*\{\s*:\|:\s*&\s*\}\s*;", // fork bomb
        r">\s*/dev/sd",
        r"mkfs\.",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

fn is_dangerous_command(command: &str) -> bool {
    DENY_PATTERNS.iter().any(|re| re.is_match(command))
}

pub struct ExecTool {
    shell: String,
}

impl ExecTool {
    pub fn new(shell: &str) -> Self {
        Self {
            shell: shell.to_string(),
        }
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "exec".to_string(),
            description: "Execute a shell command and return its exit code, stdout and stderr".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "minLength": 1,
                        "description": "The command to execute"
                    },
                    "working_dir": {
                        "type": "string",
                        "description": "Working directory for the command (optional)"
                    }
                },
                "required": ["command"],
                "additionalProperties": false
            }),
        }
    }

    fn action(&self) -> String {
        "shell.exec".to_string()
    }

    fn validate(&self, params: &Value) -> Result<(), ToolError> {
        let command = params.get("command").and_then(Value::as_str).unwrap_or_default();
        if is_dangerous_command(command) {
            return Err(ToolError::invalid("command matches a blocked pattern"));
        }
        Ok(())
    }

    fn resource(&self, params: &Value) -> Option<String> {
        params.get("command").and_then(Value::as_str).map(str::to_string)
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<Value, ToolError> {
        let command = params
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::invalid("missing command"))?;

        let working_dir = match params.get("working_dir").and_then(Value::as_str) {
            Some(dir) => ctx.checked_path(dir)?,
            None => match ctx.checked_path(".") {
                Ok(dir) => dir,
                // Workspace outside the allowed prefixes: start in the first one.
                Err(e) => ctx.limits.path_prefixes.first().cloned().ok_or(e)?,
            },
        };

        let spec = CommandSpec::shell(&self.shell, command).current_dir(working_dir);
        let output = ctx.runtime.run(spec, &ctx.limits, ctx.cancel.clone()).await?;

        Ok(json!({
            "exit_code": output.exit_code,
            "stdout": output.stdout,
            "stderr": output.stderr,
        }))
    }
}
