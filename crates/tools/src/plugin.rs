//! Tools described by a `tool.toml` manifest in a plugin directory.
//!
//! ```toml
//! [tool]
//! name = "weather"
//! version = "0.1.0"
//! description = "Current weather for a city"
//!
//! [exec]
//! binary = "bin/weather"
//!
//! [[parameters]]
//! name = "city"
//! type = "string"
//! required = true
//! ```
//!
//! The binary receives the parameters (defaults applied) as JSON on stdin.

use async_trait::async_trait;
use bastion_core::{Registry, ToolError};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::runtime::CommandSpec;
use crate::{Tool, ToolContext, ToolSchema};

pub const MANIFEST_FILE: &str = "tool.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginManifest {
    pub tool: ToolSection,
    pub exec: ExecSection,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolSection {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecSection {
    pub binary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
}

impl ParamType {
    fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<toml::Value>,
}

impl PluginManifest {
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let manifest: PluginManifest = toml::from_str(content)?;
        manifest.check()?;
        Ok(manifest)
    }

    fn check(&self) -> anyhow::Result<()> {
        let name = &self.tool.name;
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            anyhow::bail!("invalid tool name '{}'", name);
        }
        let binary = Path::new(&self.exec.binary);
        if binary.is_absolute()
            || binary
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            anyhow::bail!("binary '{}' must stay inside the plugin directory", self.exec.binary);
        }
        for param in &self.parameters {
            if let Some(default) = &param.default {
                let value = serde_json::to_value(default)?;
                if !param.kind.accepts(&value) {
                    anyhow::bail!(
                        "default for '{}' is not a {}",
                        param.name,
                        param.kind.as_str()
                    );
                }
            }
        }
        Ok(())
    }

    fn json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            properties.insert(
                param.name.clone(),
                json!({"type": param.kind.as_str(), "description": param.description}),
            );
            if param.required && param.default.is_none() {
                required.push(Value::String(param.name.clone()));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false
        })
    }
}

pub struct PluginTool {
    manifest: PluginManifest,
    dir: PathBuf,
    binary: PathBuf,
}

impl PluginTool {
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(dir.join(MANIFEST_FILE))?;
        let manifest = PluginManifest::parse(&content)?;
        let dir = dir.canonicalize()?;
        let binary = dir.join(&manifest.exec.binary).canonicalize()?;
        // Symlinks could still point out of the plugin directory.
        if !binary.starts_with(&dir) {
            anyhow::bail!("binary resolves outside the plugin directory");
        }
        Ok(Self {
            manifest,
            dir,
            binary,
        })
    }

    pub fn name(&self) -> &str {
        &self.manifest.tool.name
    }

    fn with_defaults(&self, params: Value) -> Value {
        let mut obj = match params {
            Value::Object(obj) => obj,
            _ => Map::new(),
        };
        for param in &self.manifest.parameters {
            if let Some(default) = &param.default {
                if !obj.contains_key(&param.name) {
                    if let Ok(v) = serde_json::to_value(default) {
                        obj.insert(param.name.clone(), v);
                    }
                }
            }
        }
        Value::Object(obj)
    }
}

#[async_trait]
impl Tool for PluginTool {
    fn schema(&self) -> ToolSchema {
        let description = match &self.manifest.tool.version {
            Some(v) => format!("{} (plugin v{})", self.manifest.tool.description, v),
            None => self.manifest.tool.description.clone(),
        };
        ToolSchema {
            name: self.manifest.tool.name.clone(),
            description,
            parameters: self.manifest.json_schema(),
        }
    }

    fn action(&self) -> String {
        format!("plugin.{}", self.manifest.tool.name)
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<Value, ToolError> {
        let input = serde_json::to_vec(&self.with_defaults(params))
            .map_err(|e| ToolError::fault(e.to_string()))?;
        let mut spec = CommandSpec::new(self.binary.display().to_string()).stdin(input);
        if ctx.limits.path_prefixes.is_empty() {
            spec = spec.current_dir(&self.dir);
        }

        let output = ctx.runtime.run(spec, &ctx.limits, ctx.cancel.clone()).await?;
        if !output.success() {
            return Err(ToolError::fault(format!(
                "plugin exited with {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(serde_json::from_str(output.stdout.trim())
            .unwrap_or_else(|_| Value::String(output.stdout)))
    }
}

/// Load every plugin under `plugins_dir`. Broken manifests are skipped and
/// returned as problem descriptions.
pub fn load_plugins(plugins_dir: &Path) -> (Vec<PluginTool>, Vec<String>) {
    let mut tools = Vec::new();
    let mut problems = Vec::new();

    let Ok(entries) = std::fs::read_dir(plugins_dir) else {
        return (tools, problems);
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.join(MANIFEST_FILE).is_file())
        .collect();
    dirs.sort();

    for dir in dirs {
        match PluginTool::load(&dir) {
            Ok(tool) => {
                info!(plugin = %tool.name(), dir = %dir.display(), "Loaded plugin tool");
                tools.push(tool);
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Skipping malformed plugin");
                problems.push(format!("{}: {:#}", dir.display(), e));
            }
        }
    }
    (tools, problems)
}

/// Register loaded plugins as tool capabilities keyed by tool name.
pub fn register_plugins(registry: &mut Registry<dyn Tool>, plugins_dir: &Path) -> Vec<String> {
    let (tools, mut problems) = load_plugins(plugins_dir);
    for tool in tools {
        let name = tool.name().to_string();
        let tool: Arc<dyn Tool> = Arc::new(tool);
        if let Err(e) = registry.register(&name, move |_: &Value| Ok(tool.clone())) {
            warn!(plugin = %name, error = %e, "Plugin name collides with a registered tool");
            problems.push(e.to_string());
        }
    }
    problems
}
