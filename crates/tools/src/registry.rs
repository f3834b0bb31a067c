use bastion_core::config::ToolsConfig;
use bastion_core::{Registry, RegistryError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::exec::ExecTool;
use crate::fs::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
use crate::web::WebFetchTool;
use crate::Tool;

/// Built-in tool factories, keyed by tool name.
pub fn register_builtin(registry: &mut Registry<dyn Tool>, cfg: &ToolsConfig) -> Result<(), RegistryError> {
    let shell = cfg.exec.shell.clone();
    registry.register("exec", move |_: &Value| Ok(Arc::new(ExecTool::new(&shell)) as Arc<dyn Tool>))?;
    registry.register("read_file", |_: &Value| Ok(Arc::new(ReadFileTool) as Arc<dyn Tool>))?;
    registry.register("write_file", |_: &Value| Ok(Arc::new(WriteFileTool) as Arc<dyn Tool>))?;
    registry.register("edit_file", |_: &Value| Ok(Arc::new(EditFileTool) as Arc<dyn Tool>))?;
    registry.register("list_dir", |_: &Value| Ok(Arc::new(ListDirTool) as Arc<dyn Tool>))?;
    let fetch = cfg.fetch.clone();
    registry.register("web_fetch", move |_: &Value| {
        Ok(Arc::new(WebFetchTool::new(fetch.max_bytes, fetch.timeout_secs)) as Arc<dyn Tool>)
    })?;
    Ok(())
}

/// The live tool set the sandbox dispatches to.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every enabled tool capability. An empty `enabled` list means all.
    /// Failed resolutions are returned alongside the usable registry.
    pub fn from_capabilities(
        capabilities: &Registry<dyn Tool>,
        enabled: &[String],
    ) -> (Self, Vec<RegistryError>) {
        let mut registry = Self::new();
        let mut errors = Vec::new();
        for key in capabilities.keys() {
            if !enabled.is_empty() && !enabled.contains(&key) {
                continue;
            }
            match capabilities.resolve(&key, &Value::Null) {
                Ok(tool) => registry.register(tool),
                Err(e) => errors.push(e),
            }
        }
        for name in enabled {
            if !capabilities.contains(name) {
                errors.push(RegistryError::UnknownKey {
                    kind: capabilities.kind(),
                    key: name.clone(),
                });
            }
        }
        (registry, errors)
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.schema().name;
        debug!(tool = %name, action = %tool.action(), "Registering tool");
        if self.tools.insert(name.clone(), tool).is_some() {
            warn!(tool = %name, "Replaced previously registered tool");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Function schemas for the provider request, sorted by name.
    pub fn get_tool_schemas(&self) -> Vec<Value> {
        self.tool_names()
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.schema().to_function())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::CapabilityKind;

    fn capabilities() -> Registry<dyn Tool> {
        let mut reg: Registry<dyn Tool> = Registry::new(CapabilityKind::Tool);
        register_builtin(&mut reg, &ToolsConfig::default()).unwrap();
        reg
    }

    #[test]
    fn test_all_builtins_when_unfiltered() {
        let (tools, errors) = ToolRegistry::from_capabilities(&capabilities(), &[]);
        assert!(errors.is_empty());
        assert_eq!(
            tools.tool_names(),
            vec!["edit_file", "exec", "list_dir", "read_file", "web_fetch", "write_file"]
        );
        let schemas = tools.get_tool_schemas();
        assert_eq!(schemas[0]["type"], "function");
        assert_eq!(schemas[0]["function"]["name"], "edit_file");
    }

    #[test]
    fn test_enabled_filter_and_unknown_names() {
        let enabled = vec!["read_file".to_string(), "teleport".to_string()];
        let (tools, errors) = ToolRegistry::from_capabilities(&capabilities(), &enabled);
        assert_eq!(tools.tool_names(), vec!["read_file"]);
        assert!(matches!(&errors[0], RegistryError::UnknownKey { key, .. } if key == "teleport"));
        assert!(tools.get("exec").is_none());
    }
}
