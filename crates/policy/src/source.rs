use bastion_core::config::PolicyRuleConfig;
use bastion_core::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Where policy rules come from. Sources are read in order and their rules
/// concatenated, which defines declaration order across sources.
pub trait RuleSource: Send + Sync {
    fn name(&self) -> String;
    fn load(&self) -> Result<Vec<PolicyRuleConfig>>;
}

/// Rules embedded in the main configuration.
pub struct StaticRules {
    rules: Vec<PolicyRuleConfig>,
}

impl StaticRules {
    pub fn new(rules: Vec<PolicyRuleConfig>) -> Self {
        Self { rules }
    }
}

impl RuleSource for StaticRules {
    fn name(&self) -> String {
        "config".to_string()
    }

    fn load(&self) -> Result<Vec<PolicyRuleConfig>> {
        Ok(self.rules.clone())
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<PolicyRuleConfig>,
}

/// A standalone rules file, `{ "rules": [...] }` in JSON, YAML or TOML.
/// The file is re-read on every reload.
pub struct FileRules {
    path: PathBuf,
}

impl FileRules {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl RuleSource for FileRules {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn load(&self) -> Result<Vec<PolicyRuleConfig>> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::Policy(format!("cannot read rules file {}: {}", self.path.display(), e))
        })?;
        let ext = self
            .path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("json")
            .to_ascii_lowercase();
        let file: RuleFile = match ext.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&content)?,
            "toml" => toml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        Ok(file.rules)
    }
}
