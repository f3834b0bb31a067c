pub mod decision;
pub mod engine;
pub mod pattern;
pub mod rule;
pub mod source;

pub use decision::{PolicyContext, PolicyDecision, ReasonCode, Verdict};
pub use engine::{PolicyEngine, RulePolicyEngine, RuleSummary};
pub use rule::{Effect, Rule, RuleSet};
pub use source::{FileRules, RuleSource, StaticRules};

use bastion_core::config::PolicyConfig;
use bastion_core::{Paths, Registry};
use serde_json::Value;
use std::sync::Arc;

/// Register the built-in policy engines. Each factory takes the `policy`
/// section of the configuration as its parameters.
pub fn register_builtin(
    registry: &mut Registry<dyn PolicyEngine>,
    paths: Paths,
) -> Result<(), bastion_core::RegistryError> {
    registry.register("rules", move |params: &Value| {
        let cfg: PolicyConfig = if params.is_null() {
            PolicyConfig::default()
        } else {
            serde_json::from_value(params.clone())?
        };
        let mut sources: Vec<Box<dyn RuleSource>> = vec![Box::new(StaticRules::new(cfg.rules))];
        if let Some(file) = &cfg.rules_file {
            sources.push(Box::new(FileRules::new(paths.resolve(file))));
        }
        let engine = RulePolicyEngine::new(sources, cfg.cache_size)?;
        Ok(Arc::new(engine) as Arc<dyn PolicyEngine>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::{CapabilityKind, RegistryError, Subject};
    use serde_json::json;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> Registry<dyn PolicyEngine> {
        let mut reg: Registry<dyn PolicyEngine> = Registry::new(CapabilityKind::Policy);
        register_builtin(&mut reg, Paths::with_base(dir.path().to_path_buf())).unwrap();
        reg
    }

    #[test]
    fn test_rules_engine_from_config_value() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let engine = reg
            .resolve(
                "rules",
                &json!({ "rules": [{ "subject": "cli:*", "action": "fs.read", "effect": "allow" }] }),
            )
            .unwrap();
        let d = engine.evaluate(
            &Subject::new("cli", "u"),
            "fs.read",
            &PolicyContext::default(),
        );
        assert!(d.is_allowed());
    }

    #[test]
    fn test_rules_file_resolved_against_base() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("policy.json"),
            r#"{ "rules": [{ "id": "f", "subject": "*", "action": "net.fetch", "effect": "allow" }] }"#,
        )
        .unwrap();
        let reg = registry(&dir);
        let engine = reg
            .resolve("rules", &json!({ "rulesFile": "policy.json" }))
            .unwrap();
        let d = engine.evaluate(
            &Subject::new("cli", "u"),
            "net.fetch",
            &PolicyContext::default(),
        );
        assert_eq!(d.rule_id.as_deref(), Some("f"));
    }

    #[test]
    fn test_missing_rules_file_fails_construction() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let err = reg
            .resolve("rules", &json!({ "rulesFile": "absent.yaml" }))
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::ConstructionError { .. }));
    }
}
