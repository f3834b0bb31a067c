use bastion_core::config::PolicyRuleConfig;
use bastion_core::{Error, Result, Subject};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

use crate::decision::{PolicyContext, PolicyDecision, ReasonCode, Verdict};
use crate::rule::{Effect, RuleSet};
use crate::source::{RuleSource, StaticRules};

/// Decides whether a subject may perform an action.
pub trait PolicyEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Version of the rule set currently in force.
    fn version(&self) -> u64;

    fn evaluate(&self, subject: &Subject, action: &str, context: &PolicyContext) -> PolicyDecision;

    /// Re-read rule sources and swap the rule set in atomically.
    fn reload(&self) -> Result<u64> {
        Ok(self.version())
    }

    /// Rules in evaluation order, for diagnostics.
    fn describe(&self) -> Vec<RuleSummary> {
        Vec::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RuleSummary {
    pub id: String,
    pub subject: String,
    pub action: String,
    pub effect: String,
}

#[derive(Debug, Clone)]
struct CachedVerdict {
    verdict: Verdict,
    reason: ReasonCode,
    rule_id: Option<String>,
}

type CacheKey = (String, String, u64);

/// Ordered-rule engine: first match wins, no match denies.
pub struct RulePolicyEngine {
    rules: RwLock<Arc<RuleSet>>,
    cache: RwLock<HashMap<CacheKey, CachedVerdict>>,
    cache_size: usize,
    sources: Vec<Box<dyn RuleSource>>,
}

impl RulePolicyEngine {
    pub fn new(sources: Vec<Box<dyn RuleSource>>, cache_size: usize) -> Result<Self> {
        let engine = Self {
            rules: RwLock::new(Arc::new(RuleSet::empty(0))),
            cache: RwLock::new(HashMap::new()),
            cache_size,
            sources,
        };
        engine.reload_sources()?;
        Ok(engine)
    }

    /// Engine over a fixed rule list.
    pub fn from_rules(rules: Vec<PolicyRuleConfig>) -> Result<Self> {
        Self::new(vec![Box::new(StaticRules::new(rules))], 1024)
    }

    /// Replace the rule set with `rules`. On error the current set stays in force
    /// and no version is consumed.
    ///
    /// The version is taken under the write lock, so the installed version only
    /// ever grows even when reloads race.
    pub fn replace_rules(&self, rules: Vec<PolicyRuleConfig>) -> Result<u64> {
        check_unique_ids(&rules)?;
        let mut current = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let version = current.version() + 1;
        let set = RuleSet::from_configs(&rules, version)?;
        let count = set.rules().len();
        *current = Arc::new(set);
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        drop(current);
        info!(version, rules = count, "Policy rule set installed");
        Ok(version)
    }

    fn reload_sources(&self) -> Result<u64> {
        let mut all = Vec::new();
        for source in &self.sources {
            let rules = source.load()?;
            debug!(source = %source.name(), rules = rules.len(), "Loaded policy rules");
            all.extend(rules);
        }
        self.replace_rules(all)
    }

    fn current(&self) -> Arc<RuleSet> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lookup(&self, key: &CacheKey) -> Option<CachedVerdict> {
        if self.cache_size == 0 {
            return None;
        }
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn store(&self, key: CacheKey, value: CachedVerdict) {
        if self.cache_size == 0 {
            return;
        }
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if cache.len() >= self.cache_size {
            cache.clear();
        }
        cache.insert(key, value);
    }
}

fn check_unique_ids(rules: &[PolicyRuleConfig]) -> Result<()> {
    let mut seen = HashSet::new();
    for rule in rules {
        if let Some(id) = &rule.id {
            if !seen.insert(id.as_str()) {
                return Err(Error::Config(format!("duplicate policy rule id '{}'", id)));
            }
        }
    }
    Ok(())
}

impl PolicyEngine for RulePolicyEngine {
    fn name(&self) -> &str {
        "rules"
    }

    fn version(&self) -> u64 {
        self.current().version()
    }

    fn evaluate(&self, subject: &Subject, action: &str, context: &PolicyContext) -> PolicyDecision {
        let set = self.current();
        let subject_id = subject.id();
        let key = (subject_id.clone(), action.to_string(), set.version());

        let (verdict, cached) = match self.lookup(&key) {
            Some(hit) => (hit, true),
            None => {
                let computed = match set.first_match(&subject_id, action) {
                    Some(rule) => {
                        let (verdict, reason) = match &rule.effect {
                            Effect::Allow => (Verdict::Allow, ReasonCode::RuleAllowed),
                            Effect::Deny => (Verdict::Deny, ReasonCode::RuleDenied),
                            Effect::AllowWithConstraints(c) => (
                                Verdict::AllowWithConstraints {
                                    constraints: c.clone(),
                                },
                                ReasonCode::RuleConstrained,
                            ),
                        };
                        CachedVerdict {
                            verdict,
                            reason,
                            rule_id: Some(rule.id.clone()),
                        }
                    }
                    None => CachedVerdict {
                        verdict: Verdict::Deny,
                        reason: ReasonCode::NoMatchingRule,
                        rule_id: None,
                    },
                };
                self.store(key, computed.clone());
                (computed, false)
            }
        };

        let decision = PolicyDecision {
            id: uuid::Uuid::new_v4().to_string(),
            subject: subject_id,
            action: action.to_string(),
            verdict: verdict.verdict,
            reason: verdict.reason,
            rule_id: verdict.rule_id,
            policy_version: set.version(),
            cached,
            context: context.clone(),
            decided_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        debug!(
            decision = %decision.id,
            subject = %decision.subject,
            action = %decision.action,
            verdict = decision.verdict.as_str(),
            rule = ?decision.rule_id,
            cached,
            "Policy evaluated"
        );
        decision
    }

    fn reload(&self) -> Result<u64> {
        self.reload_sources()
    }

    fn describe(&self) -> Vec<RuleSummary> {
        self.current()
            .rules()
            .iter()
            .map(|r| RuleSummary {
                id: r.id.clone(),
                subject: r.subject.as_str().to_string(),
                action: r.action.as_str().to_string(),
                effect: match &r.effect {
                    Effect::Allow => "allow".to_string(),
                    Effect::Deny => "deny".to_string(),
                    Effect::AllowWithConstraints(_) => "allow_with_constraints".to_string(),
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::config::RuleEffect;
    use bastion_core::types::Constraints;
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn rule(id: &str, subject: &str, action: &str, effect: RuleEffect) -> PolicyRuleConfig {
        PolicyRuleConfig {
            id: Some(id.to_string()),
            subject: subject.to_string(),
            action: action.to_string(),
            effect,
            constraints: None,
        }
    }

    fn ctx() -> PolicyContext {
        PolicyContext::default()
    }

    #[test]
    fn test_default_deny() {
        let engine = RulePolicyEngine::from_rules(vec![]).unwrap();
        let d = engine.evaluate(&Subject::new("cli", "alice"), "shell.exec", &ctx());
        assert_eq!(d.verdict, Verdict::Deny);
        assert_eq!(d.reason, ReasonCode::NoMatchingRule);
        assert!(d.rule_id.is_none());
    }

    #[test]
    fn test_first_match_with_constraints() {
        let mut constrained = rule("ws", "cli:*", "fs.*", RuleEffect::AllowWithConstraints);
        constrained.constraints = Some(Constraints {
            path_prefixes: vec![PathBuf::from("/srv/ws")],
            ..Default::default()
        });
        let engine = RulePolicyEngine::from_rules(vec![constrained]).unwrap();
        let d = engine.evaluate(&Subject::new("cli", "bob"), "fs.write", &ctx());
        assert!(d.is_allowed());
        assert_eq!(d.constraints().unwrap().path_prefixes[0], PathBuf::from("/srv/ws"));
        assert_eq!(d.rule_id.as_deref(), Some("ws"));
    }

    #[test]
    fn test_cache_hit_gets_fresh_decision_id() {
        let engine =
            RulePolicyEngine::from_rules(vec![rule("a", "*", "fs.read", RuleEffect::Allow)]).unwrap();
        let s = Subject::new("cli", "x");
        let first = engine.evaluate(&s, "fs.read", &ctx());
        let second = engine.evaluate(&s, "fs.read", &ctx());
        assert!(!first.cached);
        assert!(second.cached);
        assert_ne!(first.id, second.id);
        assert_eq!(first.verdict, second.verdict);
    }

    #[test]
    fn test_replace_bumps_version_and_invalidates() {
        let engine =
            RulePolicyEngine::from_rules(vec![rule("a", "*", "fs.read", RuleEffect::Allow)]).unwrap();
        let s = Subject::new("cli", "x");
        let v1 = engine.version();
        assert!(engine.evaluate(&s, "fs.read", &ctx()).is_allowed());

        let v2 = engine
            .replace_rules(vec![rule("b", "*", "fs.read", RuleEffect::Deny)])
            .unwrap();
        assert!(v2 > v1);
        let d = engine.evaluate(&s, "fs.read", &ctx());
        assert!(!d.is_allowed());
        assert!(!d.cached);
        assert_eq!(d.policy_version, v2);
    }

    #[test]
    fn test_failed_replace_keeps_old_rules() {
        let engine =
            RulePolicyEngine::from_rules(vec![rule("a", "*", "fs.read", RuleEffect::Allow)]).unwrap();
        let before = engine.version();
        let bad = rule("b", "", "fs.read", RuleEffect::Allow);
        assert!(engine.replace_rules(vec![bad]).is_err());
        assert_eq!(engine.version(), before);
        assert!(engine
            .evaluate(&Subject::new("cli", "x"), "fs.read", &ctx())
            .is_allowed());
    }

    struct SwappableSource(Mutex<Vec<PolicyRuleConfig>>);

    impl RuleSource for SwappableSource {
        fn name(&self) -> String {
            "test".to_string()
        }
        fn load(&self) -> Result<Vec<PolicyRuleConfig>> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    #[test]
    fn test_reload_reads_sources() {
        let source = Arc::new(SwappableSource(Mutex::new(vec![rule(
            "a",
            "*",
            "net.fetch",
            RuleEffect::Allow,
        )])));

        struct Shared(Arc<SwappableSource>);
        impl RuleSource for Shared {
            fn name(&self) -> String {
                self.0.name()
            }
            fn load(&self) -> Result<Vec<PolicyRuleConfig>> {
                self.0.load()
            }
        }

        let engine = RulePolicyEngine::new(vec![Box::new(Shared(source.clone()))], 16).unwrap();
        let s = Subject::new("telegram", "9");
        assert!(engine.evaluate(&s, "net.fetch", &ctx()).is_allowed());

        *source.0.lock().unwrap() = vec![rule("a", "*", "net.fetch", RuleEffect::Deny)];
        engine.reload().unwrap();
        assert!(!engine.evaluate(&s, "net.fetch", &ctx()).is_allowed());
    }

    #[test]
    fn test_concurrent_reload_never_mixes_sets() {
        // Every set installed either allows both actions or denies both.
        let engine = Arc::new(
            RulePolicyEngine::from_rules(vec![
                rule("r1", "*", "fs.read", RuleEffect::Allow),
                rule("r2", "*", "fs.list", RuleEffect::Allow),
            ])
            .unwrap(),
        );
        let writer = {
            let engine = engine.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    let effect = if i % 2 == 0 { RuleEffect::Deny } else { RuleEffect::Allow };
                    engine
                        .replace_rules(vec![
                            rule("r1", "*", "fs.read", effect),
                            rule("r2", "*", "fs.list", effect),
                        ])
                        .unwrap();
                }
            })
        };
        let s = Subject::new("cli", "x");
        for _ in 0..200 {
            let a = engine.evaluate(&s, "fs.read", &ctx());
            let b = engine.evaluate(&s, "fs.list", &ctx());
            if a.policy_version == b.policy_version {
                assert_eq!(a.is_allowed(), b.is_allowed());
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_describe_in_evaluation_order() {
        let engine = RulePolicyEngine::from_rules(vec![
            rule("broad", "*", "*", RuleEffect::Deny),
            rule("narrow", "cli:alice", "fs.read", RuleEffect::Allow),
        ])
        .unwrap();
        let ids: Vec<String> = engine.describe().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["narrow".to_string(), "broad".to_string()]);
    }

    #[test]
    fn test_racing_reloads_install_increasing_versions() {
        let engine = RulePolicyEngine::from_rules(vec![]).unwrap();
        let start = engine.version();
        let mut versions: Vec<u64> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let engine = &engine;
                    scope.spawn(move || {
                        let rules = vec![rule(&format!("r{}", i), "cli:*", "fs.read", RuleEffect::Allow)];
                        engine.replace_rules(rules).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        versions.sort_unstable();
        assert_eq!(versions, ((start + 1)..=(start + 8)).collect::<Vec<_>>());
        assert_eq!(engine.version(), start + 8);

        let d = engine.evaluate(&Subject::new("cli", "alice"), "fs.read", &ctx());
        assert_eq!(d.policy_version, start + 8);
    }

    #[test]
    fn test_rejected_reload_consumes_no_version() {
        let engine = RulePolicyEngine::from_rules(vec![]).unwrap();
        let before = engine.version();
        // Fails while compiling, after the id check.
        assert!(engine
            .replace_rules(vec![rule("bad", "", "fs.read", RuleEffect::Allow)])
            .is_err());
        let next = engine
            .replace_rules(vec![rule("ok", "cli:*", "fs.read", RuleEffect::Allow)])
            .unwrap();
        assert_eq!(next, before + 1);
    }
}
