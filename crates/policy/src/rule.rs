use bastion_core::config::{PolicyRuleConfig, RuleEffect};
use bastion_core::types::Constraints;
use bastion_core::Result;

use crate::pattern::Pattern;

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Allow,
    Deny,
    AllowWithConstraints(Constraints),
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub subject: Pattern,
    pub action: Pattern,
    pub effect: Effect,
    /// Position in the source list, used to break specificity ties.
    pub declared_at: usize,
}

impl Rule {
    pub fn from_config(cfg: &PolicyRuleConfig, index: usize) -> Result<Self> {
        cfg.validate(index)?;
        let effect = match cfg.effect {
            RuleEffect::Allow => Effect::Allow,
            RuleEffect::Deny => Effect::Deny,
            RuleEffect::AllowWithConstraints => {
                Effect::AllowWithConstraints(cfg.constraints.clone().unwrap_or_default())
            }
        };
        Ok(Self {
            id: cfg.id.clone().unwrap_or_else(|| format!("rule-{}", index)),
            subject: Pattern::new(&cfg.subject),
            action: Pattern::new(&cfg.action),
            effect,
            declared_at: index,
        })
    }

    pub fn matches(&self, subject: &str, action: &str) -> bool {
        self.subject.matches(subject) && self.action.matches(action)
    }
}

/// An immutable, evaluation-ordered rule list. Replaced wholesale on reload.
#[derive(Debug)]
pub struct RuleSet {
    version: u64,
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Orders rules by subject specificity (most specific first), keeping
    /// declaration order among equally specific subjects.
    pub fn compile(mut rules: Vec<Rule>, version: u64) -> Self {
        rules.sort_by(|a, b| {
            b.subject
                .specificity()
                .cmp(&a.subject.specificity())
                .then(a.declared_at.cmp(&b.declared_at))
        });
        Self { version, rules }
    }

    pub fn from_configs(configs: &[PolicyRuleConfig], version: u64) -> Result<Self> {
        let rules = configs
            .iter()
            .enumerate()
            .map(|(i, c)| Rule::from_config(c, i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::compile(rules, version))
    }

    pub fn empty(version: u64) -> Self {
        Self {
            version,
            rules: Vec::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn first_match(&self, subject: &str, action: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.matches(subject, action))
    }
}
