use bastion_core::types::Constraints;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
    AllowWithConstraints { constraints: Constraints },
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Deny => "deny",
            Verdict::AllowWithConstraints { .. } => "allow_with_constraints",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    RuleAllowed,
    RuleDenied,
    RuleConstrained,
    /// Nothing matched; the engine fails closed.
    NoMatchingRule,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::RuleAllowed => "rule_allowed",
            ReasonCode::RuleDenied => "rule_denied",
            ReasonCode::RuleConstrained => "rule_constrained",
            ReasonCode::NoMatchingRule => "no_matching_rule",
        }
    }
}

/// Informational context recorded with a decision. It never changes the
/// verdict, so verdicts stay cacheable per (subject, action, version).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub id: String,
    pub subject: String,
    pub action: String,
    #[serde(flatten)]
    pub verdict: Verdict,
    pub reason: ReasonCode,
    pub rule_id: Option<String>,
    pub policy_version: u64,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub context: PolicyContext,
    pub decided_at_ms: i64,
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self.verdict, Verdict::Deny)
    }

    pub fn constraints(&self) -> Option<&Constraints> {
        match &self.verdict {
            Verdict::AllowWithConstraints { constraints } => Some(constraints),
            _ => None,
        }
    }

    /// Short human explanation, used in denial messages and logs.
    pub fn explain(&self) -> String {
        match &self.rule_id {
            Some(rule) => format!(
                "{} '{}' for {} by rule '{}' (policy v{})",
                self.verdict.as_str(),
                self.action,
                self.subject,
                rule,
                self.policy_version
            ),
            None => format!(
                "{} '{}' for {}: no matching rule (policy v{})",
                self.verdict.as_str(),
                self.action,
                self.subject,
                self.policy_version
            ),
        }
    }
}
