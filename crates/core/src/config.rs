use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::error::{Error, Result};
use crate::paths::Paths;
use crate::types::Constraints;

/// Construction parameters for one capability instance: the factory key plus
/// free-form params handed to that factory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub params: Value,
}

impl CapabilityEntry {
    pub fn new(kind: &str, params: Value) -> Self {
        Self {
            kind: kind.to_string(),
            enabled: true,
            params,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    /// Default provider preference order. Empty means every configured
    /// provider in key order.
    #[serde(default)]
    pub preference: Vec<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8000
}

fn default_attempt_timeout_secs() -> u64 {
    60
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    30
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            preference: Vec::new(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefaults {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Tool calls allowed while answering one inbound message.
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: u32,
    /// Wall-clock budget for answering one inbound message.
    #[serde(default = "default_max_wall_clock_secs")]
    pub max_wall_clock_secs: u64,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u32,
    #[serde(default = "default_recent_turns")]
    pub recent_turns: usize,
    #[serde(default = "default_recall_k")]
    pub recall_k: usize,
    #[serde(default = "default_memory_timeout_ms")]
    pub memory_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub remember_turns: bool,
}

fn default_system_prompt() -> String {
    "You are a careful assistant. Use the provided tools when they help, and explain failures plainly.".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tool_calls() -> u32 {
    20
}

fn default_max_wall_clock_secs() -> u64 {
    300
}

fn default_max_context_tokens() -> u32 {
    32000
}

fn default_recent_turns() -> usize {
    20
}

fn default_recall_k() -> usize {
    4
}

fn default_memory_timeout_ms() -> u64 {
    2000
}

fn default_idle_timeout_secs() -> u64 {
    1800
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            model: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_tool_calls: default_max_tool_calls(),
            max_wall_clock_secs: default_max_wall_clock_secs(),
            max_context_tokens: default_max_context_tokens(),
            recent_turns: default_recent_turns(),
            recall_k: default_recall_k(),
            memory_timeout_ms: default_memory_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            remember_turns: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    #[serde(default)]
    pub defaults: AgentDefaults,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleEffect {
    Allow,
    Deny,
    AllowWithConstraints,
}

/// One policy rule as written in configuration. Unknown fields are rejected so
/// a typo can never silently widen access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicyRuleConfig {
    #[serde(default)]
    pub id: Option<String>,
    pub subject: String,
    pub action: String,
    pub effect: RuleEffect,
    #[serde(default)]
    pub constraints: Option<Constraints>,
}

impl PolicyRuleConfig {
    pub fn validate(&self, index: usize) -> Result<()> {
        let label = self
            .id
            .clone()
            .unwrap_or_else(|| format!("#{}", index));
        if self.subject.trim().is_empty() {
            return Err(Error::Config(format!("policy rule {}: empty subject pattern", label)));
        }
        if self.action.trim().is_empty() {
            return Err(Error::Config(format!("policy rule {}: empty action pattern", label)));
        }
        match (self.effect, &self.constraints) {
            (RuleEffect::AllowWithConstraints, None) => {
                return Err(Error::Config(format!(
                    "policy rule {}: allow_with_constraints requires a constraints block",
                    label
                )));
            }
            (RuleEffect::Allow | RuleEffect::Deny, Some(_)) => {
                return Err(Error::Config(format!(
                    "policy rule {}: constraints are only valid with allow_with_constraints",
                    label
                )));
            }
            _ => {}
        }
        if let Some(c) = &self.constraints {
            for prefix in &c.path_prefixes {
                if !prefix.is_absolute() {
                    return Err(Error::Config(format!(
                        "policy rule {}: path prefix '{}' must be absolute",
                        label,
                        prefix.display()
                    )));
                }
            }
            if c.timeout_secs == Some(0) {
                return Err(Error::Config(format!("policy rule {}: timeoutSecs must be > 0", label)));
            }
            if c.max_output_bytes == Some(0) {
                return Err(Error::Config(format!(
                    "policy rule {}: maxOutputBytes must be > 0",
                    label
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    /// Registry key of the policy engine.
    #[serde(default = "default_policy_engine")]
    pub engine: String,
    #[serde(default)]
    pub rules: Vec<PolicyRuleConfig>,
    /// Extra rules appended after the inline ones (JSON, YAML or TOML).
    #[serde(default)]
    pub rules_file: Option<String>,
    #[serde(default = "default_policy_cache_size")]
    pub cache_size: usize,
}

fn default_policy_engine() -> String {
    "rules".to_string()
}

fn default_policy_cache_size() -> usize {
    4096
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            engine: default_policy_engine(),
            rules: Vec::new(),
            rules_file: None,
            cache_size: default_policy_cache_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsConfig {
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default)]
    pub memory_mb: Option<u64>,
}

fn default_tool_timeout_secs() -> u64 {
    60
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            memory_mb: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    #[serde(default = "default_runtime")]
    pub default_runtime: String,
    /// Runtime adapter instances by name.
    #[serde(default = "default_runtimes")]
    pub runtimes: BTreeMap<String, CapabilityEntry>,
    /// Per-tool runtime overrides (tool name -> runtime name).
    #[serde(default)]
    pub tool_runtimes: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: LimitsConfig,
}

fn default_runtime() -> String {
    "native".to_string()
}

fn default_runtimes() -> BTreeMap<String, CapabilityEntry> {
    let mut runtimes = BTreeMap::new();
    runtimes.insert(
        "native".to_string(),
        CapabilityEntry::new("native", Value::Null),
    );
    runtimes
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_runtime: default_runtime(),
            runtimes: default_runtimes(),
            tool_runtimes: BTreeMap::new(),
            limits: LimitsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedderConfig {
    #[serde(rename = "type", default = "default_embedder")]
    pub kind: String,
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    #[serde(default)]
    pub params: Value,
}

fn default_embedder() -> String {
    "hashing".to_string()
}

fn default_dimensions() -> usize {
    256
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            kind: default_embedder(),
            dimensions: default_dimensions(),
            params: Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_memory_backend")]
    pub backend: String,
    #[serde(default = "default_memory_capacity")]
    pub capacity: usize,
    /// lru | lowest_importance | oldest
    #[serde(default = "default_eviction")]
    pub eviction: String,
    /// Evict instead of failing when the store is full.
    #[serde(default = "default_true")]
    pub allow_eviction: bool,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub embedder: EmbedderConfig,
}

fn default_memory_backend() -> String {
    "in_memory".to_string()
}

fn default_memory_capacity() -> usize {
    10_000
}

fn default_eviction() -> String {
    "lru".to_string()
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: default_memory_backend(),
            capacity: default_memory_capacity(),
            eviction: default_eviction(),
            allow_eviction: true,
            path: None,
            embedder: EmbedderConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub per_second: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    /// Channel instances by name.
    #[serde(default = "default_channels")]
    pub entries: BTreeMap<String, CapabilityEntry>,
    #[serde(default)]
    pub rate_limits: BTreeMap<String, RateLimitConfig>,
    /// Depth of the inbound and outbound queues between channels and agents.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_channels() -> BTreeMap<String, CapabilityEntry> {
    let mut channels = BTreeMap::new();
    channels.insert("cli".to_string(), CapabilityEntry::new("cli", Value::Null));
    channels
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            entries: default_channels(),
            rate_limits: BTreeMap::new(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecToolConfig {
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_shell() -> String {
    "sh".to_string()
}

impl Default for ExecToolConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchToolConfig {
    #[serde(default = "default_fetch_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_fetch_max_bytes() -> usize {
    1024 * 1024
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

impl Default for FetchToolConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_fetch_max_bytes(),
            timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolsConfig {
    /// Built-in tools to enable. Empty enables all of them.
    #[serde(default)]
    pub enabled: Vec<String>,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub plugins_dir: Option<String>,
    #[serde(default)]
    pub exec: ExecToolConfig,
    #[serde(default)]
    pub fetch: FetchToolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_providers")]
    pub providers: BTreeMap<String, CapabilityEntry>,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

fn default_providers() -> BTreeMap<String, CapabilityEntry> {
    let mut providers = BTreeMap::new();
    providers.insert(
        "openai".to_string(),
        CapabilityEntry::new(
            "openai",
            serde_json::json!({ "apiKeyEnv": "OPENAI_API_KEY", "model": "gpt-4o-mini" }),
        ),
    );
    providers
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            router: RouterConfig::default(),
            agents: AgentsConfig::default(),
            policy: PolicyConfig::default(),
            sandbox: SandboxConfig::default(),
            memory: MemoryConfig::default(),
            channels: ChannelsConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate. The format follows the file extension:
    /// `.json` (default), `.json5`, `.yaml`/`.yml`, `.toml`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("json")
            .to_ascii_lowercase();
        let config: Config = match ext.as_str() {
            "json5" => json5::from_str(&content)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?,
            "yaml" | "yml" => serde_yaml::from_str(&content)?,
            "toml" => toml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject malformed security-relevant settings instead of guessing.
    pub fn validate(&self) -> Result<()> {
        let mut seen_ids = HashSet::new();
        for (i, rule) in self.policy.rules.iter().enumerate() {
            rule.validate(i)?;
            if let Some(id) = &rule.id {
                if !seen_ids.insert(id.clone()) {
                    return Err(Error::Config(format!("duplicate policy rule id '{}'", id)));
                }
            }
        }
        if self.policy.engine.trim().is_empty() {
            return Err(Error::Config("policy.engine must name a policy engine".to_string()));
        }

        for (name, entry) in &self.providers {
            if entry.kind.trim().is_empty() {
                return Err(Error::Config(format!("provider '{}' has an empty type", name)));
            }
        }
        for name in &self.router.preference {
            if !self.providers.contains_key(name) {
                return Err(Error::Config(format!(
                    "router.preference names unknown provider '{}'",
                    name
                )));
            }
        }
        if self.router.max_attempts == 0 {
            return Err(Error::Config("router.maxAttempts must be >= 1".to_string()));
        }
        if self.router.failure_threshold == 0 {
            return Err(Error::Config("router.failureThreshold must be >= 1".to_string()));
        }
        if self.router.attempt_timeout_secs == 0 {
            return Err(Error::Config("router.attemptTimeoutSecs must be > 0".to_string()));
        }

        if self.sandbox.limits.timeout_secs == 0 {
            return Err(Error::Config("sandbox.limits.timeoutSecs must be > 0".to_string()));
        }
        if self.sandbox.limits.max_output_bytes == 0 {
            return Err(Error::Config("sandbox.limits.maxOutputBytes must be > 0".to_string()));
        }
        if !self.sandbox.runtimes.contains_key(&self.sandbox.default_runtime) {
            return Err(Error::Config(format!(
                "sandbox.defaultRuntime '{}' is not defined in sandbox.runtimes",
                self.sandbox.default_runtime
            )));
        }
        for (tool, runtime) in &self.sandbox.tool_runtimes {
            if !self.sandbox.runtimes.contains_key(runtime) {
                return Err(Error::Config(format!(
                    "sandbox.toolRuntimes.{} names unknown runtime '{}'",
                    tool, runtime
                )));
            }
        }

        if self.channels.queue_capacity == 0 {
            return Err(Error::Config("channels.queueCapacity must be >= 1".to_string()));
        }

        if self.agents.defaults.max_wall_clock_secs == 0 {
            return Err(Error::Config(
                "agents.defaults.maxWallClockSecs must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Default provider order for the router.
    pub fn provider_order(&self) -> Vec<String> {
        if self.router.preference.is_empty() {
            self.providers
                .iter()
                .filter(|(_, e)| e.enabled)
                .map(|(k, _)| k.clone())
                .collect()
        } else {
            self.router.preference.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_is_valid_and_fail_closed() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert!(cfg.policy.rules.is_empty());
        assert_eq!(cfg.sandbox.default_runtime, "native");
    }

    #[test]
    fn test_unknown_effect_rejected_at_parse() {
        let raw = r#"{ "policy": { "rules": [
            { "subject": "*", "action": "*", "effect": "maybe" }
        ] } }"#;
        assert!(serde_json::from_str::<Config>(raw).is_err());
    }

    #[test]
    fn test_unknown_rule_field_rejected() {
        let raw = r#"{ "policy": { "rules": [
            { "subject": "*", "action": "*", "effect": "allow", "alow": true }
        ] } }"#;
        assert!(serde_json::from_str::<Config>(raw).is_err());
    }

    #[test]
    fn test_constraints_required_for_constrained_allow() {
        let raw = r#"{ "policy": { "rules": [
            { "subject": "cli:*", "action": "fs.*", "effect": "allow_with_constraints" }
        ] } }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("requires a constraints block"));
    }

    #[test]
    fn test_relative_prefix_rejected() {
        let raw = r#"{ "policy": { "rules": [
            { "subject": "cli:*", "action": "fs.*", "effect": "allow_with_constraints",
              "constraints": { "pathPrefixes": ["data"] } }
        ] } }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert!(cfg.validate().unwrap_err().to_string().contains("must be absolute"));
    }

    #[test]
    fn test_duplicate_rule_ids_rejected() {
        let raw = r#"{ "policy": { "rules": [
            { "id": "a", "subject": "*", "action": "fs.read", "effect": "allow" },
            { "id": "a", "subject": "*", "action": "fs.list", "effect": "allow" }
        ] } }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let cfg: Config = serde_json::from_str(r#"{ "channels": { "queueCapacity": 0 } }"#).unwrap();
        assert!(cfg.validate().unwrap_err().to_string().contains("queueCapacity"));
        assert_eq!(Config::default().channels.queue_capacity, 256);
    }

    #[test]
    fn test_unknown_router_preference_rejected() {
        let mut cfg = Config::default();
        cfg.router.preference = vec!["missing".to_string()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_by_extension() {
        let dir = TempDir::new().unwrap();
        let yaml = dir.path().join("config.yaml");
        std::fs::write(
            &yaml,
            "router:\n  maxAttempts: 2\npolicy:\n  rules:\n    - subject: \"cli:*\"\n      action: \"fs.read\"\n      effect: allow\n",
        )
        .unwrap();
        let cfg = Config::load(&yaml).unwrap();
        assert_eq!(cfg.router.max_attempts, 2);
        assert_eq!(cfg.policy.rules.len(), 1);

        let toml_path = dir.path().join("config.toml");
        std::fs::write(
            &toml_path,
            "[router]\nfailureThreshold = 7\n\n[[policy.rules]]\nsubject = \"*\"\naction = \"*\"\neffect = \"deny\"\n",
        )
        .unwrap();
        let cfg = Config::load(&toml_path).unwrap();
        assert_eq!(cfg.router.failure_threshold, 7);
        assert_eq!(cfg.policy.rules[0].effect, RuleEffect::Deny);

        let json5_path = dir.path().join("config.json5");
        std::fs::write(&json5_path, "{ // comment\n router: { cooldownSecs: 9 } }").unwrap();
        assert_eq!(Config::load(&json5_path).unwrap().router.cooldown_secs, 9);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let cfg = Config::default();
        cfg.save(&path).unwrap();
        let back = Config::load(&path).unwrap();
        assert_eq!(back.providers.len(), cfg.providers.len());
    }

    #[test]
    fn test_provider_order_defaults_to_keys() {
        let mut cfg = Config::default();
        cfg.providers
            .insert("backup".to_string(), CapabilityEntry::new("openai", Value::Null));
        assert_eq!(cfg.provider_order(), vec!["backup".to_string(), "openai".to_string()]);
    }
}
