use bastion_channels::Channel;
use bastion_core::{CapabilityKind, Config, Error, Paths, Registry, Result};
use bastion_policy::PolicyEngine;
use bastion_providers::{Provider, ProviderRouter, RouterSettings};
use bastion_storage::{build_store, AuditEvent, AuditSink, MemoryBackend, MemoryStore, SessionStore};
use bastion_tools::{RuntimeAdapter, SandboxSettings, Tool, ToolRegistry, ToolSandbox};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::context::ContextBuilder;
use crate::manager::SessionManager;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::session::Budget;

/// One registry per capability kind. Filled during startup, read-only after.
pub struct CapabilityRegistry {
    pub providers: Registry<dyn Provider>,
    pub channels: Registry<dyn Channel>,
    pub tools: Registry<dyn Tool>,
    pub memory: Registry<dyn MemoryBackend>,
    pub runtimes: Registry<dyn RuntimeAdapter>,
    pub policies: Registry<dyn PolicyEngine>,
    plugin_problems: Vec<String>,
}

impl CapabilityRegistry {
    pub fn empty() -> Self {
        Self {
            providers: Registry::new(CapabilityKind::Provider),
            channels: Registry::new(CapabilityKind::Channel),
            tools: Registry::new(CapabilityKind::Tool),
            memory: Registry::new(CapabilityKind::Memory),
            runtimes: Registry::new(CapabilityKind::Runtime),
            policies: Registry::new(CapabilityKind::Policy),
            plugin_problems: Vec::new(),
        }
    }

    /// Every built-in factory plus plugin tools found in the plugins dir.
    pub fn with_builtins(config: &Config, paths: &Paths) -> Result<Self> {
        let mut reg = Self::empty();
        bastion_providers::register_builtin(&mut reg.providers)?;
        bastion_channels::register_builtin(&mut reg.channels)?;
        bastion_tools::register_builtin(&mut reg.tools, &config.tools)?;
        bastion_tools::runtime::register_builtin(&mut reg.runtimes, workspace_dir(config, paths))?;
        bastion_storage::memory::register_builtin(&mut reg.memory, paths.clone())?;
        bastion_policy::register_builtin(&mut reg.policies, paths.clone())?;

        let plugins_dir = config
            .tools
            .plugins_dir
            .as_deref()
            .map(|d| paths.resolve(d))
            .unwrap_or_else(|| paths.plugins_dir());
        if plugins_dir.is_dir() {
            reg.plugin_problems = bastion_tools::plugin::register_plugins(&mut reg.tools, &plugins_dir);
        }
        Ok(reg)
    }
}

pub fn workspace_dir(config: &Config, paths: &Paths) -> PathBuf {
    config
        .tools
        .workspace
        .as_deref()
        .map(|w| paths.resolve(w))
        .unwrap_or_else(|| paths.workspace())
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilityFailure {
    pub kind: CapabilityKind,
    pub name: String,
    pub reason: String,
}

/// What came up and what did not.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartupReport {
    pub loaded: Vec<(CapabilityKind, String)>,
    pub failures: Vec<CapabilityFailure>,
}

impl StartupReport {
    fn loaded(&mut self, kind: CapabilityKind, name: &str) {
        self.loaded.push((kind, name.to_string()));
    }

    fn failed(&mut self, kind: CapabilityKind, name: &str, reason: impl ToString) {
        let reason = reason.to_string();
        error!(kind = %kind, name = %name, reason = %reason, "Capability failed to initialize");
        self.failures.push(CapabilityFailure {
            kind,
            name: name.to_string(),
            reason,
        });
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn loaded_names(&self, kind: CapabilityKind) -> Vec<String> {
        self.loaded
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, n)| n.clone())
            .collect()
    }
}

/// The assembled system.
pub struct AgentRuntime {
    pub policy: Arc<dyn PolicyEngine>,
    pub router: Arc<ProviderRouter>,
    pub sandbox: Arc<ToolSandbox>,
    pub memory: Option<MemoryStore>,
    pub sessions: Arc<SessionManager>,
    pub channels: Vec<(String, Arc<dyn Channel>)>,
    pub audit: Arc<dyn AuditSink>,
}

impl AgentRuntime {
    /// Re-read policy rule sources. The outcome is audited either way and the
    /// previous rules stay in force on failure.
    pub fn reload_policy(&self) -> Result<u64> {
        let outcome = self.policy.reload();
        let event = AuditEvent::PolicyReload {
            version: match &outcome {
                Ok(v) => *v,
                Err(_) => self.policy.version(),
            },
            error: outcome.as_ref().err().map(|e| e.to_string()),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        if let Err(e) = self.audit.record(&event) {
            error!(error = %e, "Failed to audit policy reload");
        }
        match &outcome {
            Ok(v) => info!(version = v, "Policy reloaded"),
            Err(e) => error!(error = %e, "Policy reload failed; keeping previous rules"),
        }
        outcome
    }
}

/// Resolve every configured capability and wire the system together.
///
/// Individual failures are collected in the report and the rest keeps
/// working. Two failures stop startup: no policy engine, and no default
/// runtime adapter. Without either, nothing could run under access control.
pub fn build_runtime(
    config: &Config,
    paths: &Paths,
    registry: &CapabilityRegistry,
    audit: Arc<dyn AuditSink>,
) -> Result<(AgentRuntime, StartupReport)> {
    let mut report = StartupReport::default();
    for problem in &registry.plugin_problems {
        report.failed(CapabilityKind::Tool, "plugin", problem);
    }

    let policy_params = serde_json::to_value(&config.policy)?;
    let policy = registry
        .policies
        .resolve(&config.policy.engine, &policy_params)
        .map_err(|e| Error::Config(format!("refusing to start without a policy engine: {}", e)))?;
    report.loaded(CapabilityKind::Policy, &config.policy.engine);
    info!(engine = %config.policy.engine, version = policy.version(), "Policy engine ready");

    let runtimes = resolve_runtimes(config, registry, &mut report);
    if !runtimes.contains_key(&config.sandbox.default_runtime) {
        return Err(Error::Config(format!(
            "refusing to start: default runtime adapter '{}' is unavailable",
            config.sandbox.default_runtime
        )));
    }
    for (tool, runtime) in &config.sandbox.tool_runtimes {
        if !runtimes.contains_key(runtime) {
            warn!(tool = %tool, runtime = %runtime, "Tool is pinned to an unavailable runtime; its calls will fail");
        }
    }

    let (tools, tool_errors) = ToolRegistry::from_capabilities(&registry.tools, &config.tools.enabled);
    for e in tool_errors {
        let name = match &e {
            bastion_core::RegistryError::UnknownKey { key, .. }
            | bastion_core::RegistryError::ConstructionError { key, .. }
            | bastion_core::RegistryError::DuplicateKey { key, .. } => key.clone(),
        };
        report.failed(CapabilityKind::Tool, &name, e);
    }
    for name in tools.tool_names() {
        report.loaded(CapabilityKind::Tool, &name);
    }

    let workspace = workspace_dir(config, paths);
    let sandbox = Arc::new(ToolSandbox::new(
        tools,
        runtimes,
        policy.clone(),
        audit.clone(),
        SandboxSettings::from_config(&config.sandbox, workspace),
    ));

    let mut router = ProviderRouter::new(RouterSettings::from(&config.router));
    for (name, entry) in &config.providers {
        if !entry.enabled {
            continue;
        }
        match registry.providers.resolve(&entry.kind, &entry.params) {
            Ok(provider) => {
                router.add_provider(name, provider);
                report.loaded(CapabilityKind::Provider, name);
            }
            Err(e) => report.failed(CapabilityKind::Provider, name, e),
        }
    }
    router.set_default_order(config.provider_order());
    if router.is_empty() {
        warn!("No provider is available; every turn will answer with an apology");
    }
    let router = Arc::new(router);
    forward_circuit_events(router.subscribe(), audit.clone());

    let memory = if config.memory.enabled {
        match build_store(&registry.memory, &config.memory) {
            Ok(store) => {
                report.loaded(CapabilityKind::Memory, &config.memory.backend);
                Some(store)
            }
            Err(e) => {
                report.failed(CapabilityKind::Memory, &config.memory.backend, format!("{:#}", e));
                None
            }
        }
    } else {
        None
    };

    let mut channels = Vec::new();
    for (name, entry) in &config.channels.entries {
        if !entry.enabled {
            continue;
        }
        match registry.channels.resolve(&entry.kind, &entry.params) {
            Ok(channel) => {
                channels.push((name.clone(), channel));
                report.loaded(CapabilityKind::Channel, name);
            }
            Err(e) => report.failed(CapabilityKind::Channel, name, e),
        }
    }

    let defaults = &config.agents.defaults;
    let orchestrator = Arc::new(Orchestrator::new(
        router.clone(),
        sandbox.clone(),
        memory.clone(),
        ContextBuilder::from_defaults(defaults),
        OrchestratorSettings::new(defaults, &config.memory, Vec::new()),
    ));
    let sessions = Arc::new(SessionManager::new(
        orchestrator,
        Some(SessionStore::new(paths.clone())),
        Budget::from_defaults(defaults),
        Duration::from_secs(defaults.idle_timeout_secs),
    ));

    info!(
        loaded = report.loaded.len(),
        failed = report.failures.len(),
        "Runtime assembled"
    );
    Ok((
        AgentRuntime {
            policy,
            router,
            sandbox,
            memory,
            sessions,
            channels,
            audit,
        },
        report,
    ))
}

/// Named runtime entries from config, then every registered adapter under its
/// own key when not shadowed.
fn resolve_runtimes(
    config: &Config,
    registry: &CapabilityRegistry,
    report: &mut StartupReport,
) -> HashMap<String, Arc<dyn RuntimeAdapter>> {
    let mut runtimes: HashMap<String, Arc<dyn RuntimeAdapter>> = HashMap::new();
    for (name, entry) in &config.sandbox.runtimes {
        if !entry.enabled {
            continue;
        }
        match registry.runtimes.resolve(&entry.kind, &entry.params) {
            Ok(runtime) => {
                runtimes.insert(name.clone(), runtime);
                report.loaded(CapabilityKind::Runtime, name);
            }
            Err(e) => report.failed(CapabilityKind::Runtime, name, e),
        }
    }
    for key in registry.runtimes.keys() {
        if runtimes.contains_key(&key) || config.sandbox.runtimes.contains_key(&key) {
            continue;
        }
        match registry.runtimes.resolve(&key, &Value::Null) {
            Ok(runtime) => {
                runtimes.insert(key.clone(), runtime);
                report.loaded(CapabilityKind::Runtime, &key);
            }
            Err(e) => report.failed(CapabilityKind::Runtime, &key, e),
        }
    }
    runtimes
}

/// Record circuit transitions in the audit log. Needs a tokio runtime; when
/// there is none the transitions are only logged by the router.
fn forward_circuit_events(
    mut events: broadcast::Receiver<bastion_providers::CircuitTransition>,
    audit: Arc<dyn AuditSink>,
) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!("No async runtime; circuit transitions will not be audited");
        return;
    };
    handle.spawn(async move {
        loop {
            match events.recv().await {
                Ok(t) => {
                    let event = AuditEvent::CircuitTransition {
                        provider: t.provider,
                        from: t.from.as_str().to_string(),
                        to: t.to.as_str().to_string(),
                        consecutive_failures: t.consecutive_failures,
                        timestamp_ms: t.at_ms,
                    };
                    if let Err(e) = audit.record(&event) {
                        error!(error = %e, "Failed to audit circuit transition");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "Circuit audit fell behind")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::test_support::DownProvider;
    use bastion_core::config::{CapabilityEntry, PolicyRuleConfig, RuleEffect};
    use bastion_core::types::ProviderRequest;
    use bastion_core::{InboundMessage, RegistryError};
    use bastion_storage::MemoryAuditSink;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn config() -> Config {
        let mut cfg = Config::default();
        cfg.providers = BTreeMap::new();
        cfg.channels.entries = BTreeMap::new();
        cfg.policy.rules = vec![PolicyRuleConfig {
            id: Some("reads".to_string()),
            subject: "cli:*".to_string(),
            action: "fs.read".to_string(),
            effect: RuleEffect::Allow,
            constraints: None,
        }];
        cfg
    }

    fn build(cfg: &Config, dir: &TempDir) -> Result<(AgentRuntime, StartupReport)> {
        let paths = Paths::with_base(dir.path().to_path_buf());
        let registry = CapabilityRegistry::with_builtins(cfg, &paths)?;
        build_runtime(cfg, &paths, &registry, Arc::new(MemoryAuditSink::new()))
    }

    #[tokio::test]
    async fn test_builds_with_builtins() {
        let dir = TempDir::new().unwrap();
        let (runtime, report) = build(&config(), &dir).unwrap();
        assert!(report.is_clean(), "{:?}", report.failures);
        assert!(runtime.sandbox.tools().get("exec").is_some());
        assert!(runtime.sandbox.runtime_names().contains(&"native".to_string()));
        assert!(runtime.memory.is_some());
        assert_eq!(report.loaded_names(CapabilityKind::Policy), vec!["rules".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_policy_engine_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config();
        cfg.policy.engine = "opa".to_string();
        let err = build(&cfg, &dir).err().unwrap();
        assert!(err.to_string().contains("refusing to start"));
    }

    #[tokio::test]
    async fn test_missing_default_runtime_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config();
        cfg.sandbox.default_runtime = "firecracker".to_string();
        let err = build(&cfg, &dir).err().unwrap();
        assert!(err.to_string().contains("firecracker"));
    }

    #[tokio::test]
    async fn test_failed_capabilities_are_reported_not_fatal() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config();
        cfg.providers.insert("ghost".to_string(), CapabilityEntry::new("no-such-provider", Value::Null));
        cfg.memory.eviction = "random".to_string();
        cfg.tools.enabled = vec!["read_file".to_string(), "teleport".to_string()];

        let (runtime, report) = build(&cfg, &dir).unwrap();
        let failed: Vec<(CapabilityKind, String)> =
            report.failures.iter().map(|f| (f.kind, f.name.clone())).collect();
        assert!(failed.contains(&(CapabilityKind::Provider, "ghost".to_string())));
        assert!(failed.contains(&(CapabilityKind::Memory, "in_memory".to_string())));
        assert!(failed.contains(&(CapabilityKind::Tool, "teleport".to_string())));
        assert!(runtime.memory.is_none());
        assert_eq!(runtime.sandbox.tools().tool_names(), vec!["read_file".to_string()]);

        // Still answers, with the apology.
        let reply = runtime.sessions.handle(&InboundMessage::cli("hello")).await.unwrap();
        assert!(reply.content.contains("could not reach"));
    }

    #[tokio::test]
    async fn test_failing_tool_factory_is_isolated() {
        let dir = TempDir::new().unwrap();
        let cfg = config();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let mut registry = CapabilityRegistry::with_builtins(&cfg, &paths).unwrap();
        registry
            .tools
            .register_override("web_fetch", |_: &Value| anyhow::bail!("no network stack"));
        let (runtime, report) = build_runtime(&cfg, &paths, &registry, Arc::new(MemoryAuditSink::new())).unwrap();
        assert!(runtime.sandbox.tools().get("web_fetch").is_none());
        assert!(runtime.sandbox.tools().get("read_file").is_some());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].name, "web_fetch");
    }

    #[tokio::test]
    async fn test_circuit_transitions_are_audited() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config();
        cfg.router.failure_threshold = 1;
        cfg.router.max_attempts = 1;
        cfg.providers.insert("down".to_string(), CapabilityEntry::new("down", json!({})));
        let paths = Paths::with_base(dir.path().to_path_buf());
        let mut registry = CapabilityRegistry::with_builtins(&cfg, &paths).unwrap();
        registry
            .providers
            .register("down", |_: &Value| Ok(Arc::new(DownProvider) as Arc<dyn Provider>))
            .unwrap();
        let audit = Arc::new(MemoryAuditSink::new());
        let (runtime, _) = build_runtime(&cfg, &paths, &registry, audit.clone()).unwrap();

        let _ = runtime
            .router
            .send(&ProviderRequest::default(), &[], &CancellationToken::new())
            .await;
        for _ in 0..100 {
            if !audit.events().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let events = audit.events();
        assert!(events.iter().any(|e| matches!(
            e,
            AuditEvent::CircuitTransition { provider, to, .. } if provider == "down" && to == "open"
        )));
    }

    #[tokio::test]
    async fn test_reload_policy_is_audited() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let cfg = config();
        let registry = CapabilityRegistry::with_builtins(&cfg, &paths).unwrap();
        let audit = Arc::new(MemoryAuditSink::new());
        let (runtime, _) = build_runtime(&cfg, &paths, &registry, audit.clone()).unwrap();
        runtime.reload_policy().unwrap();
        assert!(audit
            .events()
            .iter()
            .any(|e| matches!(e, AuditEvent::PolicyReload { error: None, .. })));
    }

    #[test]
    fn test_duplicate_registration_surfaces() {
        let mut reg = CapabilityRegistry::empty();
        bastion_channels::register_builtin(&mut reg.channels).unwrap();
        let err = bastion_channels::register_builtin(&mut reg.channels).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateKey { .. }));
    }
}
