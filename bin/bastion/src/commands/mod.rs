pub mod agent;
pub mod audit_cmd;
pub mod completions_cmd;
pub mod config_cmd;
pub mod gateway;
pub mod init;
pub mod policy_cmd;
pub mod status;
pub mod tools_cmd;

use bastion_agent::{build_runtime, AgentRuntime, CapabilityRegistry, StartupReport};
use bastion_core::{Config, Paths};
use bastion_storage::{AuditLogger, AuditSink};
use std::sync::Arc;
use tracing::warn;

/// Load the config file, falling back to defaults when none exists yet.
pub fn load_config(paths: &Paths) -> anyhow::Result<Config> {
    let config = Config::load_or_default(paths)?;
    if !paths.config_file().exists() {
        warn!(
            path = %paths.config_file().display(),
            "No config file found, using defaults. Run `bastion init` to create one."
        );
    }
    Ok(config)
}

/// Resolve every capability against the registry and assemble the runtime,
/// auditing to daily files under the base directory.
pub fn start_runtime(paths: &Paths, config: &Config) -> anyhow::Result<(AgentRuntime, StartupReport)> {
    paths.ensure_dirs()?;
    let registry = CapabilityRegistry::with_builtins(config, paths)?;
    let audit: Arc<dyn AuditSink> = Arc::new(AuditLogger::new(paths.clone()));
    let (runtime, report) = build_runtime(config, paths, &registry, audit)?;
    for failure in &report.failures {
        warn!(kind = %failure.kind, name = %failure.name, "Running without {}: {}", failure.kind, failure.reason);
    }
    Ok((runtime, report))
}

/// Split a `channel:user` subject. A bare name is taken as a CLI user.
pub fn parse_subject(raw: &str) -> bastion_core::Subject {
    match raw.split_once(':') {
        Some((channel, user)) => bastion_core::Subject::new(channel, user),
        None => bastion_core::Subject::new("cli", raw),
    }
}
