use bastion_core::config::SandboxConfig;
use bastion_core::types::{Constraints, ToolInvocation, ToolResult};
use bastion_core::{Subject, ToolError, ToolErrorKind};
use bastion_policy::{PolicyContext, PolicyDecision, PolicyEngine};
use bastion_storage::{AuditEvent, AuditSink};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::runtime::{ExecutionLimits, RuntimeAdapter};
use crate::{safe_truncate, schema, Tool, ToolContext, ToolRegistry};

/// How long a cancelled tool gets to tear down its processes before the task is aborted.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub default_runtime: String,
    pub tool_runtimes: BTreeMap<String, String>,
    pub limits: ExecutionLimits,
    pub workspace: PathBuf,
}

impl SandboxSettings {
    pub fn from_config(cfg: &SandboxConfig, workspace: PathBuf) -> Self {
        Self {
            default_runtime: cfg.default_runtime.clone(),
            tool_runtimes: cfg.tool_runtimes.clone(),
            limits: ExecutionLimits::from_config(&cfg.limits),
            workspace,
        }
    }
}

/// Mediates every tool invocation: lookup, validation, policy, execution
/// under limits, classification. `invoke` always produces a `ToolResult`.
pub struct ToolSandbox {
    tools: ToolRegistry,
    runtimes: HashMap<String, Arc<dyn RuntimeAdapter>>,
    policy: Arc<dyn PolicyEngine>,
    audit: Arc<dyn AuditSink>,
    settings: SandboxSettings,
}

impl ToolSandbox {
    pub fn new(
        tools: ToolRegistry,
        runtimes: HashMap<String, Arc<dyn RuntimeAdapter>>,
        policy: Arc<dyn PolicyEngine>,
        audit: Arc<dyn AuditSink>,
        settings: SandboxSettings,
    ) -> Self {
        Self {
            tools,
            runtimes,
            policy,
            audit,
            settings,
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn policy(&self) -> &Arc<dyn PolicyEngine> {
        &self.policy
    }

    pub fn runtime_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runtimes.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn invoke(
        &self,
        invocation: &ToolInvocation,
        subject: &Subject,
        session_key: Option<&str>,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let Some(tool) = self.tools.get(&invocation.name) else {
            warn!(tool = %invocation.name, subject = %subject, "Unknown tool requested");
            return ToolResult::failure(
                invocation,
                ToolError::new(
                    ToolErrorKind::UnknownTool,
                    format!("no tool named '{}'", invocation.name),
                ),
            );
        };

        if let Err(e) = validate_params(tool.as_ref(), &invocation.params) {
            warn!(tool = %invocation.name, error = %e.message, "Tool parameters rejected");
            return ToolResult::failure(invocation, e);
        }

        let action = tool.action();
        let context = PolicyContext {
            tool: Some(invocation.name.clone()),
            resource: tool.resource(&invocation.params),
            session_key: session_key.map(str::to_string),
        };
        let decision = self.policy.evaluate(subject, &action, &context);

        // Nothing runs unless the decision is on record first.
        if let Err(e) = self
            .audit
            .record(&AuditEvent::policy_decision(&decision, Some(&invocation.id)))
        {
            error!(tool = %invocation.name, decision = %decision.id, error = %e, "Audit sink failed; refusing to execute");
            let mut result = ToolResult::failure(
                invocation,
                ToolError::fault(format!("audit sink unavailable: {}", e)),
            );
            result.decision_id = Some(decision.id);
            return result;
        }

        if !decision.is_allowed() {
            warn!(
                tool = %invocation.name,
                subject = %subject,
                action = %action,
                rule = decision.rule_id.as_deref().unwrap_or("-"),
                reason = decision.reason.as_str(),
                "Tool invocation denied by policy"
            );
            let mut result =
                ToolResult::failure(invocation, ToolError::denied(decision.explain()));
            result.decision_id = Some(decision.id);
            return result;
        }

        let started_at_ms = chrono::Utc::now().timestamp_millis();
        let started = Instant::now();
        let outcome = self
            .execute(tool, invocation, subject, session_key, &decision, cancel)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut result = match outcome {
            Ok(output) => {
                let exit_code = output
                    .get("exit_code")
                    .and_then(Value::as_i64)
                    .map(|c| c as i32);
                let (output, truncated, bytes) =
                    bound_output(output, self.limits_for(&decision).max_output_bytes);
                let mut result = ToolResult::success(invocation, output);
                result.truncated = truncated;
                result.usage.output_bytes = bytes;
                result.usage.exit_code = exit_code;
                result
            }
            Err(e) => ToolResult::failure(invocation, e),
        };
        result.decision_id = Some(decision.id.clone());
        result.usage.started_at_ms = started_at_ms;
        result.usage.duration_ms = duration_ms;

        let event = AuditEvent::ToolExecution {
            invocation_id: invocation.id.clone(),
            decision_id: Some(decision.id.clone()),
            tool: invocation.name.clone(),
            session_key: session_key.map(str::to_string),
            outcome: if result.is_success() { "success" } else { "failure" }.to_string(),
            error_kind: result.error_kind(),
            duration_ms,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        if let Err(e) = self.audit.record(&event) {
            error!(tool = %invocation.name, invocation = %invocation.id, error = %e, "Failed to record tool execution");
        }

        match result.error_kind() {
            None => info!(tool = %invocation.name, decision = %decision.id, duration_ms, "Tool executed"),
            Some(kind) => warn!(tool = %invocation.name, decision = %decision.id, kind = %kind, duration_ms, "Tool failed"),
        }
        result
    }

    fn limits_for(&self, decision: &PolicyDecision) -> ExecutionLimits {
        match decision.constraints() {
            Some(c) => self.settings.limits.tighten(c),
            None => self.settings.limits.clone(),
        }
    }

    /// Constraint override, then per-tool config, then tool preference, then default.
    fn select_runtime<'a>(&'a self, name: &str, tool: &'a dyn Tool, constraints: Option<&'a Constraints>) -> &'a str {
        constraints
            .and_then(|c| c.runtime.as_deref())
            .or_else(|| self.settings.tool_runtimes.get(name).map(String::as_str))
            .or_else(|| tool.runtime())
            .unwrap_or(&self.settings.default_runtime)
    }

    async fn execute(
        &self,
        tool: Arc<dyn Tool>,
        invocation: &ToolInvocation,
        subject: &Subject,
        session_key: Option<&str>,
        decision: &PolicyDecision,
        cancel: &CancellationToken,
    ) -> Result<Value, ToolError> {
        let runtime_name = self.select_runtime(&invocation.name, tool.as_ref(), decision.constraints());
        let runtime = self.runtimes.get(runtime_name).cloned().ok_or_else(|| {
            ToolError::fault(format!("runtime adapter '{}' is not available", runtime_name))
        })?;
        let limits = self.limits_for(decision);
        debug!(tool = %invocation.name, runtime = %runtime_name, timeout_secs = limits.timeout.as_secs(), "Executing tool");

        let child = cancel.child_token();
        let ctx = ToolContext {
            invocation_id: invocation.id.clone(),
            subject: subject.clone(),
            session_key: session_key.map(str::to_string),
            workspace: self.settings.workspace.clone(),
            limits: limits.clone(),
            runtime,
            cancel: child.clone(),
        };
        let params = invocation.params.clone();
        let mut handle = tokio::spawn(async move { tool.execute(ctx, params).await });

        let stopped = tokio::select! {
            joined = &mut handle => {
                return match joined {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err(ToolError::fault("tool panicked")),
                    Err(e) => Err(ToolError::fault(format!("tool task failed: {}", e))),
                };
            }
            _ = tokio::time::sleep(limits.timeout) => ToolError::new(
                ToolErrorKind::ExecutionTimeout,
                format!("tool exceeded its {}s time limit", limits.timeout.as_secs()),
            ),
            _ = cancel.cancelled() => ToolError::fault("invocation cancelled"),
        };

        child.cancel();
        if tokio::time::timeout(KILL_GRACE, &mut handle).await.is_err() {
            handle.abort();
        }
        Err(stopped)
    }
}

fn validate_params(tool: &dyn Tool, params: &Value) -> Result<(), ToolError> {
    schema::validate(&tool.schema().parameters, params).map_err(ToolError::invalid)?;
    tool.validate(params).map_err(|e| match e.kind {
        ToolErrorKind::InvalidParameters => e,
        _ => ToolError::invalid(e.message),
    })
}

/// Cap serialized output at `max` bytes, replacing it with a preview string.
fn bound_output(output: Value, max: usize) -> (Value, bool, usize) {
    let text = match &output {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let bytes = text.len();
    if bytes <= max {
        return (output, false, bytes);
    }
    (Value::String(safe_truncate(&text, max).to_string()), true, bytes)
}
