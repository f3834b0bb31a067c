use bastion_core::{Paths, Result, ToolErrorKind};
use bastion_policy::PolicyDecision;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tracing::error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    PolicyDecision {
        decision: PolicyDecision,
        #[serde(default)]
        invocation_id: Option<String>,
        timestamp_ms: i64,
    },
    ToolExecution {
        invocation_id: String,
        decision_id: Option<String>,
        tool: String,
        session_key: Option<String>,
        /// "success" or "failure"
        outcome: String,
        #[serde(default)]
        error_kind: Option<ToolErrorKind>,
        duration_ms: u64,
        timestamp_ms: i64,
    },
    CircuitTransition {
        provider: String,
        from: String,
        to: String,
        consecutive_failures: u32,
        timestamp_ms: i64,
    },
    PolicyReload {
        version: u64,
        #[serde(default)]
        error: Option<String>,
        timestamp_ms: i64,
    },
}

impl AuditEvent {
    pub fn policy_decision(decision: &PolicyDecision, invocation_id: Option<&str>) -> Self {
        AuditEvent::PolicyDecision {
            decision: decision.clone(),
            invocation_id: invocation_id.map(str::to_string),
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::PolicyDecision { .. } => "policy_decision",
            AuditEvent::ToolExecution { .. } => "tool_execution",
            AuditEvent::CircuitTransition { .. } => "circuit_transition",
            AuditEvent::PolicyReload { .. } => "policy_reload",
        }
    }
}

/// Durable destination for audit events. A failing `record` must stop the
/// caller from acting on the event it tried to log.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// Daily JSONL files under `audit_dir`.
pub struct AuditLogger {
    paths: Paths,
    current_date: Mutex<String>,
}

impl AuditLogger {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            current_date: Mutex::new(Utc::now().format("%Y-%m-%d").to_string()),
        }
    }

    fn write_event(&self, event: &AuditEvent) -> Result<()> {
        // The date lock also serializes appends from concurrent sessions.
        let mut current = self.current_date.lock().unwrap_or_else(PoisonError::into_inner);
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if today != *current {
            *current = today;
        }
        let log_file = self.log_file(&current);

        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)?;

        let json = serde_json::to_string(event)?;
        writeln!(file, "{}", json)?;
        file.flush()?;

        Ok(())
    }

    fn log_file(&self, date: &str) -> PathBuf {
        self.paths.audit_dir().join(format!("{}.jsonl", date))
    }

    /// Read audit events from a specific date
    pub fn read_events(&self, date: &str) -> Result<Vec<AuditEvent>> {
        let log_file = self.log_file(date);

        if !log_file.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&log_file)?;
        let mut events = Vec::new();

        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    error!(error = %e, line = %line, "Failed to parse audit event");
                }
            }
        }

        Ok(events)
    }

    /// Read today's audit events
    pub fn read_today(&self) -> Result<Vec<AuditEvent>> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        self.read_events(&today)
    }
}

impl AuditSink for AuditLogger {
    fn record(&self, event: &AuditEvent) -> Result<()> {
        self.write_event(event)
    }
}

/// Keeps events in memory. Used by tests and by `tools call` dry runs.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}

/// The allowing decision logged for `invocation_id` before its execution
/// record. `None` means the log cannot show the execution was authorized.
pub fn authorizing_decision<'a>(
    events: &'a [AuditEvent],
    invocation_id: &str,
) -> Option<&'a PolicyDecision> {
    let mut allowed = None;
    for event in events {
        match event {
            AuditEvent::PolicyDecision {
                decision,
                invocation_id: Some(id),
                ..
            } if id == invocation_id && decision.is_allowed() => {
                allowed.get_or_insert(decision);
            }
            AuditEvent::ToolExecution {
                invocation_id: id,
                decision_id,
                ..
            } if id == invocation_id => {
                return allowed.filter(|d| decision_id.as_deref() == Some(d.id.as_str()));
            }
            _ => {}
        }
    }
    None
}
