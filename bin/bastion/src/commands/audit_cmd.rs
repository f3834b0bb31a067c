use bastion_core::Paths;
use bastion_storage::{AuditEvent, AuditLogger};
use chrono::{TimeZone, Utc};

fn format_ts(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// One human-readable line per event.
pub fn describe(event: &AuditEvent) -> String {
    match event {
        AuditEvent::PolicyDecision {
            decision,
            invocation_id,
            timestamp_ms,
        } => format!(
            "{} decision  {} [{}]{}",
            format_ts(*timestamp_ms),
            decision.explain(),
            decision.id,
            invocation_id
                .as_deref()
                .map(|id| format!(" invocation={}", id))
                .unwrap_or_default()
        ),
        AuditEvent::ToolExecution {
            invocation_id,
            decision_id,
            tool,
            outcome,
            error_kind,
            duration_ms,
            timestamp_ms,
            ..
        } => format!(
            "{} execution {} {}{} in {}ms invocation={} decision={}",
            format_ts(*timestamp_ms),
            tool,
            outcome,
            error_kind.map(|k| format!(" ({})", k)).unwrap_or_default(),
            duration_ms,
            invocation_id,
            decision_id.as_deref().unwrap_or("-")
        ),
        AuditEvent::CircuitTransition {
            provider,
            from,
            to,
            consecutive_failures,
            timestamp_ms,
        } => format!(
            "{} circuit   {} {} -> {} after {} failure(s)",
            format_ts(*timestamp_ms),
            provider,
            from,
            to,
            consecutive_failures
        ),
        AuditEvent::PolicyReload {
            version,
            error,
            timestamp_ms,
        } => match error {
            Some(e) => format!(
                "{} reload    rejected, still v{}: {}",
                format_ts(*timestamp_ms),
                version,
                e
            ),
            None => format!("{} reload    now v{}", format_ts(*timestamp_ms), version),
        },
    }
}

pub async fn run(
    paths: &Paths,
    date: Option<String>,
    kind: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let logger = AuditLogger::new(paths.clone());
    let events = match &date {
        Some(d) => logger.read_events(d)?,
        None => logger.read_today()?,
    };

    let events: Vec<&AuditEvent> = events
        .iter()
        .filter(|e| kind.as_deref().map_or(true, |k| e.kind() == k))
        .collect();

    if events.is_empty() {
        eprintln!(
            "No audit events for {}.",
            date.as_deref().unwrap_or("today")
        );
        return Ok(());
    }

    for event in events {
        if json {
            println!("{}", serde_json::to_string(event)?);
        } else {
            println!("{}", describe(event));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::ToolErrorKind;

    #[test]
    fn test_describe_execution_links_decision() {
        let line = describe(&AuditEvent::ToolExecution {
            invocation_id: "inv-1".to_string(),
            decision_id: Some("dec-1".to_string()),
            tool: "read_file".to_string(),
            session_key: None,
            outcome: "failure".to_string(),
            error_kind: Some(ToolErrorKind::ExecutionTimeout),
            duration_ms: 30000,
            timestamp_ms: 0,
        });
        assert!(line.contains("read_file failure (execution_timeout)"));
        assert!(line.contains("decision=dec-1"));
    }

    #[test]
    fn test_describe_rejected_reload() {
        let line = describe(&AuditEvent::PolicyReload {
            version: 3,
            error: Some("bad rule".to_string()),
            timestamp_ms: 0,
        });
        assert!(line.contains("rejected, still v3: bad rule"));
    }
}
