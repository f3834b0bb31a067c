use bastion_core::config::AgentDefaults;
use bastion_core::types::Turn;
use bastion_core::{Error, Result, Subject};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Where a session stands in the orchestration loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    AwaitingInput,
    Generating,
    ExecutingTools,
    Responding,
    Closed,
}

impl Phase {
    pub fn can_enter(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (AwaitingInput, Generating)
                | (Generating, ExecutingTools)
                | (Generating, Responding)
                | (ExecutingTools, Generating)
                | (ExecutingTools, Responding)
                | (Responding, AwaitingInput)
                | (AwaitingInput | Generating | ExecutingTools | Responding, Closed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Suspended,
    Closed,
}

/// Per inbound message limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub max_tool_calls: u32,
    pub max_wall_clock: Duration,
}

impl Budget {
    pub fn from_defaults(defaults: &AgentDefaults) -> Self {
        Self {
            max_tool_calls: defaults.max_tool_calls,
            max_wall_clock: Duration::from_secs(defaults.max_wall_clock_secs),
        }
    }
}

/// Conversation state for one session key. Only the session manager hands
/// out `&mut` access, one turn at a time.
#[derive(Debug)]
pub struct AgentSession {
    key: String,
    subject: Subject,
    turns: Vec<Turn>,
    budget: Budget,
    state: SessionState,
    phase: Phase,
    created_at_ms: i64,
    last_active: Instant,
}

impl AgentSession {
    pub fn new(key: &str, subject: Subject, budget: Budget) -> Self {
        Self {
            key: key.to_string(),
            subject,
            turns: Vec::new(),
            budget,
            state: SessionState::Active,
            phase: Phase::AwaitingInput,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
            last_active: Instant::now(),
        }
    }

    /// Resume with previously persisted turns.
    pub fn with_history(mut self, turns: Vec<Turn>) -> Self {
        self.turns = turns;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn budget(&self) -> Budget {
        self.budget
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub fn enter(&mut self, next: Phase) -> Result<()> {
        if next == Phase::Generating && self.state != SessionState::Active {
            return Err(Error::Session(format!(
                "session {} is {:?} and cannot start a turn",
                self.key, self.state
            )));
        }
        if !self.phase.can_enter(next) {
            return Err(Error::Session(format!(
                "illegal phase transition {:?} -> {:?} in session {}",
                self.phase, next, self.key
            )));
        }
        self.phase = next;
        if next == Phase::Closed {
            self.state = SessionState::Closed;
        }
        Ok(())
    }

    /// Drop an in-flight turn without recording it.
    pub fn abort_turn(&mut self) {
        if self.phase != Phase::Closed {
            self.phase = Phase::AwaitingInput;
        }
    }

    /// The only way history grows.
    pub fn append_turn(&mut self, turn: Turn) {
        self.turns.push(turn);
        self.touch();
    }

    pub fn suspend(&mut self) {
        if self.state == SessionState::Active {
            self.state = SessionState::Suspended;
        }
    }

    pub fn resume(&mut self) {
        if self.state == SessionState::Suspended {
            self.state = SessionState::Active;
        }
    }

    pub fn close(&mut self) {
        self.phase = Phase::Closed;
        self.state = SessionState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> AgentSession {
        AgentSession::new(
            "cli:default",
            Subject::new("cli", "user"),
            Budget {
                max_tool_calls: 3,
                max_wall_clock: Duration::from_secs(60),
            },
        )
    }

    #[test]
    fn test_full_tool_loop_is_legal() {
        let mut s = session();
        for phase in [
            Phase::Generating,
            Phase::ExecutingTools,
            Phase::Generating,
            Phase::ExecutingTools,
            Phase::Responding,
            Phase::AwaitingInput,
        ] {
            s.enter(phase).unwrap();
        }
        assert_eq!(s.phase(), Phase::AwaitingInput);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut s = session();
        assert!(s.enter(Phase::ExecutingTools).is_err());
        assert!(s.enter(Phase::Responding).is_err());
        s.enter(Phase::Generating).unwrap();
        assert!(s.enter(Phase::AwaitingInput).is_err());
        assert_eq!(s.phase(), Phase::Generating);
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut s = session();
        s.enter(Phase::Closed).unwrap();
        assert!(s.is_closed());
        assert!(s.enter(Phase::Generating).is_err());
        assert!(s.enter(Phase::AwaitingInput).is_err());
        s.abort_turn();
        assert_eq!(s.phase(), Phase::Closed);
    }

    #[test]
    fn test_suspended_session_cannot_start_turn() {
        let mut s = session();
        s.suspend();
        assert!(s.enter(Phase::Generating).is_err());
        s.resume();
        s.enter(Phase::Generating).unwrap();
    }

    #[test]
    fn test_abort_returns_to_awaiting_input() {
        let mut s = session();
        s.enter(Phase::Generating).unwrap();
        s.enter(Phase::ExecutingTools).unwrap();
        s.abort_turn();
        assert_eq!(s.phase(), Phase::AwaitingInput);
        assert!(s.turns().is_empty());
    }
}
