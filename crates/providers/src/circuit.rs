use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitStatus::Closed => "closed",
            CircuitStatus::Open => "open",
            CircuitStatus::HalfOpen => "half_open",
        }
    }
}

/// Emitted whenever a provider's circuit changes status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitTransition {
    pub provider: String,
    pub from: CircuitStatus,
    pub to: CircuitStatus,
    pub consecutive_failures: u32,
    pub at_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub provider: String,
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    /// Remaining cool-down while open.
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug)]
struct CircuitState {
    status: CircuitStatus,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    trial_in_flight: bool,
}

/// Per-provider breaker. The lock is only held for state transitions, never
/// across an await.
pub struct CircuitBreaker {
    provider: String,
    threshold: u32,
    cooldown: Duration,
    state: Mutex<CircuitState>,
    events: broadcast::Sender<CircuitTransition>,
}

impl CircuitBreaker {
    pub fn new(
        provider: &str,
        threshold: u32,
        cooldown: Duration,
        events: broadcast::Sender<CircuitTransition>,
    ) -> Self {
        Self {
            provider: provider.to_string(),
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(CircuitState {
                status: CircuitStatus::Closed,
                consecutive_failures: 0,
                open_until: None,
                trial_in_flight: false,
            }),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask permission to send. `None` means the provider must be skipped:
    /// the circuit is open, or a half-open trial is already in flight.
    pub fn acquire(&self) -> Option<Permit<'_>> {
        let (permit, transition) = {
            let mut state = self.lock();
            match state.status {
                CircuitStatus::Closed => (Some(false), None),
                CircuitStatus::Open => {
                    let elapsed = state.open_until.map_or(true, |until| Instant::now() >= until);
                    if elapsed {
                        state.status = CircuitStatus::HalfOpen;
                        state.trial_in_flight = true;
                        state.open_until = None;
                        let t = self.transition(CircuitStatus::Open, CircuitStatus::HalfOpen, &state);
                        (Some(true), Some(t))
                    } else {
                        (None, None)
                    }
                }
                CircuitStatus::HalfOpen => {
                    if state.trial_in_flight {
                        (None, None)
                    } else {
                        state.trial_in_flight = true;
                        (Some(true), None)
                    }
                }
            }
        };
        if let Some(t) = transition {
            self.publish(t);
        }
        permit.map(|trial| Permit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn record_success(&self) {
        let transition = {
            let mut state = self.lock();
            state.consecutive_failures = 0;
            state.trial_in_flight = false;
            state.open_until = None;
            let from = state.status;
            if from != CircuitStatus::Closed {
                state.status = CircuitStatus::Closed;
                Some(self.transition(from, CircuitStatus::Closed, &state))
            } else {
                None
            }
        };
        if let Some(t) = transition {
            self.publish(t);
        }
    }

    fn record_failure(&self, trial: bool) {
        let transition = {
            let mut state = self.lock();
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            let from = state.status;
            let trips = if trial {
                state.trial_in_flight = false;
                true
            } else {
                from == CircuitStatus::Closed && state.consecutive_failures >= self.threshold
            };
            if trips {
                state.status = CircuitStatus::Open;
                state.open_until = Some(Instant::now() + self.cooldown);
                Some(self.transition(from, CircuitStatus::Open, &state))
            } else {
                None
            }
        };
        if let Some(t) = transition {
            self.publish(t);
        }
    }

    fn release_trial(&self) {
        self.lock().trial_in_flight = false;
    }

    fn transition(
        &self,
        from: CircuitStatus,
        to: CircuitStatus,
        state: &CircuitState,
    ) -> CircuitTransition {
        CircuitTransition {
            provider: self.provider.clone(),
            from,
            to,
            consecutive_failures: state.consecutive_failures,
            at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn publish(&self, t: CircuitTransition) {
        if t.to == CircuitStatus::Open {
            warn!(
                provider = %t.provider,
                from = t.from.as_str(),
                failures = t.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Circuit opened"
            );
        } else {
            info!(
                provider = %t.provider,
                from = t.from.as_str(),
                to = t.to.as_str(),
                "Circuit transition"
            );
        }
        // No subscribers is fine.
        let _ = self.events.send(t);
    }

    pub fn status(&self) -> CircuitStatus {
        self.lock().status
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.lock();
        let now = Instant::now();
        CircuitSnapshot {
            provider: self.provider.clone(),
            status: state.status,
            consecutive_failures: state.consecutive_failures,
            retry_in_ms: state
                .open_until
                .filter(|_| state.status == CircuitStatus::Open)
                .map(|until| until.saturating_duration_since(now).as_millis() as u64),
        }
    }
}

/// One admitted request. Settle it with `success` or `failure`; dropping it
/// unsettled (cancellation) frees a half-open trial slot without changing
/// the circuit status.
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> (CircuitBreaker, broadcast::Receiver<CircuitTransition>) {
        let (tx, rx) = broadcast::channel(16);
        (CircuitBreaker::new("a", threshold, Duration::from_secs(30), tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let (cb, mut rx) = breaker(3);
        for _ in 0..2 {
            cb.acquire().unwrap().failure();
        }
        assert_eq!(cb.status(), CircuitStatus::Closed);
        cb.acquire().unwrap().failure();
        assert_eq!(cb.status(), CircuitStatus::Open);
        assert!(cb.acquire().is_none());

        let t = rx.try_recv().unwrap();
        assert_eq!((t.from, t.to), (CircuitStatus::Closed, CircuitStatus::Open));
        assert_eq!(t.consecutive_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counter() {
        let (cb, _rx) = breaker(3);
        cb.acquire().unwrap().failure();
        cb.acquire().unwrap().failure();
        cb.acquire().unwrap().success();
        cb.acquire().unwrap().failure();
        cb.acquire().unwrap().failure();
        assert_eq!(cb.status(), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let (cb, _rx) = breaker(1);
        cb.acquire().unwrap().failure();
        assert!(cb.acquire().is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let trial = cb.acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(cb.status(), CircuitStatus::HalfOpen);
        assert!(cb.acquire().is_none());

        trial.success();
        assert_eq!(cb.status(), CircuitStatus::Closed);
        assert!(cb.acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_with_fresh_cooldown() {
        let (cb, mut rx) = breaker(1);
        cb.acquire().unwrap().failure();
        tokio::time::advance(Duration::from_secs(31)).await;
        cb.acquire().unwrap().failure();
        assert_eq!(cb.status(), CircuitStatus::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cb.acquire().is_none());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cb.acquire().is_some());

        let seen: Vec<(CircuitStatus, CircuitStatus)> =
            std::iter::from_fn(|| rx.try_recv().ok().map(|t| (t.from, t.to))).collect();
        assert_eq!(
            seen,
            vec![
                (CircuitStatus::Closed, CircuitStatus::Open),
                (CircuitStatus::Open, CircuitStatus::HalfOpen),
                (CircuitStatus::HalfOpen, CircuitStatus::Open),
                (CircuitStatus::Open, CircuitStatus::HalfOpen),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_releases_slot() {
        let (cb, _rx) = breaker(1);
        cb.acquire().unwrap().failure();
        tokio::time::advance(Duration::from_secs(31)).await;
        drop(cb.acquire().unwrap());
        assert_eq!(cb.status(), CircuitStatus::HalfOpen);
        assert!(cb.acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reports_remaining_cooldown() {
        let (cb, _rx) = breaker(1);
        cb.acquire().unwrap().failure();
        tokio::time::advance(Duration::from_secs(10)).await;
        let snap = cb.snapshot();
        assert_eq!(snap.status, CircuitStatus::Open);
        assert_eq!(snap.retry_in_ms, Some(20_000));
    }
}
