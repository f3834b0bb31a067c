use bastion_core::config::RouterConfig;
use bastion_core::types::{ProviderRequest, ProviderResponse};
use bastion_core::{ProviderError, RouterError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::circuit::{CircuitBreaker, CircuitSnapshot, CircuitTransition};
use crate::Provider;

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl From<&RouterConfig> for RouterSettings {
    fn from(cfg: &RouterConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            attempt_timeout: Duration::from_secs(cfg.attempt_timeout_secs),
            failure_threshold: cfg.failure_threshold,
            cooldown: Duration::from_secs(cfg.cooldown_secs),
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from(&RouterConfig::default())
    }
}

impl RouterSettings {
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(20);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct RoutedResponse {
    /// Configured name of the provider that answered.
    pub provider: String,
    pub response: ProviderResponse,
    /// Attempts made across all providers, including the successful one.
    pub attempts: u32,
}

struct Route {
    name: String,
    provider: Arc<dyn Provider>,
    circuit: CircuitBreaker,
}

/// Sends a request to the first healthy provider in preference order,
/// retrying transient failures and falling through on permanent ones.
pub struct ProviderRouter {
    routes: Vec<Route>,
    default_order: Vec<String>,
    settings: RouterSettings,
    events: broadcast::Sender<CircuitTransition>,
}

impl ProviderRouter {
    pub fn new(settings: RouterSettings) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            routes: Vec::new(),
            default_order: Vec::new(),
            settings,
            events,
        }
    }

    /// Add a provider under its configured name. The default order follows
    /// insertion unless `set_default_order` overrides it.
    pub fn add_provider(&mut self, name: &str, provider: Arc<dyn Provider>) {
        let circuit = CircuitBreaker::new(
            name,
            self.settings.failure_threshold,
            self.settings.cooldown,
            self.events.clone(),
        );
        self.routes.retain(|r| r.name != name);
        self.routes.push(Route {
            name: name.to_string(),
            provider,
            circuit,
        });
        if !self.default_order.iter().any(|n| n == name) {
            self.default_order.push(name.to_string());
        }
    }

    pub fn set_default_order(&mut self, order: Vec<String>) {
        self.default_order = order;
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CircuitTransition> {
        self.events.subscribe()
    }

    pub fn circuit_snapshot(&self) -> Vec<CircuitSnapshot> {
        self.routes.iter().map(|r| r.circuit.snapshot()).collect()
    }

    fn route(&self, name: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.name == name)
    }

    pub async fn send(
        &self,
        request: &ProviderRequest,
        preference: &[String],
        cancel: &CancellationToken,
    ) -> Result<RoutedResponse, RouterError> {
        if self.routes.is_empty() {
            return Err(RouterError::NoProviders);
        }
        let order = if preference.is_empty() {
            &self.default_order
        } else {
            preference
        };

        let mut attempts = 0u32;
        let mut skipped = 0u32;
        let mut last_error: Option<String> = None;

        for name in order {
            let Some(route) = self.route(name) else {
                warn!(provider = %name, "Preference names an unknown provider, skipping");
                skipped += 1;
                continue;
            };

            for attempt in 1..=self.settings.max_attempts {
                if cancel.is_cancelled() {
                    return Err(RouterError::Cancelled);
                }
                let Some(permit) = route.circuit.acquire() else {
                    if attempt == 1 {
                        debug!(provider = %name, "Circuit open, skipping provider");
                        skipped += 1;
                    }
                    break;
                };

                attempts += 1;
                info!(provider = %name, attempt, trial = permit.is_trial(), "Sending provider request");

                let outcome = tokio::select! {
                    _ = cancel.cancelled() => return Err(RouterError::Cancelled),
                    r = tokio::time::timeout(self.settings.attempt_timeout, route.provider.send(request)) => r,
                };

                let err = match outcome {
                    Ok(Ok(response)) => {
                        permit.success();
                        return Ok(RoutedResponse {
                            provider: route.name.clone(),
                            response,
                            attempts,
                        });
                    }
                    Ok(Err(e)) => e,
                    Err(_) => ProviderError::Transient(format!(
                        "attempt timed out after {:?}",
                        self.settings.attempt_timeout
                    )),
                };
                permit.failure();

                warn!(
                    provider = %name,
                    attempt,
                    transient = err.is_transient(),
                    error = %err,
                    "Provider attempt failed"
                );
                let transient = err.is_transient();
                last_error = Some(format!("{}: {}", name, err));

                if !transient {
                    break;
                }
                if attempt < self.settings.max_attempts {
                    let delay = self.settings.backoff(attempt);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RouterError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        warn!(attempts, skipped, "All providers exhausted");
        Err(RouterError::AllProvidersExhausted {
            attempts,
            skipped,
            last_error,
        })
    }
}
