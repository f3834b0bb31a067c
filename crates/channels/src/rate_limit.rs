//! Token bucket applied to outbound messages, one bucket per channel.
//! Callers `await` on `acquire()` before sending; it returns at once when a
//! token is available and otherwise sleeps until the next refill.

use bastion_core::config::RateLimitConfig;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct RateLimiter {
    /// Burst capacity.
    capacity: u32,
    tokens: f64,
    /// Tokens added per second.
    refill_rate: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(capacity: u32, per_second: f64) -> Self {
        Self {
            capacity: capacity.max(1),
            tokens: capacity.max(1) as f64,
            refill_rate: per_second,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity as f64);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available.
    fn try_consume(&mut self) -> Option<Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let needed = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(needed / self.refill_rate))
        }
    }
}

pub struct ChannelRateLimiter(Mutex<RateLimiter>);

impl ChannelRateLimiter {
    pub fn new(capacity: u32, per_second: f64) -> Self {
        Self(Mutex::new(RateLimiter::new(capacity, per_second)))
    }

    /// `None` when the configured rate could never refill.
    pub fn from_config(cfg: &RateLimitConfig) -> Option<Self> {
        if cfg.per_second.is_finite() && cfg.per_second > 0.0 {
            Some(Self::new(cfg.capacity, cfg.per_second))
        } else {
            None
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut inner = self.0.lock().await;
                inner.try_consume()
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}
