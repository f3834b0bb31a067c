use bastion_core::config::ChannelsConfig;
use bastion_core::{Error, InboundMessage, OutboundMessage, Result};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::rate_limit::ChannelRateLimiter;
use crate::{Channel, ChannelHealth};

/// Reconnect delays for listeners: doubles from `initial` up to `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

/// Owns the live channels: keeps their listeners running and routes
/// outbound messages to them under per-channel rate limits.
pub struct ChannelManager {
    channels: BTreeMap<String, Arc<dyn Channel>>,
    limiters: BTreeMap<String, Arc<ChannelRateLimiter>>,
    backoff: Backoff,
}

impl ChannelManager {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            channels: BTreeMap::new(),
            limiters: BTreeMap::new(),
            backoff,
        }
    }

    pub fn from_config(channels: Vec<(String, Arc<dyn Channel>)>, cfg: &ChannelsConfig) -> Self {
        let mut manager = Self::new(Backoff::default());
        for (name, channel) in channels {
            manager.add(&name, channel);
        }
        for (name, limit) in &cfg.rate_limits {
            match ChannelRateLimiter::from_config(limit) {
                Some(limiter) => manager.set_rate_limiter(name, limiter),
                None => warn!(channel = %name, "Ignoring rate limit with a non-positive rate"),
            }
        }
        manager
    }

    pub fn add(&mut self, name: &str, channel: Arc<dyn Channel>) {
        self.channels.insert(name.to_string(), channel);
    }

    pub fn set_rate_limiter(&mut self, name: &str, limiter: ChannelRateLimiter) {
        self.limiters.insert(name.to_string(), Arc::new(limiter));
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub async fn health(&self) -> Vec<(String, ChannelHealth)> {
        let mut report = Vec::new();
        for (name, channel) in &self.channels {
            report.push((name.clone(), channel.health_check().await));
        }
        report
    }

    /// Spawn one listener task per channel. Each restarts its channel's
    /// `listen` with backoff until `shutdown` fires or the inbound side closes.
    pub fn start_listeners(
        &self,
        inbound_tx: mpsc::Sender<InboundMessage>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        self.channels
            .iter()
            .map(|(name, channel)| {
                tokio::spawn(listen_loop(
                    name.clone(),
                    channel.clone(),
                    inbound_tx.clone(),
                    shutdown.clone(),
                    self.backoff,
                ))
            })
            .collect()
    }

    pub async fn start_outbound_dispatcher(
        &self,
        mut outbound_rx: mpsc::Receiver<OutboundMessage>,
        shutdown: CancellationToken,
    ) {
        info!("Outbound dispatcher started");
        loop {
            let msg = tokio::select! {
                msg = outbound_rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };
            if let Err(e) = self.dispatch(&msg).await {
                error!(error = %e, channel = %msg.channel, "Failed to dispatch outbound message");
            }
        }
        info!("Outbound dispatcher stopped");
    }

    pub async fn dispatch(&self, msg: &OutboundMessage) -> Result<()> {
        let channel = self
            .channels
            .get(&msg.channel)
            .ok_or_else(|| Error::Channel(format!("unknown channel '{}'", msg.channel)))?;
        if let Some(limiter) = self.limiters.get(&msg.channel) {
            limiter.acquire().await;
        }
        channel.send(msg).await
    }
}

async fn listen_loop(
    name: String,
    channel: Arc<dyn Channel>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    shutdown: CancellationToken,
    backoff: Backoff,
) {
    let mut delay = backoff.initial;
    loop {
        let listened = tokio::select! {
            r = channel.listen() => r,
            _ = shutdown.cancelled() => return,
        };
        match listened {
            Ok(mut stream) => {
                info!(channel = %name, "Channel listening");
                delay = backoff.initial;
                loop {
                    tokio::select! {
                        item = stream.next() => match item {
                            Some(msg) => {
                                if inbound_tx.send(msg).await.is_err() {
                                    info!(channel = %name, "Inbound bus closed; listener stopping");
                                    return;
                                }
                            }
                            None => break,
                        },
                        _ = shutdown.cancelled() => return,
                    }
                }
                warn!(channel = %name, retry_in_ms = delay.as_millis() as u64, "Channel stream ended, reconnecting");
            }
            Err(e) => {
                error!(channel = %name, error = %e, retry_in_ms = delay.as_millis() as u64, "Channel listen failed");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => return,
        }
        delay = (delay * 2).min(backoff.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Fails the first `failures` listens, then yields one message per listen.
    struct Flaky {
        failures: usize,
        listens: AtomicUsize,
        listen_times: Mutex<Vec<Instant>>,
        sent: Mutex<Vec<(Instant, String)>>,
    }

    impl Flaky {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                listens: AtomicUsize::new(0),
                listen_times: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Channel for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn send(&self, msg: &OutboundMessage) -> Result<()> {
            self.sent.lock().unwrap().push((Instant::now(), msg.content.clone()));
            Ok(())
        }

        async fn listen(&self) -> Result<BoxStream<'static, InboundMessage>> {
            let n = self.listens.fetch_add(1, Ordering::SeqCst);
            self.listen_times.lock().unwrap().push(Instant::now());
            if n < self.failures {
                return Err(Error::Channel("connection refused".to_string()));
            }
            let msg = InboundMessage::new("flaky", "u", "c", &format!("hello {}", n));
            Ok(stream::iter(vec![msg]).boxed())
        }

        async fn health_check(&self) -> ChannelHealth {
            ChannelHealth::Unhealthy("flaky".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_restarts_with_backoff() {
        let channel = Flaky::new(2);
        let mut manager = ChannelManager::new(Backoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(4),
        });
        manager.add("flaky", channel.clone());

        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let handles = manager.start_listeners(tx, shutdown.clone());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.content, "hello 2");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.content, "hello 3");

        let times = channel.listen_times.lock().unwrap().clone();
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps[0], Duration::from_secs(1));
        assert_eq!(gaps[1], Duration::from_secs(2));
        // A successful listen resets the delay.
        assert_eq!(gaps[2], Duration::from_secs(1));

        shutdown.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_applies_rate_limit() {
        let channel = Flaky::new(0);
        let mut manager = ChannelManager::new(Backoff::default());
        manager.add("flaky", channel.clone());
        manager.set_rate_limiter("flaky", ChannelRateLimiter::new(1, 1.0));

        let started = Instant::now();
        for i in 0..3 {
            manager
                .dispatch(&OutboundMessage::new("flaky", "c", &format!("m{}", i)))
                .await
                .unwrap();
        }
        let sent = channel.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 3);
        assert!(sent[2].0 - started >= Duration::from_millis(1900));
    }

    #[tokio::test]
    async fn test_unknown_channel_is_error() {
        let manager = ChannelManager::new(Backoff::default());
        let err = manager.dispatch(&OutboundMessage::new("nowhere", "c", "x")).await.unwrap_err();
        assert!(matches!(err, Error::Channel(_)));
    }

    #[tokio::test]
    async fn test_health_report() {
        let mut manager = ChannelManager::new(Backoff::default());
        manager.add("flaky", Flaky::new(0));
        let report = manager.health().await;
        assert_eq!(report.len(), 1);
        assert!(!report[0].1.is_healthy());
    }
}
