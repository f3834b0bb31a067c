use bastion_agent::{AgentRuntime, MessageBus};
use bastion_channels::ChannelManager;
use bastion_core::Paths;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run(paths: &Paths) -> anyhow::Result<()> {
    let config = super::load_config(paths)?;
    let (runtime, report) = super::start_runtime(paths, &config)?;

    let channels = Arc::new(ChannelManager::from_config(
        runtime.channels.clone(),
        &config.channels,
    ));
    if channels.is_empty() {
        anyhow::bail!("no channel is enabled; nothing to listen on");
    }
    info!(
        channels = ?channels.channel_names(),
        failures = report.failures.len(),
        "Gateway starting"
    );

    let bus = MessageBus::new(config.channels.queue_capacity);
    info!(capacity = bus.capacity(), "Message bus ready");
    let (channel_ends, agent_ends) = bus.split();
    let shutdown = CancellationToken::new();

    let listeners = channels.start_listeners(channel_ends.inbound, shutdown.clone());
    let outbound_rx = channel_ends.outbound;

    let dispatcher = {
        let channels = channels.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            channels.start_outbound_dispatcher(outbound_rx, shutdown).await;
        })
    };

    let manager = tokio::spawn(runtime.sessions.clone().run(agent_ends.inbound, agent_ends.outbound));

    let sweeper = {
        let sessions = runtime.sessions.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let closed = sessions.sweep_idle();
                        if closed > 0 {
                            info!(closed, "Closed idle sessions");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    };

    wait_for_shutdown(&runtime).await?;
    info!("Shutdown signal received, cancelling turns...");

    runtime.sessions.shutdown();
    shutdown.cancel();
    for handle in listeners {
        let _ = handle.await;
    }
    let _ = sweeper.await;
    let _ = manager.await;
    let _ = dispatcher.await;

    info!("Gateway stopped");
    Ok(())
}

/// Block until Ctrl-C. On unix, SIGHUP reloads the policy in place.
#[cfg(unix)]
async fn wait_for_shutdown(runtime: &AgentRuntime) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                return Ok(());
            }
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading policy");
                if let Err(e) = runtime.reload_policy() {
                    warn!(error = %e, "Policy reload rejected");
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_runtime: &AgentRuntime) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
