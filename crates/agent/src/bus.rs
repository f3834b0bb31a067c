use bastion_core::{InboundMessage, OutboundMessage};
use tokio::sync::mpsc;
use tracing::debug;

/// What channel listeners and the outbound dispatcher hold.
pub struct ChannelEnds {
    pub inbound: mpsc::Sender<InboundMessage>,
    pub outbound: mpsc::Receiver<OutboundMessage>,
}

/// What the session manager holds.
pub struct AgentEnds {
    pub inbound: mpsc::Receiver<InboundMessage>,
    pub outbound: mpsc::Sender<OutboundMessage>,
}

/// Two bounded queues between channels and sessions. A full queue makes the
/// producer wait, so a slow agent slows intake instead of dropping messages.
/// Dropping every sender of one direction ends the consumer's loop.
pub struct MessageBus {
    capacity: usize,
    channels: ChannelEnds,
    agents: AgentEnds,
}

impl MessageBus {
    /// `capacity` is per direction. Zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        debug!(capacity, "Message bus created");
        Self {
            capacity,
            channels: ChannelEnds {
                inbound: inbound_tx,
                outbound: outbound_rx,
            },
            agents: AgentEnds {
                inbound: inbound_rx,
                outbound: outbound_tx,
            },
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn split(self) -> (ChannelEnds, AgentEnds) {
        (self.channels, self.agents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_messages_cross_in_both_directions() {
        let (channels, mut agents) = MessageBus::new(4).split();
        let msg = InboundMessage::new("cli", "alice", "room", "hi");
        channels.inbound.send(msg).await.unwrap();
        let got = agents.inbound.recv().await.unwrap();
        assert_eq!(got.session_key(), "cli:room");

        let mut outbound = channels.outbound;
        agents
            .outbound
            .send(OutboundMessage::reply_to(&got, "hello"))
            .await
            .unwrap();
        let reply = outbound.recv().await.unwrap();
        assert_eq!(reply.chat_id, "room");
        assert_eq!(reply.content, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_holds_the_producer() {
        let bus = MessageBus::new(0);
        assert_eq!(bus.capacity(), 1);
        let (channels, mut agents) = bus.split();
        channels
            .inbound
            .send(InboundMessage::new("cli", "a", "r", "1"))
            .await
            .unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_secs(1),
            channels.inbound.send(InboundMessage::new("cli", "a", "r", "2")),
        )
        .await;
        assert!(blocked.is_err());

        assert_eq!(agents.inbound.recv().await.unwrap().content, "1");
        channels
            .inbound
            .send(InboundMessage::new("cli", "a", "r", "3"))
            .await
            .unwrap();
        assert_eq!(agents.inbound.recv().await.unwrap().content, "3");
    }

    #[tokio::test]
    async fn test_dropping_channel_side_closes_intake() {
        let (channels, mut agents) = MessageBus::new(2).split();
        drop(channels);
        assert!(agents.inbound.recv().await.is_none());
    }
}
