use bastion_core::{Error, InboundMessage, OutboundMessage, Result};
use bastion_storage::SessionStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::orchestrator::Orchestrator;
use crate::session::{AgentSession, Budget, Phase};

struct SessionSlot {
    /// Held for a whole turn: one writer per session.
    session: tokio::sync::Mutex<AgentSession>,
    /// Token of the turn in flight, if any.
    turn: Mutex<Option<CancellationToken>>,
}

impl SessionSlot {
    fn set_turn(&self, token: Option<CancellationToken>) {
        *self.turn.lock().unwrap_or_else(PoisonError::into_inner) = token;
    }

    fn cancel_turn(&self) -> bool {
        match self.turn.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Owns every live session and serializes turns within each one. Different
/// sessions run concurrently.
pub struct SessionManager {
    orchestrator: Arc<Orchestrator>,
    store: Option<SessionStore>,
    budget: Budget,
    idle_timeout: Duration,
    sessions: Mutex<HashMap<String, Arc<SessionSlot>>>,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        store: Option<SessionStore>,
        budget: Budget,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            orchestrator,
            store,
            budget,
            idle_timeout,
            sessions: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SessionSlot>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot_for(&self, msg: &InboundMessage) -> Arc<SessionSlot> {
        let key = msg.session_key();
        if let Some(slot) = self.slots().get(&key) {
            return slot.clone();
        }

        // Load outside the map lock; a racing creator wins and ours is dropped.
        let history = match &self.store {
            Some(store) => store.load(&key).unwrap_or_else(|e| {
                warn!(session = %key, error = %e, "Failed to load session history; starting fresh");
                Vec::new()
            }),
            None => Vec::new(),
        };
        let session = AgentSession::new(&key, msg.subject(), self.budget).with_history(history);
        let slot = Arc::new(SessionSlot {
            session: tokio::sync::Mutex::new(session),
            turn: Mutex::new(None),
        });

        let mut slots = self.slots();
        let slot = slots.entry(key.clone()).or_insert(slot).clone();
        info!(session = %key, "Session opened");
        slot
    }

    /// Run one turn for the message and produce the reply to deliver.
    pub async fn handle(&self, msg: &InboundMessage) -> Result<OutboundMessage> {
        let key = msg.session_key();
        // A session closed while we waited for its lock is replaced once.
        for _ in 0..2 {
            let slot = self.slot_for(msg);
            let mut session = slot.session.lock().await;
            if session.is_closed() {
                drop(session);
                self.remove_if_same(&key, &slot);
                continue;
            }
            return self.run_turn(msg, &slot, &mut session).await;
        }
        Err(Error::Session(format!("session {} is closed", key)))
    }

    async fn run_turn(
        &self,
        msg: &InboundMessage,
        slot: &SessionSlot,
        session: &mut AgentSession,
    ) -> Result<OutboundMessage> {
        let token = self.shutdown.child_token();
        slot.set_turn(Some(token.clone()));
        let outcome = self
            .orchestrator
            .handle_turn(session, &msg.subject(), &msg.content, &token)
            .await;
        slot.set_turn(None);
        let turn = outcome?;

        if let Some(store) = &self.store {
            if let Err(e) = store.append(session.key(), &turn) {
                error!(session = %session.key(), error = %e, "Failed to persist turn");
            }
        }
        session.enter(Phase::AwaitingInput)?;
        Ok(OutboundMessage::reply_to(msg, &turn.reply))
    }

    fn remove_if_same(&self, key: &str, slot: &Arc<SessionSlot>) {
        let mut slots = self.slots();
        if slots.get(key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(key);
        }
    }

    /// Cancel the turn in flight for `session_key`. Its tools are stopped and
    /// no turn is recorded.
    pub fn cancel(&self, session_key: &str) -> bool {
        let slot = self.slots().get(session_key).cloned();
        slot.map(|s| s.cancel_turn()).unwrap_or(false)
    }

    /// Close a session, cancelling any turn in flight.
    pub async fn close(&self, session_key: &str) -> bool {
        let Some(slot) = self.slots().remove(session_key) else {
            return false;
        };
        slot.cancel_turn();
        slot.session.lock().await.close();
        info!(session = %session_key, "Session closed");
        true
    }

    /// Close sessions idle longer than the idle timeout. Busy sessions are
    /// skipped. Returns how many were closed.
    pub fn sweep_idle(&self) -> usize {
        let mut slots = self.slots();
        let mut closed = Vec::new();
        for (key, slot) in slots.iter() {
            let Ok(mut session) = slot.session.try_lock() else {
                continue;
            };
            if session.idle_for() >= self.idle_timeout {
                session.close();
                closed.push(key.clone());
            }
        }
        for key in &closed {
            slots.remove(key);
            info!(session = %key, "Closed idle session");
        }
        closed.len()
    }

    pub fn active_sessions(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.slots().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Cancel every turn in flight and stop `run`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Consume inbound messages until the bus closes or shutdown. Each message
    /// runs on its own task; turns for one session queue on its lock.
    pub async fn run(
        self: Arc<Self>,
        mut inbound_rx: mpsc::Receiver<InboundMessage>,
        outbound_tx: mpsc::Sender<OutboundMessage>,
    ) {
        info!("Session manager started");
        loop {
            let msg = tokio::select! {
                msg = inbound_rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                _ = self.shutdown.cancelled() => break,
            };
            let manager = self.clone();
            let outbound_tx = outbound_tx.clone();
            tokio::spawn(async move {
                match manager.handle(&msg).await {
                    Ok(reply) => {
                        if outbound_tx.send(reply).await.is_err() {
                            warn!("Outbound bus closed; dropping reply");
                        }
                    }
                    Err(Error::Cancelled) => {
                        info!(session = %msg.session_key(), "Turn cancelled")
                    }
                    Err(e) => error!(session = %msg.session_key(), error = %e, "Turn failed"),
                }
            });
        }
        info!("Session manager stopped");
    }
}
