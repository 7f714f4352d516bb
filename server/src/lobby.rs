//! Routing between connections, the queue and running matches
//!
//! The lobby is what a connection talks to once it is authenticated. It keeps
//! the identity → outbox table, forwards queue operations to the
//! [`Matchmaker`], spawns a match task when a pair is formed and forwards
//! in-match commands to the right task through the [`SessionRegistry`].

use crate::config::{HeartbeatPolicy, MatchConfig};
use crate::error::{DuelError, Result, ValidationError};
use crate::ledger::ScoreLedger;
use crate::queue::{EnqueueOutcome, Matchmaker, PairedMatch};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::sequencer::QuestionSequencer;
use crate::session::{MatchSession, Outbox, SessionCommand};
use log::{debug, info, warn};
use shared::{Identity, ServerMessage, TopicKey};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Lobby {
    matchmaker: Arc<Matchmaker>,
    sessions: SessionRegistry,
    sequencer: QuestionSequencer,
    ledger: Arc<dyn ScoreLedger>,
    config: MatchConfig,
    connections: Arc<Mutex<HashMap<Identity, Outbox>>>,
}

impl Lobby {
    pub fn new(
        sequencer: QuestionSequencer,
        ledger: Arc<dyn ScoreLedger>,
        config: MatchConfig,
    ) -> Self {
        Self {
            matchmaker: Arc::new(Matchmaker::new()),
            sessions: SessionRegistry::new(),
            sequencer,
            ledger,
            config,
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<Identity, Outbox>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn outbox_for(&self, identity: &Identity) -> Option<Outbox> {
        self.connections().get(identity).cloned()
    }

    fn send_to(&self, identity: &Identity, message: ServerMessage) {
        if let Some(outbox) = self.outbox_for(identity) {
            if outbox.send(message).is_err() {
                debug!("Connection for {} already closed", identity);
            }
        }
    }

    fn session(&self, identity: &Identity) -> Result<SessionHandle> {
        self.sessions
            .session_for(identity)
            .ok_or(DuelError::Validation(ValidationError::NoActiveMatch))
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn matchmaker(&self) -> &Matchmaker {
        &self.matchmaker
    }

    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    /// Binds an authenticated connection to `identity`.
    ///
    /// A newer connection replaces an older one for the same identity; if the
    /// participant is in a running match, the new connection is reattached
    /// and receives a full state replay.
    pub fn connect(&self, identity: &Identity, outbox: Outbox) {
        let previous = self.connections().insert(identity.clone(), outbox.clone());
        if let Some(previous) = previous {
            info!("{} signed in again; closing the older connection", identity);
            let _ = previous.send(ServerMessage::Disconnected {
                reason: "Signed in from another connection".to_string(),
            });
        }

        if let Some(handle) = self.sessions.session_for(identity) {
            let attach = SessionCommand::Attach {
                identity: identity.clone(),
                outbox,
            };
            if let Err(e) = handle.send(attach) {
                debug!("Could not reattach {}: {}", identity, e);
            }
        }
    }

    /// Whether `outbox` is still the live connection for `identity`
    pub fn is_current(&self, identity: &Identity, outbox: &Outbox) -> bool {
        self.connections()
            .get(identity)
            .map_or(false, |current| current.same_channel(outbox))
    }

    /// Cleans up after a connection closed. Does nothing if `outbox` has
    /// already been replaced by a newer connection.
    pub fn disconnect(&self, identity: &Identity, outbox: &Outbox) {
        let removed = {
            let mut connections = self.connections();
            match connections.get(identity) {
                Some(current) if current.same_channel(outbox) => {
                    connections.remove(identity);
                    true
                }
                _ => false,
            }
        };
        if !removed {
            return;
        }

        self.matchmaker.leave(identity);
        if let Some(handle) = self.sessions.session_for(identity) {
            let _ = handle.send(SessionCommand::Detach {
                identity: identity.clone(),
                outbox: outbox.clone(),
            });
        }
    }

    pub fn enqueue(
        &self,
        identity: &Identity,
        topic: TopicKey,
        skill_rating: Option<u32>,
    ) -> Result<()> {
        topic.validate().map_err(ValidationError::from)?;
        if self.sessions.session_for(identity).is_some() {
            return Err(ValidationError::AlreadyInMatch.into());
        }

        match self
            .matchmaker
            .enqueue(identity.clone(), topic.clone(), skill_rating)?
        {
            EnqueueOutcome::Queued { position } => {
                self.send_to(identity, ServerMessage::Queued { topic, position });
            }
            EnqueueOutcome::Matched(paired) => self.start_match(paired),
            EnqueueOutcome::PairedElsewhere => {
                debug!("{} was paired by a concurrent pass", identity);
            }
        }
        Ok(())
    }

    fn start_match(&self, paired: PairedMatch) {
        let session = MatchSession::new(
            &paired,
            self.config.clone(),
            self.sequencer.clone(),
            Arc::clone(&self.ledger),
            Instant::now(),
        );
        let handle = session.spawn(&self.sessions);

        let (a, b) = paired.identities();
        for identity in [a, b] {
            // Someone who vanished in between is caught by the attach timeout
            let Some(outbox) = self.outbox_for(identity) else {
                warn!("{} has no connection for match {}", identity, paired.match_id);
                continue;
            };
            let attach = SessionCommand::Attach {
                identity: identity.clone(),
                outbox,
            };
            if let Err(e) = handle.send(attach) {
                warn!("Could not attach {}: {}", identity, e);
            }
        }
    }

    pub fn leave(&self, identity: &Identity) {
        self.matchmaker.leave(identity);
        self.send_to(identity, ServerMessage::QueueLeft { evicted: false });
    }

    /// Liveness signal, counted by the queue and by a running match
    pub fn heartbeat(&self, identity: &Identity) {
        self.matchmaker.heartbeat(identity);
        if let Some(handle) = self.sessions.session_for(identity) {
            let _ = handle.send(SessionCommand::Heartbeat {
                identity: identity.clone(),
            });
        }
    }

    pub fn submit(
        &self,
        identity: &Identity,
        request_id: u32,
        step_index: usize,
        selected_option_index: usize,
    ) -> Result<()> {
        self.session(identity)?.send(SessionCommand::Submit {
            identity: identity.clone(),
            request_id,
            step_index,
            selected_option_index,
        })
    }

    pub fn sync(&self, identity: &Identity) -> Result<()> {
        self.session(identity)?.send(SessionCommand::Sync {
            identity: identity.clone(),
        })
    }

    /// Evicts queue entries whose heartbeats stopped and tells their owners
    pub fn sweep_queue(&self, policy: &HeartbeatPolicy) -> usize {
        let evicted = self.matchmaker.evict_lapsed(policy);
        for entry in &evicted {
            self.send_to(&entry.identity, ServerMessage::QueueLeft { evicted: true });
        }
        evicted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::sequencer::QuestionBank;
    use std::time::Duration;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn lobby() -> Lobby {
        let bank = QuestionBank::sample().unwrap();
        let sequencer = QuestionSequencer::new(Arc::new(bank), Duration::from_secs(1));
        Lobby::new(sequencer, Arc::new(MemoryLedger::new()), MatchConfig::default())
    }

    fn connect(lobby: &Lobby, name: &str) -> (Identity, Outbox, UnboundedReceiver<ServerMessage>) {
        let identity = Identity::new(name);
        let (tx, rx) = mpsc::unbounded_channel();
        lobby.connect(&identity, tx.clone());
        (identity, tx, rx)
    }

    fn topic() -> TopicKey {
        "math:algebra".parse().unwrap()
    }

    async fn next_of(rx: &mut UnboundedReceiver<ServerMessage>, kind: &str) -> ServerMessage {
        loop {
            let message = rx.recv().await.expect("outbox closed");
            if message.kind() == kind {
                return message;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_enqueues_start_a_match() {
        let lobby = lobby();
        let (ada, _, mut ada_rx) = connect(&lobby, "ada");
        let (bob, _, mut bob_rx) = connect(&lobby, "bob");

        lobby.enqueue(&ada, topic(), None).unwrap();
        assert!(matches!(
            ada_rx.recv().await,
            Some(ServerMessage::Queued { position: 1, .. })
        ));

        lobby.enqueue(&bob, topic(), Some(1500)).unwrap();
        let connected = next_of(&mut ada_rx, "connected").await;
        assert!(matches!(
            connected,
            ServerMessage::Connected { role: shared::Role::A, ref opponent, .. } if *opponent == bob
        ));
        next_of(&mut bob_rx, "round_start").await;
        assert_eq!(lobby.sessions().len(), 1);
        assert!(lobby.matchmaker().is_empty());

        let again = lobby.enqueue(&ada, topic(), None);
        assert!(matches!(
            again,
            Err(DuelError::Validation(ValidationError::AlreadyInMatch))
        ));
    }

    #[tokio::test]
    async fn test_in_match_commands_need_a_match() {
        let lobby = lobby();
        let (ada, _, _rx) = connect(&lobby, "ada");
        assert!(matches!(
            lobby.submit(&ada, 1, 0, 0),
            Err(DuelError::Validation(ValidationError::NoActiveMatch))
        ));
        assert!(lobby.sync(&ada).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_silent_queue_entries() {
        let lobby = lobby();
        let (ada, _, mut ada_rx) = connect(&lobby, "ada");
        lobby.enqueue(&ada, topic(), None).unwrap();
        ada_rx.recv().await;

        let policy = HeartbeatPolicy::new(Duration::from_millis(100), 2);
        assert_eq!(lobby.sweep_queue(&policy), 0);
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(lobby.sweep_queue(&policy), 1);
        assert_eq!(
            ada_rx.recv().await,
            Some(ServerMessage::QueueLeft { evicted: true })
        );
        assert!(lobby.matchmaker().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_leaves_the_queue() {
        let lobby = lobby();
        let (ada, ada_tx, _rx) = connect(&lobby, "ada");
        lobby.enqueue(&ada, topic(), None).unwrap();
        assert_eq!(lobby.matchmaker().len(), 1);

        lobby.disconnect(&ada, &ada_tx);
        assert!(lobby.matchmaker().is_empty());
        assert_eq!(lobby.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_newer_connection_replaces_older() {
        let lobby = lobby();
        let (ada, old_tx, mut old_rx) = connect(&lobby, "ada");
        assert!(lobby.is_current(&ada, &old_tx));
        let (_, new_tx, _new_rx) = connect(&lobby, "ada");

        assert!(matches!(
            old_rx.recv().await,
            Some(ServerMessage::Disconnected { .. })
        ));
        assert!(!lobby.is_current(&ada, &old_tx));
        assert!(lobby.is_current(&ada, &new_tx));
        lobby.disconnect(&ada, &old_tx);
        assert_eq!(lobby.connection_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replays_match_state() {
        let lobby = lobby();
        let (ada, _, _ada_rx) = connect(&lobby, "ada");
        let (bob, _, mut bob_rx) = connect(&lobby, "bob");
        lobby.enqueue(&ada, topic(), None).unwrap();
        lobby.enqueue(&bob, topic(), None).unwrap();
        next_of(&mut bob_rx, "round_start").await;

        let (_, _, mut fresh) = connect(&lobby, "ada");
        next_of(&mut fresh, "connected").await;
        next_of(&mut fresh, "round_start").await;
    }
}
