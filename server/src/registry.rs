//! Discovery of running match tasks
//!
//! The registry only stores command channels. Match state itself is owned by
//! each match task and is never reachable through here.

use crate::error::DuelError;
use crate::session::SessionCommand;
use shared::{Identity, MatchId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Command channel into one match task
#[derive(Debug, Clone)]
pub struct SessionHandle {
    match_id: MatchId,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn new(match_id: MatchId, commands: mpsc::UnboundedSender<SessionCommand>) -> Self {
        Self { match_id, commands }
    }

    pub fn match_id(&self) -> MatchId {
        self.match_id
    }

    pub fn send(&self, command: SessionCommand) -> Result<(), DuelError> {
        self.commands
            .send(command)
            .map_err(|_| DuelError::SessionClosed(self.match_id))
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

#[derive(Debug, Default)]
struct Entries {
    sessions: HashMap<MatchId, SessionHandle>,
    by_identity: HashMap<Identity, MatchId>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    entries: Arc<Mutex<Entries>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, handle: SessionHandle, participants: [&Identity; 2]) {
        let mut entries = self.lock();
        for identity in participants {
            entries.by_identity.insert(identity.clone(), handle.match_id);
        }
        entries.sessions.insert(handle.match_id, handle);
    }

    /// Forgets a finished match and its participants' routing
    pub fn remove(&self, match_id: MatchId) {
        let mut entries = self.lock();
        entries.sessions.remove(&match_id);
        entries.by_identity.retain(|_, id| *id != match_id);
    }

    pub fn get(&self, match_id: MatchId) -> Option<SessionHandle> {
        self.lock().sessions.get(&match_id).cloned()
    }

    /// The live match `identity` is playing, if any
    pub fn session_for(&self, identity: &Identity) -> Option<SessionHandle> {
        let entries = self.lock();
        let match_id = entries.by_identity.get(identity)?;
        entries
            .sessions
            .get(match_id)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }
}
