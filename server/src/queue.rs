//! Matchmaking queue and pairing engine
//!
//! The queue is the only structure touched by every connection at once, so it
//! lives behind a single mutex inside [`Matchmaker`]. A pairing pass is split
//! into an observe step (find the oldest compatible entry) and a commit step
//! (remove both entries and mint the match). The commit re-checks that both
//! entries are still present under the lock; if another pass got there first
//! it reports a [`DuelError::ConcurrencyConflict`] and the pass starts over.
//!
//! Pairing is strict FIFO per topic. Skill ratings are recorded with each
//! entry but deliberately do not gate pairing: wait-time fairness outranks
//! match quality, and the rating is reserved for a future matching-quality
//! extension.

use crate::config::HeartbeatPolicy;
use crate::error::{DuelError, Result};
use log::{debug, info, warn};
use shared::{Identity, MatchId, TopicKey};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

/// How many times a pass re-observes the queue after losing a race
const MAX_PAIRING_ATTEMPTS: u32 = 3;

/// A participant waiting to be paired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// Insertion order; also the identity of this particular entry
    pub seq: u64,
    pub identity: Identity,
    pub topic: TopicKey,
    pub enqueued_at: Instant,
    pub skill_rating: Option<u32>,
    pub last_heartbeat_at: Instant,
}

/// Two consumed queue entries that now form a match
#[derive(Debug, Clone)]
pub struct PairedMatch {
    pub match_id: MatchId,
    pub topic: TopicKey,
    /// The longer-waiting participant
    pub participant_a: QueueEntry,
    pub participant_b: QueueEntry,
    pub created_at: Instant,
}

impl PairedMatch {
    fn new(match_id: MatchId, a: QueueEntry, b: QueueEntry, now: Instant) -> Result<Self> {
        if a.identity == b.identity {
            return Err(DuelError::InternalInvariantViolation(format!(
                "pairing produced a self-match for {}",
                a.identity
            )));
        }
        if a.topic != b.topic {
            return Err(DuelError::InternalInvariantViolation(format!(
                "pairing crossed topics {} and {}",
                a.topic, b.topic
            )));
        }
        Ok(Self {
            match_id,
            topic: a.topic.clone(),
            participant_a: a,
            participant_b: b,
            created_at: now,
        })
    }

    pub fn identities(&self) -> (&Identity, &Identity) {
        (&self.participant_a.identity, &self.participant_b.identity)
    }
}

#[derive(Debug)]
pub enum EnqueueOutcome {
    Queued { position: usize },
    Matched(PairedMatch),
    /// The requester's entry was consumed by a concurrent pass that is
    /// already building the match
    PairedElsewhere,
}

/// Waiting entries, ordered by insertion
#[derive(Debug, Default)]
pub struct QueueStore {
    entries: BTreeMap<u64, QueueEntry>,
    next_seq: u64,
}

impl QueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry, or refreshes the existing one for this identity.
    ///
    /// A refresh on the same topic keeps the original place in line; moving
    /// to another topic re-queues at the back.
    pub fn upsert(
        &mut self,
        identity: Identity,
        topic: TopicKey,
        skill_rating: Option<u32>,
        now: Instant,
    ) -> QueueEntry {
        let existing: Vec<u64> = self
            .entries
            .values()
            .filter(|e| e.identity == identity)
            .map(|e| e.seq)
            .collect();

        for seq in existing {
            let same_topic = self.entries.get(&seq).map(|e| e.topic == topic);
            if same_topic == Some(true) {
                if let Some(entry) = self.entries.get_mut(&seq) {
                    entry.skill_rating = skill_rating;
                    entry.last_heartbeat_at = now;
                    return entry.clone();
                }
            }
            self.entries.remove(&seq);
        }

        self.insert(identity, topic, skill_rating, now)
    }

    fn insert(
        &mut self,
        identity: Identity,
        topic: TopicKey,
        skill_rating: Option<u32>,
        now: Instant,
    ) -> QueueEntry {
        self.next_seq += 1;
        let entry = QueueEntry {
            seq: self.next_seq,
            identity,
            topic,
            enqueued_at: now,
            skill_rating,
            last_heartbeat_at: now,
        };
        self.entries.insert(entry.seq, entry.clone());
        entry
    }

    /// Removes every entry for `identity`. Returns whether anything was removed.
    pub fn remove_identity(&mut self, identity: &Identity) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, e| &e.identity != identity);
        self.entries.len() != before
    }

    pub fn touch(&mut self, identity: &Identity, now: Instant) -> bool {
        let mut found = false;
        for entry in self.entries.values_mut().filter(|e| &e.identity == identity) {
            entry.last_heartbeat_at = now;
            found = true;
        }
        found
    }

    pub fn get(&self, seq: u64) -> Option<&QueueEntry> {
        self.entries.get(&seq)
    }

    pub fn entry_for(&self, identity: &Identity) -> Option<&QueueEntry> {
        self.entries.values().find(|e| &e.identity == identity)
    }

    /// 1-based place in line within the entry's topic
    pub fn position(&self, seq: u64) -> Option<usize> {
        let entry = self.entries.get(&seq)?;
        Some(
            self.entries
                .range(..=seq)
                .filter(|(_, e)| e.topic == entry.topic)
                .count(),
        )
    }

    /// Oldest waiting entry on the requester's topic that belongs to someone else.
    ///
    /// The identity filter holds even if the store transiently contains two
    /// entries for the requester.
    pub fn find_candidate(&self, requester: &QueueEntry) -> Option<&QueueEntry> {
        self.entries
            .values()
            .filter(|e| e.topic == requester.topic)
            .find(|e| e.identity != requester.identity)
    }

    /// Atomically removes both entries, oldest first, or fails without
    /// touching the store if either one is already gone.
    pub fn take_pair(&mut self, first: u64, second: u64) -> Result<(QueueEntry, QueueEntry)> {
        for seq in [first, second] {
            if !self.entries.contains_key(&seq) {
                return Err(DuelError::ConcurrencyConflict(seq));
            }
        }
        let (older, newer) = if first < second {
            (first, second)
        } else {
            (second, first)
        };
        match (self.entries.remove(&older), self.entries.remove(&newer)) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(DuelError::InternalInvariantViolation(
                "queue entry vanished while the store was locked".to_string(),
            )),
        }
    }

    /// Removes and returns entries whose heartbeat lapsed under `policy`
    pub fn evict_lapsed(&mut self, policy: &HeartbeatPolicy, now: Instant) -> Vec<QueueEntry> {
        let lapsed: Vec<u64> = self
            .entries
            .values()
            .filter(|e| policy.is_lapsed(e.last_heartbeat_at, now))
            .map(|e| e.seq)
            .collect();

        lapsed
            .into_iter()
            .filter_map(|seq| self.entries.remove(&seq))
            .collect()
    }

    pub fn waiting(&self, topic: &TopicKey) -> usize {
        self.entries.values().filter(|e| &e.topic == topic).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bypasses the uniqueness check to reproduce the duplicate-entry race
    #[cfg(test)]
    pub(crate) fn insert_duplicate(&mut self, identity: Identity, topic: TopicKey, now: Instant) {
        self.insert(identity, topic, None, now);
    }
}

/// Thread-safe front of the queue store: enqueue, leave, heartbeat and pairing
#[derive(Debug, Default)]
pub struct Matchmaker {
    store: Mutex<QueueStore>,
}

impl Matchmaker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueStore> {
        // A panic while holding the lock cannot leave the map half-updated:
        // every mutation is a single BTreeMap call.
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds or refreshes the participant's entry and tries to pair it
    pub fn enqueue(
        &self,
        identity: Identity,
        topic: TopicKey,
        skill_rating: Option<u32>,
    ) -> Result<EnqueueOutcome> {
        let requester = self
            .lock()
            .upsert(identity, topic, skill_rating, Instant::now());
        debug!(
            "{} waiting on {} (entry {}, rating {:?})",
            requester.identity, requester.topic, requester.seq, requester.skill_rating
        );
        self.pairing_pass(&requester)
    }

    /// Looks for the oldest opponent for `requester` and commits the pair.
    ///
    /// Losing a race to another pass is retried transparently; after
    /// [`MAX_PAIRING_ATTEMPTS`] the requester simply stays queued.
    pub fn pairing_pass(&self, requester: &QueueEntry) -> Result<EnqueueOutcome> {
        for attempt in 1..=MAX_PAIRING_ATTEMPTS {
            let candidate = {
                let store = self.lock();
                let Some(me) = store.get(requester.seq) else {
                    return Ok(EnqueueOutcome::PairedElsewhere);
                };
                match store.find_candidate(me) {
                    Some(candidate) => candidate.seq,
                    None => {
                        let position = store.position(me.seq).unwrap_or(1);
                        return Ok(EnqueueOutcome::Queued { position });
                    }
                }
            };

            let taken = self.lock().take_pair(candidate, requester.seq);
            match taken {
                Ok((a, b)) => {
                    let paired =
                        PairedMatch::new(MatchId(rand::random()), a, b, Instant::now())?;
                    info!(
                        "Paired {} with {} on {} as match {}",
                        paired.participant_a.identity,
                        paired.participant_b.identity,
                        paired.topic,
                        paired.match_id
                    );
                    return Ok(EnqueueOutcome::Matched(paired));
                }
                Err(DuelError::ConcurrencyConflict(seq)) => {
                    debug!(
                        "Pairing pass for {} lost entry {} (attempt {})",
                        requester.identity, seq, attempt
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let store = self.lock();
        match store.position(requester.seq) {
            Some(position) => Ok(EnqueueOutcome::Queued { position }),
            None => Ok(EnqueueOutcome::PairedElsewhere),
        }
    }

    pub fn leave(&self, identity: &Identity) -> bool {
        let removed = self.lock().remove_identity(identity);
        if removed {
            info!("{} left the queue", identity);
        }
        removed
    }

    pub fn heartbeat(&self, identity: &Identity) -> bool {
        self.lock().touch(identity, Instant::now())
    }

    pub fn is_waiting(&self, identity: &Identity) -> bool {
        self.lock().entry_for(identity).is_some()
    }

    /// Drops entries whose owners stopped heartbeating
    pub fn evict_lapsed(&self, policy: &HeartbeatPolicy) -> Vec<QueueEntry> {
        let evicted = self.lock().evict_lapsed(policy, Instant::now());
        for entry in &evicted {
            warn!(
                "Evicted {} from the {} queue after missed heartbeats",
                entry.identity, entry.topic
            );
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
