//! Liveness tracking for participants
//!
//! A `PresenceMonitor` records when each tracked key was last heard from and
//! reports keys that have been silent for longer than the heartbeat policy
//! allows. Each match task owns one keyed by participant role; the queue
//! applies the same [`HeartbeatPolicy`] to its entries directly.

use crate::config::HeartbeatPolicy;
use std::collections::HashMap;
use std::hash::Hash;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Liveness {
    last_seen: Instant,
    /// Set once the key has been reported lapsed, so it is reported only once
    lapsed: bool,
}

#[derive(Debug, Clone)]
pub struct PresenceMonitor<K> {
    policy: HeartbeatPolicy,
    tracked: HashMap<K, Liveness>,
}

impl<K> PresenceMonitor<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new(policy: HeartbeatPolicy) -> Self {
        Self {
            policy,
            tracked: HashMap::new(),
        }
    }

    /// Records a liveness signal. Returns true if the key had previously been
    /// reported lapsed, i.e. this is a comeback.
    pub fn touch(&mut self, key: K, now: Instant) -> bool {
        let entry = self.tracked.entry(key).or_insert(Liveness {
            last_seen: now,
            lapsed: false,
        });
        let was_lapsed = entry.lapsed;
        entry.last_seen = now;
        entry.lapsed = false;
        was_lapsed
    }

    pub fn forget(&mut self, key: &K) {
        self.tracked.remove(key);
    }

    pub fn is_lapsed(&self, key: &K) -> bool {
        self.tracked.get(key).map(|l| l.lapsed).unwrap_or(false)
    }

    pub fn last_seen(&self, key: &K) -> Option<Instant> {
        self.tracked.get(key).map(|l| l.last_seen)
    }

    /// Keys that crossed the lapse threshold since the last call
    pub fn newly_lapsed(&mut self, now: Instant) -> Vec<K> {
        let policy = self.policy;
        self.tracked
            .iter_mut()
            .filter(|(_, l)| !l.lapsed && policy.is_lapsed(l.last_seen, now))
            .map(|(key, l)| {
                l.lapsed = true;
                key.clone()
            })
            .collect()
    }

    pub fn all_lapsed(&self) -> bool {
        !self.tracked.is_empty() && self.tracked.values().all(|l| l.lapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn monitor() -> PresenceMonitor<&'static str> {
        PresenceMonitor::new(HeartbeatPolicy::new(Duration::from_secs(1), 3))
    }

    #[test]
    fn test_lapse_reported_once() {
        let mut presence = monitor();
        let start = Instant::now();
        presence.touch("ada", start);
        presence.touch("bob", start);

        presence.touch("ada", start + Duration::from_secs(2));
        let lapsed = presence.newly_lapsed(start + Duration::from_secs(3));
        assert_eq!(lapsed, vec!["bob"]);
        assert!(presence.is_lapsed(&"bob"));
        assert_eq!(presence.last_seen(&"bob"), Some(start));

        assert!(presence
            .newly_lapsed(start + Duration::from_secs(4))
            .is_empty());
    }

    #[test]
    fn test_touch_after_lapse_is_a_comeback() {
        let mut presence = monitor();
        let start = Instant::now();
        presence.touch("ada", start);
        presence.newly_lapsed(start + Duration::from_secs(10));

        assert!(presence.touch("ada", start + Duration::from_secs(11)));
        assert!(!presence.is_lapsed(&"ada"));
        assert!(!presence.touch("ada", start + Duration::from_secs(12)));
    }

    #[test]
    fn test_all_lapsed() {
        let mut presence = monitor();
        let start = Instant::now();
        assert!(!presence.all_lapsed());

        presence.touch("ada", start);
        presence.touch("bob", start);
        presence.newly_lapsed(start + Duration::from_secs(5));
        assert!(presence.all_lapsed());

        presence.forget(&"bob");
        presence.touch("ada", start + Duration::from_secs(6));
        assert!(!presence.all_lapsed());
    }
}
