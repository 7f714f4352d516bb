//! Server and match tuning knobs
//!
//! The binary fills these from command-line flags; tests build them directly,
//! usually starting from `Default` and shrinking the durations.

use std::time::Duration;
use tokio::time::Instant;

/// How often participants are expected to heartbeat and how many beats they
/// may miss before they are considered gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    pub interval: Duration,
    pub max_missed: u32,
}

impl HeartbeatPolicy {
    pub fn new(interval: Duration, max_missed: u32) -> Self {
        Self {
            interval,
            max_missed: max_missed.max(1),
        }
    }

    /// Silence longer than this means the participant is gone
    pub fn timeout(&self) -> Duration {
        self.interval * self.max_missed
    }

    pub fn is_lapsed(&self, last_seen: Instant, now: Instant) -> bool {
        now.saturating_duration_since(last_seen) >= self.timeout()
    }
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), 3)
    }
}

/// Per-match timing and rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchConfig {
    pub max_rounds: u32,
    /// Read-only period at the start of each round before options appear
    pub thinking_time: Duration,
    /// How long round results stay on screen
    pub result_time: Duration,
    pub heartbeat: HeartbeatPolicy,
    /// Window a disconnected participant has to come back before forfeiting.
    /// Only offered before the scoring midpoint; zero disables it.
    pub reconnect_grace: Duration,
    /// Both participants must attach within this window or the match aborts
    pub attach_timeout: Duration,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            thinking_time: Duration::from_secs(5),
            result_time: Duration::from_secs(4),
            heartbeat: HeartbeatPolicy::default(),
            reconnect_grace: Duration::from_secs(15),
            attach_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_connections: usize,
    /// Queue entries that stop heartbeating are evicted under this policy
    pub queue_heartbeat: HeartbeatPolicy,
    pub matches: MatchConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            max_connections: 1024,
            queue_heartbeat: HeartbeatPolicy::default(),
            matches: MatchConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_timeout() {
        let policy = HeartbeatPolicy::new(Duration::from_secs(2), 3);
        assert_eq!(policy.timeout(), Duration::from_secs(6));

        let start = Instant::now();
        assert!(!policy.is_lapsed(start, start + Duration::from_secs(5)));
        assert!(policy.is_lapsed(start, start + Duration::from_secs(6)));
    }

    #[test]
    fn test_heartbeat_requires_at_least_one_missed_beat() {
        let policy = HeartbeatPolicy::new(Duration::from_millis(500), 0);
        assert_eq!(policy.max_missed, 1);
        assert_eq!(policy.timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.matches.max_rounds, 3);
        assert!(config.matches.reconnect_grace > Duration::ZERO);
        assert!(config.max_connections > 0);
    }
}
