//! Hand-off of finished match outcomes to the score/rank ledger
//!
//! The server does not compute rating deltas. It reports the raw outcome
//! once per match, after `MatchEnd` has been sent.

use log::info;
use shared::{EndReason, Identity, MatchId};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchOutcome {
    pub match_id: MatchId,
    pub participant_a: Identity,
    pub participant_b: Identity,
    pub winner_id: Option<Identity>,
    pub score_a: u32,
    pub score_b: u32,
    pub reason: EndReason,
}

pub trait ScoreLedger: Send + Sync {
    fn record(&self, outcome: MatchOutcome);
}

/// Writes outcomes to the log
#[derive(Debug, Default)]
pub struct LogLedger;

impl ScoreLedger for LogLedger {
    fn record(&self, outcome: MatchOutcome) {
        let winner = outcome
            .winner_id
            .as_ref()
            .map(Identity::to_string)
            .unwrap_or_else(|| "nobody".to_string());
        info!(
            "Match {} ({}) {} vs {}: {}-{}, winner {}",
            outcome.match_id,
            outcome.reason,
            outcome.participant_a,
            outcome.participant_b,
            outcome.score_a,
            outcome.score_b,
            winner
        );
    }
}

/// Keeps outcomes in memory; handy for tests and local tooling
#[derive(Debug, Default)]
pub struct MemoryLedger {
    outcomes: Mutex<Vec<MatchOutcome>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcomes(&self) -> Vec<MatchOutcome> {
        self.outcomes
            .lock()
            .map(|outcomes| outcomes.clone())
            .unwrap_or_default()
    }
}

impl ScoreLedger for MemoryLedger {
    fn record(&self, outcome: MatchOutcome) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.push(outcome);
        }
    }
}
