//! Text rendering of the battle state for the terminal client

use crate::state::{ClientBattleState, ClientPhase};
use shared::{epoch_millis, EndReason, Phase};
use std::fmt::Write;

/// Seconds left until `deadline`, rounded up
pub fn seconds_left(deadline: u64, now_ms: u64) -> u64 {
    deadline.saturating_sub(now_ms).saturating_add(999) / 1000
}

/// Human-readable summary of `state` as of `now_ms`
pub fn describe(state: &ClientBattleState, now_ms: u64) -> String {
    let mut out = String::new();
    let who = state
        .identity
        .as_ref()
        .map(|i| i.to_string())
        .unwrap_or_else(|| "?".to_string());

    match state.phase {
        ClientPhase::Idle => out.push_str("Connecting..."),
        ClientPhase::Authenticated => {
            let _ = write!(out, "Signed in as {}", who);
        }
        ClientPhase::Queued => {
            let topic = state
                .topic
                .as_ref()
                .map(|t| t.to_string())
                .unwrap_or_default();
            let _ = write!(
                out,
                "Waiting for an opponent on {} (position {})",
                topic,
                state.queue_position.unwrap_or(1)
            );
        }
        ClientPhase::MatchFound => {
            let opponent = state.opponent.as_ref().map(|o| o.to_string()).unwrap_or_default();
            let _ = write!(out, "Matched with {}, waiting for them to join", opponent);
        }
        ClientPhase::InBattle => describe_battle(&mut out, state, now_ms),
        ClientPhase::Finished => {
            // Only a completed match without a winner is a draw
            let outcome = match (state.won(), &state.winner_id, state.end_reason) {
                (Some(true), _, _) => "You won",
                (_, Some(_), _) => "You lost",
                (_, None, Some(EndReason::Completed)) => "Draw",
                (_, None, Some(EndReason::Aborted)) => "Match aborted",
                (_, None, Some(EndReason::Abandoned)) => "Match abandoned",
                _ => "Match over",
            };
            let reason = state.end_reason.map(|r| r.to_string()).unwrap_or_default();
            let _ = write!(
                out,
                "{} {}-{} ({})",
                outcome,
                state.my_score(),
                state.opponent_score(),
                reason
            );
        }
        ClientPhase::Disconnected => {
            let _ = write!(
                out,
                "Disconnected: {}",
                state.disconnect_reason.as_deref().unwrap_or("unknown reason")
            );
        }
    }

    if let Some(error) = &state.last_error {
        let _ = write!(out, "\n  ! {}", error);
    }
    out
}

fn describe_battle(out: &mut String, state: &ClientBattleState, now_ms: u64) {
    let _ = write!(
        out,
        "Round {}/{}  you {} - {} them  momentum {:+}",
        state.current_round,
        state.total_rounds,
        state.my_score(),
        state.opponent_score(),
        state.momentum
    );
    if !state.opponent_present {
        match state.opponent_grace_ends_at {
            Some(until) => {
                let _ = write!(
                    out,
                    "\n  Opponent disconnected, {}s to come back",
                    seconds_left(until, now_ms)
                );
            }
            None => out.push_str("\n  Opponent disconnected"),
        }
    }
    if let Some(question) = &state.current_question {
        let _ = write!(out, "\n  {}", question.stem);
    }
    let remaining = state
        .phase_deadline
        .map(|deadline| seconds_left(deadline, now_ms))
        .unwrap_or(0);

    match state.round_phase {
        Some(Phase::Thinking) => {
            let _ = write!(out, "\n  Read the question... options in {}s", remaining);
        }
        Some(Phase::Choosing) => {
            if let Some(step) = &state.current_step {
                let total = state
                    .current_question
                    .as_ref()
                    .map(|q| q.total_steps)
                    .unwrap_or(1);
                let _ = write!(
                    out,
                    "\n  Step {}/{} ({} marks, {}s): {}",
                    state.current_step_index + 1,
                    total,
                    step.marks,
                    remaining,
                    step.prompt
                );
                for (i, option) in step.options.iter().enumerate() {
                    let marker = if state.selected_answer == Some(i) { '*' } else { ' ' };
                    let _ = write!(out, "\n   {}[{}] {}", marker, i, option);
                }
                if state.is_submitting() {
                    out.push_str("\n  Sending answer...");
                }
            }
        }
        Some(Phase::Result) => {
            let _ = write!(out, "\n  Correct answers: {:?}", state.correct_answers);
            for result in &state.last_results {
                let right = result.correct.iter().filter(|c| **c).count();
                let _ = write!(
                    out,
                    "\n   {} got {}/{} steps (+{})",
                    result.identity,
                    right,
                    result.correct.len(),
                    result.round_score
                );
            }
        }
        None => {}
    }
}

/// Prints the state whenever its description changes
#[derive(Debug, Default)]
pub struct Renderer {
    last: String,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(&mut self, state: &ClientBattleState) {
        let text = describe(state, epoch_millis());
        if text != self.last {
            println!("{}\n", text);
            self.last = text;
        }
    }
}
