//! Client-side battle state
//!
//! Everything a client displays is derived here by folding server events
//! through [`reduce`]. The reducer is pure: it never reads a clock or touches
//! the network, so replayed or duplicated events converge on the same state.

use shared::{
    EndReason, Identity, MatchId, MatchSummary, ParticipantResult, Phase, QuestionStem, Role,
    RoundId, ServerMessage, StepView, TopicKey,
};

/// Where the client is in its overall lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientPhase {
    #[default]
    Idle,
    Authenticated,
    Queued,
    /// Paired, waiting for the opponent to join
    MatchFound,
    InBattle,
    Finished,
    Disconnected,
}

/// An answer that has been sent but not yet acknowledged or rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingSubmission {
    pub request_id: u32,
    pub step_index: usize,
    pub selected_option_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Server(ServerMessage),
    /// The local participant picked an option and it is being sent
    SubmitRequested(PendingSubmission),
    ConnectionLost,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientBattleState {
    pub phase: ClientPhase,
    pub identity: Option<Identity>,
    pub topic: Option<TopicKey>,
    pub queue_position: Option<usize>,

    pub match_id: Option<MatchId>,
    pub role: Option<Role>,
    pub opponent: Option<Identity>,
    pub opponent_present: bool,
    /// Set while the opponent is away but may still come back
    pub opponent_grace_ends_at: Option<u64>,
    pub total_rounds: u32,

    pub current_round: u32,
    pub round_id: Option<RoundId>,
    pub current_question: Option<QuestionStem>,
    pub round_phase: Option<Phase>,
    /// Absolute epoch milliseconds, as sent by the server
    pub phase_deadline: Option<u64>,
    pub current_step_index: usize,
    pub current_step: Option<StepView>,
    pub selected_answer: Option<usize>,
    pub correct_answers: Vec<usize>,
    pub last_results: Vec<ParticipantResult>,
    pub pending: Option<PendingSubmission>,

    /// Participant A's cumulative score
    pub p1_score: u32,
    /// Participant B's cumulative score
    pub p2_score: u32,
    pub momentum: i32,

    pub winner_id: Option<Identity>,
    pub end_reason: Option<EndReason>,
    pub summary: Option<MatchSummary>,

    pub last_error: Option<String>,
    pub disconnect_reason: Option<String>,
}

impl ClientBattleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_submitting(&self) -> bool {
        self.pending.is_some()
    }

    /// True when an answer for the current step may be sent
    pub fn can_submit(&self) -> bool {
        self.phase == ClientPhase::InBattle
            && self.round_phase == Some(Phase::Choosing)
            && self.current_step.is_some()
            && self.selected_answer.is_none()
            && self.pending.is_none()
    }

    pub fn my_score(&self) -> u32 {
        match self.role {
            Some(Role::B) => self.p2_score,
            _ => self.p1_score,
        }
    }

    pub fn opponent_score(&self) -> u32 {
        match self.role {
            Some(Role::B) => self.p1_score,
            _ => self.p2_score,
        }
    }

    pub fn won(&self) -> Option<bool> {
        if self.phase != ClientPhase::Finished {
            return None;
        }
        Some(self.winner_id.is_some() && self.winner_id == self.identity)
    }

    fn in_match(&self) -> bool {
        matches!(self.phase, ClientPhase::MatchFound | ClientPhase::InBattle)
    }

    /// Clears everything that belongs to the current question
    fn reset_question(&mut self) {
        self.current_step_index = 0;
        self.current_step = None;
        self.selected_answer = None;
        self.correct_answers.clear();
        self.last_results.clear();
        self.pending = None;
    }

    /// Clears everything that belongs to a match, keeping who we are
    fn reset_match(&mut self) {
        *self = ClientBattleState {
            identity: self.identity.take(),
            topic: self.topic.take(),
            ..ClientBattleState::default()
        };
    }

    fn raise_scores(&mut self, score_a: u32, score_b: u32) {
        self.p1_score = self.p1_score.max(score_a);
        self.p2_score = self.p2_score.max(score_b);
    }
}

/// Folds one event into the state
pub fn reduce(mut state: ClientBattleState, event: &ClientEvent) -> ClientBattleState {
    match event {
        ClientEvent::Server(message) => apply_server_message(&mut state, message),
        ClientEvent::SubmitRequested(submission) => {
            if state.can_submit() && submission.step_index == state.current_step_index {
                state.pending = Some(*submission);
                state.last_error = None;
            }
        }
        ClientEvent::ConnectionLost => {
            state.phase = ClientPhase::Disconnected;
            state.pending = None;
            state.disconnect_reason = Some("connection lost".to_string());
        }
    }
    state
}

fn apply_server_message(state: &mut ClientBattleState, message: &ServerMessage) {
    match message {
        ServerMessage::Authenticated { identity } => {
            state.identity = Some(identity.clone());
            state.disconnect_reason = None;
            if matches!(state.phase, ClientPhase::Idle | ClientPhase::Disconnected) {
                state.phase = ClientPhase::Authenticated;
            }
        }

        ServerMessage::Queued { topic, position } => {
            if state.in_match() {
                return;
            }
            if state.phase == ClientPhase::Finished {
                state.reset_match();
            }
            state.phase = ClientPhase::Queued;
            state.topic = Some(topic.clone());
            state.queue_position = Some(*position);
        }

        ServerMessage::QueueLeft { evicted } => {
            if state.phase != ClientPhase::Queued {
                return;
            }
            state.phase = ClientPhase::Authenticated;
            state.queue_position = None;
            if *evicted {
                state.last_error = Some("removed from the queue after missed heartbeats".to_string());
            }
        }

        ServerMessage::Connected {
            match_id,
            role,
            opponent,
            total_rounds,
        } => {
            if state.match_id == Some(*match_id) {
                // Replay of a match we already track
                if state.phase == ClientPhase::Finished {
                    return;
                }
                if state.phase == ClientPhase::Disconnected || state.phase == ClientPhase::Authenticated {
                    state.phase = ClientPhase::MatchFound;
                }
            } else {
                state.reset_match();
                state.match_id = Some(*match_id);
                state.phase = ClientPhase::MatchFound;
            }
            state.role = Some(*role);
            state.opponent = Some(opponent.clone());
            state.total_rounds = *total_rounds;
            state.queue_position = None;
        }

        ServerMessage::OpponentReady { opponent } => {
            if !state.in_match() {
                return;
            }
            state.opponent = Some(opponent.clone());
            state.opponent_present = true;
            state.phase = ClientPhase::InBattle;
        }

        ServerMessage::RoundStart {
            round_id,
            round_index,
            question,
            thinking_ends_at,
            score_a,
            score_b,
        } => {
            if !state.in_match() || *round_index < state.current_round {
                return;
            }
            state.phase = ClientPhase::InBattle;
            state.current_round = *round_index;
            state.round_id = Some(*round_id);
            state.current_question = Some(question.clone());
            state.round_phase = Some(Phase::Thinking);
            state.phase_deadline = Some(*thinking_ends_at);
            state.reset_question();
            state.raise_scores(*score_a, *score_b);
        }

        ServerMessage::PhaseChange {
            round_index,
            phase,
            deadline,
            step_index,
            step,
            ..
        } => {
            if !state.in_match() || *round_index < state.current_round {
                return;
            }
            if *round_index == state.current_round {
                match state.round_phase {
                    Some(Phase::Result) => return,
                    Some(Phase::Choosing) if *step_index < state.current_step_index => return,
                    _ => {}
                }
            }
            if *round_index != state.current_round || *step_index != state.current_step_index {
                state.selected_answer = None;
                state.pending = None;
            }
            state.phase = ClientPhase::InBattle;
            state.current_round = *round_index;
            state.round_phase = Some(*phase);
            state.phase_deadline = Some(*deadline);
            state.current_step_index = *step_index;
            state.current_step = step.clone();
        }

        ServerMessage::AnswerAcknowledged {
            request_id,
            step_index,
            selected_option_index,
        } => {
            if state.pending.map(|p| p.request_id) == Some(*request_id) {
                state.pending = None;
            }
            if state.round_phase != Some(Phase::Choosing) || *step_index != state.current_step_index {
                return;
            }
            state.selected_answer = Some(*selected_option_index);
            state.last_error = None;
        }

        ServerMessage::RoundResult {
            round_index,
            correct_option_indexes,
            results,
            score_a,
            score_b,
            momentum,
            result_ends_at,
        } => {
            if !state.in_match() || *round_index < state.current_round {
                return;
            }
            state.current_round = *round_index;
            state.round_phase = Some(Phase::Result);
            state.phase_deadline = Some(*result_ends_at);
            state.correct_answers = correct_option_indexes.clone();
            state.last_results = results.clone();
            state.pending = None;
            state.raise_scores(*score_a, *score_b);
            state.momentum = *momentum;
        }

        ServerMessage::MatchEnd {
            winner_id,
            reason,
            summary,
        } => {
            if state.match_id.is_some() && state.match_id != Some(summary.match_id) {
                return;
            }
            state.phase = ClientPhase::Finished;
            state.match_id = Some(summary.match_id);
            state.winner_id = winner_id.clone();
            state.end_reason = Some(*reason);
            state.raise_scores(summary.score_a, summary.score_b);
            state.momentum = summary.momentum;
            state.summary = Some(summary.clone());
            state.pending = None;
            state.phase_deadline = None;
        }

        ServerMessage::OpponentDisconnected { grace_ends_at, .. } => {
            if !state.in_match() {
                return;
            }
            state.opponent_present = false;
            state.opponent_grace_ends_at = *grace_ends_at;
        }

        ServerMessage::OpponentReconnected => {
            if !state.in_match() {
                return;
            }
            state.opponent_present = true;
            state.opponent_grace_ends_at = None;
        }

        ServerMessage::ValidationError {
            request_id,
            message,
        } => {
            let clears = match (request_id, state.pending) {
                (_, None) => false,
                (None, Some(_)) => true,
                (Some(id), Some(pending)) => *id == pending.request_id,
            };
            if clears {
                state.pending = None;
            }
            state.last_error = Some(message.clone());
        }

        ServerMessage::Disconnected { reason } => {
            state.phase = ClientPhase::Disconnected;
            state.pending = None;
            state.disconnect_reason = Some(reason.clone());
        }
    }
}
