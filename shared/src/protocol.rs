//! Messages exchanged between participants and the match server
//!
//! Both enums are decoded strictly at the boundary (see [`crate::codec`]):
//! a frame either decodes into exactly one variant or is rejected. All
//! deadlines are absolute milliseconds since the UNIX epoch so that both
//! participants count down to the same instant regardless of latency.

use crate::types::{
    EndReason, Identity, MatchId, MatchSummary, ParticipantResult, Phase, QuestionStem, Role,
    RoundId, StepView, TopicKey,
};
use serde::{Deserialize, Serialize};

/// Messages sent by a participant's client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Must be the first message on a connection
    Authenticate {
        token: String,
        client_version: u32,
    },
    Enqueue {
        topic: TopicKey,
        skill_rating: Option<u32>,
    },
    LeaveQueue,
    Heartbeat,
    SubmitAnswer {
        /// Correlates the acknowledgement or rejection with this submission
        request_id: u32,
        step_index: usize,
        selected_option_index: usize,
    },
    /// Asks for a replay of the current match state
    SyncRequest,
    Disconnect,
}

/// Messages pushed by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Authenticated {
        identity: Identity,
    },
    Queued {
        topic: TopicKey,
        position: usize,
    },
    QueueLeft {
        /// True when the server removed the entry after missed heartbeats
        evicted: bool,
    },
    Connected {
        match_id: MatchId,
        role: Role,
        opponent: Identity,
        total_rounds: u32,
    },
    OpponentReady {
        opponent: Identity,
    },
    RoundStart {
        round_id: RoundId,
        round_index: u32,
        question: QuestionStem,
        thinking_ends_at: u64,
        /// Cumulative scores going into this round
        score_a: u32,
        score_b: u32,
    },
    PhaseChange {
        round_index: u32,
        phase: Phase,
        deadline: u64,
        step_index: usize,
        total_steps: usize,
        step: Option<StepView>,
    },
    AnswerAcknowledged {
        request_id: u32,
        step_index: usize,
        selected_option_index: usize,
    },
    RoundResult {
        round_index: u32,
        correct_option_indexes: Vec<usize>,
        results: Vec<ParticipantResult>,
        score_a: u32,
        score_b: u32,
        momentum: i32,
        result_ends_at: u64,
    },
    MatchEnd {
        winner_id: Option<Identity>,
        reason: EndReason,
        summary: MatchSummary,
    },
    OpponentDisconnected {
        reason: EndReason,
        forfeit_to_you: bool,
        /// Set when the opponent may still come back before this instant
        grace_ends_at: Option<u64>,
    },
    OpponentReconnected,
    ValidationError {
        request_id: Option<u32>,
        message: String,
    },
    Disconnected {
        reason: String,
    },
}

impl ServerMessage {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Authenticated { .. } => "authenticated",
            ServerMessage::Queued { .. } => "queued",
            ServerMessage::QueueLeft { .. } => "queue_left",
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::OpponentReady { .. } => "opponent_ready",
            ServerMessage::RoundStart { .. } => "round_start",
            ServerMessage::PhaseChange { .. } => "phase_change",
            ServerMessage::AnswerAcknowledged { .. } => "answer_acknowledged",
            ServerMessage::RoundResult { .. } => "round_result",
            ServerMessage::MatchEnd { .. } => "match_end",
            ServerMessage::OpponentDisconnected { .. } => "opponent_disconnected",
            ServerMessage::OpponentReconnected => "opponent_reconnected",
            ServerMessage::ValidationError { .. } => "validation_error",
            ServerMessage::Disconnected { .. } => "disconnected",
        }
    }
}
