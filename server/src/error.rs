//! Error taxonomy for the match server
//!
//! `ValidationError` never leaves the match or connection that produced it:
//! it is turned into a `ValidationError` message for the sender only.
//! Everything else is a `DuelError`.

use shared::{FrameError, Identity, Phase, TopicKey, TopicKeyError};
use thiserror::Error;

/// A client message that is well-formed on the wire but not acceptable now
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("answers are not accepted during the {0} phase")]
    WrongPhase(Phase),
    #[error("match is not running")]
    MatchNotActive,
    #[error("step {submitted} is not the active step (active step is {active})")]
    WrongStep { submitted: usize, active: usize },
    #[error("step {0} is closed")]
    StepClosed(usize),
    #[error("step {0} was already answered")]
    DuplicateSubmission(usize),
    #[error("option {index} is out of range for a step with {options} options")]
    OptionOutOfRange { index: usize, options: usize },
    #[error("{0} is not a participant of this match")]
    NotParticipant(Identity),
    #[error("not currently in a match")]
    NoActiveMatch,
    #[error("already playing a match")]
    AlreadyInMatch,
    #[error("authenticate before sending other messages")]
    NotAuthenticated,
    #[error("already authenticated")]
    AlreadyAuthenticated,
    #[error(transparent)]
    Topic(#[from] TopicKeyError),
}

#[derive(Debug, Error)]
pub enum DuelError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Lost a pairing race; the participant stays queued
    #[error("queue entry {0} was consumed by a concurrent pairing pass")]
    ConcurrencyConflict(u64),
    #[error("{0} stopped heartbeating")]
    PresenceTimeout(Identity),
    #[error("no question available for topic {0}")]
    SequencerUnavailable(TopicKey),
    /// Must never happen; treated as fatal by callers
    #[error("internal invariant violated: {0}")]
    InternalInvariantViolation(String),
    #[error("authentication failed: {0}")]
    Unauthorized(String),
    #[error("match {0} is no longer running")]
    SessionClosed(shared::MatchId),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = DuelError> = std::result::Result<T, E>;
