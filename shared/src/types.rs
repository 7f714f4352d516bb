//! Domain types shared by the server and the client
//!
//! Identities, topic keys, question shapes and the per-round result records
//! that travel inside protocol messages. Question shapes carry the correct
//! answers and therefore never leave the server whole: clients only ever see
//! a [`QuestionStem`] and one [`StepView`] at a time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Minimum number of options a step may offer
pub const MIN_OPTIONS: usize = 2;
/// Maximum number of options a step may offer
pub const MAX_OPTIONS: usize = 6;

/// A verified participant identity, as handed out by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatchId(pub u64);

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m-{:016x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoundId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuestionId(pub u32);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicKeyError {
    #[error("topic key must look like `subject:category`, got `{0}`")]
    Malformed(String),
    #[error("topic key parts must be non-empty lowercase words")]
    InvalidPart,
}

/// Subject plus category, written `subject:category` (e.g. `math:algebra`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicKey {
    subject: String,
    category: String,
}

impl TopicKey {
    pub fn new(subject: &str, category: &str) -> Result<Self, TopicKeyError> {
        let valid = |part: &str| {
            !part.is_empty()
                && part.len() <= 32
                && part
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        };
        if !valid(subject) || !valid(category) {
            return Err(TopicKeyError::InvalidPart);
        }
        Ok(Self {
            subject: subject.to_string(),
            category: category.to_string(),
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// Re-checks a key that arrived over the wire, since deserialization
    /// bypasses [`TopicKey::new`]
    pub fn validate(&self) -> Result<(), TopicKeyError> {
        Self::new(&self.subject, &self.category).map(|_| ())
    }
}

impl FromStr for TopicKey {
    type Err = TopicKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((subject, category)) => Self::new(subject, category),
            None => Err(TopicKeyError::Malformed(s.to_string())),
        }
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject, self.category)
    }
}

/// Which side of a match a participant plays. A is the longer-waiting entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    A,
    B,
}

impl Role {
    pub fn opponent(self) -> Role {
        match self {
            Role::A => Role::B,
            Role::B => Role::A,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Role::A => 0,
            Role::B => 1,
        }
    }
}

/// Sub-state of a round controlling what a client may display and submit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Thinking,
    Choosing,
    Result,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Thinking => "thinking",
            Phase::Choosing => "choosing",
            Phase::Result => "result",
        };
        f.write_str(name)
    }
}

/// Why a match ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// All configured rounds were played
    Completed,
    /// One participant stopped heartbeating and forfeited
    OpponentDisconnect,
    /// Both participants went away
    Abandoned,
    /// The match could not start or continue (no question, attach timeout)
    Aborted,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::Completed => "completed",
            EndReason::OpponentDisconnect => "opponent_disconnect",
            EndReason::Abandoned => "abandoned",
            EndReason::Aborted => "aborted",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sub-question of a round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionStep {
    pub prompt: String,
    pub options: Vec<String>,
    pub correct_option_index: usize,
    pub marks: u32,
    pub time_limit_seconds: u32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuestionShapeError {
    #[error("question has no steps")]
    NoSteps,
    #[error("step {step} has {count} options, expected 2..=6")]
    OptionCount { step: usize, count: usize },
    #[error("step {step} marks option {index} correct but only has {count} options")]
    CorrectIndexOutOfRange { step: usize, index: usize, count: usize },
    #[error("step {step} must award marks and have a positive time limit")]
    ZeroBudget { step: usize },
}

/// A full question as stored by the question backing store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionShape {
    pub id: QuestionId,
    pub stem: String,
    pub steps: Vec<QuestionStep>,
}

impl QuestionShape {
    pub fn validate(&self) -> Result<(), QuestionShapeError> {
        if self.steps.is_empty() {
            return Err(QuestionShapeError::NoSteps);
        }
        for (step, s) in self.steps.iter().enumerate() {
            let count = s.options.len();
            if !(MIN_OPTIONS..=MAX_OPTIONS).contains(&count) {
                return Err(QuestionShapeError::OptionCount { step, count });
            }
            if s.correct_option_index >= count {
                return Err(QuestionShapeError::CorrectIndexOutOfRange {
                    step,
                    index: s.correct_option_index,
                    count,
                });
            }
            if s.marks == 0 || s.time_limit_seconds == 0 {
                return Err(QuestionShapeError::ZeroBudget { step });
            }
        }
        Ok(())
    }

    pub fn total_marks(&self) -> u32 {
        self.steps.iter().map(|s| s.marks).sum()
    }

    pub fn stem_view(&self) -> QuestionStem {
        QuestionStem {
            id: self.id,
            stem: self.stem.clone(),
            total_steps: self.steps.len(),
        }
    }

    pub fn step_view(&self, step_index: usize) -> Option<StepView> {
        self.steps.get(step_index).map(|s| StepView {
            prompt: s.prompt.clone(),
            options: s.options.clone(),
            marks: s.marks,
        })
    }

    pub fn correct_option_indexes(&self) -> Vec<usize> {
        self.steps.iter().map(|s| s.correct_option_index).collect()
    }
}

/// What a client sees at round start: the stem, never the answers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionStem {
    pub id: QuestionId,
    pub stem: String,
    pub total_steps: usize,
}

/// One step as revealed when choosing opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepView {
    pub prompt: String,
    pub options: Vec<String>,
    pub marks: u32,
}

/// One participant's outcome for a finished round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantResult {
    pub identity: Identity,
    pub role: Role,
    pub selected: Vec<Option<usize>>,
    pub correct: Vec<bool>,
    pub round_score: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round_index: u32,
    pub question_id: QuestionId,
    pub round_score_a: u32,
    pub round_score_b: u32,
}

/// Sent with `MatchEnd`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSummary {
    pub match_id: MatchId,
    pub participant_a: Identity,
    pub participant_b: Identity,
    pub score_a: u32,
    pub score_b: u32,
    pub momentum: i32,
    pub rounds: Vec<RoundSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(options: usize, correct: usize) -> QuestionStep {
        QuestionStep {
            prompt: "2 + 2".to_string(),
            options: (0..options).map(|i| i.to_string()).collect(),
            correct_option_index: correct,
            marks: 1,
            time_limit_seconds: 10,
        }
    }

    #[test]
    fn test_topic_key_parse() {
        let key: TopicKey = "math:algebra".parse().unwrap();
        assert_eq!(key.subject(), "math");
        assert_eq!(key.category(), "algebra");
        assert_eq!(key.to_string(), "math:algebra");
    }

    #[test]
    fn test_topic_key_rejects_garbage() {
        assert!(matches!(
            "mathalgebra".parse::<TopicKey>(),
            Err(TopicKeyError::Malformed(_))
        ));
        assert_eq!("math:".parse::<TopicKey>(), Err(TopicKeyError::InvalidPart));
        assert_eq!(
            "Math:Algebra".parse::<TopicKey>(),
            Err(TopicKeyError::InvalidPart)
        );
    }

    #[test]
    fn test_role_opponent() {
        assert_eq!(Role::A.opponent(), Role::B);
        assert_eq!(Role::B.opponent(), Role::A);
        assert_eq!(Role::B.index(), 1);
    }

    #[test]
    fn test_question_validation() {
        let mut question = QuestionShape {
            id: QuestionId(1),
            stem: "Arithmetic".to_string(),
            steps: vec![step(4, 2)],
        };
        assert!(question.validate().is_ok());

        question.steps.push(step(7, 0));
        assert_eq!(
            question.validate(),
            Err(QuestionShapeError::OptionCount { step: 1, count: 7 })
        );

        question.steps[1] = step(3, 3);
        assert_eq!(
            question.validate(),
            Err(QuestionShapeError::CorrectIndexOutOfRange {
                step: 1,
                index: 3,
                count: 3
            })
        );

        question.steps.clear();
        assert_eq!(question.validate(), Err(QuestionShapeError::NoSteps));
    }

    #[test]
    fn test_views_hide_answers() {
        let question = QuestionShape {
            id: QuestionId(9),
            stem: "Arithmetic".to_string(),
            steps: vec![step(4, 1), step(2, 0)],
        };
        let stem = question.stem_view();
        assert_eq!(stem.total_steps, 2);
        let view = question.step_view(1).unwrap();
        assert_eq!(view.options.len(), 2);
        assert!(question.step_view(2).is_none());
        assert_eq!(question.correct_option_indexes(), vec![1, 0]);
        assert_eq!(question.total_marks(), 2);
    }

    #[test]
    fn test_end_reason_wire_names() {
        assert_eq!(EndReason::OpponentDisconnect.as_str(), "opponent_disconnect");
        assert_eq!(EndReason::Completed.to_string(), "completed");
    }
}
