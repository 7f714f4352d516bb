//! Question supply and step timing
//!
//! Match tasks ask a shared [`QuestionSequencer`] for each round's question.
//! The sequencer holds no per-match state: the caller passes the ids it has
//! already used, and the backing [`QuestionSource`] only ever gets `&self`.

use crate::error::{DuelError, Result};
use log::warn;
use rand::seq::SliceRandom;
use shared::{QuestionId, QuestionShape, QuestionStep, TopicKey, TopicKeyError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Backing store for question content
pub trait QuestionSource: Send + Sync {
    fn next_question(&self, topic: &TopicKey, exclude: &[QuestionId]) -> Option<QuestionShape>;
}

#[derive(Clone)]
pub struct QuestionSequencer {
    source: Arc<dyn QuestionSource>,
    thinking_time: Duration,
}

impl QuestionSequencer {
    pub fn new(source: Arc<dyn QuestionSource>, thinking_time: Duration) -> Self {
        Self {
            source,
            thinking_time,
        }
    }

    /// Next valid question for `topic` not in `exclude`.
    ///
    /// Malformed questions from the source are skipped, never patched up.
    pub fn next_question(
        &self,
        topic: &TopicKey,
        exclude: &[QuestionId],
    ) -> Result<QuestionShape> {
        let mut skipped: Vec<QuestionId> = exclude.to_vec();
        loop {
            let question = self
                .source
                .next_question(topic, &skipped)
                .ok_or_else(|| DuelError::SequencerUnavailable(topic.clone()))?;

            match question.validate() {
                Ok(()) => return Ok(question),
                Err(e) => {
                    warn!("Skipping question {:?} on {}: {}", question.id, topic, e);
                    if skipped.contains(&question.id) {
                        return Err(DuelError::SequencerUnavailable(topic.clone()));
                    }
                    skipped.push(question.id);
                }
            }
        }
    }

    /// Read-only period before a round's first step opens
    pub fn thinking_budget(&self) -> Duration {
        self.thinking_time
    }

    pub fn step_budget(step: &QuestionStep) -> Duration {
        Duration::from_secs(u64::from(step.time_limit_seconds))
    }
}

/// In-memory question bank keyed by topic
#[derive(Debug, Default)]
pub struct QuestionBank {
    questions: HashMap<TopicKey, Vec<QuestionShape>>,
}

impl QuestionBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, topic: TopicKey, question: QuestionShape) {
        self.questions.entry(topic).or_default().push(question);
    }

    pub fn topics(&self) -> impl Iterator<Item = &TopicKey> {
        self.questions.keys()
    }

    /// A small bank covering a couple of topics, used by the binary
    pub fn sample() -> std::result::Result<Self, TopicKeyError> {
        let mut bank = Self::new();
        let step = |prompt: &str, options: &[&str], correct: usize, marks: u32| QuestionStep {
            prompt: prompt.to_string(),
            options: options.iter().map(|o| o.to_string()).collect(),
            correct_option_index: correct,
            marks,
            time_limit_seconds: 10,
        };

        let algebra = TopicKey::new("math", "algebra")?;
        bank.add(
            algebra.clone(),
            QuestionShape {
                id: QuestionId(1),
                stem: "Solve 2x + 6 = 14 step by step".to_string(),
                steps: vec![
                    step("Subtract 6 from both sides", &["2x = 8", "2x = 20", "x = 14", "2x = 6"], 0, 1),
                    step("Divide both sides by 2", &["x = 16", "x = 4", "x = 8", "x = 2"], 1, 1),
                    step("Check: 2·4 + 6 equals", &["12", "14", "16", "10"], 1, 2),
                ],
            },
        );
        bank.add(
            algebra.clone(),
            QuestionShape {
                id: QuestionId(2),
                stem: "Factor x² - 9".to_string(),
                steps: vec![
                    step("Recognise the pattern", &["perfect square", "difference of squares", "cubic"], 1, 1),
                    step("Write the factors", &["(x-3)(x+3)", "(x-9)(x+1)", "(x-3)²"], 0, 2),
                ],
            },
        );
        bank.add(
            algebra,
            QuestionShape {
                id: QuestionId(3),
                stem: "Evaluate 3(a + b) with a = 2, b = 5".to_string(),
                steps: vec![
                    step("a + b", &["7", "10", "3"], 0, 1),
                    step("3 · 7", &["10", "21", "24", "18"], 1, 1),
                ],
            },
        );

        let physics = TopicKey::new("science", "physics")?;
        bank.add(
            physics.clone(),
            QuestionShape {
                id: QuestionId(10),
                stem: "A car accelerates from rest at 2 m/s² for 5 s".to_string(),
                steps: vec![
                    step("Final speed", &["5 m/s", "10 m/s", "2.5 m/s", "25 m/s"], 1, 1),
                    step("Distance covered", &["25 m", "50 m", "10 m", "12.5 m"], 0, 2),
                ],
            },
        );
        bank.add(
            physics.clone(),
            QuestionShape {
                id: QuestionId(11),
                stem: "Units".to_string(),
                steps: vec![step("SI unit of force", &["joule", "newton", "watt", "pascal"], 1, 1)],
            },
        );
        bank.add(
            physics.clone(),
            QuestionShape {
                id: QuestionId(12),
                stem: "A 2 kg mass is lifted 3 m (g = 10 m/s²)".to_string(),
                steps: vec![
                    step("Weight of the mass", &["5 N", "20 N", "12 N", "2 N"], 1, 1),
                    step("Work done lifting it", &["60 J", "6 J", "23 J", "30 J"], 0, 2),
                ],
            },
        );
        bank.add(
            physics,
            QuestionShape {
                id: QuestionId(13),
                stem: "A 12 V battery drives 3 A through a resistor".to_string(),
                steps: vec![
                    step("Resistance", &["36 Ω", "4 Ω", "0.25 Ω", "15 Ω"], 1, 1),
                    step("Power dissipated", &["4 W", "15 W", "36 W", "9 W"], 2, 2),
                ],
            },
        );
        Ok(bank)
    }
}

impl QuestionSource for QuestionBank {
    fn next_question(&self, topic: &TopicKey, exclude: &[QuestionId]) -> Option<QuestionShape> {
        let candidates: Vec<&QuestionShape> = self
            .questions
            .get(topic)?
            .iter()
            .filter(|q| !exclude.contains(&q.id))
            .collect();
        candidates.choose(&mut rand::thread_rng()).map(|q| (*q).clone())
    }
}
