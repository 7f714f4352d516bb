//! Match session controller
//!
//! Each match runs as one tokio task that exclusively owns the match state.
//! Everything that can change it arrives through a single command channel
//! (attach, detach, heartbeat, answer submission, resync) or fires from the
//! task's own timers, so no lock is ever taken on match state:
//!
//! - a single-shot phase alarm, re-armed after every event for the nearest
//!   pending deadline (attach timeout, phase deadline or reconnect grace)
//! - a presence tick that checks both participants' heartbeats
//!
//! Round flow is `Thinking` (stem only) → `Choosing` once per step →
//! `Result`, then the next round or the end of the match. Deadlines sent to
//! clients are absolute epoch milliseconds taken from the match clock.

use crate::config::MatchConfig;
use crate::error::{DuelError, ValidationError};
use crate::ledger::{MatchOutcome, ScoreLedger};
use crate::presence::PresenceMonitor;
use crate::queue::PairedMatch;
use crate::registry::{SessionHandle, SessionRegistry};
use crate::sequencer::QuestionSequencer;
use log::{debug, info, warn};
use shared::{
    EndReason, Identity, MatchId, MatchSummary, ParticipantResult, Phase, QuestionId,
    QuestionShape, Role, RoundId, RoundSummary, ServerMessage, TopicKey,
};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

/// Shortest phase the controller will schedule
const MIN_PHASE: Duration = Duration::from_millis(1);
/// Alarm used when nothing is pending; any event re-arms it anyway
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

/// Per-connection channel the session pushes messages into
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug)]
pub enum SessionCommand {
    /// Binds a connection to its participant slot (first join or reconnect)
    Attach { identity: Identity, outbox: Outbox },
    /// The connection behind `outbox` went away
    Detach { identity: Identity, outbox: Outbox },
    Heartbeat { identity: Identity },
    Submit {
        identity: Identity,
        request_id: u32,
        step_index: usize,
        selected_option_index: usize,
    },
    Sync { identity: Identity },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    /// Waiting for both participants to attach
    Pending,
    Active,
    Completed,
}

/// Maps the task's monotonic clock onto wall-clock milliseconds
#[derive(Debug, Clone, Copy)]
struct MatchClock {
    origin: Instant,
    origin_ms: u64,
}

impl MatchClock {
    fn new(now: Instant) -> Self {
        Self {
            origin: now,
            origin_ms: shared::epoch_millis(),
        }
    }

    fn millis(&self, at: Instant) -> u64 {
        let offset = at.saturating_duration_since(self.origin).as_millis();
        self.origin_ms
            .saturating_add(offset.min(u64::MAX as u128) as u64)
    }
}

#[derive(Debug)]
struct Participant {
    identity: Identity,
    role: Role,
    outbox: Option<Outbox>,
    attached: bool,
    score: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordedAnswer {
    selected_option_index: usize,
    request_id: u32,
}

#[derive(Debug)]
struct Round {
    id: RoundId,
    index: u32,
    question: QuestionShape,
    phase: Phase,
    step_index: usize,
    phase_deadline: Instant,
    thinking_ends_at: u64,
    /// Cumulative scores (A, B) going into the round
    opening_scores: (u32, u32),
    /// Per role, per step
    answers: [Vec<Option<RecordedAnswer>>; 2],
    /// Kept for replay once the round is scored
    result: Option<ServerMessage>,
}

impl Round {
    fn start_message(&self) -> ServerMessage {
        ServerMessage::RoundStart {
            round_id: self.id,
            round_index: self.index,
            question: self.question.stem_view(),
            thinking_ends_at: self.thinking_ends_at,
            score_a: self.opening_scores.0,
            score_b: self.opening_scores.1,
        }
    }

    fn step_message(&self, clock: &MatchClock) -> ServerMessage {
        ServerMessage::PhaseChange {
            round_index: self.index,
            phase: self.phase,
            deadline: clock.millis(self.phase_deadline),
            step_index: self.step_index,
            total_steps: self.question.steps.len(),
            step: self.question.step_view(self.step_index),
        }
    }
}

pub struct MatchSession {
    match_id: MatchId,
    topic: TopicKey,
    participants: [Participant; 2],
    config: MatchConfig,
    sequencer: QuestionSequencer,
    ledger: Arc<dyn ScoreLedger>,
    clock: MatchClock,
    state: MatchState,
    round: Option<Round>,
    presence: PresenceMonitor<Role>,
    /// Participant currently allowed to come back, and until when
    grace: Option<(Role, Instant)>,
    attach_deadline: Instant,
    used_questions: Vec<QuestionId>,
    rounds: Vec<RoundSummary>,
    momentum: i32,
}

impl MatchSession {
    pub fn new(
        paired: &PairedMatch,
        config: MatchConfig,
        sequencer: QuestionSequencer,
        ledger: Arc<dyn ScoreLedger>,
        now: Instant,
    ) -> Self {
        let participant = |identity: &Identity, role| Participant {
            identity: identity.clone(),
            role,
            outbox: None,
            attached: false,
            score: 0,
        };
        Self {
            match_id: paired.match_id,
            topic: paired.topic.clone(),
            participants: [
                participant(&paired.participant_a.identity, Role::A),
                participant(&paired.participant_b.identity, Role::B),
            ],
            presence: PresenceMonitor::new(config.heartbeat),
            attach_deadline: now + config.attach_timeout.max(MIN_PHASE),
            config,
            sequencer,
            ledger,
            clock: MatchClock::new(now),
            state: MatchState::Pending,
            round: None,
            grace: None,
            used_questions: Vec::new(),
            rounds: Vec::new(),
            momentum: 0,
        }
    }

    pub fn match_id(&self) -> MatchId {
        self.match_id
    }

    pub fn state(&self) -> MatchState {
        self.state
    }

    fn role_of(&self, identity: &Identity) -> Option<Role> {
        self.participants
            .iter()
            .find(|p| &p.identity == identity)
            .map(|p| p.role)
    }

    fn participant(&self, role: Role) -> &Participant {
        &self.participants[role.index()]
    }

    fn scores(&self) -> (u32, u32) {
        (self.participants[0].score, self.participants[1].score)
    }

    fn send(&mut self, role: Role, message: ServerMessage) {
        let participant = &mut self.participants[role.index()];
        if let Some(outbox) = &participant.outbox {
            if outbox.send(message).is_err() {
                debug!(
                    "Outbox for {} in match {} is gone",
                    participant.identity, self.match_id
                );
                participant.outbox = None;
            }
        }
    }

    fn broadcast(&mut self, message: ServerMessage) {
        self.send(Role::A, message.clone());
        self.send(Role::B, message);
    }

    pub fn handle(&mut self, command: SessionCommand, now: Instant) -> Flow {
        match command {
            SessionCommand::Attach { identity, outbox } => self.attach(&identity, outbox, now),
            SessionCommand::Detach { identity, outbox } => {
                self.detach(&identity, &outbox);
                Flow::Continue
            }
            SessionCommand::Heartbeat { identity } => {
                self.heartbeat(&identity, now);
                Flow::Continue
            }
            SessionCommand::Submit {
                identity,
                request_id,
                step_index,
                selected_option_index,
            } => self.submit(&identity, request_id, step_index, selected_option_index, now),
            SessionCommand::Sync { identity } => {
                self.sync(&identity);
                Flow::Continue
            }
        }
    }

    fn attach(&mut self, identity: &Identity, outbox: Outbox, now: Instant) -> Flow {
        let Some(role) = self.role_of(identity) else {
            let _ = outbox.send(ServerMessage::ValidationError {
                request_id: None,
                message: ValidationError::NotParticipant(identity.clone()).to_string(),
            });
            return Flow::Continue;
        };
        self.participants[role.index()].outbox = Some(outbox);

        match self.state {
            MatchState::Pending => {
                self.participants[role.index()].attached = true;
                info!("{} attached to match {} as {:?}", identity, self.match_id, role);
                let connected = self.connected_message(role);
                self.send(role, connected);

                if self.participants.iter().all(|p| p.attached) {
                    self.state = MatchState::Active;
                    for role in [Role::A, Role::B] {
                        self.presence.touch(role, now);
                        let opponent = self.participant(role.opponent()).identity.clone();
                        self.send(role, ServerMessage::OpponentReady { opponent });
                    }
                    info!("Match {} started on {}", self.match_id, self.topic);
                    return self.begin_round(1, now);
                }
                Flow::Continue
            }
            MatchState::Active => {
                info!("{} reattached to match {}", identity, self.match_id);
                if self.presence.touch(role, now) {
                    self.comeback(role);
                }
                self.replay(role);
                Flow::Continue
            }
            MatchState::Completed => Flow::Continue,
        }
    }

    fn detach(&mut self, identity: &Identity, outbox: &Outbox) {
        let Some(role) = self.role_of(identity) else {
            return;
        };
        let participant = &mut self.participants[role.index()];
        // A newer connection may already have replaced this one
        if participant
            .outbox
            .as_ref()
            .map_or(false, |current| current.same_channel(outbox))
        {
            participant.outbox = None;
            debug!("{} detached from match {}", identity, self.match_id);
        }
    }

    fn heartbeat(&mut self, identity: &Identity, now: Instant) {
        let Some(role) = self.role_of(identity) else {
            return;
        };
        if self.state == MatchState::Active && self.presence.touch(role, now) {
            self.comeback(role);
        }
    }

    /// A lapsed participant was heard from again
    fn comeback(&mut self, role: Role) {
        match self.grace {
            Some((in_grace, _)) if in_grace == role => {
                self.grace = None;
                info!(
                    "{} came back to match {} within the grace period",
                    self.participant(role).identity,
                    self.match_id
                );
                self.send(role.opponent(), ServerMessage::OpponentReconnected);
            }
            _ => {}
        }
    }

    fn submit(
        &mut self,
        identity: &Identity,
        request_id: u32,
        step_index: usize,
        selected_option_index: usize,
        now: Instant,
    ) -> Flow {
        let Some(role) = self.role_of(identity) else {
            return Flow::Continue;
        };
        if self.state == MatchState::Active && self.presence.touch(role, now) {
            self.comeback(role);
        }

        match self.record_answer(role, request_id, step_index, selected_option_index, now) {
            Ok(step_complete) => {
                self.send(
                    role,
                    ServerMessage::AnswerAcknowledged {
                        request_id,
                        step_index,
                        selected_option_index,
                    },
                );
                if step_complete {
                    return self.advance(now);
                }
                Flow::Continue
            }
            Err(e) => {
                debug!("Rejected answer from {}: {}", identity, e);
                self.send(
                    role,
                    ServerMessage::ValidationError {
                        request_id: Some(request_id),
                        message: e.to_string(),
                    },
                );
                Flow::Continue
            }
        }
    }

    /// Records one answer for the active step. Returns true once both
    /// participants have answered it.
    ///
    /// The first answer for a step is final; any later one is rejected, even
    /// an exact resend. A client that lost the acknowledgement gets it back
    /// through a sync replay.
    fn record_answer(
        &mut self,
        role: Role,
        request_id: u32,
        step_index: usize,
        selected_option_index: usize,
        now: Instant,
    ) -> Result<bool, ValidationError> {
        if self.state != MatchState::Active {
            return Err(ValidationError::MatchNotActive);
        }
        let round = self.round.as_mut().ok_or(ValidationError::MatchNotActive)?;
        if round.phase != Phase::Choosing {
            return Err(ValidationError::WrongPhase(round.phase));
        }
        if step_index != round.step_index {
            return Err(ValidationError::WrongStep {
                submitted: step_index,
                active: round.step_index,
            });
        }
        if now >= round.phase_deadline {
            return Err(ValidationError::StepClosed(step_index));
        }

        let slot = &mut round.answers[role.index()][step_index];
        if slot.is_some() {
            return Err(ValidationError::DuplicateSubmission(step_index));
        }

        let options = round.question.steps[step_index].options.len();
        if selected_option_index >= options {
            return Err(ValidationError::OptionOutOfRange {
                index: selected_option_index,
                options,
            });
        }

        *slot = Some(RecordedAnswer {
            selected_option_index,
            request_id,
        });
        Ok(round.answers.iter().all(|answers| answers[step_index].is_some()))
    }

    fn sync(&mut self, identity: &Identity) {
        if let Some(role) = self.role_of(identity) {
            self.replay(role);
        }
    }

    fn replay(&mut self, role: Role) {
        for message in self.replay_messages(role) {
            self.send(role, message);
        }
    }

    /// Messages that bring a client from nothing to the current state
    fn replay_messages(&self, role: Role) -> Vec<ServerMessage> {
        let mut messages = vec![self.connected_message(role)];
        if self.state != MatchState::Active {
            return messages;
        }

        messages.push(ServerMessage::OpponentReady {
            opponent: self.participant(role.opponent()).identity.clone(),
        });
        if let Some((in_grace, until)) = self.grace {
            if in_grace == role.opponent() {
                messages.push(ServerMessage::OpponentDisconnected {
                    reason: EndReason::OpponentDisconnect,
                    forfeit_to_you: false,
                    grace_ends_at: Some(self.clock.millis(until)),
                });
            }
        }

        let Some(round) = &self.round else {
            return messages;
        };
        messages.push(round.start_message());
        match round.phase {
            Phase::Thinking => {}
            Phase::Choosing => {
                messages.push(round.step_message(&self.clock));
                if let Some(answer) = round.answers[role.index()][round.step_index] {
                    messages.push(ServerMessage::AnswerAcknowledged {
                        request_id: answer.request_id,
                        step_index: round.step_index,
                        selected_option_index: answer.selected_option_index,
                    });
                }
            }
            Phase::Result => {
                if let Some(result) = &round.result {
                    messages.push(result.clone());
                }
            }
        }
        messages
    }

    fn connected_message(&self, role: Role) -> ServerMessage {
        ServerMessage::Connected {
            match_id: self.match_id,
            role,
            opponent: self.participant(role.opponent()).identity.clone(),
            total_rounds: self.config.max_rounds,
        }
    }

    /// Fires whatever deadline has passed
    pub fn on_timer(&mut self, now: Instant) -> Flow {
        match self.state {
            MatchState::Pending => {
                if now >= self.attach_deadline {
                    warn!(
                        "Match {} aborted: participants did not attach in time",
                        self.match_id
                    );
                    return self.finish(EndReason::Aborted, None);
                }
            }
            MatchState::Active => {
                if let Some((role, until)) = self.grace {
                    if now >= until {
                        info!(
                            "Grace period for {} in match {} expired",
                            self.participant(role).identity,
                            self.match_id
                        );
                        return self.forfeit(role);
                    }
                }
                let due = self
                    .round
                    .as_ref()
                    .map_or(false, |round| now >= round.phase_deadline);
                if due {
                    return self.advance(now);
                }
            }
            MatchState::Completed => return Flow::Finished,
        }
        Flow::Continue
    }

    fn advance(&mut self, now: Instant) -> Flow {
        let Some((phase, index, step_index, total_steps)) = self
            .round
            .as_ref()
            .map(|r| (r.phase, r.index, r.step_index, r.question.steps.len()))
        else {
            return Flow::Continue;
        };
        match phase {
            Phase::Thinking => self.open_step(0, now),
            Phase::Choosing => {
                if step_index + 1 < total_steps {
                    self.open_step(step_index + 1, now)
                } else {
                    self.finish_round(now)
                }
            }
            Phase::Result => {
                if index < self.config.max_rounds {
                    self.begin_round(index + 1, now)
                } else {
                    self.complete()
                }
            }
        }
    }

    fn begin_round(&mut self, index: u32, now: Instant) -> Flow {
        let question = match self.sequencer.next_question(&self.topic, &self.used_questions) {
            Ok(question) => question,
            Err(e) => {
                warn!("Match {} cannot start round {}: {}", self.match_id, index, e);
                return self.finish(EndReason::Aborted, None);
            }
        };
        self.used_questions.push(question.id);

        let deadline = now + self.sequencer.thinking_budget().max(MIN_PHASE);
        let steps = question.steps.len();
        let round = Round {
            id: RoundId(rand::random()),
            index,
            question,
            phase: Phase::Thinking,
            step_index: 0,
            phase_deadline: deadline,
            thinking_ends_at: self.clock.millis(deadline),
            opening_scores: self.scores(),
            answers: [vec![None; steps], vec![None; steps]],
            result: None,
        };
        debug!(
            "Match {} round {} uses question {:?} ({} steps)",
            self.match_id, index, round.question.id, steps
        );
        let message = round.start_message();
        self.round = Some(round);
        self.broadcast(message);
        Flow::Continue
    }

    fn open_step(&mut self, step_index: usize, now: Instant) -> Flow {
        let clock = self.clock;
        let Some(round) = self.round.as_mut() else {
            return Flow::Continue;
        };
        let Some(budget) = round
            .question
            .steps
            .get(step_index)
            .map(QuestionSequencer::step_budget)
        else {
            return Flow::Continue;
        };
        round.phase = Phase::Choosing;
        round.step_index = step_index;
        round.phase_deadline = now + budget.max(MIN_PHASE);
        let message = round.step_message(&clock);
        self.broadcast(message);
        Flow::Continue
    }

    fn finish_round(&mut self, now: Instant) -> Flow {
        let Some(round) = self.round.as_mut() else {
            return Flow::Continue;
        };
        let correct_option_indexes = round.question.correct_option_indexes();

        let mut results = Vec::with_capacity(2);
        let mut round_scores = [0u32; 2];
        for participant in &self.participants {
            let answers = &round.answers[participant.role.index()];
            let selected: Vec<Option<usize>> = answers
                .iter()
                .map(|answer| answer.map(|a| a.selected_option_index))
                .collect();
            let correct: Vec<bool> = selected
                .iter()
                .zip(&correct_option_indexes)
                .map(|(chosen, right)| *chosen == Some(*right))
                .collect();
            let round_score = correct
                .iter()
                .zip(&round.question.steps)
                .filter(|(ok, _)| **ok)
                .fold(0u32, |total, (_, step)| total.saturating_add(step.marks));

            round_scores[participant.role.index()] = round_score;
            results.push(ParticipantResult {
                identity: participant.identity.clone(),
                role: participant.role,
                selected,
                correct,
                round_score,
            });
        }

        for participant in self.participants.iter_mut() {
            participant.score = participant
                .score
                .saturating_add(round_scores[participant.role.index()]);
        }
        self.momentum += match round_scores[0].cmp(&round_scores[1]) {
            Ordering::Greater => 1,
            Ordering::Less => -1,
            Ordering::Equal => 0,
        };
        self.rounds.push(RoundSummary {
            round_index: round.index,
            question_id: round.question.id,
            round_score_a: round_scores[0],
            round_score_b: round_scores[1],
        });

        let deadline = now + self.config.result_time.max(MIN_PHASE);
        round.phase = Phase::Result;
        round.phase_deadline = deadline;
        let message = ServerMessage::RoundResult {
            round_index: round.index,
            correct_option_indexes,
            results,
            score_a: self.participants[0].score,
            score_b: self.participants[1].score,
            momentum: self.momentum,
            result_ends_at: self.clock.millis(deadline),
        };
        round.result = Some(message.clone());
        debug!(
            "Match {} round {} scored {}-{}",
            self.match_id, round.index, round_scores[0], round_scores[1]
        );
        self.broadcast(message);
        Flow::Continue
    }

    /// All rounds played; the higher cumulative score wins, a tie has no winner
    fn complete(&mut self) -> Flow {
        let (score_a, score_b) = self.scores();
        let winner = match score_a.cmp(&score_b) {
            Ordering::Greater => Some(Role::A),
            Ordering::Less => Some(Role::B),
            Ordering::Equal => None,
        };
        self.finish(EndReason::Completed, winner)
    }

    fn forfeit(&mut self, absent: Role) -> Flow {
        let present = absent.opponent();
        self.send(
            present,
            ServerMessage::OpponentDisconnected {
                reason: EndReason::OpponentDisconnect,
                forfeit_to_you: true,
                grace_ends_at: None,
            },
        );
        self.finish(EndReason::OpponentDisconnect, Some(present))
    }

    fn finish(&mut self, reason: EndReason, winner: Option<Role>) -> Flow {
        if self.state == MatchState::Completed {
            return Flow::Finished;
        }
        self.state = MatchState::Completed;

        let (score_a, score_b) = self.scores();
        let participant_a = self.participants[0].identity.clone();
        let participant_b = self.participants[1].identity.clone();
        let winner_id = winner.map(|role| self.participant(role).identity.clone());
        let summary = MatchSummary {
            match_id: self.match_id,
            participant_a: participant_a.clone(),
            participant_b: participant_b.clone(),
            score_a,
            score_b,
            momentum: self.momentum,
            rounds: self.rounds.clone(),
        };
        self.broadcast(ServerMessage::MatchEnd {
            winner_id: winner_id.clone(),
            reason,
            summary,
        });

        info!(
            "Match {} finished ({}): {} {} - {} {}",
            self.match_id, reason, participant_a, score_a, score_b, participant_b
        );
        self.ledger.record(MatchOutcome {
            match_id: self.match_id,
            participant_a,
            participant_b,
            winner_id,
            score_a,
            score_b,
            reason,
        });
        Flow::Finished
    }

    /// Reacts to participants whose heartbeats stopped.
    ///
    /// Before the scoring midpoint a lapsed participant gets the configured
    /// grace period to come back; after it (or with no grace configured) the
    /// present participant wins by forfeit. Both gone means abandoned.
    pub fn check_presence(&mut self, now: Instant) -> Flow {
        if self.state != MatchState::Active {
            return Flow::Continue;
        }
        let lapsed = self.presence.newly_lapsed(now);
        if lapsed.is_empty() {
            return Flow::Continue;
        }
        if self.presence.all_lapsed() {
            info!("Both participants of match {} went away", self.match_id);
            return self.finish(EndReason::Abandoned, None);
        }
        for role in lapsed {
            if self.handle_lapse(role, now) == Flow::Finished {
                return Flow::Finished;
            }
        }
        Flow::Continue
    }

    fn handle_lapse(&mut self, role: Role, now: Instant) -> Flow {
        warn!(
            "{} in match {}",
            DuelError::PresenceTimeout(self.participant(role).identity.clone()),
            self.match_id
        );
        let completed = self.rounds.len() as u32;
        let before_midpoint = completed.saturating_mul(2) < self.config.max_rounds;
        if before_midpoint && !self.config.reconnect_grace.is_zero() && self.grace.is_none() {
            let until = now + self.config.reconnect_grace;
            self.grace = Some((role, until));
            let grace_ends_at = Some(self.clock.millis(until));
            self.send(
                role.opponent(),
                ServerMessage::OpponentDisconnected {
                    reason: EndReason::OpponentDisconnect,
                    forfeit_to_you: false,
                    grace_ends_at,
                },
            );
            return Flow::Continue;
        }
        self.forfeit(role)
    }

    /// When the alarm should next fire
    fn next_wakeup(&self, now: Instant) -> Instant {
        let pending = match self.state {
            MatchState::Pending => Some(self.attach_deadline),
            MatchState::Active => {
                let phase = self.round.as_ref().map(|round| round.phase_deadline);
                let grace = self.grace.map(|(_, until)| until);
                match (phase, grace) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            }
            MatchState::Completed => None,
        };
        pending.unwrap_or(now + IDLE_WAKEUP)
    }

    /// Registers the session and runs it on its own task
    pub fn spawn(self, registry: &SessionRegistry) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle::new(self.match_id, tx);
        registry.register(
            handle.clone(),
            [&self.participants[0].identity, &self.participants[1].identity],
        );
        tokio::spawn(self.run(rx, registry.clone()));
        handle
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        registry: SessionRegistry,
    ) {
        let match_id = self.match_id;
        let alarm = tokio::time::sleep_until(self.next_wakeup(Instant::now()));
        tokio::pin!(alarm);
        let mut presence_tick = tokio::time::interval(self.config.heartbeat.interval.max(MIN_PHASE));
        presence_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flow = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command, Instant::now()),
                    None => Flow::Finished,
                },
                _ = &mut alarm => self.on_timer(Instant::now()),
                _ = presence_tick.tick() => self.check_presence(Instant::now()),
            };
            if flow == Flow::Finished {
                break;
            }
            alarm.as_mut().reset(self.next_wakeup(Instant::now()));
        }

        registry.remove(match_id);
        debug!("Match {} task stopped", match_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeartbeatPolicy;
    use crate::ledger::MemoryLedger;
    use crate::queue::QueueEntry;
    use crate::sequencer::QuestionBank;
    use shared::QuestionStep;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn topic() -> TopicKey {
        "math:algebra".parse().unwrap()
    }

    /// Every step's correct answer is option 0 and is worth one mark
    fn question(id: u32, steps: usize) -> QuestionShape {
        QuestionShape {
            id: QuestionId(id),
            stem: format!("Question {}", id),
            steps: (0..steps)
                .map(|i| QuestionStep {
                    prompt: format!("Step {}", i),
                    options: vec!["a".into(), "b".into(), "c".into(), "d".into()],
                    correct_option_index: 0,
                    marks: 1,
                    time_limit_seconds: 10,
                })
                .collect(),
        }
    }

    fn sequencer(questions: u32, steps: usize) -> QuestionSequencer {
        let mut bank = QuestionBank::new();
        for id in 1..=questions {
            bank.add(topic(), question(id, steps));
        }
        QuestionSequencer::new(Arc::new(bank), Duration::from_secs(1))
    }

    fn config(max_rounds: u32) -> MatchConfig {
        MatchConfig {
            max_rounds,
            thinking_time: Duration::from_secs(1),
            result_time: Duration::from_secs(2),
            heartbeat: HeartbeatPolicy::new(Duration::from_secs(1), 2),
            reconnect_grace: Duration::from_secs(5),
            attach_timeout: Duration::from_secs(3),
        }
    }

    fn entry(seq: u64, name: &str, now: Instant) -> QueueEntry {
        QueueEntry {
            seq,
            identity: Identity::new(name),
            topic: topic(),
            enqueued_at: now,
            skill_rating: None,
            last_heartbeat_at: now,
        }
    }

    fn paired(now: Instant) -> PairedMatch {
        PairedMatch {
            match_id: MatchId(42),
            topic: topic(),
            participant_a: entry(1, "ada", now),
            participant_b: entry(2, "bob", now),
            created_at: now,
        }
    }

    fn session(
        config: MatchConfig,
        sequencer: QuestionSequencer,
        now: Instant,
    ) -> (MatchSession, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        let session = MatchSession::new(&paired(now), config, sequencer, ledger.clone(), now);
        (session, ledger)
    }

    fn ada() -> Identity {
        Identity::new("ada")
    }

    fn bob() -> Identity {
        Identity::new("bob")
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn attach(
        session: &mut MatchSession,
        identity: Identity,
        now: Instant,
    ) -> (Flow, UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let flow = session.handle(SessionCommand::Attach { identity, outbox: tx }, now);
        (flow, rx)
    }

    fn attach_both(
        session: &mut MatchSession,
        now: Instant,
    ) -> (UnboundedReceiver<ServerMessage>, UnboundedReceiver<ServerMessage>) {
        let (_, mut a) = attach(session, ada(), now);
        let (_, mut b) = attach(session, bob(), now);
        drain(&mut a);
        drain(&mut b);
        (a, b)
    }

    fn submit(
        session: &mut MatchSession,
        identity: Identity,
        request_id: u32,
        step_index: usize,
        selected_option_index: usize,
        now: Instant,
    ) -> Flow {
        session.handle(
            SessionCommand::Submit {
                identity,
                request_id,
                step_index,
                selected_option_index,
            },
            now,
        )
    }

    fn deadline(session: &MatchSession) -> Instant {
        session.round.as_ref().unwrap().phase_deadline
    }

    fn phase(session: &MatchSession) -> Phase {
        session.round.as_ref().unwrap().phase
    }

    #[test]
    fn test_match_starts_once_both_attach() {
        let now = Instant::now();
        let (mut session, _) = session(config(3), sequencer(3, 2), now);

        let (flow, mut a) = attach(&mut session, ada(), now);
        assert_eq!(flow, Flow::Continue);
        assert_eq!(session.state(), MatchState::Pending);
        let messages = drain(&mut a);
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            &messages[0],
            ServerMessage::Connected { role: Role::A, opponent, total_rounds: 3, .. } if *opponent == bob()
        ));

        let (_, mut b) = attach(&mut session, bob(), now);
        assert_eq!(session.state(), MatchState::Active);
        let kinds: Vec<_> = drain(&mut b).iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["connected", "opponent_ready", "round_start"]);
        let kinds: Vec<_> = drain(&mut a).iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["opponent_ready", "round_start"]);
        assert_eq!(phase(&session), Phase::Thinking);
    }

    #[test]
    fn test_strangers_cannot_attach() {
        let now = Instant::now();
        let (mut session, _) = session(config(3), sequencer(3, 2), now);
        let (_, mut eve) = attach(&mut session, Identity::new("eve"), now);
        assert!(matches!(
            drain(&mut eve).as_slice(),
            [ServerMessage::ValidationError { request_id: None, .. }]
        ));
        assert!(session.participants.iter().all(|p| p.outbox.is_none()));
    }

    #[test]
    fn test_four_step_round_scores_each_step() {
        let start = Instant::now();
        let (mut session, ledger) = session(config(1), sequencer(1, 4), start);
        let (mut a, mut b) = attach_both(&mut session, start);

        let mut now = deadline(&session);
        assert_eq!(session.on_timer(now), Flow::Continue);
        for step in 0..4 {
            assert_eq!(phase(&session), Phase::Choosing);
            assert_eq!(session.round.as_ref().unwrap().step_index, step);
            now += Duration::from_millis(100);
            submit(&mut session, ada(), step as u32, step, 0, now);
            submit(&mut session, bob(), 100 + step as u32, step, 1, now);
        }
        assert_eq!(phase(&session), Phase::Result);

        let result = drain(&mut b)
            .into_iter()
            .find(|m| m.kind() == "round_result")
            .unwrap();
        match result {
            ServerMessage::RoundResult {
                results,
                score_a,
                score_b,
                momentum,
                correct_option_indexes,
                ..
            } => {
                assert_eq!(correct_option_indexes, vec![0; 4]);
                assert_eq!((score_a, score_b), (4, 0));
                assert_eq!(momentum, 1);
                assert_eq!(results[0].correct, vec![true; 4]);
                assert_eq!(results[1].correct, vec![false; 4]);
                assert_eq!(results[1].selected, vec![Some(1); 4]);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(session.on_timer(deadline(&session)), Flow::Finished);
        let end = drain(&mut a).pop().unwrap();
        assert!(matches!(
            end,
            ServerMessage::MatchEnd { winner_id: Some(ref w), reason: EndReason::Completed, .. } if *w == ada()
        ));
        let outcomes = ledger.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].score_a, 4);
        assert_eq!(outcomes[0].winner_id, Some(ada()));
    }

    #[test]
    fn test_second_answer_for_a_step_is_rejected() {
        let start = Instant::now();
        let (mut session, _) = session(config(1), sequencer(1, 2), start);
        let (mut a, _b) = attach_both(&mut session, start);
        let now = deadline(&session);
        session.on_timer(now);
        drain(&mut a);

        submit(&mut session, ada(), 1, 0, 2, now);
        submit(&mut session, ada(), 2, 0, 3, now);
        submit(&mut session, ada(), 1, 0, 2, now);

        let messages = drain(&mut a);
        assert_eq!(
            messages,
            vec![
                ServerMessage::AnswerAcknowledged {
                    request_id: 1,
                    step_index: 0,
                    selected_option_index: 2
                },
                ServerMessage::ValidationError {
                    request_id: Some(2),
                    message: ValidationError::DuplicateSubmission(0).to_string()
                },
                ServerMessage::ValidationError {
                    request_id: Some(1),
                    message: ValidationError::DuplicateSubmission(0).to_string()
                },
            ]
        );
        let recorded = session.round.as_ref().unwrap().answers[0][0].unwrap();
        assert_eq!(recorded.selected_option_index, 2);
    }

    #[test]
    fn test_exact_resend_is_rejected_and_sync_restores_ack() {
        let start = Instant::now();
        let (mut session, _) = session(config(1), sequencer(1, 2), start);
        let (mut a, mut b) = attach_both(&mut session, start);
        let now = deadline(&session);
        session.on_timer(now);
        drain(&mut a);
        drain(&mut b);

        submit(&mut session, ada(), 1, 0, 0, now);
        submit(&mut session, ada(), 1, 0, 0, now);

        let kinds: Vec<_> = drain(&mut a).iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["answer_acknowledged", "validation_error"]);
        assert!(drain(&mut b).is_empty());

        session.handle(SessionCommand::Sync { identity: ada() }, now);
        let replayed = drain(&mut a);
        assert_eq!(
            replayed.last(),
            Some(&ServerMessage::AnswerAcknowledged {
                request_id: 1,
                step_index: 0,
                selected_option_index: 0
            })
        );
    }

    #[test]
    fn test_out_of_range_option_only_reaches_sender() {
        let start = Instant::now();
        let (mut session, _) = session(config(1), sequencer(1, 2), start);
        let (mut a, mut b) = attach_both(&mut session, start);
        let now = deadline(&session);
        session.on_timer(now);
        drain(&mut a);
        drain(&mut b);

        submit(&mut session, ada(), 9, 0, 7, now);
        assert!(matches!(
            drain(&mut a).as_slice(),
            [ServerMessage::ValidationError { request_id: Some(9), .. }]
        ));
        assert!(drain(&mut b).is_empty());
        assert!(session.round.as_ref().unwrap().answers[0][0].is_none());
    }

    #[test]
    fn test_answers_outside_the_active_step_are_rejected() {
        let start = Instant::now();
        let (mut session, _) = session(config(1), sequencer(1, 2), start);
        let (_a, _b) = attach_both(&mut session, start);

        let thinking = session.record_answer(Role::A, 1, 0, 0, start);
        assert_eq!(thinking, Err(ValidationError::WrongPhase(Phase::Thinking)));

        let now = deadline(&session);
        session.on_timer(now);
        assert_eq!(
            session.record_answer(Role::A, 2, 1, 0, now),
            Err(ValidationError::WrongStep {
                submitted: 1,
                active: 0
            })
        );
        let closed = deadline(&session);
        assert_eq!(
            session.record_answer(Role::A, 3, 0, 0, closed),
            Err(ValidationError::StepClosed(0))
        );
    }

    #[test]
    fn test_deadlines_move_forward_without_answers() {
        let start = Instant::now();
        let (mut session, ledger) = session(config(2), sequencer(2, 2), start);
        let (mut a, _b) = attach_both(&mut session, start);

        let mut deadlines = Vec::new();
        let mut flow = Flow::Continue;
        let mut guard = 0;
        while flow == Flow::Continue {
            flow = session.on_timer(deadline(&session));
            guard += 1;
            assert!(guard < 20, "match never finished");
        }

        for message in drain(&mut a) {
            match message {
                ServerMessage::RoundStart { thinking_ends_at, .. } => deadlines.push(thinking_ends_at),
                ServerMessage::PhaseChange { deadline, .. } => deadlines.push(deadline),
                ServerMessage::RoundResult {
                    result_ends_at,
                    score_a,
                    score_b,
                    ..
                } => {
                    assert_eq!((score_a, score_b), (0, 0));
                    deadlines.push(result_ends_at);
                }
                ServerMessage::MatchEnd { winner_id, reason, summary } => {
                    assert_eq!(winner_id, None);
                    assert_eq!(reason, EndReason::Completed);
                    assert_eq!(summary.rounds.len(), 2);
                }
                _ => {}
            }
        }
        // Per round: thinking, two steps, result
        assert_eq!(deadlines.len(), 8);
        assert!(deadlines.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(ledger.outcomes()[0].winner_id, None);
    }

    #[test]
    fn test_lapse_after_midpoint_forfeits() {
        let start = Instant::now();
        let mut config = config(3);
        config.reconnect_grace = Duration::ZERO;
        let (mut session, ledger) = session(config, sequencer(3, 2), start);
        let (mut a, _b) = attach_both(&mut session, start);

        let mut now = start;
        for _ in 0..3 {
            now += Duration::from_secs(1);
            session.handle(SessionCommand::Heartbeat { identity: ada() }, now);
        }
        assert_eq!(session.check_presence(now), Flow::Finished);

        let messages = drain(&mut a);
        assert!(messages.contains(&ServerMessage::OpponentDisconnected {
            reason: EndReason::OpponentDisconnect,
            forfeit_to_you: true,
            grace_ends_at: None,
        }));
        assert!(matches!(
            messages.last(),
            Some(ServerMessage::MatchEnd { winner_id: Some(w), reason: EndReason::OpponentDisconnect, .. }) if *w == ada()
        ));
        assert_eq!(ledger.outcomes()[0].reason, EndReason::OpponentDisconnect);
    }

    #[test]
    fn test_no_grace_once_half_the_rounds_are_played() {
        let start = Instant::now();
        let (mut session, _) = session(config(2), sequencer(2, 1), start);
        let (_a, _b) = attach_both(&mut session, start);
        session.rounds.push(RoundSummary {
            round_index: 1,
            question_id: QuestionId(1),
            round_score_a: 0,
            round_score_b: 0,
        });

        session.handle(
            SessionCommand::Heartbeat { identity: bob() },
            start + Duration::from_secs(2),
        );
        assert_eq!(
            session.check_presence(start + Duration::from_secs(2)),
            Flow::Finished
        );
    }

    #[test]
    fn test_grace_period_then_forfeit() {
        let start = Instant::now();
        let (mut session, _) = session(config(3), sequencer(3, 2), start);
        let (mut a, _b) = attach_both(&mut session, start);

        let now = start + Duration::from_secs(2);
        session.handle(SessionCommand::Heartbeat { identity: ada() }, now);
        assert_eq!(session.check_presence(now), Flow::Continue);
        let until = now + Duration::from_secs(5);
        assert_eq!(session.grace, Some((Role::B, until)));
        assert!(drain(&mut a)
            .iter()
            .any(|m| matches!(m, ServerMessage::OpponentDisconnected { forfeit_to_you: false, grace_ends_at: Some(_), .. })));
        assert!(session.next_wakeup(now) <= until);

        session.handle(SessionCommand::Heartbeat { identity: ada() }, until);
        assert_eq!(session.on_timer(until), Flow::Finished);
        assert!(matches!(
            drain(&mut a).last(),
            Some(ServerMessage::MatchEnd { winner_id: Some(w), .. }) if *w == ada()
        ));
    }

    #[test]
    fn test_comeback_within_grace() {
        let start = Instant::now();
        let (mut session, _) = session(config(3), sequencer(3, 2), start);
        let (mut a, _b) = attach_both(&mut session, start);

        let now = start + Duration::from_secs(2);
        session.handle(SessionCommand::Heartbeat { identity: ada() }, now);
        session.check_presence(now);
        drain(&mut a);

        let (_, mut b) = attach(&mut session, bob(), now + Duration::from_secs(1));
        assert_eq!(session.grace, None);
        assert_eq!(drain(&mut a), vec![ServerMessage::OpponentReconnected]);
        let kinds: Vec<_> = drain(&mut b).iter().map(|m| m.kind()).collect();
        assert_eq!(kinds[..3], ["connected", "opponent_ready", "round_start"]);
    }

    #[test]
    fn test_both_lapsed_is_abandoned() {
        let start = Instant::now();
        let (mut session, ledger) = session(config(3), sequencer(3, 2), start);
        let (_a, _b) = attach_both(&mut session, start);

        assert_eq!(
            session.check_presence(start + Duration::from_secs(2)),
            Flow::Finished
        );
        let outcome = &ledger.outcomes()[0];
        assert_eq!(outcome.reason, EndReason::Abandoned);
        assert_eq!(outcome.winner_id, None);
    }

    #[test]
    fn test_no_questions_aborts() {
        let start = Instant::now();
        let (mut session, ledger) = session(config(3), sequencer(0, 1), start);
        let (_, mut a) = attach(&mut session, ada(), start);
        let (flow, _b) = attach(&mut session, bob(), start);

        assert_eq!(flow, Flow::Finished);
        assert!(matches!(
            drain(&mut a).last(),
            Some(ServerMessage::MatchEnd { winner_id: None, reason: EndReason::Aborted, .. })
        ));
        assert_eq!(ledger.outcomes()[0].reason, EndReason::Aborted);
    }

    #[test]
    fn test_attach_timeout_aborts() {
        let start = Instant::now();
        let (mut session, ledger) = session(config(3), sequencer(3, 1), start);
        let (_, _a) = attach(&mut session, ada(), start);

        assert_eq!(session.on_timer(start + Duration::from_secs(1)), Flow::Continue);
        assert_eq!(
            session.on_timer(start + Duration::from_secs(3)),
            Flow::Finished
        );
        assert_eq!(ledger.outcomes()[0].reason, EndReason::Aborted);
    }

    #[test]
    fn test_sync_replays_the_current_step() {
        let start = Instant::now();
        let (mut session, _) = session(config(1), sequencer(1, 2), start);
        let (mut a, _b) = attach_both(&mut session, start);
        let now = deadline(&session);
        session.on_timer(now);
        submit(&mut session, ada(), 5, 0, 1, now);
        drain(&mut a);

        session.handle(SessionCommand::Sync { identity: ada() }, now);
        let messages = drain(&mut a);
        let kinds: Vec<_> = messages.iter().map(|m| m.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "connected",
                "opponent_ready",
                "round_start",
                "phase_change",
                "answer_acknowledged"
            ]
        );
    }

    #[test]
    fn test_stale_detach_keeps_the_new_connection() {
        let start = Instant::now();
        let (mut session, _) = session(config(1), sequencer(1, 2), start);
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        session.handle(
            SessionCommand::Attach {
                identity: ada(),
                outbox: old_tx.clone(),
            },
            start,
        );
        let (_, _new_rx) = attach(&mut session, ada(), start);

        session.handle(
            SessionCommand::Detach {
                identity: ada(),
                outbox: old_tx,
            },
            start,
        );
        assert!(session.participants[0].outbox.is_some());
    }

    async fn next_of(rx: &mut UnboundedReceiver<ServerMessage>, kind: &str) -> ServerMessage {
        loop {
            let message = rx.recv().await.expect("session closed the outbox");
            if message.kind() == kind {
                return message;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_task_plays_to_completion() {
        let mut config = config(2);
        config.heartbeat = HeartbeatPolicy::new(Duration::from_secs(3600), 1);
        let registry = SessionRegistry::new();
        let ledger = Arc::new(MemoryLedger::new());
        let session = MatchSession::new(
            &paired(Instant::now()),
            config,
            sequencer(2, 1),
            ledger.clone(),
            Instant::now(),
        );
        let handle = session.spawn(&registry);
        assert_eq!(registry.session_for(&ada()).unwrap().match_id(), MatchId(42));

        let (a_tx, mut a) = mpsc::unbounded_channel();
        let (b_tx, mut b) = mpsc::unbounded_channel();
        handle
            .send(SessionCommand::Attach { identity: ada(), outbox: a_tx })
            .unwrap();
        handle
            .send(SessionCommand::Attach { identity: bob(), outbox: b_tx })
            .unwrap();

        next_of(&mut a, "phase_change").await;
        handle
            .send(SessionCommand::Submit {
                identity: ada(),
                request_id: 1,
                step_index: 0,
                selected_option_index: 0,
            })
            .unwrap();

        let end = next_of(&mut b, "match_end").await;
        assert!(matches!(
            end,
            ServerMessage::MatchEnd { winner_id: Some(ref w), reason: EndReason::Completed, .. } if *w == ada()
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.is_empty());
        assert_eq!(ledger.outcomes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_task_forfeits_silent_participant() {
        let mut config = config(3);
        config.heartbeat = HeartbeatPolicy::new(Duration::from_millis(100), 2);
        config.reconnect_grace = Duration::from_secs(1);
        let registry = SessionRegistry::new();
        let session = MatchSession::new(
            &paired(Instant::now()),
            config,
            sequencer(3, 1),
            Arc::new(MemoryLedger::new()),
            Instant::now(),
        );
        let handle = session.spawn(&registry);

        let (a_tx, mut a) = mpsc::unbounded_channel();
        let (b_tx, _b) = mpsc::unbounded_channel();
        handle
            .send(SessionCommand::Attach { identity: ada(), outbox: a_tx })
            .unwrap();
        handle
            .send(SessionCommand::Attach { identity: bob(), outbox: b_tx })
            .unwrap();

        let beats = handle.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(50));
            loop {
                ticker.tick().await;
                if beats
                    .send(SessionCommand::Heartbeat { identity: ada() })
                    .is_err()
                {
                    break;
                }
            }
        });

        let warning = next_of(&mut a, "opponent_disconnected").await;
        assert!(matches!(
            warning,
            ServerMessage::OpponentDisconnected { forfeit_to_you: false, grace_ends_at: Some(_), .. }
        ));
        let forfeit = next_of(&mut a, "opponent_disconnected").await;
        assert!(matches!(
            forfeit,
            ServerMessage::OpponentDisconnected { forfeit_to_you: true, .. }
        ));
        let end = next_of(&mut a, "match_end").await;
        assert!(matches!(
            end,
            ServerMessage::MatchEnd { reason: EndReason::OpponentDisconnect, .. }
        ));
    }
}
