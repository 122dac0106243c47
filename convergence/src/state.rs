//! Evaluation state machine: phases, legal transitions and the run record.
//!
//! ```text
//!  PENDING ──► EVALUATING ──► DEBATING ──► SYNTHESIZING ──► REVIEWING ──► LOCKED
//!     ▲            ▲  │          │  ▲                          │
//!     │            │  │          │  └──────── reopen ──────────┘
//!     │            └──┼─ rescore ┘
//!     │               ▼
//!     └────────── FAILED  (every non-terminal phase may fail)
//! ```
//!
//! `LOCKED` is terminal. `FAILED` is terminal once the run's retry budget is
//! spent; until then `FAILED → PENDING` is allowed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::checkpoint::Checkpoint;
use crate::error::{EngineError, EngineResult};
use crate::synthesis::Resolution;
use crate::types::{aggregate, CriterionScore, Exchange, FinalVerdict, TerminationReason};

/// Phase of an evaluation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunPhase {
    /// Created, nothing issued yet.
    Pending,
    /// Reviewer fan-out in progress.
    Evaluating,
    /// Cross-examination rounds.
    Debating,
    /// Contradictory claims being resolved.
    Synthesizing,
    /// Final check before the verdict is locked.
    Reviewing,
    /// Verdict locked; immutable.
    Locked,
    /// Aborted by a fatal or limit error; retryable while retries remain.
    Failed,
}

impl RunPhase {
    pub const ALL: [RunPhase; 7] = [
        Self::Pending,
        Self::Evaluating,
        Self::Debating,
        Self::Synthesizing,
        Self::Reviewing,
        Self::Locked,
        Self::Failed,
    ];

    /// Valid transitions from this phase.
    pub fn valid_transitions(self) -> &'static [RunPhase] {
        match self {
            Self::Pending => &[Self::Evaluating, Self::Failed],
            Self::Evaluating => &[Self::Debating, Self::Failed],
            Self::Debating => &[Self::Synthesizing, Self::Evaluating, Self::Failed],
            Self::Synthesizing => &[Self::Reviewing, Self::Failed],
            Self::Reviewing => &[Self::Locked, Self::Debating, Self::Failed],
            Self::Failed => &[Self::Pending],
            Self::Locked => &[],
        }
    }

    pub fn can_transition_to(self, to: RunPhase) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// Whether the phase never changes again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Locked)
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Evaluating => write!(f, "EVALUATING"),
            Self::Debating => write!(f, "DEBATING"),
            Self::Synthesizing => write!(f, "SYNTHESIZING"),
            Self::Reviewing => write!(f, "REVIEWING"),
            Self::Locked => write!(f, "LOCKED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// An illegal transition was attempted. The phase is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition {from} → {to}: {reason} (allowed: {allowed:?})")]
pub struct StateTransitionError {
    pub from: RunPhase,
    pub to: RunPhase,
    pub allowed: Vec<RunPhase>,
    pub reason: String,
}

/// A phase transition record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: RunPhase,
    pub to: RunPhase,
    /// Round number when the transition happened.
    pub round: u32,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Why a run went to `FAILED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Phase the run was in when it failed.
    pub phase: RunPhase,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// One evaluation attempt for one item.
///
/// Owned by a single controller task. Concurrent work never touches it
/// directly; results are merged in by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    run_id: String,
    item_id: String,
    phase: RunPhase,
    round: u32,
    budget_ceiling: f64,
    budget_consumed: f64,
    /// Wall-clock time spent by the current attempt, across suspensions.
    active_ms: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    terminal_reason: Option<TerminationReason>,
    /// Reason the debate loop stopped; becomes the terminal reason on lock.
    stop_reason: Option<TerminationReason>,
    scores: BTreeMap<String, CriterionScore>,
    exchanges: Vec<Exchange>,
    transitions: Vec<PhaseTransition>,
    retries_remaining: u32,
    rescores_used: u32,
    reopens_used: u32,
    /// Categories queued for re-evaluation on the next `EVALUATING` pass.
    pending_rescore: Vec<String>,
    resolutions: Vec<Resolution>,
    /// Exchanges before this index have been through synthesis.
    synthesized_through: usize,
    verdict: Option<FinalVerdict>,
    supersedes: Option<String>,
    checkpoint_seq: u64,
    failure: Option<RunFailure>,
}

impl Run {
    pub fn new(run_id: &str, item_id: &str, budget_ceiling: f64, retries: u32) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.to_string(),
            item_id: item_id.to_string(),
            phase: RunPhase::Pending,
            round: 0,
            budget_ceiling,
            budget_consumed: 0.0,
            active_ms: 0,
            created_at: now,
            updated_at: now,
            terminal_reason: None,
            stop_reason: None,
            scores: BTreeMap::new(),
            exchanges: Vec::new(),
            transitions: Vec::new(),
            retries_remaining: retries,
            rescores_used: 0,
            reopens_used: 0,
            pending_rescore: Vec::new(),
            resolutions: Vec::new(),
            synthesized_through: 0,
            verdict: None,
            supersedes: None,
            checkpoint_seq: 0,
            failure: None,
        }
    }

    /// Mark this run as superseding a previously locked one.
    pub fn superseding(mut self, prior_run_id: &str) -> Self {
        self.supersedes = Some(prior_run_id.to_string());
        self
    }

    /// Rebuild a run from a checkpoint.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        checkpoint.run.clone()
    }

    // ── Accessors ──

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn budget_ceiling(&self) -> f64 {
        self.budget_ceiling
    }

    pub fn budget_consumed(&self) -> f64 {
        self.budget_consumed
    }

    pub fn active_ms(&self) -> u64 {
        self.active_ms
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn terminal_reason(&self) -> Option<TerminationReason> {
        self.terminal_reason
    }

    pub fn stop_reason(&self) -> Option<TerminationReason> {
        self.stop_reason
    }

    pub fn scores(&self) -> &BTreeMap<String, CriterionScore> {
        &self.scores
    }

    pub fn score(&self, criterion: &str) -> Option<&CriterionScore> {
        self.scores.get(criterion)
    }

    pub fn exchanges(&self) -> &[Exchange] {
        &self.exchanges
    }

    pub fn transitions(&self) -> &[PhaseTransition] {
        &self.transitions
    }

    pub fn retries_remaining(&self) -> u32 {
        self.retries_remaining
    }

    pub fn rescores_used(&self) -> u32 {
        self.rescores_used
    }

    pub fn reopens_used(&self) -> u32 {
        self.reopens_used
    }

    pub fn pending_rescore(&self) -> &[String] {
        &self.pending_rescore
    }

    pub fn resolutions(&self) -> &[Resolution] {
        &self.resolutions
    }

    /// Exchanges not yet seen by synthesis.
    pub fn unsynthesized_exchanges(&self) -> &[Exchange] {
        &self.exchanges[self.synthesized_through.min(self.exchanges.len())..]
    }

    pub fn verdict(&self) -> Option<&FinalVerdict> {
        self.verdict.as_ref()
    }

    pub fn supersedes(&self) -> Option<&str> {
        self.supersedes.as_deref()
    }

    pub fn checkpoint_seq(&self) -> u64 {
        self.checkpoint_seq
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        self.failure.as_ref()
    }

    /// `LOCKED`, or `FAILED` with no retries left. Nothing changes a sealed run.
    pub fn is_sealed(&self) -> bool {
        match self.phase {
            RunPhase::Locked => true,
            RunPhase::Failed => self.retries_remaining == 0,
            _ => false,
        }
    }

    fn ensure_mutable(&self) -> EngineResult<()> {
        if self.is_sealed() {
            return Err(EngineError::RunImmutable {
                run_id: self.run_id.clone(),
                phase: self.phase,
            });
        }
        Ok(())
    }

    // ── Transitions ──

    /// Move to `to`, recording the transition.
    ///
    /// `FAILED → PENDING` consumes one retry and is refused once none remain.
    pub fn transition(&mut self, to: RunPhase, reason: &str) -> Result<(), StateTransitionError> {
        if !self.phase.can_transition_to(to) {
            return Err(StateTransitionError {
                from: self.phase,
                to,
                allowed: self.phase.valid_transitions().to_vec(),
                reason: "not a valid transition".to_string(),
            });
        }
        if self.phase == RunPhase::Failed && to == RunPhase::Pending {
            if self.retries_remaining == 0 {
                return Err(StateTransitionError {
                    from: self.phase,
                    to,
                    allowed: Vec::new(),
                    reason: "retry budget exhausted".to_string(),
                });
            }
            self.retries_remaining -= 1;
            self.failure = None;
            self.terminal_reason = None;
            self.stop_reason = None;
            self.active_ms = 0;
        }

        let now = Utc::now();
        self.transitions.push(PhaseTransition {
            from: self.phase,
            to,
            round: self.round,
            timestamp: now,
            reason: reason.to_string(),
        });
        info!(
            run.id = %self.run_id,
            from = %self.phase,
            to = %to,
            round = self.round,
            reason,
            "Phase transition"
        );
        self.phase = to;
        self.updated_at = now;
        Ok(())
    }

    /// Move to `FAILED`, recording the failure and, for limit breaches, the
    /// termination reason.
    pub fn fail(
        &mut self,
        reason: Option<TerminationReason>,
        message: &str,
    ) -> Result<(), StateTransitionError> {
        let phase = self.phase;
        self.transition(RunPhase::Failed, message)?;
        self.terminal_reason = reason;
        self.failure = Some(RunFailure {
            phase,
            message: message.to_string(),
            recorded_at: self.updated_at,
        });
        Ok(())
    }

    /// `REVIEWING → LOCKED`: build the final verdict exactly once.
    pub fn lock(&mut self, reason: TerminationReason) -> EngineResult<&FinalVerdict> {
        self.ensure_mutable()?;
        self.transition(RunPhase::Locked, &format!("verdict locked: {}", reason))?;
        let scores: Vec<CriterionScore> = self.scores.values().cloned().collect();
        let (aggregate_score, aggregate_confidence) = aggregate(&scores);
        self.terminal_reason = Some(reason);
        Ok(&*self.verdict.insert(FinalVerdict {
            run_id: self.run_id.clone(),
            item_id: self.item_id.clone(),
            scores,
            aggregate_score,
            aggregate_confidence,
            termination_reason: reason,
            rounds_completed: self.round,
            exchange_log_ref: self.run_id.clone(),
            exchange_count: self.exchanges.len(),
            supersedes: self.supersedes.clone(),
            locked_at: self.updated_at,
        }))
    }

    // ── Mutation (controller only) ──

    /// Start the next debate round: bump the round and snapshot every score.
    pub(crate) fn open_round(&mut self) -> EngineResult<u32> {
        self.ensure_mutable()?;
        self.round += 1;
        for score in self.scores.values_mut() {
            score.open_round();
        }
        self.updated_at = Utc::now();
        Ok(self.round)
    }

    /// Insert a first score for a criterion or replace an existing position.
    pub(crate) fn record_score(&mut self, mut fresh: CriterionScore) -> EngineResult<()> {
        self.ensure_mutable()?;
        match self.scores.get_mut(fresh.criterion()) {
            Some(existing) => existing.rescore(fresh),
            None => {
                fresh.backfill_history(self.round);
                self.scores.insert(fresh.criterion().to_string(), fresh);
            }
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    pub(crate) fn score_mut(&mut self, criterion: &str) -> EngineResult<Option<&mut CriterionScore>> {
        self.ensure_mutable()?;
        Ok(self.scores.get_mut(criterion))
    }

    pub(crate) fn append_exchange(&mut self, exchange: Exchange) -> EngineResult<()> {
        self.ensure_mutable()?;
        self.exchanges.push(exchange);
        Ok(())
    }

    pub(crate) fn record_resolutions(&mut self, resolutions: Vec<Resolution>) -> EngineResult<()> {
        self.ensure_mutable()?;
        self.resolutions.extend(resolutions);
        self.synthesized_through = self.exchanges.len();
        Ok(())
    }

    pub(crate) fn set_stop_reason(&mut self, reason: Option<TerminationReason>) {
        self.stop_reason = reason;
    }

    pub(crate) fn queue_rescore(&mut self, categories: Vec<String>) {
        self.rescores_used += 1;
        self.pending_rescore = categories;
    }

    pub(crate) fn take_pending_rescore(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_rescore)
    }

    pub(crate) fn note_reopen(&mut self) {
        self.reopens_used += 1;
    }

    /// Record spend and time. Accounting is kept even when round data is discarded.
    pub(crate) fn record_usage(&mut self, consumed: f64, active_ms: u64) {
        self.budget_consumed = consumed;
        self.active_ms = active_ms;
        self.updated_at = Utc::now();
    }

    // ── Checkpointing ──

    /// Snapshot the run. Each call takes the next sequence number.
    pub fn checkpoint(&mut self, reason: &str) -> Checkpoint {
        self.checkpoint_seq += 1;
        Checkpoint::new(self, reason)
    }

    /// Give back the sequence number of a snapshot the store refused.
    pub(crate) fn discard_checkpoint(&mut self, sequence: u64) {
        if self.checkpoint_seq == sequence {
            self.checkpoint_seq = sequence.saturating_sub(1);
        }
    }

    /// Replace this run's state with the checkpoint's.
    ///
    /// Staleness must be checked by the caller before restoring.
    pub fn restore(&mut self, checkpoint: &Checkpoint) {
        *self = checkpoint.run.clone();
    }

    /// Compact status line.
    pub fn status_line(&self) -> String {
        format!(
            "[{}] run={} item={} round {} | {} criteria | {} exchanges | budget {:.2}/{:.2}",
            self.phase,
            self.run_id,
            self.item_id,
            self.round,
            self.scores.len(),
            self.exchanges.len(),
            self.budget_consumed,
            self.budget_ceiling
        )
    }
}
