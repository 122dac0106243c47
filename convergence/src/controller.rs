//! Run controller: the full lifecycle of one evaluation.
//!
//! ```text
//! acquire lock(item)
//!   PENDING → EVALUATING ──fan-out──→ DEBATING ⇄ (round) ──stop──→ SYNTHESIZING
//!                 ↑                      │                              │
//!                 └──── re-score ────────┘        REVIEWING ←───────────┘
//!                                                    │  └── reopen ──→ DEBATING
//!                                                    ↓
//!                                                  LOCKED
//! release lock
//! ```
//!
//! Every phase transition and every completed round is checkpointed. Rounds
//! run against a working copy of the run and are committed only when they
//! finish, so cancellation, timeouts and failures never leave a partial
//! round behind.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::budget::{BudgetConfig, BudgetGuard};
use crate::checkpoint::{validate_checkpoint, CheckpointStore, IntegrityStatus, PersistenceError};
use crate::config::{CategorySpec, EngineConfig};
use crate::convergence::{ConvergenceDetector, LimitStatus};
use crate::debate::{DebateOrchestrator, RunContext};
use crate::error::{EngineError, EngineResult, ErrorClass};
use crate::lock::{LockGuard, LockKey, LockManager};
use crate::review::ReviewCapability;
use crate::state::{Run, RunPhase};
use crate::synthesis::ConflictResolver;
use crate::telemetry::{self, RunSummary};
use crate::types::{FinalVerdict, TerminationReason};

/// What to evaluate.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationRequest {
    pub item_id: String,
    /// The proposal text handed to every reviewer.
    pub content: String,
    /// Free-form background passed along with the content.
    pub context: String,
}

impl EvaluationRequest {
    pub fn new(item_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            content: content.into(),
            context: String::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeOptions {
    /// Accept a checkpoint older than the staleness horizon.
    pub confirm_stale: bool,
}

/// How a drive of a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The run reached `LOCKED`.
    Locked(FinalVerdict),
    /// The run is in `FAILED`; `retry_failed` may bring it back while
    /// retries remain.
    Failed { run: Box<Run>, message: String },
    /// Cancelled; resumable from its last checkpoint.
    Suspended {
        run_id: String,
        phase: RunPhase,
        round: u32,
    },
}

impl RunOutcome {
    pub fn verdict(&self) -> Option<&FinalVerdict> {
        match self {
            Self::Locked(verdict) => Some(verdict),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Locked(_) => "locked",
            Self::Failed { .. } => "failed",
            Self::Suspended { .. } => "suspended",
        }
    }
}

/// Drives runs to a verdict.
pub struct RunController {
    config: EngineConfig,
    orchestrator: DebateOrchestrator,
    detector: ConvergenceDetector,
    resolver: ConflictResolver,
    store: Arc<dyn CheckpointStore>,
    locks: Arc<LockManager>,
}

impl RunController {
    pub fn new(
        config: EngineConfig,
        reviewer: Arc<dyn ReviewCapability>,
        store: Arc<dyn CheckpointStore>,
        locks: Arc<LockManager>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let orchestrator = DebateOrchestrator::new(
            reviewer,
            config.debate.clone(),
            config.retry.clone(),
            config.cost.clone(),
        );
        Ok(Self {
            detector: ConvergenceDetector::new(config.convergence.clone()),
            resolver: ConflictResolver::new(config.synthesis.clone()),
            orchestrator,
            config,
            store,
            locks,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Entry points ──

    /// Start a new run for `request.item_id`.
    pub async fn evaluate(
        &self,
        request: EvaluationRequest,
        cancel: CancellationToken,
    ) -> EngineResult<RunOutcome> {
        let run = Run::new(
            &Uuid::new_v4().to_string(),
            &request.item_id,
            self.config.budget.ceiling,
            self.config.max_run_retries,
        );
        self.drive(run, &request, cancel).await
    }

    /// Continue a run from its latest checkpoint.
    ///
    /// Locked and failed runs are reported as they are. Checkpoints past the
    /// staleness horizon need `confirm_stale`.
    pub async fn resume(
        &self,
        run_id: &str,
        request: EvaluationRequest,
        options: ResumeOptions,
        cancel: CancellationToken,
    ) -> EngineResult<RunOutcome> {
        let run = self.restore(run_id, options).await?;
        match run.phase() {
            RunPhase::Locked => Ok(RunOutcome::Locked(self.verdict_of(&run)?)),
            RunPhase::Failed => Ok(failed(run)),
            _ => {
                check_item(&run, &request)?;
                self.drive(run, &request, cancel).await
            }
        }
    }

    /// Send a failed run back to `PENDING` and drive it again from its last
    /// good state.
    pub async fn retry_failed(
        &self,
        run_id: &str,
        request: EvaluationRequest,
        cancel: CancellationToken,
    ) -> EngineResult<RunOutcome> {
        let mut run = self
            .restore(
                run_id,
                ResumeOptions {
                    confirm_stale: true,
                },
            )
            .await?;
        check_item(&run, &request)?;
        run.transition(RunPhase::Pending, "retrying failed run")?;
        self.drive(run, &request, cancel).await
    }

    /// Start a new run that replaces the locked verdict of `prior_run_id`.
    pub async fn supersede(
        &self,
        prior_run_id: &str,
        request: EvaluationRequest,
        cancel: CancellationToken,
    ) -> EngineResult<RunOutcome> {
        let prior = self.load_run(prior_run_id).await?;
        if prior.phase() != RunPhase::Locked {
            return Err(EngineError::config(format!(
                "run {} is {} and has no verdict to supersede",
                prior_run_id,
                prior.phase()
            )));
        }
        check_item(&prior, &request)?;
        let run = Run::new(
            &Uuid::new_v4().to_string(),
            &request.item_id,
            self.config.budget.ceiling,
            self.config.max_run_retries,
        )
        .superseding(prior_run_id);
        self.drive(run, &request, cancel).await
    }

    /// The latest persisted state of a run.
    pub async fn load_run(&self, run_id: &str) -> EngineResult<Run> {
        let checkpoint = self
            .store
            .load(run_id)
            .await?
            .ok_or_else(|| EngineError::CheckpointNotFound(run_id.to_string()))?;
        Ok(Run::from_checkpoint(&checkpoint))
    }

    async fn restore(&self, run_id: &str, options: ResumeOptions) -> EngineResult<Run> {
        let checkpoint = self
            .store
            .load(run_id)
            .await?
            .ok_or_else(|| EngineError::CheckpointNotFound(run_id.to_string()))?;

        match validate_checkpoint(&checkpoint) {
            IntegrityStatus::Valid => {}
            IntegrityStatus::Recoverable { warnings } => {
                warn!(run.id = %run_id, warnings = ?warnings, "Checkpoint has warnings; resuming");
            }
            IntegrityStatus::Corrupted { errors } => {
                return Err(PersistenceError::IntegrityCheckFailed {
                    reason: errors.join("; "),
                }
                .into());
            }
        }

        let now = Utc::now();
        let horizon = self.config.checkpoint.staleness_horizon();
        if checkpoint.is_stale(horizon, now) && !options.confirm_stale {
            return Err(EngineError::StaleCheckpoint {
                run_id: run_id.to_string(),
                age_ms: checkpoint.age(now).as_millis() as u64,
            });
        }

        let run = Run::from_checkpoint(&checkpoint);
        info!(
            run.id = %run_id,
            sequence = checkpoint.sequence,
            reason = %checkpoint.reason,
            status = %run.status_line(),
            "Run restored from checkpoint"
        );
        Ok(run)
    }

    fn verdict_of(&self, run: &Run) -> EngineResult<FinalVerdict> {
        run.verdict().cloned().ok_or_else(|| {
            PersistenceError::IntegrityCheckFailed {
                reason: format!("locked run {} has no verdict", run.run_id()),
            }
            .into()
        })
    }

    // ── Lifecycle ──

    /// Hold the item lock and step the run until it locks, fails or is
    /// cancelled.
    async fn drive(
        &self,
        mut run: Run,
        request: &EvaluationRequest,
        cancel: CancellationToken,
    ) -> EngineResult<RunOutcome> {
        let key = LockKey::evaluation(run.item_id());
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled(run.run_id().to_string())),
            guard = self.locks.acquire(key, run.run_id()) => guard?,
        };

        let ctx = RunContext {
            run_id: run.run_id().to_string(),
            item_id: run.item_id().to_string(),
            content: request.content.clone(),
            context: request.context.clone(),
        };
        let limits = BudgetConfig {
            ceiling: run.budget_ceiling(),
            ..self.config.budget.clone()
        };
        let budget = Arc::new(BudgetGuard::resume(
            &limits,
            run.budget_consumed(),
            Duration::from_millis(run.active_ms()),
        ));
        let span = telemetry::run_span(run.run_id(), run.item_id());
        let started = tokio::time::Instant::now();

        let result = self
            .step(&mut run, &ctx, &budget, &guard, &cancel)
            .instrument(span.clone())
            .await;
        let outcome = self.settle(&mut run, &budget, result).instrument(span.clone()).await;

        if let Err(e) = guard.release() {
            warn!(run.id = %run.run_id(), error = %e, "Lock was lost before release");
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(outcome) => {
                telemetry::record_run_result(
                    &span,
                    outcome.label(),
                    run.round(),
                    run.budget_consumed(),
                    duration_ms,
                );
                info!(
                    run.id = %run.run_id(),
                    item.id = %run.item_id(),
                    outcome = outcome.label(),
                    summary = %RunSummary::from_run(&run),
                    "Run finished"
                );
            }
            Err(e) => {
                telemetry::record_run_result(&span, "error", run.round(), run.budget_consumed(), duration_ms);
                error!(run.id = %run.run_id(), error = %e, "Run aborted");
            }
        }
        outcome
    }

    /// Turn the step loop's result into an outcome, persisting the run.
    async fn settle(
        &self,
        run: &mut Run,
        budget: &BudgetGuard,
        result: EngineResult<RunOutcome>,
    ) -> EngineResult<RunOutcome> {
        let err = match result {
            Ok(outcome) => return Ok(outcome),
            Err(err) => err,
        };
        run.record_usage(budget.consumed(), budget.elapsed_ms());

        match err.class() {
            ErrorClass::Cancelled => {
                info!(run.id = %run.run_id(), phase = %run.phase(), round = run.round(), "Run suspended");
                self.save(run, "suspended").await?;
                Ok(RunOutcome::Suspended {
                    run_id: run.run_id().to_string(),
                    phase: run.phase(),
                    round: run.round(),
                })
            }
            ErrorClass::ContractViolation | ErrorClass::Persistence => Err(err),
            ErrorClass::TransientRemote | ErrorClass::FatalRemote | ErrorClass::Limit => {
                let message = err.to_string();
                warn!(
                    run.id = %run.run_id(),
                    phase = %run.phase(),
                    round = run.round(),
                    error = %message,
                    "Run failed"
                );
                run.fail(err.termination_reason(), &message)?;
                self.save(run, "failed").await?;
                Ok(failed(run.clone()))
            }
        }
    }

    async fn step(
        &self,
        run: &mut Run,
        ctx: &RunContext,
        budget: &Arc<BudgetGuard>,
        guard: &LockGuard,
        cancel: &CancellationToken,
    ) -> EngineResult<RunOutcome> {
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled(run.run_id().to_string()));
            }
            guard.renew()?;

            match run.phase() {
                RunPhase::Pending => {
                    run.transition(RunPhase::Evaluating, "evaluation started")?;
                    self.commit(run, budget, "evaluating").await?;
                }
                RunPhase::Evaluating => {
                    self.evaluate_phase(run, ctx, budget, cancel).await?;
                    run.transition(RunPhase::Debating, "evaluation complete")?;
                    self.commit(run, budget, "evaluated").await?;
                }
                RunPhase::Debating => self.debate_phase(run, ctx, budget, cancel).await?,
                RunPhase::Synthesizing => {
                    let span = telemetry::synthesis_span(run.run_id(), run.round());
                    let resolutions = span.in_scope(|| self.resolver.synthesize(run))?;
                    run.transition(
                        RunPhase::Reviewing,
                        &format!("{} conflicts synthesized", resolutions.len()),
                    )?;
                    self.commit(run, budget, "synthesized").await?;
                }
                RunPhase::Reviewing => {
                    if let Some(outcome) = self.review_phase(run, budget).await? {
                        return Ok(outcome);
                    }
                }
                RunPhase::Locked => return Ok(RunOutcome::Locked(self.verdict_of(run)?)),
                RunPhase::Failed => return Ok(failed(run.clone())),
            }
        }
    }

    /// Fan out to the categories that still need scores.
    async fn evaluate_phase(
        &self,
        run: &mut Run,
        ctx: &RunContext,
        budget: &Arc<BudgetGuard>,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let categories = self.categories_to_evaluate(run);
        debug!(
            run.id = %run.run_id(),
            categories = ?categories.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "Evaluating categories"
        );

        let mut outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled(ctx.run_id.clone())),
            outcome = self.orchestrator.fan_out(ctx, run.round(), &categories, budget) => outcome?,
        };

        // Categories that succeeded are kept so a retry only re-asks the rest.
        for score in std::mem::take(&mut outcome.scores) {
            run.record_score(score)?;
        }
        if let Some(err) = outcome.take_failure() {
            return Err(err);
        }
        run.take_pending_rescore();
        Ok(())
    }

    fn categories_to_evaluate(&self, run: &Run) -> Vec<CategorySpec> {
        let pending = run.pending_rescore();
        self.config
            .categories
            .iter()
            .filter(|category| {
                if pending.is_empty() {
                    category.criteria.iter().any(|c| run.score(c).is_none())
                } else {
                    pending.contains(&category.name)
                }
            })
            .cloned()
            .collect()
    }

    /// Decide whether to stop, re-score or run another round.
    async fn debate_phase(
        &self,
        run: &mut Run,
        ctx: &RunContext,
        budget: &Arc<BudgetGuard>,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let limits = self.limits(run, budget);
        let report = self.detector.check(run, limits);
        let stop = if just_reopened(run) {
            limits.reason()
        } else {
            report.reason
        };

        if let Some(reason) = stop {
            info!(
                run.id = %run.run_id(),
                round = run.round(),
                reason = %reason,
                signals = ?report.signals,
                "Debate stopping"
            );
            run.set_stop_reason(Some(reason));
            run.transition(RunPhase::Synthesizing, &format!("debate stopped: {}", reason))?;
            return self.commit(run, budget, "debate stopped").await;
        }
        debug!(
            run.id = %run.run_id(),
            round = run.round(),
            blocking = ?report.blocking_criteria(),
            "Not converged"
        );

        if run.rescores_used() < self.config.debate.max_rescores {
            let categories = self.orchestrator.rescore_candidates(run);
            if !categories.is_empty() {
                info!(run.id = %run.run_id(), categories = ?categories, "Re-scoring low-confidence categories");
                run.queue_rescore(categories);
                run.transition(RunPhase::Evaluating, "confidence below re-score floor")?;
                return self.commit(run, budget, "re-scoring").await;
            }
        }

        let mut working = run.clone();
        let round = working.open_round()?;
        let exchanges = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled(ctx.run_id.clone())),
            exchanges = self.orchestrator.cross_examine(ctx, &working, budget) => exchanges?,
        };
        let count = exchanges.len();
        self.orchestrator.merge_round(&mut working, exchanges)?;
        *run = working;
        info!(
            run.id = %run.run_id(),
            round,
            exchanges = count,
            consumed = budget.consumed(),
            "Round complete"
        );
        self.commit(run, budget, &format!("round {} complete", round)).await
    }

    /// Lock the verdict or reopen debate. `None` means keep stepping.
    async fn review_phase(
        &self,
        run: &mut Run,
        budget: &BudgetGuard,
    ) -> EngineResult<Option<RunOutcome>> {
        let reason = run.stop_reason().unwrap_or_else(|| {
            warn!(run.id = %run.run_id(), "Reviewing without a stop reason; assuming MAX_ROUNDS");
            TerminationReason::MaxRounds
        });

        if self.should_reopen(run, reason) {
            run.note_reopen();
            run.set_stop_reason(None);
            run.transition(RunPhase::Debating, "unresolved conflict reopened debate")?;
            self.commit(run, budget, "reopened").await?;
            return Ok(None);
        }

        run.record_usage(budget.consumed(), budget.elapsed_ms());
        let verdict = run.lock(reason)?.clone();
        self.save(run, "locked").await?;
        info!(
            run.id = %run.run_id(),
            reason = %reason,
            aggregate_score = verdict.aggregate_score,
            aggregate_confidence = verdict.aggregate_confidence,
            "Verdict locked"
        );
        Ok(Some(RunOutcome::Locked(verdict)))
    }

    fn should_reopen(&self, run: &Run, reason: TerminationReason) -> bool {
        if reason.is_hard_limit()
            || run.reopens_used() >= self.config.debate.max_reopens
            || run.round() >= self.config.debate.max_rounds
        {
            return false;
        }
        let since = last_reopen_round(run);
        run.resolutions()
            .iter()
            .any(|r| r.is_unresolved() && r.round > since)
    }

    fn limits(&self, run: &Run, budget: &BudgetGuard) -> LimitStatus {
        LimitStatus {
            rounds_exhausted: run.round() >= self.config.debate.max_rounds,
            budget_exhausted: !budget.can_afford(self.orchestrator.round_cost(run.scores().len())),
            deadline_passed: budget.check_deadline().is_err(),
        }
    }

    async fn commit(&self, run: &mut Run, budget: &BudgetGuard, reason: &str) -> EngineResult<()> {
        run.record_usage(budget.consumed(), budget.elapsed_ms());
        self.save(run, reason).await
    }

    async fn save(&self, run: &mut Run, reason: &str) -> EngineResult<()> {
        let checkpoint = run.checkpoint(reason);
        if let Err(e) = self.store.save(&checkpoint).await {
            run.discard_checkpoint(checkpoint.sequence);
            return Err(e.into());
        }
        debug!(
            run.id = %run.run_id(),
            sequence = checkpoint.sequence,
            phase = %run.phase(),
            round = run.round(),
            reason,
            "Checkpoint saved"
        );
        Ok(())
    }
}

fn failed(run: Run) -> RunOutcome {
    let message = run
        .failure()
        .map(|f| f.message.clone())
        .unwrap_or_default();
    RunOutcome::Failed {
        run: Box::new(run),
        message,
    }
}

fn check_item(run: &Run, request: &EvaluationRequest) -> EngineResult<()> {
    if run.item_id() != request.item_id {
        return Err(EngineError::config(format!(
            "run {} evaluates item {}, not {}",
            run.run_id(),
            run.item_id(),
            request.item_id
        )));
    }
    Ok(())
}

/// Round at which debate was last reopened (0 if never).
fn last_reopen_round(run: &Run) -> u32 {
    run.transitions()
        .iter()
        .rev()
        .find(|t| t.from == RunPhase::Reviewing && t.to == RunPhase::Debating)
        .map(|t| t.round)
        .unwrap_or(0)
}

/// Debate was reopened and no round has run since.
fn just_reopened(run: &Run) -> bool {
    run.transitions().last().is_some_and(|t| {
        t.from == RunPhase::Reviewing && t.to == RunPhase::Debating && t.round == run.round()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore, PersistenceError};
    use crate::review::MockReviewCapability;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Refuses its first save, then behaves like the memory store.
    #[derive(Default)]
    struct RefusesFirstSave {
        refused: AtomicBool,
        inner: MemoryCheckpointStore,
    }

    #[async_trait]
    impl CheckpointStore for RefusesFirstSave {
        async fn save(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
            if !self.refused.swap(true, Ordering::SeqCst) {
                return Err(PersistenceError::Io {
                    reason: "disk full".into(),
                });
            }
            self.inner.save(checkpoint).await
        }

        async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, PersistenceError> {
            self.inner.load(run_id).await
        }

        async fn delete(&self, run_id: &str) -> Result<bool, PersistenceError> {
            self.inner.delete(run_id).await
        }
    }

    fn controller(config: EngineConfig) -> RunController {
        RunController::new(
            config,
            Arc::new(MockReviewCapability::new()),
            Arc::new(MemoryCheckpointStore::new()),
            LockManager::new(Default::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = EngineConfig {
            categories: Vec::new(),
            ..Default::default()
        };
        let result = RunController::new(
            config,
            Arc::new(MockReviewCapability::new()),
            Arc::new(MemoryCheckpointStore::new()),
            LockManager::new(Default::default()),
        );
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_categories_to_evaluate() {
        let ctl = controller(EngineConfig::default());
        let mut run = Run::new("r-1", "item-1", 15.0, 0);
        assert_eq!(ctl.categories_to_evaluate(&run).len(), 6);

        run.record_score(crate::types::CriterionScore::new("risk", "risk", 5.0, 0.5, ""))
            .unwrap();
        let names: Vec<String> = ctl
            .categories_to_evaluate(&run)
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names.len(), 5);
        assert!(!names.contains(&"risk".to_string()));

        run.queue_rescore(vec!["risk".into()]);
        let names: Vec<String> = ctl
            .categories_to_evaluate(&run)
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["risk"]);
    }

    #[test]
    fn test_limits() {
        let ctl = controller(EngineConfig::default());
        let mut run = Run::new("r-1", "item-1", 15.0, 0);
        for name in ["a", "b", "c"] {
            run.record_score(crate::types::CriterionScore::new(name, name, 5.0, 0.5, ""))
                .unwrap();
        }
        let budget = BudgetGuard::new(&ctl.config().budget);
        assert_eq!(ctl.limits(&run, &budget), LimitStatus::none());

        let tight = BudgetGuard::new(&BudgetConfig {
            ceiling: 1.0,
            wall_clock_ms: 0,
        });
        let limits = ctl.limits(&run, &tight);
        assert!(limits.budget_exhausted);
        assert_eq!(limits.reason(), Some(TerminationReason::BudgetExceeded));
    }

    #[test]
    fn test_reopen_helpers() {
        let mut run = Run::new("r-1", "item-1", 15.0, 0);
        assert!(!just_reopened(&run));
        assert_eq!(last_reopen_round(&run), 0);
        for phase in [
            RunPhase::Evaluating,
            RunPhase::Debating,
            RunPhase::Synthesizing,
            RunPhase::Reviewing,
            RunPhase::Debating,
        ] {
            run.transition(phase, "test").unwrap();
        }
        assert!(just_reopened(&run));
        run.open_round().unwrap();
        assert!(!just_reopened(&run));
    }

    #[tokio::test]
    async fn test_refused_save_does_not_advance_sequence() {
        let store = Arc::new(RefusesFirstSave::default());
        let ctl = RunController::new(
            EngineConfig::default(),
            Arc::new(MockReviewCapability::new()),
            store.clone(),
            LockManager::new(Default::default()),
        )
        .unwrap();
        let mut run = Run::new("r-1", "item-1", 15.0, 0);

        let err = ctl.save(&mut run, "created").await.unwrap_err();
        assert!(matches!(err, EngineError::Persistence(PersistenceError::Io { .. })));
        assert_eq!(run.checkpoint_seq(), 0);

        ctl.save(&mut run, "created").await.unwrap();
        assert_eq!(run.checkpoint_seq(), 1);
        let stored = store.load("r-1").await.unwrap().unwrap();
        assert_eq!(stored.sequence, 1);
        assert_eq!(stored.run.checkpoint_seq(), 1);
    }

    #[test]
    fn test_outcome_verdict() {
        let outcome = RunOutcome::Suspended {
            run_id: "r-1".into(),
            phase: RunPhase::Debating,
            round: 2,
        };
        assert!(outcome.verdict().is_none());
        assert_eq!(outcome.label(), "suspended");
    }
}
