//! Debate orchestrator: reviewer fan-out and cross-examination rounds.
//!
//! # Modes
//!
//! ```text
//! fan-out          evaluate(category) × N   concurrently, every result collected
//! cross-examine    (criterion, challenger) × M concurrently
//!                      └─ challenge → defend → arbitrate   strictly sequential
//! ```
//!
//! Both modes are bounded by a semaphore of `max_in_flight` permits. Tasks
//! only return results; the controller merges them into the run in a fixed
//! order with [`DebateOrchestrator::merge_round`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn, Instrument};

use crate::budget::{BudgetGuard, CostModel};
use crate::config::CategorySpec;
use crate::convergence::normalize_topic;
use crate::error::{EngineError, EngineResult, ErrorClass, ReviewError};
use crate::retry::{with_retry, Attempt, RetryPolicy};
use crate::review::{
    ArbitrateRequest, Billed, ChallengeRequest, DefendRequest, EvaluateRequest, ReviewCapability,
};
use crate::state::Run;
use crate::telemetry;
use crate::types::{Claim, CriterionScore, Exchange, ExchangeVerdict, Grounding};

/// Debate round configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebateConfig {
    pub max_rounds: u32,
    /// Largest score change one ruling may apply.
    pub max_delta: f64,
    /// Concurrent remote calls per fan-out or round.
    pub max_in_flight: usize,
    /// Aggregate timeout of one round.
    pub round_timeout_ms: u64,
    pub challengers: Vec<String>,
    /// Criteria challenged per round (0 = all).
    pub criteria_per_round: usize,
    pub defended_confidence_step: f64,
    pub overturned_confidence_step: f64,
    pub inconclusive_penalty: f64,
    pub bonus_confidence: f64,
    /// Criteria below this confidence are sent back for re-evaluation.
    pub rescore_confidence_floor: f64,
    pub max_rescores: u32,
    /// Times a review may reopen debate over unresolved conflicts.
    pub max_reopens: u32,
}

impl Default for DebateConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            max_delta: 2.0,
            max_in_flight: 10,
            round_timeout_ms: 120_000,
            challengers: vec!["skeptic".to_string(), "contrarian".to_string()],
            criteria_per_round: 3,
            defended_confidence_step: 0.05,
            overturned_confidence_step: 0.10,
            inconclusive_penalty: 0.05,
            bonus_confidence: 0.05,
            rescore_confidence_floor: 0.3,
            max_rescores: 1,
            max_reopens: 1,
        }
    }
}

impl DebateConfig {
    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }
}

/// The item under evaluation, shared by every call of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: String,
    pub item_id: String,
    pub content: String,
    pub context: String,
}

/// A category with no successful evaluation.
#[derive(Debug)]
pub struct CategoryFailure {
    pub category: String,
    pub error: EngineError,
}

/// Everything a fan-out produced.
#[derive(Debug, Default)]
pub struct FanOutOutcome {
    pub scores: Vec<CriterionScore>,
    pub failures: Vec<CategoryFailure>,
}

impl FanOutOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// The error that fails the run when any category came back empty.
    ///
    /// Limit breaches win (they carry a termination reason), then fatal
    /// remote errors; exhausted retries are reported together.
    pub fn take_failure(&mut self) -> Option<EngineError> {
        if self.failures.is_empty() {
            return None;
        }
        let failures = std::mem::take(&mut self.failures);
        let categories: Vec<String> = failures.iter().map(|f| f.category.clone()).collect();
        let rank = |f: &CategoryFailure| match f.error.class() {
            ErrorClass::Limit => 0,
            ErrorClass::Cancelled => 1,
            ErrorClass::FatalRemote | ErrorClass::Persistence | ErrorClass::ContractViolation => 2,
            ErrorClass::TransientRemote => 3,
        };
        let worst = failures.into_iter().min_by_key(|f| rank(f))?;
        Some(match worst.error.class() {
            ErrorClass::TransientRemote => EngineError::FanOutFailed { categories },
            _ => worst.error,
        })
    }
}

/// Charge, call with retry, settle.
async fn billed_call<T, F, Fut>(
    budget: &BudgetGuard,
    projected: f64,
    retry: &RetryPolicy,
    operation: &str,
    call: F,
) -> EngineResult<T>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<Billed<T>, ReviewError>>,
{
    let reservation = budget.authorize(projected)?;
    let billed = with_retry(retry, operation, call).await?;
    reservation.settle(billed.cost)?;
    Ok(billed.value)
}

/// Runs fan-outs and cross-examination rounds against a review capability.
pub struct DebateOrchestrator {
    reviewer: Arc<dyn ReviewCapability>,
    config: DebateConfig,
    retry: RetryPolicy,
    cost: CostModel,
}

impl DebateOrchestrator {
    pub fn new(
        reviewer: Arc<dyn ReviewCapability>,
        config: DebateConfig,
        retry: RetryPolicy,
        cost: CostModel,
    ) -> Self {
        Self {
            reviewer,
            config,
            retry,
            cost,
        }
    }

    pub fn config(&self) -> &DebateConfig {
        &self.config
    }

    // ── Fan-out ──

    /// Evaluate every category concurrently and collect all results.
    ///
    /// The whole fan-out is priced up front; if the budget cannot cover it,
    /// nothing is issued.
    pub async fn fan_out(
        &self,
        ctx: &RunContext,
        round: u32,
        categories: &[CategorySpec],
        budget: &Arc<BudgetGuard>,
    ) -> EngineResult<FanOutOutcome> {
        if categories.is_empty() {
            return Ok(FanOutOutcome::default());
        }
        drop(budget.authorize(self.cost.evaluate * categories.len() as f64)?);

        let span = telemetry::fan_out_span(&ctx.run_id, round, categories.len());
        let sem = Arc::new(Semaphore::new(self.config.max_in_flight));
        let mut join_set: JoinSet<(String, EngineResult<Vec<CriterionScore>>)> = JoinSet::new();

        for category in categories.iter().cloned() {
            let sem = sem.clone();
            let reviewer = self.reviewer.clone();
            let retry = self.retry.clone();
            let projected = self.cost.evaluate;
            let budget = budget.clone();
            let ctx = ctx.clone();

            join_set.spawn(
                async move {
                    let name = category.name.clone();
                    let result = match sem.acquire().await {
                        Ok(_permit) => {
                            evaluate_category(reviewer, &retry, projected, &ctx, round, category, &budget)
                                .await
                        }
                        Err(_) => Err(EngineError::Cancelled(ctx.run_id.clone())),
                    };
                    (name, result)
                }
                .instrument(span.clone()),
            );
        }

        let mut outcome = FanOutOutcome::default();
        let mut answered = Vec::new();
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok((category, Ok(scores))) => {
                    debug!(run.id = %ctx.run_id, category = %category, "Category evaluated");
                    answered.push(category);
                    outcome.scores.extend(scores);
                }
                Ok((category, Err(e))) => {
                    warn!(run.id = %ctx.run_id, category = %category, error = %e, "Category evaluation failed");
                    answered.push(category.clone());
                    outcome.failures.push(CategoryFailure { category, error: e });
                }
                Err(e) => {
                    error!(run.id = %ctx.run_id, error = %e, "Evaluation task panicked");
                }
            }
        }

        // Tasks that panicked never reported back.
        for category in categories {
            if !answered.contains(&category.name) {
                outcome.failures.push(CategoryFailure {
                    category: category.name.clone(),
                    error: EngineError::FanOutFailed {
                        categories: vec![category.name.clone()],
                    },
                });
            }
        }

        outcome.scores.sort_by(|a, b| a.criterion().cmp(b.criterion()));
        outcome.failures.sort_by(|a, b| a.category.cmp(&b.category));
        span.record(
            telemetry::FIELD_OUTCOME,
            if outcome.is_complete() { "complete" } else { "partial" },
        );
        Ok(outcome)
    }

    // ── Cross-examination ──

    /// Criteria to challenge this round: lowest confidence first, then
    /// highest score, then name.
    pub fn select_targets<'a>(
        &self,
        scores: impl IntoIterator<Item = &'a CriterionScore>,
    ) -> Vec<&'a CriterionScore> {
        let mut targets: Vec<&CriterionScore> = scores.into_iter().collect();
        targets.sort_by(|a, b| {
            a.confidence()
                .total_cmp(&b.confidence())
                .then(b.score().total_cmp(&a.score()))
                .then(a.criterion().cmp(b.criterion()))
        });
        if self.config.criteria_per_round > 0 {
            targets.truncate(self.config.criteria_per_round);
        }
        targets
    }

    /// Projected cost of a round over `criteria` criteria.
    pub fn round_cost(&self, criteria: usize) -> f64 {
        let targeted = if self.config.criteria_per_round > 0 {
            criteria.min(self.config.criteria_per_round)
        } else {
            criteria
        };
        (targeted * self.config.challengers.len()) as f64 * self.cost.exchange()
    }

    /// Run one round of cross-examination against `run`'s current scores.
    ///
    /// Returns the round's exchanges sorted by `(criterion, challenger)`.
    /// Exhausted retries inside a pair yield an inconclusive exchange; any
    /// other error aborts the round. The round as a whole is bounded by
    /// `round_timeout_ms`.
    pub async fn cross_examine(
        &self,
        ctx: &RunContext,
        run: &Run,
        budget: &Arc<BudgetGuard>,
    ) -> EngineResult<Vec<Exchange>> {
        let round = run.round();
        let targets: Vec<CriterionScore> = self
            .select_targets(run.scores().values())
            .into_iter()
            .cloned()
            .collect();
        let pairs = targets.len() * self.config.challengers.len();
        let span = telemetry::round_span(&ctx.run_id, round, pairs);
        let started = tokio::time::Instant::now();

        let sem = Arc::new(Semaphore::new(self.config.max_in_flight));
        let mut join_set: JoinSet<EngineResult<Exchange>> = JoinSet::new();
        for target in &targets {
            for challenger in &self.config.challengers {
                let pair = PairTask {
                    reviewer: self.reviewer.clone(),
                    retry: self.retry.clone(),
                    cost: self.cost.clone(),
                    max_delta: self.config.max_delta,
                    ctx: ctx.clone(),
                    round,
                    target: target.clone(),
                    challenger: challenger.clone(),
                    budget: budget.clone(),
                };
                let sem = sem.clone();
                join_set.spawn(
                    async move {
                        let _permit = sem
                            .acquire()
                            .await
                            .map_err(|_| EngineError::Cancelled(pair.ctx.run_id.clone()))?;
                        pair.run().await
                    }
                    .instrument(span.clone()),
                );
            }
        }

        let collect = async {
            let mut exchanges = Vec::with_capacity(pairs);
            while let Some(res) = join_set.join_next().await {
                match res {
                    Ok(Ok(exchange)) => exchanges.push(exchange),
                    Ok(Err(e)) => return Err(e),
                    Err(e) => error!(run.id = %ctx.run_id, round, error = %e, "Exchange task panicked"),
                }
            }
            Ok(exchanges)
        };

        let result = match tokio::time::timeout(self.config.round_timeout(), collect).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::RoundTimeout {
                round,
                limit_ms: self.config.round_timeout_ms,
            }),
        };
        // Dropping the set aborts whatever is still in flight.
        join_set.abort_all();

        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(mut exchanges) => {
                exchanges.sort_by(|a, b| {
                    a.criterion
                        .cmp(&b.criterion)
                        .then(a.challenger.cmp(&b.challenger))
                });
                telemetry::record_round_result(&span, "completed", duration_ms);
                Ok(exchanges)
            }
            Err(e) => {
                telemetry::record_round_result(&span, "aborted", duration_ms);
                Err(e)
            }
        }
    }

    /// Merge a completed round into the run, in order.
    ///
    /// Confidence moves with the verdict; any nonzero delta is clamped to
    /// `±max_delta` and applied to the score. The exchange records the delta
    /// actually applied.
    pub fn merge_round(&self, run: &mut Run, exchanges: Vec<Exchange>) -> EngineResult<()> {
        for mut exchange in exchanges {
            if let Some(score) = run.score_mut(&exchange.criterion)? {
                if exchange.inconclusive {
                    score.adjust_confidence(-self.config.inconclusive_penalty);
                    exchange.delta = 0.0;
                } else {
                    let step = match exchange.verdict {
                        ExchangeVerdict::Defender => self.config.defended_confidence_step,
                        ExchangeVerdict::Challenger => -self.config.overturned_confidence_step,
                        ExchangeVerdict::Draw => 0.0,
                    };
                    score.adjust_confidence(step);
                    if exchange.bonus {
                        score.adjust_confidence(self.config.bonus_confidence);
                    }
                    let delta = exchange.delta.clamp(-self.config.max_delta, self.config.max_delta);
                    exchange.delta = if delta != 0.0 {
                        score.apply_delta(delta)
                    } else {
                        0.0
                    };
                }
                debug!(
                    run.id = %run.run_id(),
                    round = exchange.round,
                    criterion = %exchange.criterion,
                    challenger = %exchange.challenger,
                    verdict = %exchange.verdict,
                    delta = exchange.delta,
                    "Exchange merged"
                );
            }
            run.append_exchange(exchange)?;
        }
        Ok(())
    }

    /// Categories holding a criterion below the re-score floor.
    pub fn rescore_candidates(&self, run: &Run) -> Vec<String> {
        let mut categories: Vec<String> = run
            .scores()
            .values()
            .filter(|s| s.confidence() < self.config.rescore_confidence_floor)
            .map(|s| s.category().to_string())
            .collect();
        categories.sort();
        categories.dedup();
        categories
    }
}

async fn evaluate_category(
    reviewer: Arc<dyn ReviewCapability>,
    retry: &RetryPolicy,
    projected: f64,
    ctx: &RunContext,
    round: u32,
    category: CategorySpec,
    budget: &BudgetGuard,
) -> EngineResult<Vec<CriterionScore>> {
    let span = telemetry::call_span("evaluate", &category.name, round);
    let base = EvaluateRequest {
        run_id: ctx.run_id.clone(),
        item_id: ctx.item_id.clone(),
        round,
        category: category.name.clone(),
        criteria: category.criteria.clone(),
        content: ctx.content.clone(),
        context: ctx.context.clone(),
        attempt: Attempt::first(),
    };
    let result = billed_call(budget, projected, retry, "evaluate", |attempt| {
        let reviewer = reviewer.clone();
        let request = EvaluateRequest {
            attempt,
            ..base.clone()
        };
        async move {
            let billed = reviewer.evaluate(&request).await?;
            billed.value.validate(&request.criteria)?;
            Ok(billed)
        }
    })
    .instrument(span.clone())
    .await;

    let evaluation = match result {
        Ok(evaluation) => {
            telemetry::record_call_result(&span, "ok", projected);
            evaluation
        }
        Err(e) => {
            telemetry::record_call_result(&span, "error", 0.0);
            return Err(e);
        }
    };

    Ok(evaluation
        .assessments
        .into_iter()
        .map(|a| {
            CriterionScore::new(a.criterion, &category.name, a.score, a.confidence, a.justification)
                .with_grounding(a.grounding)
        })
        .collect())
}

/// One (criterion, challenger) pair, owned by its task.
struct PairTask {
    reviewer: Arc<dyn ReviewCapability>,
    retry: RetryPolicy,
    cost: CostModel,
    max_delta: f64,
    ctx: RunContext,
    round: u32,
    target: CriterionScore,
    challenger: String,
    budget: Arc<BudgetGuard>,
}

impl PairTask {
    /// challenge → defend → arbitrate.
    async fn run(self) -> EngineResult<Exchange> {
        let criterion = self.target.criterion().to_string();
        let defender = format!("reviewer:{}", self.target.category());
        let claim = self.target.as_claim(
            &defender,
            self.target.justification(),
            self.target.grounding().clone(),
        );
        let mut exchange = Exchange {
            round: self.round,
            criterion: criterion.clone(),
            challenger: self.challenger.clone(),
            challenge: String::new(),
            topic: String::new(),
            critical: false,
            defender,
            defense: String::new(),
            defense_grounding: Grounding::default(),
            counter_claim: None,
            verdict: ExchangeVerdict::Draw,
            delta: 0.0,
            bonus: false,
            inconclusive: false,
            recorded_at: Utc::now(),
        };

        // Challenge.
        let request = ChallengeRequest {
            run_id: self.ctx.run_id.clone(),
            item_id: self.ctx.item_id.clone(),
            round: self.round,
            challenger: self.challenger.clone(),
            claim: claim.clone(),
            content: self.ctx.content.clone(),
            attempt: Attempt::first(),
        };
        let reviewer = self.reviewer.clone();
        let challenge = match self
            .call("challenge", self.cost.challenge, |attempt| {
                let reviewer = reviewer.clone();
                let request = ChallengeRequest {
                    attempt,
                    ..request.clone()
                };
                async move {
                    let billed = reviewer.challenge(&request).await?;
                    billed.value.validate()?;
                    Ok(billed)
                }
            })
            .await
        {
            Ok(challenge) => challenge,
            Err(e) => return self.inconclusive(exchange, "challenge", e),
        };
        exchange.challenge = challenge.text.clone();
        exchange.topic = normalize_topic(&challenge.topic);
        exchange.critical = challenge.critical;
        exchange.counter_claim = challenge.counter_score.map(|score| Claim {
            author: self.challenger.clone(),
            criterion: criterion.clone(),
            score,
            confidence: challenge.confidence,
            statement: challenge.text.clone(),
            grounding: challenge.grounding.clone(),
        });

        // Defense.
        let request = DefendRequest {
            run_id: self.ctx.run_id.clone(),
            item_id: self.ctx.item_id.clone(),
            round: self.round,
            claim: claim.clone(),
            challenger: self.challenger.clone(),
            challenge: challenge.clone(),
            content: self.ctx.content.clone(),
            attempt: Attempt::first(),
        };
        let defense = match self
            .call("defend", self.cost.defend, |attempt| {
                let reviewer = reviewer.clone();
                let request = DefendRequest {
                    attempt,
                    ..request.clone()
                };
                async move {
                    let billed = reviewer.defend(&request).await?;
                    billed.value.validate()?;
                    Ok(billed)
                }
            })
            .await
        {
            Ok(defense) => defense,
            Err(e) => return self.inconclusive(exchange, "defend", e),
        };
        exchange.defense = defense.text.clone();
        exchange.defense_grounding = defense.grounding.clone();

        // Verdict.
        let request = ArbitrateRequest {
            run_id: self.ctx.run_id.clone(),
            item_id: self.ctx.item_id.clone(),
            round: self.round,
            claim,
            challenge,
            defense,
            attempt: Attempt::first(),
        };
        let ruling = match self
            .call("arbitrate", self.cost.arbitrate, |attempt| {
                let reviewer = reviewer.clone();
                let request = ArbitrateRequest {
                    attempt,
                    ..request.clone()
                };
                async move {
                    let billed = reviewer.arbitrate(&request).await?;
                    billed.value.validate()?;
                    Ok(billed)
                }
            })
            .await
        {
            Ok(ruling) => ruling,
            Err(e) => return self.inconclusive(exchange, "arbitrate", e),
        };

        exchange.verdict = ruling.verdict;
        exchange.delta = ruling.delta.clamp(-self.max_delta, self.max_delta);
        exchange.bonus = ruling.bonus;
        exchange.recorded_at = Utc::now();
        Ok(exchange)
    }

    async fn call<T, F, Fut>(&self, operation: &str, projected: f64, call: F) -> EngineResult<T>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<Billed<T>, ReviewError>>,
    {
        let span = telemetry::call_span(operation, self.target.criterion(), self.round);
        let result = billed_call(&self.budget, projected, &self.retry, operation, call)
            .instrument(span.clone())
            .await;
        match &result {
            Ok(_) => telemetry::record_call_result(&span, "ok", projected),
            Err(e) => telemetry::record_call_result(&span, &e.class().to_string(), 0.0),
        }
        result
    }

    /// Turn exhausted retries into an inconclusive draw; propagate the rest.
    fn inconclusive(
        &self,
        mut exchange: Exchange,
        operation: &str,
        error: EngineError,
    ) -> EngineResult<Exchange> {
        if error.fails_run() {
            return Err(error);
        }
        warn!(
            run.id = %self.ctx.run_id,
            round = self.round,
            criterion = %exchange.criterion,
            challenger = %exchange.challenger,
            operation,
            error = %error,
            "Exchange inconclusive"
        );
        exchange.verdict = ExchangeVerdict::Draw;
        exchange.delta = 0.0;
        exchange.bonus = false;
        exchange.inconclusive = true;
        exchange.recorded_at = Utc::now();
        Ok(exchange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetConfig;
    use crate::review::{Assessment, Challenge, Defense, Evaluation, MockReviewCapability, Ruling};

    fn ctx() -> RunContext {
        RunContext {
            run_id: "r-1".into(),
            item_id: "item-1".into(),
            content: "a proposal".into(),
            context: String::new(),
        }
    }

    fn budget(ceiling: f64) -> Arc<BudgetGuard> {
        Arc::new(BudgetGuard::new(&BudgetConfig {
            ceiling,
            wall_clock_ms: 0,
        }))
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
            ..Default::default()
        }
    }

    fn orchestrator(mock: MockReviewCapability, config: DebateConfig) -> DebateOrchestrator {
        DebateOrchestrator::new(Arc::new(mock), config, fast_retry(), CostModel::default())
    }

    fn debating_run(scores: &[(&str, f64, f64)]) -> Run {
        let mut run = Run::new("r-1", "item-1", 15.0, 0);
        for (name, score, confidence) in scores {
            run.record_score(CriterionScore::new(*name, *name, *score, *confidence, "initial"))
                .unwrap();
        }
        run.open_round().unwrap();
        run
    }

    fn mock_exchange(mock: &mut MockReviewCapability, verdict: ExchangeVerdict, delta: f64) {
        mock.expect_challenge().returning(|req| {
            Ok(Billed::new(
                Challenge {
                    text: format!("{} doubts {}", req.challenger, req.claim.criterion),
                    topic: format!("{}-{}", req.claim.criterion, req.challenger),
                    critical: false,
                    counter_score: None,
                    confidence: 0.5,
                    grounding: Grounding::default(),
                },
                0.1,
            ))
        });
        mock.expect_defend().returning(|_| {
            Ok(Billed::new(
                Defense {
                    text: "holds".into(),
                    grounding: Grounding::default(),
                },
                0.1,
            ))
        });
        mock.expect_arbitrate().returning(move |_| {
            Ok(Billed::new(
                Ruling {
                    verdict,
                    delta,
                    bonus: false,
                    rationale: String::new(),
                },
                0.1,
            ))
        });
    }

    #[test]
    fn test_select_targets_priority() {
        let orch = orchestrator(
            MockReviewCapability::new(),
            DebateConfig {
                criteria_per_round: 2,
                ..Default::default()
            },
        );
        let scores = vec![
            CriterionScore::new("a", "a", 5.0, 0.9, ""),
            CriterionScore::new("b", "b", 4.0, 0.4, ""),
            CriterionScore::new("c", "c", 9.0, 0.4, ""),
            CriterionScore::new("d", "d", 9.0, 0.6, ""),
        ];
        let names: Vec<&str> = orch
            .select_targets(scores.iter())
            .into_iter()
            .map(|s| s.criterion())
            .collect();
        assert_eq!(names, vec!["c", "b"]);
    }

    #[test]
    fn test_round_cost() {
        let orch = orchestrator(MockReviewCapability::new(), DebateConfig::default());
        // 3 criteria × 2 challengers × 0.30
        assert!((orch.round_cost(6) - 1.8).abs() < 1e-9);
        assert!((orch.round_cost(1) - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fan_out_collects_all_categories() {
        let mut mock = MockReviewCapability::new();
        mock.expect_evaluate().times(2).returning(|req| {
            Ok(Billed::new(
                Evaluation {
                    assessments: req
                        .criteria
                        .iter()
                        .map(|c| Assessment {
                            criterion: c.clone(),
                            score: 6.0,
                            confidence: 0.6,
                            justification: "fine".into(),
                            grounding: Grounding::default(),
                        })
                        .collect(),
                },
                0.4,
            ))
        });
        let orch = orchestrator(mock, DebateConfig::default());
        let budget = budget(10.0);
        let categories = vec![
            CategorySpec::new("technical", &["feasibility", "risk"]),
            CategorySpec::single("impact"),
        ];
        let outcome = orch.fan_out(&ctx(), 0, &categories, &budget).await.unwrap();
        assert!(outcome.is_complete());
        let names: Vec<&str> = outcome.scores.iter().map(|s| s.criterion()).collect();
        assert_eq!(names, vec!["feasibility", "impact", "risk"]);
        assert_eq!(outcome.scores[0].category(), "technical");
        assert!((budget.consumed() - 0.8).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_failure_isolated() {
        let mut mock = MockReviewCapability::new();
        mock.expect_evaluate().returning(|req| {
            if req.category == "risk" {
                Err(ReviewError::Transient("503".into()))
            } else {
                Ok(Billed::new(
                    Evaluation {
                        assessments: vec![Assessment {
                            criterion: req.category.clone(),
                            score: 5.0,
                            confidence: 0.5,
                            justification: String::new(),
                            grounding: Grounding::default(),
                        }],
                    },
                    0.4,
                ))
            }
        });
        let orch = orchestrator(mock, DebateConfig::default());
        let categories = vec![CategorySpec::single("risk"), CategorySpec::single("cost")];
        let mut outcome = orch
            .fan_out(&ctx(), 0, &categories, &budget(10.0))
            .await
            .unwrap();
        assert_eq!(outcome.scores.len(), 1);
        assert_eq!(outcome.failures.len(), 1);
        match outcome.take_failure().unwrap() {
            EngineError::FanOutFailed { categories } => assert_eq!(categories, vec!["risk"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_fan_out_unaffordable_issues_nothing() {
        let mut mock = MockReviewCapability::new();
        mock.expect_evaluate().never();
        let orch = orchestrator(mock, DebateConfig::default());
        let categories: Vec<CategorySpec> =
            ["a", "b", "c"].iter().map(|c| CategorySpec::single(c)).collect();
        let err = orch
            .fan_out(&ctx(), 0, &categories, &budget(1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BudgetExceeded { .. }));
    }

    #[tokio::test]
    async fn test_cross_examine_and_merge() {
        let mut mock = MockReviewCapability::new();
        mock_exchange(&mut mock, ExchangeVerdict::Defender, 0.5);
        let orch = orchestrator(
            mock,
            DebateConfig {
                criteria_per_round: 0,
                ..Default::default()
            },
        );
        let mut run = debating_run(&[("risk", 6.0, 0.6), ("cost", 4.0, 0.6)]);
        let budget = budget(10.0);
        let exchanges = orch.cross_examine(&ctx(), &run, &budget).await.unwrap();
        assert_eq!(exchanges.len(), 4);
        let order: Vec<(&str, &str)> = exchanges
            .iter()
            .map(|e| (e.criterion.as_str(), e.challenger.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("cost", "contrarian"),
                ("cost", "skeptic"),
                ("risk", "contrarian"),
                ("risk", "skeptic"),
            ]
        );
        assert!((budget.consumed() - 1.2).abs() < 1e-9);

        orch.merge_round(&mut run, exchanges).unwrap();
        let risk = run.score("risk").unwrap();
        assert!((risk.score() - 7.0).abs() < 1e-9);
        assert!((risk.confidence() - 0.7).abs() < 1e-9);
        assert_eq!(risk.history(), &[6.0]);
        assert_eq!(run.exchanges().len(), 4);
    }

    #[tokio::test]
    async fn test_delta_clamped_to_max() {
        let mut mock = MockReviewCapability::new();
        mock_exchange(&mut mock, ExchangeVerdict::Challenger, -7.5);
        let orch = orchestrator(
            mock,
            DebateConfig {
                challengers: vec!["skeptic".into()],
                ..Default::default()
            },
        );
        let mut run = debating_run(&[("risk", 8.0, 0.6)]);
        let exchanges = orch.cross_examine(&ctx(), &run, &budget(10.0)).await.unwrap();
        assert_eq!(exchanges[0].delta, -2.0);
        orch.merge_round(&mut run, exchanges).unwrap();
        let risk = run.score("risk").unwrap();
        assert!((risk.score() - 6.0).abs() < 1e-9);
        assert!((risk.confidence() - 0.5).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_are_inconclusive() {
        let mut mock = MockReviewCapability::new();
        mock.expect_challenge()
            .returning(|_| Err(ReviewError::RateLimited { retry_after: None }));
        mock.expect_defend().never();
        mock.expect_arbitrate().never();
        let orch = orchestrator(
            mock,
            DebateConfig {
                challengers: vec!["skeptic".into()],
                ..Default::default()
            },
        );
        let mut run = debating_run(&[("risk", 5.0, 0.6)]);
        let exchanges = orch.cross_examine(&ctx(), &run, &budget(10.0)).await.unwrap();
        assert_eq!(exchanges.len(), 1);
        assert!(exchanges[0].inconclusive);
        assert_eq!(exchanges[0].verdict, ExchangeVerdict::Draw);

        orch.merge_round(&mut run, exchanges).unwrap();
        let risk = run.score("risk").unwrap();
        assert_eq!(risk.score(), 5.0);
        assert!((risk.confidence() - 0.55).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_round() {
        let mut mock = MockReviewCapability::new();
        mock.expect_challenge()
            .returning(|_| Err(ReviewError::Unauthorized("revoked".into())));
        let orch = orchestrator(mock, DebateConfig::default());
        let run = debating_run(&[("risk", 5.0, 0.6)]);
        let err = orch
            .cross_examine(&ctx(), &run, &budget(10.0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Fatal { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_timeout() {
        struct Slow;

        #[async_trait::async_trait]
        impl ReviewCapability for Slow {
            async fn evaluate(&self, _: &EvaluateRequest) -> Result<Billed<Evaluation>, ReviewError> {
                unreachable!()
            }
            async fn challenge(&self, _: &ChallengeRequest) -> Result<Billed<Challenge>, ReviewError> {
                tokio::time::sleep(Duration::from_secs(50)).await;
                Err(ReviewError::Transient("slow".into()))
            }
            async fn defend(&self, _: &DefendRequest) -> Result<Billed<Defense>, ReviewError> {
                unreachable!()
            }
            async fn arbitrate(&self, _: &ArbitrateRequest) -> Result<Billed<Ruling>, ReviewError> {
                unreachable!()
            }
        }

        let orch = DebateOrchestrator::new(
            Arc::new(Slow),
            DebateConfig {
                round_timeout_ms: 1_000,
                ..Default::default()
            },
            fast_retry(),
            CostModel::default(),
        );
        let run = debating_run(&[("risk", 5.0, 0.6)]);
        let err = orch
            .cross_examine(&ctx(), &run, &budget(10.0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RoundTimeout { round: 1, .. }));
    }

    #[test]
    fn test_rescore_candidates() {
        let orch = orchestrator(MockReviewCapability::new(), DebateConfig::default());
        let run = debating_run(&[("risk", 5.0, 0.1), ("cost", 5.0, 0.9), ("impact", 5.0, 0.2)]);
        assert_eq!(orch.rescore_candidates(&run), vec!["impact", "risk"]);
    }
}
