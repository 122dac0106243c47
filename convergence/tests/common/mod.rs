//! Deterministic scripted reviewer shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use convergence::review::{
    ArbitrateRequest, Assessment, Challenge, ChallengeRequest, Defense, DefendRequest, Evaluation,
    EvaluateRequest, Ruling,
};
use convergence::{
    Billed, CheckpointStore, EngineConfig, ExchangeVerdict, Grounding, LockManager,
    MemoryCheckpointStore, RetryPolicy, ReviewCapability, ReviewError, RunController,
};
use tokio_util::sync::CancellationToken;

pub const EVALUATE_COST: f64 = 0.40;
pub const EXCHANGE_CALL_COST: f64 = 0.10;

static INIT: Once = Once::new();

pub fn init_test_subscriber() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

type ChallengeFn = dyn Fn(&ChallengeRequest) -> Result<Challenge, ReviewError> + Send + Sync;
type RulingFn = dyn Fn(&ArbitrateRequest) -> Result<Ruling, ReviewError> + Send + Sync;
type AssessFn = dyn Fn(&EvaluateRequest, &str) -> (f64, f64) + Send + Sync;

/// Reviewer whose every answer is a function of the request.
pub struct ScriptedReviewer {
    score: f64,
    confidence: f64,
    evaluate_delay: Duration,
    assess: Option<Box<AssessFn>>,
    challenge: Box<ChallengeFn>,
    ruling: Box<RulingFn>,
    cancel_at: Option<(u32, CancellationToken)>,
    cancel_fired: AtomicBool,
    pub evaluate_calls: AtomicUsize,
    pub challenge_calls: AtomicUsize,
    pub arbitrate_calls: AtomicUsize,
    evaluated: Mutex<Vec<String>>,
}

impl ScriptedReviewer {
    /// Scores 6 at confidence 0.6, unique challenge topics, every exchange
    /// defended with no score change.
    pub fn new() -> Self {
        Self {
            score: 6.0,
            confidence: 0.6,
            evaluate_delay: Duration::ZERO,
            assess: None,
            challenge: Box::new(|req| Ok(unique_challenge(req))),
            ruling: Box::new(|_| Ok(ruling(ExchangeVerdict::Defender, 0.0))),
            cancel_at: None,
            cancel_fired: AtomicBool::new(false),
            evaluate_calls: AtomicUsize::new(0),
            challenge_calls: AtomicUsize::new(0),
            arbitrate_calls: AtomicUsize::new(0),
            evaluated: Mutex::new(Vec::new()),
        }
    }

    pub fn with_initial(mut self, score: f64, confidence: f64) -> Self {
        self.score = score;
        self.confidence = confidence;
        self
    }

    /// Score and confidence per (request, criterion), overriding the initial pair.
    pub fn with_assessment(
        mut self,
        f: impl Fn(&EvaluateRequest, &str) -> (f64, f64) + Send + Sync + 'static,
    ) -> Self {
        self.assess = Some(Box::new(f));
        self
    }

    pub fn with_evaluate_delay(mut self, delay: Duration) -> Self {
        self.evaluate_delay = delay;
        self
    }

    pub fn with_challenge(
        mut self,
        f: impl Fn(&ChallengeRequest) -> Result<Challenge, ReviewError> + Send + Sync + 'static,
    ) -> Self {
        self.challenge = Box::new(f);
        self
    }

    pub fn with_ruling(
        mut self,
        f: impl Fn(&ArbitrateRequest) -> Result<Ruling, ReviewError> + Send + Sync + 'static,
    ) -> Self {
        self.ruling = Box::new(f);
        self
    }

    /// Cancel `token` the first time a challenge of `round` is issued.
    pub fn cancel_during_round(mut self, round: u32, token: CancellationToken) -> Self {
        self.cancel_at = Some((round, token));
        self
    }

    pub fn evaluations(&self) -> usize {
        self.evaluate_calls.load(Ordering::SeqCst)
    }

    /// Categories in the order their evaluations were answered.
    pub fn evaluated_categories(&self) -> Vec<String> {
        self.evaluated.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReviewCapability for ScriptedReviewer {
    async fn evaluate(&self, request: &EvaluateRequest) -> Result<Billed<Evaluation>, ReviewError> {
        self.evaluate_calls.fetch_add(1, Ordering::SeqCst);
        if !self.evaluate_delay.is_zero() {
            tokio::time::sleep(self.evaluate_delay).await;
        }
        let assessments = request
            .criteria
            .iter()
            .map(|criterion| {
                let (score, confidence) = match &self.assess {
                    Some(assess) => assess(request, criterion.as_str()),
                    None => (self.score, self.confidence),
                };
                Assessment {
                    criterion: criterion.clone(),
                    score,
                    confidence,
                    justification: format!("{} looks reasonable", criterion),
                    grounding: Grounding::default(),
                }
            })
            .collect();
        self.evaluated.lock().unwrap().push(request.category.clone());
        Ok(Billed::new(Evaluation { assessments }, EVALUATE_COST))
    }

    async fn challenge(&self, request: &ChallengeRequest) -> Result<Billed<Challenge>, ReviewError> {
        self.challenge_calls.fetch_add(1, Ordering::SeqCst);
        if let Some((round, token)) = &self.cancel_at {
            if request.round == *round && !self.cancel_fired.swap(true, Ordering::SeqCst) {
                token.cancel();
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
        (self.challenge)(request).map(|c| Billed::new(c, EXCHANGE_CALL_COST))
    }

    async fn defend(&self, _request: &DefendRequest) -> Result<Billed<Defense>, ReviewError> {
        Ok(Billed::new(
            Defense {
                text: "the position holds under the stated constraints".into(),
                grounding: Grounding::default(),
            },
            EXCHANGE_CALL_COST,
        ))
    }

    async fn arbitrate(&self, request: &ArbitrateRequest) -> Result<Billed<Ruling>, ReviewError> {
        self.arbitrate_calls.fetch_add(1, Ordering::SeqCst);
        (self.ruling)(request).map(|r| Billed::new(r, EXCHANGE_CALL_COST))
    }
}

/// A challenge whose topic is unique per (criterion, challenger, round).
pub fn unique_challenge(request: &ChallengeRequest) -> Challenge {
    Challenge {
        text: format!(
            "{} questions the {} score",
            request.challenger, request.claim.criterion
        ),
        topic: format!(
            "{} {} round {}",
            request.claim.criterion, request.challenger, request.round
        ),
        critical: false,
        counter_score: None,
        confidence: 0.5,
        grounding: Grounding::default(),
    }
}

pub fn ruling(verdict: ExchangeVerdict, delta: f64) -> Ruling {
    Ruling {
        verdict,
        delta,
        bonus: false,
        rationale: String::new(),
    }
}

/// Default six single-criterion categories and two challengers, every
/// criterion challenged each round, near-instant back-off.
pub fn config(max_rounds: u32) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.debate.max_rounds = max_rounds;
    config.debate.criteria_per_round = 0;
    config.retry = RetryPolicy {
        max_retries: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        ..Default::default()
    };
    config
}

pub fn controller_with(
    config: EngineConfig,
    reviewer: Arc<ScriptedReviewer>,
    store: Arc<dyn CheckpointStore>,
    locks: Arc<LockManager>,
) -> RunController {
    RunController::new(config, reviewer, store, locks).expect("valid config")
}

pub fn controller(config: EngineConfig, reviewer: Arc<ScriptedReviewer>) -> RunController {
    let locks = LockManager::new(config.lock.clone());
    controller_with(config, reviewer, Arc::new(MemoryCheckpointStore::new()), locks)
}

/// Deltas that stabilize by round 2: +0.5 in round 1, +0.15 in round 2.
pub fn stabilizing_reviewer() -> ScriptedReviewer {
    ScriptedReviewer::new().with_ruling(|req| {
        let delta = match req.round {
            1 => 0.5,
            2 => 0.15,
            _ => 0.0,
        };
        Ok(ruling(ExchangeVerdict::Defender, delta))
    })
}
