//! Review capability: the opaque remote reviewer, challenger and arbiter.
//!
//! The engine never looks inside a reviewer. It sends typed requests,
//! receives typed responses, validates them against the schema below and
//! treats anything that does not fit as [`ReviewError::MalformedResponse`].

mod http;

pub use http::{HttpReviewer, HttpReviewerConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ReviewError;
use crate::retry::Attempt;
use crate::types::{Claim, ExchangeVerdict, Grounding, MAX_SCORE, MIN_SCORE};

/// A response together with what it actually cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Billed<T> {
    pub value: T,
    pub cost: f64,
}

impl<T> Billed<T> {
    pub fn new(value: T, cost: f64) -> Self {
        Self { value, cost }
    }
}

// ── Requests ──

/// Fan-out request: score every criterion of one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateRequest {
    pub run_id: String,
    pub item_id: String,
    pub round: u32,
    pub category: String,
    pub criteria: Vec<String>,
    pub content: String,
    pub context: String,
    pub attempt: Attempt,
}

/// Ask `challenger` to attack the current position on one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeRequest {
    pub run_id: String,
    pub item_id: String,
    pub round: u32,
    pub challenger: String,
    pub claim: Claim,
    pub content: String,
    pub attempt: Attempt,
}

/// Ask the defending reviewer to answer a challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefendRequest {
    pub run_id: String,
    pub item_id: String,
    pub round: u32,
    pub claim: Claim,
    pub challenger: String,
    pub challenge: Challenge,
    pub content: String,
    pub attempt: Attempt,
}

/// Ask the arbiter to rule on one challenge / defense pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrateRequest {
    pub run_id: String,
    pub item_id: String,
    pub round: u32,
    pub claim: Claim,
    pub challenge: Challenge,
    pub defense: Defense,
    pub attempt: Attempt,
}

// ── Responses ──

/// One criterion's assessment inside an [`Evaluation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub criterion: String,
    /// Integral score within `[MIN_SCORE, MAX_SCORE]`.
    pub score: f64,
    pub confidence: f64,
    pub justification: String,
    #[serde(default)]
    pub grounding: Grounding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub assessments: Vec<Assessment>,
}

impl Evaluation {
    /// Every requested criterion assessed exactly once, values in range.
    pub fn validate(&self, criteria: &[String]) -> Result<(), ReviewError> {
        for criterion in criteria {
            let count = self
                .assessments
                .iter()
                .filter(|a| &a.criterion == criterion)
                .count();
            if count != 1 {
                return Err(ReviewError::malformed(format!(
                    "criterion '{}' assessed {} times",
                    criterion, count
                )));
            }
        }
        for a in &self.assessments {
            if !criteria.contains(&a.criterion) {
                return Err(ReviewError::malformed(format!(
                    "unexpected criterion '{}'",
                    a.criterion
                )));
            }
            validate_score(&a.criterion, a.score)?;
            if a.score.fract() != 0.0 {
                return Err(ReviewError::malformed(format!(
                    "score for '{}' is not integral: {}",
                    a.criterion, a.score
                )));
            }
            validate_confidence(&a.criterion, a.confidence)?;
        }
        Ok(())
    }
}

/// A challenger's attack on a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub text: String,
    /// Short label of the concern raised, used to track novelty.
    pub topic: String,
    /// The challenger considers this concern blocking.
    #[serde(default)]
    pub critical: bool,
    /// The score the challenger argues for, if it proposes one.
    #[serde(default)]
    pub counter_score: Option<f64>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub grounding: Grounding,
}

impl Challenge {
    pub fn validate(&self) -> Result<(), ReviewError> {
        if self.text.trim().is_empty() {
            return Err(ReviewError::malformed("empty challenge text"));
        }
        if self.topic.trim().is_empty() {
            return Err(ReviewError::malformed("empty challenge topic"));
        }
        if let Some(score) = self.counter_score {
            validate_score("counter_score", score)?;
        }
        validate_confidence("challenge", self.confidence)
    }
}

/// The defending reviewer's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defense {
    pub text: String,
    #[serde(default)]
    pub grounding: Grounding,
}

impl Defense {
    pub fn validate(&self) -> Result<(), ReviewError> {
        if self.text.trim().is_empty() {
            return Err(ReviewError::malformed("empty defense text"));
        }
        Ok(())
    }
}

/// The arbiter's decision on one exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ruling {
    pub verdict: ExchangeVerdict,
    /// Proposed score change; clamped by the orchestrator.
    pub delta: f64,
    /// The defense's rationale earns a confidence bonus.
    #[serde(default)]
    pub bonus: bool,
    #[serde(default)]
    pub rationale: String,
}

impl Ruling {
    pub fn validate(&self) -> Result<(), ReviewError> {
        if !self.delta.is_finite() {
            return Err(ReviewError::malformed(format!(
                "non-finite delta {}",
                self.delta
            )));
        }
        Ok(())
    }
}

fn validate_score(field: &str, score: f64) -> Result<(), ReviewError> {
    if !score.is_finite() || !(MIN_SCORE..=MAX_SCORE).contains(&score) {
        return Err(ReviewError::malformed(format!(
            "score for '{}' out of range: {}",
            field, score
        )));
    }
    Ok(())
}

fn validate_confidence(field: &str, confidence: f64) -> Result<(), ReviewError> {
    if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
        return Err(ReviewError::malformed(format!(
            "confidence for '{}' out of range: {}",
            field, confidence
        )));
    }
    Ok(())
}

/// The remote reviewer, challenger and arbiter.
///
/// Any implementation satisfying the request / response schema is
/// substitutable, including deterministic stubs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReviewCapability: Send + Sync {
    /// Score every criterion of one category.
    async fn evaluate(&self, request: &EvaluateRequest) -> Result<Billed<Evaluation>, ReviewError>;

    /// Challenge a position.
    async fn challenge(&self, request: &ChallengeRequest)
        -> Result<Billed<Challenge>, ReviewError>;

    /// Defend a position against a challenge.
    async fn defend(&self, request: &DefendRequest) -> Result<Billed<Defense>, ReviewError>;

    /// Rule on a challenge / defense pair.
    async fn arbitrate(&self, request: &ArbitrateRequest) -> Result<Billed<Ruling>, ReviewError>;
}
