//! Core data model: criterion scores, exchanges, claims and the final verdict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lowest score a criterion can hold.
pub const MIN_SCORE: f64 = 1.0;
/// Highest score a criterion can hold.
pub const MAX_SCORE: f64 = 10.0;

/// Clamp a score into `[MIN_SCORE, MAX_SCORE]`.
pub fn clamp_score(score: f64) -> f64 {
    score.clamp(MIN_SCORE, MAX_SCORE)
}

/// Clamp a confidence into `[0, 1]`.
pub fn clamp_confidence(confidence: f64) -> f64 {
    confidence.clamp(0.0, 1.0)
}

/// What a claim rests on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimBasis {
    /// Derived from stated fundamental constraints or mechanics.
    Fundamentals,
    /// Argued from analogy or precedent only.
    Analogy,
    #[default]
    Unspecified,
}

impl std::fmt::Display for ClaimBasis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fundamentals => write!(f, "fundamentals"),
            Self::Analogy => write!(f, "analogy"),
            Self::Unspecified => write!(f, "unspecified"),
        }
    }
}

/// How a position is supported.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Grounding {
    #[serde(default)]
    pub basis: ClaimBasis,
    /// Falsifiable, checkable evidence cited for the position.
    #[serde(default)]
    pub evidence: Vec<String>,
    /// Higher is narrower and more testable.
    #[serde(default)]
    pub specificity: u8,
}

impl Grounding {
    pub fn cites_evidence(&self) -> bool {
        self.evidence.iter().any(|e| !e.trim().is_empty())
    }
}

/// One scored dimension of the item under evaluation.
///
/// `history` holds the values the criterion had at the start of each debate
/// round, so its length always equals the run's round number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionScore {
    criterion: String,
    category: String,
    score: f64,
    confidence: f64,
    justification: String,
    grounding: Grounding,
    history: Vec<f64>,
}

impl CriterionScore {
    pub fn new(
        criterion: impl Into<String>,
        category: impl Into<String>,
        score: f64,
        confidence: f64,
        justification: impl Into<String>,
    ) -> Self {
        Self {
            criterion: criterion.into(),
            category: category.into(),
            score: clamp_score(score),
            confidence: clamp_confidence(confidence),
            justification: justification.into(),
            grounding: Grounding::default(),
            history: Vec::new(),
        }
    }

    pub fn with_grounding(mut self, grounding: Grounding) -> Self {
        self.grounding = grounding;
        self
    }

    pub fn criterion(&self) -> &str {
        &self.criterion
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn justification(&self) -> &str {
        &self.justification
    }

    pub fn grounding(&self) -> &Grounding {
        &self.grounding
    }

    /// Values observed at the start of each completed round.
    pub fn history(&self) -> &[f64] {
        &self.history
    }

    /// All recorded values, oldest first, ending with the current score.
    pub fn recorded_values(&self) -> Vec<f64> {
        let mut values = self.history.clone();
        values.push(self.score);
        values
    }

    /// Snapshot the current score into history as a new round opens.
    pub(crate) fn open_round(&mut self) {
        self.history.push(self.score);
    }

    /// Pad history with the current score so a criterion first scored at
    /// round `rounds` satisfies `history.len() == rounds`.
    pub(crate) fn backfill_history(&mut self, rounds: u32) {
        while self.history.len() < rounds as usize {
            self.history.push(self.score);
        }
    }

    /// Apply a bounded delta; returns the change actually applied.
    pub(crate) fn apply_delta(&mut self, delta: f64) -> f64 {
        let before = self.score;
        self.score = clamp_score(self.score + delta);
        self.score - before
    }

    pub(crate) fn adjust_confidence(&mut self, delta: f64) {
        self.confidence = clamp_confidence(self.confidence + delta);
    }

    pub(crate) fn set_position(&mut self, score: f64, confidence: f64) {
        self.score = clamp_score(score);
        self.confidence = clamp_confidence(confidence);
    }

    /// Replace the position after a re-evaluation; history is kept.
    pub(crate) fn rescore(&mut self, fresh: CriterionScore) {
        self.score = fresh.score;
        self.confidence = fresh.confidence;
        self.justification = fresh.justification;
        self.grounding = fresh.grounding;
    }

    /// Whether score and confidence are inside their bounds.
    pub fn is_within_bounds(&self) -> bool {
        (MIN_SCORE..=MAX_SCORE).contains(&self.score) && (0.0..=1.0).contains(&self.confidence)
    }

    /// The criterion's current position as a claim by `author`.
    pub fn as_claim(&self, author: &str, statement: &str, grounding: Grounding) -> Claim {
        Claim {
            author: author.to_string(),
            criterion: self.criterion.clone(),
            score: self.score,
            confidence: self.confidence,
            statement: statement.to_string(),
            grounding,
        }
    }
}

/// Outcome of one arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeVerdict {
    /// The defending reviewer's position held.
    Defender,
    /// The challenger prevailed.
    Challenger,
    Draw,
}

impl std::fmt::Display for ExchangeVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Defender => write!(f, "DEFENDER"),
            Self::Challenger => write!(f, "CHALLENGER"),
            Self::Draw => write!(f, "DRAW"),
        }
    }
}

/// A position about one criterion, used when two positions contradict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub author: String,
    pub criterion: String,
    pub score: f64,
    pub confidence: f64,
    pub statement: String,
    pub grounding: Grounding,
}

/// One challenge / defense / verdict triple. Never rewritten once logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub round: u32,
    pub criterion: String,
    pub challenger: String,
    pub challenge: String,
    /// Normalized topic of the challenge, used for saturation tracking.
    pub topic: String,
    /// Whether the challenger marked this as a critical challenge.
    pub critical: bool,
    pub defender: String,
    pub defense: String,
    pub defense_grounding: Grounding,
    /// The challenger's counter-position, when it proposed one.
    pub counter_claim: Option<Claim>,
    pub verdict: ExchangeVerdict,
    /// Score delta applied to the criterion (already clamped).
    pub delta: f64,
    /// The arbiter awarded a rationale bonus to the defense.
    pub bonus: bool,
    /// A remote call in this exchange exhausted its retries.
    pub inconclusive: bool,
    pub recorded_at: DateTime<Utc>,
}

impl Exchange {
    /// Whether the defender successfully held its position.
    pub fn is_defended(&self) -> bool {
        self.verdict == ExchangeVerdict::Defender && !self.inconclusive
    }
}

/// Why a run stopped iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationReason {
    Converged,
    MaxRounds,
    Saturated,
    BudgetExceeded,
    Timeout,
}

impl TerminationReason {
    /// Reasons produced by a hard limit rather than by the signals.
    pub fn is_hard_limit(self) -> bool {
        matches!(self, Self::MaxRounds | Self::BudgetExceeded | Self::Timeout)
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Converged => write!(f, "CONVERGED"),
            Self::MaxRounds => write!(f, "MAX_ROUNDS"),
            Self::Saturated => write!(f, "SATURATED"),
            Self::BudgetExceeded => write!(f, "BUDGET_EXCEEDED"),
            Self::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

/// The terminal, immutable output of a locked run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalVerdict {
    pub run_id: String,
    pub item_id: String,
    pub scores: Vec<CriterionScore>,
    /// Confidence-weighted mean of the criterion scores.
    pub aggregate_score: f64,
    /// Mean criterion confidence.
    pub aggregate_confidence: f64,
    pub termination_reason: TerminationReason,
    pub rounds_completed: u32,
    /// Reference to the run's exchange log (the run id) and its length.
    pub exchange_log_ref: String,
    pub exchange_count: usize,
    /// Run this verdict supersedes, if any.
    pub supersedes: Option<String>,
    pub locked_at: DateTime<Utc>,
}

/// Confidence-weighted mean score and mean confidence.
///
/// Falls back to a plain mean when every confidence is zero.
pub fn aggregate(scores: &[CriterionScore]) -> (f64, f64) {
    if scores.is_empty() {
        return (0.0, 0.0);
    }
    let n = scores.len() as f64;
    let weight: f64 = scores.iter().map(|s| s.confidence()).sum();
    let mean_confidence = weight / n;
    let score = if weight > 0.0 {
        scores.iter().map(|s| s.score() * s.confidence()).sum::<f64>() / weight
    } else {
        scores.iter().map(|s| s.score()).sum::<f64>() / n
    };
    (score, mean_confidence)
}
