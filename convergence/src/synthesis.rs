//! Conflict resolution between contradictory claims.
//!
//! Fixed precedence, first rule that separates the claims wins:
//!
//! 1. fundamentals-based beats analogy-based;
//! 2. the only claim citing checkable evidence;
//! 3. the strictly more specific claim;
//! 4. otherwise `UNRESOLVED`: the scores are averaged and the confidence is
//!    the lower of the two, penalized.
//!
//! Averaging is only ever the fallback; it is recorded as a failure to decide.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::EngineResult;
use crate::state::Run;
use crate::types::{clamp_confidence, clamp_score, Claim, ClaimBasis, Exchange, ExchangeVerdict};

/// Synthesis thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Minimum score gap between a counter-claim and the current position
    /// for the two to count as contradictory.
    pub contradiction_threshold: f64,
    /// Fraction removed from the confidence of an unresolved criterion.
    pub unresolved_penalty: f64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            contradiction_threshold: 2.0,
            unresolved_penalty: 0.2,
        }
    }
}

/// Which side a resolution picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Winner {
    /// The position the criterion held.
    Incumbent,
    /// The challenger's counter-claim.
    Challenger,
    Unresolved,
}

impl std::fmt::Display for Winner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Incumbent => write!(f, "INCUMBENT"),
            Self::Challenger => write!(f, "CHALLENGER"),
            Self::Unresolved => write!(f, "UNRESOLVED"),
        }
    }
}

/// Precedence rule that decided a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecidedBy {
    Fundamentals,
    Evidence,
    Specificity,
    /// No rule separated the claims.
    Fallback,
}

/// Two contradictory claims about one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub round: u32,
    pub criterion: String,
    pub incumbent: Claim,
    pub challenger: Claim,
}

/// The single authoritative position produced for a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub round: u32,
    pub criterion: String,
    pub winner: Winner,
    pub decided_by: DecidedBy,
    pub unified_score: f64,
    pub unified_confidence: f64,
    pub narrative: String,
    pub incumbent: Claim,
    pub challenger: Claim,
}

impl Resolution {
    pub fn is_unresolved(&self) -> bool {
        self.winner == Winner::Unresolved
    }
}

/// Applies the precedence order.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    config: SynthesisConfig,
}

impl ConflictResolver {
    pub fn new(config: SynthesisConfig) -> Self {
        Self { config }
    }

    /// Decide between two claims. Deterministic in its inputs.
    pub fn resolve(&self, conflict: &Conflict) -> Resolution {
        let a = &conflict.incumbent;
        let b = &conflict.challenger;

        let decision = match (a.grounding.basis, b.grounding.basis) {
            (ClaimBasis::Fundamentals, ClaimBasis::Analogy) => {
                Some((Winner::Incumbent, DecidedBy::Fundamentals))
            }
            (ClaimBasis::Analogy, ClaimBasis::Fundamentals) => {
                Some((Winner::Challenger, DecidedBy::Fundamentals))
            }
            _ => None,
        }
        .or_else(
            || match (a.grounding.cites_evidence(), b.grounding.cites_evidence()) {
                (true, false) => Some((Winner::Incumbent, DecidedBy::Evidence)),
                (false, true) => Some((Winner::Challenger, DecidedBy::Evidence)),
                _ => None,
            },
        )
        .or_else(|| {
            use std::cmp::Ordering;
            match a.grounding.specificity.cmp(&b.grounding.specificity) {
                Ordering::Greater => Some((Winner::Incumbent, DecidedBy::Specificity)),
                Ordering::Less => Some((Winner::Challenger, DecidedBy::Specificity)),
                Ordering::Equal => None,
            }
        });

        let (winner, decided_by, unified_score, unified_confidence) = match decision {
            Some((Winner::Challenger, rule)) => {
                (Winner::Challenger, rule, b.score, b.confidence)
            }
            Some((winner, rule)) => (winner, rule, a.score, a.confidence),
            None => (
                Winner::Unresolved,
                DecidedBy::Fallback,
                (a.score + b.score) / 2.0,
                a.confidence.min(b.confidence) * (1.0 - self.config.unresolved_penalty),
            ),
        };

        let narrative = match winner {
            Winner::Unresolved => format!(
                "{} vs {} on '{}': no precedence rule separates the claims; \
                 averaged {:.1} and {:.1} with reduced confidence",
                a.author, b.author, conflict.criterion, a.score, b.score
            ),
            _ => {
                let (won, lost) = if winner == Winner::Incumbent { (a, b) } else { (b, a) };
                format!(
                    "{} prevails over {} on '{}' by {} ({:.1} over {:.1})",
                    won.author,
                    lost.author,
                    conflict.criterion,
                    rule_label(decided_by),
                    won.score,
                    lost.score
                )
            }
        };

        Resolution {
            round: conflict.round,
            criterion: conflict.criterion.clone(),
            winner,
            decided_by,
            unified_score: clamp_score(unified_score),
            unified_confidence: clamp_confidence(unified_confidence),
            narrative,
            incumbent: a.clone(),
            challenger: b.clone(),
        }
    }

    /// The conflict an exchange raises against `incumbent`, if any.
    ///
    /// Only decisive, non-defended exchanges that carried a counter-claim far
    /// enough from the current position count.
    pub fn conflict_for(&self, exchange: &Exchange, incumbent: Claim) -> Option<Conflict> {
        if exchange.inconclusive || exchange.verdict == ExchangeVerdict::Defender {
            return None;
        }
        let counter = exchange.counter_claim.as_ref()?;
        if (counter.score - incumbent.score).abs() < self.config.contradiction_threshold {
            return None;
        }
        Some(Conflict {
            round: exchange.round,
            criterion: exchange.criterion.clone(),
            incumbent,
            challenger: counter.clone(),
        })
    }

    /// Conflicts raised since the last synthesis, against current positions.
    pub fn find_conflicts(&self, run: &Run) -> Vec<Conflict> {
        run.unsynthesized_exchanges()
            .iter()
            .filter_map(|exchange| {
                let score = run.score(&exchange.criterion)?;
                self.conflict_for(exchange, incumbent_claim(score, exchange))
            })
            .collect()
    }

    /// Resolve every pending conflict in log order and apply the unified
    /// positions to the run.
    pub fn synthesize(&self, run: &mut Run) -> EngineResult<Vec<Resolution>> {
        let pending: Vec<Exchange> = run.unsynthesized_exchanges().to_vec();
        let mut resolutions = Vec::new();

        for exchange in &pending {
            let Some(score) = run.score(&exchange.criterion) else {
                continue;
            };
            let Some(conflict) = self.conflict_for(exchange, incumbent_claim(score, exchange))
            else {
                continue;
            };
            let resolution = self.resolve(&conflict);
            debug!(
                criterion = %resolution.criterion,
                winner = %resolution.winner,
                decided_by = ?resolution.decided_by,
                "Conflict resolved"
            );
            if let Some(score) = run.score_mut(&resolution.criterion)? {
                score.set_position(resolution.unified_score, resolution.unified_confidence);
            }
            resolutions.push(resolution);
        }

        info!(
            run.id = %run.run_id(),
            conflicts = resolutions.len(),
            unresolved = resolutions.iter().filter(|r| r.is_unresolved()).count(),
            "Synthesis complete"
        );
        run.record_resolutions(resolutions.clone())?;
        Ok(resolutions)
    }
}

/// The defended position as a claim: current score, grounded by the defense.
fn incumbent_claim(score: &crate::types::CriterionScore, exchange: &Exchange) -> Claim {
    let grounding = if exchange.defense.trim().is_empty() {
        score.grounding().clone()
    } else {
        exchange.defense_grounding.clone()
    };
    score.as_claim(&exchange.defender, &exchange.defense, grounding)
}

fn rule_label(rule: DecidedBy) -> &'static str {
    match rule {
        DecidedBy::Fundamentals => "fundamentals over analogy",
        DecidedBy::Evidence => "checkable evidence",
        DecidedBy::Specificity => "greater specificity",
        DecidedBy::Fallback => "fallback",
    }
}
