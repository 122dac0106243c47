//! Convergence detection.
//!
//! Four independent signals over the run's score history and exchange log:
//!
//! | Signal     | Holds when                                                     |
//! |------------|----------------------------------------------------------------|
//! | stable     | every criterion's last K values spread ≤ `stability_delta`     |
//! | confident  | every criterion's confidence ≥ `min_confidence`                |
//! | resolved   | defended ratio ≥ `defended_ratio`, no critical challenge open  |
//! | saturated  | the latest challenge topics bring < `saturation_min_novel` new |
//!
//! `converged = (stable ∧ confident ∧ resolved) ∨ saturated ∨ hard limit`.
//!
//! Pure: no I/O, no clock. The caller supplies the hard-limit status.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::state::Run;
use crate::types::{CriterionScore, Exchange, TerminationReason};

/// Convergence thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Number of most recent values checked for stability (K).
    pub stability_window: usize,
    /// Maximum spread among the last K values of a stable criterion.
    pub stability_delta: f64,
    pub min_confidence: f64,
    /// Required fraction of exchanges won by the defender.
    pub defended_ratio: f64,
    /// Number of most recent distinct topics examined for novelty.
    pub saturation_window: usize,
    /// Fewer novel topics than this in the window means saturated.
    pub saturation_min_novel: usize,
    pub saturation_enabled: bool,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            stability_window: 2,
            stability_delta: 0.5,
            min_confidence: 0.7,
            defended_ratio: 0.8,
            saturation_window: 5,
            saturation_min_novel: 2,
            saturation_enabled: true,
        }
    }
}

/// Hard limits observed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LimitStatus {
    pub rounds_exhausted: bool,
    pub budget_exhausted: bool,
    pub deadline_passed: bool,
}

impl LimitStatus {
    pub fn none() -> Self {
        Self::default()
    }

    /// The termination reason of the first limit hit, if any.
    pub fn reason(&self) -> Option<TerminationReason> {
        if self.budget_exhausted {
            Some(TerminationReason::BudgetExceeded)
        } else if self.deadline_passed {
            Some(TerminationReason::Timeout)
        } else if self.rounds_exhausted {
            Some(TerminationReason::MaxRounds)
        } else {
            None
        }
    }
}

/// The four signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Signals {
    pub stable: bool,
    pub confident: bool,
    pub resolved: bool,
    pub saturated: bool,
}

/// Why the run has not converged yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Blocker {
    /// Fewer than K recorded values.
    InsufficientHistory { criterion: String, recorded: usize },
    Unstable { criterion: String, spread: f64 },
    LowConfidence { criterion: String, confidence: f64 },
    /// Defended ratio below threshold.
    Undefended { ratio: f64 },
    /// A critical challenge whose latest exchange was not defended.
    CriticalOpen { criterion: String, topic: String },
    NoExchanges,
    NoCriteria,
}

impl Blocker {
    pub fn criterion(&self) -> Option<&str> {
        match self {
            Self::InsufficientHistory { criterion, .. }
            | Self::Unstable { criterion, .. }
            | Self::LowConfidence { criterion, .. }
            | Self::CriticalOpen { criterion, .. } => Some(criterion),
            _ => None,
        }
    }
}

/// Detector output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceReport {
    pub signals: Signals,
    pub converged: bool,
    /// Set exactly when `converged`.
    pub reason: Option<TerminationReason>,
    pub blockers: Vec<Blocker>,
}

impl ConvergenceReport {
    /// Distinct criteria named by blockers, sorted.
    pub fn blocking_criteria(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .blockers
            .iter()
            .filter_map(|b| b.criterion().map(str::to_string))
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Lowercase, trimmed, whitespace-collapsed topic used for novelty tracking.
pub fn normalize_topic(topic: &str) -> String {
    topic
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Default)]
pub struct ConvergenceDetector {
    config: ConvergenceConfig,
}

impl ConvergenceDetector {
    pub fn new(config: ConvergenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConvergenceConfig {
        &self.config
    }

    /// Evaluate a run.
    pub fn check(&self, run: &Run, limits: LimitStatus) -> ConvergenceReport {
        self.evaluate(run.scores(), run.exchanges(), limits)
    }

    /// Evaluate raw history.
    pub fn evaluate(
        &self,
        scores: &BTreeMap<String, CriterionScore>,
        exchanges: &[Exchange],
        limits: LimitStatus,
    ) -> ConvergenceReport {
        let mut blockers = Vec::new();
        let stable = self.score_stability(scores, &mut blockers);
        let confident = self.confidence_threshold(scores, &mut blockers);
        let resolved = self.challenge_resolution(exchanges, &mut blockers);
        let saturated = self.config.saturation_enabled && self.is_saturated(exchanges);

        let signals = Signals {
            stable,
            confident,
            resolved,
            saturated,
        };

        let reason = if stable && confident && resolved {
            Some(TerminationReason::Converged)
        } else if saturated {
            Some(TerminationReason::Saturated)
        } else {
            limits.reason()
        };

        ConvergenceReport {
            signals,
            converged: reason.is_some(),
            reason,
            blockers,
        }
    }

    fn score_stability(
        &self,
        scores: &BTreeMap<String, CriterionScore>,
        blockers: &mut Vec<Blocker>,
    ) -> bool {
        if scores.is_empty() {
            blockers.push(Blocker::NoCriteria);
            return false;
        }
        let k = self.config.stability_window;
        let mut stable = true;
        for score in scores.values() {
            let values = score.recorded_values();
            if values.len() < k {
                blockers.push(Blocker::InsufficientHistory {
                    criterion: score.criterion().to_string(),
                    recorded: values.len(),
                });
                stable = false;
                continue;
            }
            let window = &values[values.len() - k..];
            let max = window.iter().cloned().fold(f64::MIN, f64::max);
            let min = window.iter().cloned().fold(f64::MAX, f64::min);
            let spread = max - min;
            if spread > self.config.stability_delta + 1e-9 {
                blockers.push(Blocker::Unstable {
                    criterion: score.criterion().to_string(),
                    spread,
                });
                stable = false;
            }
        }
        stable
    }

    fn confidence_threshold(
        &self,
        scores: &BTreeMap<String, CriterionScore>,
        blockers: &mut Vec<Blocker>,
    ) -> bool {
        let mut confident = !scores.is_empty();
        for score in scores.values() {
            if score.confidence() + 1e-9 < self.config.min_confidence {
                blockers.push(Blocker::LowConfidence {
                    criterion: score.criterion().to_string(),
                    confidence: score.confidence(),
                });
                confident = false;
            }
        }
        confident
    }

    fn challenge_resolution(&self, exchanges: &[Exchange], blockers: &mut Vec<Blocker>) -> bool {
        if exchanges.is_empty() {
            blockers.push(Blocker::NoExchanges);
            return false;
        }
        let defended = exchanges.iter().filter(|e| e.is_defended()).count();
        let ratio = defended as f64 / exchanges.len() as f64;
        let mut resolved = true;
        if ratio + 1e-9 < self.config.defended_ratio {
            blockers.push(Blocker::Undefended { ratio });
            resolved = false;
        }

        // Latest outcome per critical (criterion, topic).
        let mut critical: HashMap<(&str, String), bool> = HashMap::new();
        for e in exchanges.iter().filter(|e| e.critical) {
            critical.insert((e.criterion.as_str(), normalize_topic(&e.topic)), e.is_defended());
        }
        let mut open: Vec<(&str, String)> = critical
            .into_iter()
            .filter(|(_, defended)| !defended)
            .map(|(key, _)| key)
            .collect();
        open.sort();
        for (criterion, topic) in open {
            blockers.push(Blocker::CriticalOpen {
                criterion: criterion.to_string(),
                topic,
            });
            resolved = false;
        }
        resolved
    }

    /// Whether the most recent challenge topics stopped bringing new ones.
    ///
    /// The window is the last `saturation_window` distinct topics, ordered by
    /// latest occurrence. A topic is novel when nothing before the window
    /// raised it. Inconclusive exchanges and empty topics carry no topic.
    /// Needs a full window and at least one earlier topic to compare to.
    pub fn is_saturated(&self, exchanges: &[Exchange]) -> bool {
        let window = self.config.saturation_window;
        if window == 0 {
            return false;
        }
        let topics: Vec<String> = exchanges
            .iter()
            .filter(|e| !e.inconclusive)
            .map(|e| normalize_topic(&e.topic))
            .filter(|t| !t.is_empty())
            .collect();

        let mut recent: HashSet<&str> = HashSet::new();
        let mut start = topics.len();
        for (i, topic) in topics.iter().enumerate().rev() {
            if recent.len() == window {
                break;
            }
            if recent.insert(topic.as_str()) {
                start = i;
            }
        }
        if recent.len() < window || start == 0 {
            return false;
        }

        let prior: HashSet<&str> = topics[..start].iter().map(String::as_str).collect();
        let novel = recent.iter().filter(|t| !prior.contains(*t)).count();
        novel < self.config.saturation_min_novel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExchangeVerdict, Grounding};
    use chrono::Utc;

    fn score(name: &str, values: &[f64], confidence: f64) -> CriterionScore {
        let mut s = CriterionScore::new(name, name, values[0], confidence, "");
        for v in &values[1..] {
            s.open_round();
            s.set_position(*v, confidence);
        }
        s
    }

    fn scores(list: Vec<CriterionScore>) -> BTreeMap<String, CriterionScore> {
        list.into_iter()
            .map(|s| (s.criterion().to_string(), s))
            .collect()
    }

    fn exchange(criterion: &str, topic: &str, verdict: ExchangeVerdict, critical: bool) -> Exchange {
        Exchange {
            round: 1,
            criterion: criterion.into(),
            challenger: "skeptic".into(),
            challenge: "why?".into(),
            topic: topic.into(),
            critical,
            defender: "reviewer".into(),
            defense: "because".into(),
            defense_grounding: Grounding::default(),
            counter_claim: None,
            verdict,
            delta: 0.0,
            bonus: false,
            inconclusive: false,
            recorded_at: Utc::now(),
        }
    }

    fn defended(n: usize) -> Vec<Exchange> {
        (0..n)
            .map(|i| exchange("risk", &format!("topic {i}"), ExchangeVerdict::Defender, false))
            .collect()
    }

    #[test]
    fn test_converges_when_stable_confident_resolved() {
        let detector = ConvergenceDetector::default();
        let s = scores(vec![score("risk", &[5.0, 7.0, 7.3], 0.8)]);
        let report = detector.evaluate(&s, &defended(4), LimitStatus::none());
        assert!(report.converged);
        assert_eq!(report.reason, Some(TerminationReason::Converged));
        assert!(report.blockers.is_empty());
    }

    #[test]
    fn test_needs_k_values() {
        let detector = ConvergenceDetector::default();
        let s = scores(vec![score("risk", &[7.0], 0.9)]);
        let report = detector.evaluate(&s, &defended(2), LimitStatus::none());
        assert!(!report.signals.stable);
        assert!(!report.converged);
        assert_eq!(report.blocking_criteria(), vec!["risk".to_string()]);
    }

    #[test]
    fn test_unstable_criterion_blocks() {
        let detector = ConvergenceDetector::default();
        let s = scores(vec![
            score("risk", &[5.0, 6.0], 0.9),
            score("cost", &[5.0, 5.2], 0.9),
        ]);
        let report = detector.evaluate(&s, &defended(2), LimitStatus::none());
        assert!(!report.signals.stable);
        assert_eq!(report.blocking_criteria(), vec!["risk".to_string()]);
        assert!(matches!(
            report.blockers[0],
            Blocker::Unstable { ref criterion, .. } if criterion == "risk"
        ));
    }

    #[test]
    fn test_low_confidence_blocks() {
        let detector = ConvergenceDetector::default();
        let s = scores(vec![score("risk", &[5.0, 5.0], 0.6)]);
        let report = detector.evaluate(&s, &defended(2), LimitStatus::none());
        assert!(report.signals.stable);
        assert!(!report.signals.confident);
        assert!(!report.converged);
    }

    #[test]
    fn test_defended_ratio_and_critical() {
        let detector = ConvergenceDetector::default();
        let s = scores(vec![score("risk", &[5.0, 5.0], 0.9)]);

        let mut log = defended(3);
        log.push(exchange("risk", "x", ExchangeVerdict::Challenger, false));
        let report = detector.evaluate(&s, &log, LimitStatus::none());
        assert!(!report.signals.resolved);

        // Ratio fine, but a critical challenge is open.
        let mut log = defended(8);
        log.push(exchange("risk", "Data Loss", ExchangeVerdict::Draw, true));
        let report = detector.evaluate(&s, &log, LimitStatus::none());
        assert!(!report.signals.resolved);
        assert!(report
            .blockers
            .iter()
            .any(|b| matches!(b, Blocker::CriticalOpen { topic, .. } if topic == "data loss")));

        // Defending the same critical topic later closes it.
        log.push(exchange("risk", "data  loss", ExchangeVerdict::Defender, true));
        let report = detector.evaluate(&s, &log, LimitStatus::none());
        assert!(report.signals.resolved);
    }

    #[test]
    fn test_no_exchanges_not_resolved() {
        let detector = ConvergenceDetector::default();
        let s = scores(vec![score("risk", &[5.0, 5.0], 0.9)]);
        let report = detector.evaluate(&s, &[], LimitStatus::none());
        assert!(!report.signals.resolved);
        assert!(report.blockers.contains(&Blocker::NoExchanges));
    }

    #[test]
    fn test_saturation() {
        let detector = ConvergenceDetector::default();
        let mut log: Vec<Exchange> = ["a", "b", "c", "d"]
            .iter()
            .map(|t| exchange("risk", t, ExchangeVerdict::Challenger, false))
            .collect();
        // Window not full yet.
        assert!(!detector.is_saturated(&log));

        for t in ["A", "b ", "c", "d", "e"] {
            log.push(exchange("risk", t, ExchangeVerdict::Challenger, false));
        }
        // Only "e" is new among the last five.
        assert!(detector.is_saturated(&log));

        let s = scores(vec![score("risk", &[5.0, 9.0], 0.2)]);
        let report = detector.evaluate(&s, &log, LimitStatus::none());
        assert_eq!(report.reason, Some(TerminationReason::Saturated));

        let disabled = ConvergenceDetector::new(ConvergenceConfig {
            saturation_enabled: false,
            ..Default::default()
        });
        assert!(!disabled.evaluate(&s, &log, LimitStatus::none()).converged);
    }

    #[test]
    fn test_novel_topics_not_saturated() {
        let detector = ConvergenceDetector::default();
        let log: Vec<Exchange> = (0..12)
            .map(|i| exchange("risk", &format!("t{i}"), ExchangeVerdict::Draw, false))
            .collect();
        assert!(!detector.is_saturated(&log));
    }

    fn failed_challenge() -> Exchange {
        Exchange {
            inconclusive: true,
            ..exchange("risk", "", ExchangeVerdict::Draw, false)
        }
    }

    #[test]
    fn test_failed_challenges_do_not_count_as_novel() {
        let detector = ConvergenceDetector::default();
        let mut log: Vec<Exchange> = ["a", "b", "c", "d", "e", "f", "a", "b", "c", "d", "g"]
            .iter()
            .map(|t| exchange("risk", t, ExchangeVerdict::Defender, false))
            .collect();
        assert!(detector.is_saturated(&log));

        log.extend((0..4).map(|_| failed_challenge()));
        // Only "g" is new among the latest five distinct topics.
        assert!(detector.is_saturated(&log));
    }

    #[test]
    fn test_review_outage_is_not_saturation() {
        let detector = ConvergenceDetector::default();
        let mut log: Vec<Exchange> = (0..6)
            .map(|i| exchange("risk", &format!("t{i}"), ExchangeVerdict::Defender, false))
            .collect();
        log.extend((0..6).map(|_| failed_challenge()));
        assert!(!detector.is_saturated(&log));

        // Inconclusive exchanges never supply topics, even non-empty ones.
        log.extend((0..6).map(|_| Exchange {
            inconclusive: true,
            ..exchange("risk", "t5", ExchangeVerdict::Draw, false)
        }));
        assert!(!detector.is_saturated(&log));
    }

    #[test]
    fn test_saturation_window_counts_distinct_topics() {
        let detector = ConvergenceDetector::default();
        // Many repeats of two topics never fill a five-topic window.
        let mut log: Vec<Exchange> = (0..10)
            .map(|i| {
                let topic = if i % 2 == 0 { "x" } else { "y" };
                exchange("risk", topic, ExchangeVerdict::Draw, false)
            })
            .collect();
        assert!(!detector.is_saturated(&log));

        for t in ["p", "q", "r", "x", "y", "x"] {
            log.push(exchange("risk", t, ExchangeVerdict::Draw, false));
        }
        // Window {x, y, r, q, p}: p, q and r are new.
        assert!(!detector.is_saturated(&log));
    }

    #[test]
    fn test_hard_limits() {
        let detector = ConvergenceDetector::default();
        let s = scores(vec![score("risk", &[2.0, 9.0], 0.1)]);
        let report = detector.evaluate(
            &s,
            &[],
            LimitStatus {
                rounds_exhausted: true,
                ..Default::default()
            },
        );
        assert!(report.converged);
        assert_eq!(report.reason, Some(TerminationReason::MaxRounds));
        assert!(!report.blockers.is_empty());

        let both = LimitStatus {
            rounds_exhausted: true,
            budget_exhausted: true,
            deadline_passed: false,
        };
        assert_eq!(both.reason(), Some(TerminationReason::BudgetExceeded));
    }

    #[test]
    fn test_idempotent_once_converged() {
        let detector = ConvergenceDetector::default();
        let s = scores(vec![
            score("risk", &[5.0, 6.0, 6.2], 0.75),
            score("cost", &[3.0, 3.0, 3.0], 0.9),
        ]);
        let log = defended(5);
        let first = detector.evaluate(&s, &log, LimitStatus::none());
        assert!(first.converged);
        for _ in 0..3 {
            assert_eq!(detector.evaluate(&s, &log, LimitStatus::none()), first);
        }
    }

    #[test]
    fn test_normalize_topic() {
        assert_eq!(normalize_topic("  Data   LOSS\n"), "data loss");
    }
}
