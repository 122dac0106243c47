//! Span helpers for run observability.
//!
//! Structured `tracing` spans with dot-notation field names. The library
//! never installs a subscriber; the embedding application decides where
//! spans go.
//!
//! # Span Hierarchy
//!
//! ```text
//! engine.run                 (root, one per drive of a run)
//!   ├─ engine.fan_out        (reviewer fan-out, one per EVALUATING pass)
//!   │   └─ engine.call       (one per remote call)
//!   ├─ engine.round          (one per debate round)
//!   │   └─ engine.call
//!   └─ engine.synthesis      (conflict resolution pass)
//! ```

use serde::{Deserialize, Serialize};
use tracing::Span;

use crate::state::Run;

// ── Span Name Constants ──────────────────────────────────────────────

pub const SPAN_RUN: &str = "engine.run";
pub const SPAN_FAN_OUT: &str = "engine.fan_out";
pub const SPAN_ROUND: &str = "engine.round";
pub const SPAN_CALL: &str = "engine.call";
pub const SPAN_SYNTHESIS: &str = "engine.synthesis";

// ── Field Name Constants ─────────────────────────────────────────────

pub const FIELD_RUN_ID: &str = "run.id";
pub const FIELD_ITEM_ID: &str = "item.id";
pub const FIELD_ROUND: &str = "engine.round.number";
pub const FIELD_OPERATION: &str = "engine.call.operation";
pub const FIELD_CRITERION: &str = "engine.criterion";
pub const FIELD_OUTCOME: &str = "engine.outcome";
pub const FIELD_COST: &str = "engine.cost";
pub const FIELD_DURATION_MS: &str = "engine.duration_ms";

// ── Span Builders ────────────────────────────────────────────────────
//
// Field keys are spelled out in the macros; they must match the constants above.

/// Root span for one drive of a run.
///
/// Fields filled later via [`record_run_result`]: outcome, round, cost, duration.
pub fn run_span(run_id: &str, item_id: &str) -> Span {
    tracing::info_span!(
        SPAN_RUN,
        "run.id" = %run_id,
        "item.id" = %item_id,
        "engine.outcome" = tracing::field::Empty,
        "engine.round.number" = tracing::field::Empty,
        "engine.cost" = tracing::field::Empty,
        "engine.duration_ms" = tracing::field::Empty,
    )
}

/// Record how a drive of a run ended.
pub fn record_run_result(span: &Span, outcome: &str, round: u32, cost: f64, duration_ms: u64) {
    span.record(FIELD_OUTCOME, outcome);
    span.record(FIELD_ROUND, round);
    span.record(FIELD_COST, cost);
    span.record(FIELD_DURATION_MS, duration_ms);
}

/// Span for one reviewer fan-out.
pub fn fan_out_span(run_id: &str, round: u32, categories: usize) -> Span {
    tracing::info_span!(
        SPAN_FAN_OUT,
        "run.id" = %run_id,
        "engine.round.number" = round,
        categories = categories as u64,
        "engine.outcome" = tracing::field::Empty,
    )
}

/// Span for one debate round.
///
/// Fields filled later via [`record_round_result`]: outcome, duration.
pub fn round_span(run_id: &str, round: u32, pairs: usize) -> Span {
    tracing::info_span!(
        SPAN_ROUND,
        "run.id" = %run_id,
        "engine.round.number" = round,
        pairs = pairs as u64,
        "engine.outcome" = tracing::field::Empty,
        "engine.duration_ms" = tracing::field::Empty,
    )
}

/// Record how a debate round ended.
pub fn record_round_result(span: &Span, outcome: &str, duration_ms: u64) {
    span.record(FIELD_OUTCOME, outcome);
    span.record(FIELD_DURATION_MS, duration_ms);
}

/// Span for one remote call.
///
/// Fields filled later via [`record_call_result`]: outcome, cost.
pub fn call_span(operation: &str, criterion: &str, round: u32) -> Span {
    tracing::debug_span!(
        SPAN_CALL,
        "engine.call.operation" = %operation,
        "engine.criterion" = %criterion,
        "engine.round.number" = round,
        "engine.outcome" = tracing::field::Empty,
        "engine.cost" = tracing::field::Empty,
    )
}

/// Record the result of a remote call.
pub fn record_call_result(span: &Span, outcome: &str, cost: f64) {
    span.record(FIELD_OUTCOME, outcome);
    span.record(FIELD_COST, cost);
}

/// Span for a synthesis pass.
pub fn synthesis_span(run_id: &str, round: u32) -> Span {
    tracing::info_span!(
        SPAN_SYNTHESIS,
        "run.id" = %run_id,
        "engine.round.number" = round,
    )
}

// ── Run Summary ──────────────────────────────────────────────────────

/// Counters describing a run, logged when a drive ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub rounds: u32,
    pub criteria: usize,
    pub exchanges: usize,
    pub defended: usize,
    pub overturned: usize,
    pub inconclusive: usize,
    pub conflicts: usize,
    pub unresolved: usize,
    pub cost: f64,
}

impl RunSummary {
    pub fn from_run(run: &Run) -> Self {
        let exchanges = run.exchanges();
        Self {
            rounds: run.round(),
            criteria: run.scores().len(),
            exchanges: exchanges.len(),
            defended: exchanges.iter().filter(|e| e.is_defended()).count(),
            overturned: exchanges
                .iter()
                .filter(|e| !e.inconclusive && e.verdict == crate::types::ExchangeVerdict::Challenger)
                .count(),
            inconclusive: exchanges.iter().filter(|e| e.inconclusive).count(),
            conflicts: run.resolutions().len(),
            unresolved: run.resolutions().iter().filter(|r| r.is_unresolved()).count(),
            cost: run.budget_consumed(),
        }
    }

    /// Fraction of exchanges the defender won (0.0 when there are none).
    pub fn defended_ratio(&self) -> f64 {
        if self.exchanges == 0 {
            return 0.0;
        }
        self.defended as f64 / self.exchanges as f64
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rounds={} criteria={} exchanges={} defended={} overturned={} inconclusive={} conflicts={}/{} cost={:.2}",
            self.rounds,
            self.criteria,
            self.exchanges,
            self.defended,
            self.overturned,
            self.inconclusive,
            self.unresolved,
            self.conflicts,
            self.cost,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    /// Initialize a test subscriber so spans are not disabled.
    fn init_test_subscriber() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(tracing::Level::TRACE)
                .try_init();
        });
    }

    #[test]
    fn test_run_span_creates_valid_span() {
        init_test_subscriber();
        let span = run_span("r-1", "item-1");
        assert!(!span.is_disabled());
        record_run_result(&span, "locked", 2, 4.2, 1500);
    }

    #[test]
    fn test_round_and_call_spans() {
        init_test_subscriber();
        let round = round_span("r-1", 1, 6);
        assert!(!round.is_disabled());
        let _guard = round.enter();
        let call = call_span("challenge", "risk", 1);
        assert!(!call.is_disabled());
        record_call_result(&call, "ok", 0.1);
        record_round_result(&round, "completed", 900);
    }

    #[test]
    fn test_fan_out_and_synthesis_spans() {
        init_test_subscriber();
        assert!(!fan_out_span("r-1", 0, 6).is_disabled());
        assert!(!synthesis_span("r-1", 2).is_disabled());
    }

    #[test]
    fn test_run_summary() {
        let run = Run::new("r-1", "item-1", 15.0, 0);
        let summary = RunSummary::from_run(&run);
        assert_eq!(summary, RunSummary::default());
        assert_eq!(summary.defended_ratio(), 0.0);
        let display = summary.to_string();
        assert!(display.contains("rounds=0"));
        assert!(display.contains("conflicts=0/0"));
    }

    #[test]
    fn test_spans_declare_named_fields() {
        init_test_subscriber();
        let cases = [
            (
                run_span("r-1", "item-1"),
                SPAN_RUN,
                vec![FIELD_RUN_ID, FIELD_ITEM_ID, FIELD_OUTCOME, FIELD_ROUND, FIELD_COST, FIELD_DURATION_MS],
            ),
            (
                fan_out_span("r-1", 0, 6),
                SPAN_FAN_OUT,
                vec![FIELD_RUN_ID, FIELD_ROUND, FIELD_OUTCOME],
            ),
            (
                round_span("r-1", 1, 6),
                SPAN_ROUND,
                vec![FIELD_RUN_ID, FIELD_ROUND, FIELD_OUTCOME, FIELD_DURATION_MS],
            ),
            (
                call_span("defend", "risk", 1),
                SPAN_CALL,
                vec![FIELD_OPERATION, FIELD_CRITERION, FIELD_ROUND, FIELD_OUTCOME, FIELD_COST],
            ),
            (
                synthesis_span("r-1", 2),
                SPAN_SYNTHESIS,
                vec![FIELD_RUN_ID, FIELD_ROUND],
            ),
        ];
        for (span, name, fields) in cases {
            let meta = span.metadata().expect("enabled span has metadata");
            assert_eq!(meta.name(), name);
            for field in fields {
                assert!(span.field(field).is_some(), "{} lacks {}", name, field);
            }
        }
    }

    #[test]
    fn test_constants_are_dotted() {
        for name in [SPAN_RUN, SPAN_FAN_OUT, SPAN_ROUND, SPAN_CALL, SPAN_SYNTHESIS] {
            assert!(name.starts_with("engine."));
        }
        for field in [
            FIELD_RUN_ID,
            FIELD_ITEM_ID,
            FIELD_ROUND,
            FIELD_OPERATION,
            FIELD_CRITERION,
            FIELD_OUTCOME,
            FIELD_COST,
            FIELD_DURATION_MS,
        ] {
            assert!(field.contains('.'));
        }
    }
}
