//! Run checkpoints: snapshot format, integrity checks and storage.
//!
//! A checkpoint is written at every phase boundary and after every completed
//! round. Checkpoints for a run are totally ordered by `sequence`; a later
//! checkpoint supersedes the stored one, it never mutates it.

mod store;

pub use store::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::Run;

/// Checkpoint retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Age after which a checkpoint needs explicit confirmation to resume.
    pub staleness_horizon_ms: u64,
}

impl CheckpointConfig {
    pub fn staleness_horizon(&self) -> Duration {
        Duration::from_millis(self.staleness_horizon_ms)
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            staleness_horizon_ms: 86_400_000,
        }
    }
}

/// A complete run snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Schema version for forward compatibility.
    pub version: u32,
    /// Monotonic per-run sequence number.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    /// Why the checkpoint was taken.
    pub reason: String,
    pub run: Run,
}

impl Checkpoint {
    /// Current schema version.
    pub const CURRENT_VERSION: u32 = 1;

    pub(crate) fn new(run: &Run, reason: &str) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            sequence: run.checkpoint_seq(),
            created_at: Utc::now(),
            reason: reason.to_string(),
            run: run.clone(),
        }
    }

    pub fn run_id(&self) -> &str {
        self.run.run_id()
    }

    /// Pretty-printed JSON, the on-disk form used by the file store.
    pub fn to_json(&self) -> Result<String, PersistenceError> {
        serde_json::to_string_pretty(self).map_err(|e| PersistenceError::SerializeFailed {
            reason: format!("run {}: {}", self.run_id(), e),
        })
    }

    /// Parse a stored checkpoint. Snapshots written by a newer schema are
    /// refused rather than read partially.
    pub fn from_json(json: &str) -> Result<Self, PersistenceError> {
        let checkpoint = serde_json::from_str::<Self>(json)
            .map_err(|e| PersistenceError::DeserializeFailed { reason: e.to_string() })?;
        match checkpoint.version {
            found if found > Self::CURRENT_VERSION => Err(PersistenceError::VersionMismatch {
                expected: Self::CURRENT_VERSION,
                found,
            }),
            _ => Ok(checkpoint),
        }
    }

    /// Age relative to `now` (zero if the checkpoint is from the future).
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the checkpoint is past the staleness horizon.
    pub fn is_stale(&self, horizon: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) > horizon
    }
}

/// Error during persistence operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("serialize failed: {reason}")]
    SerializeFailed { reason: String },

    #[error("deserialize failed: {reason}")]
    DeserializeFailed { reason: String },

    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("integrity check failed: {reason}")]
    IntegrityCheckFailed { reason: String },

    /// A checkpoint that does not advance the stored sequence.
    #[error("out-of-order checkpoint for {run_id}: stored seq {stored}, offered {offered}")]
    OutOfOrder {
        run_id: String,
        stored: u64,
        offered: u64,
    },

    #[error("storage I/O failed: {reason}")]
    Io { reason: String },
}

impl From<std::io::Error> for PersistenceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            reason: e.to_string(),
        }
    }
}

/// Integrity check result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityStatus {
    /// Checkpoint is valid and can be resumed.
    Valid,
    /// Checkpoint has minor issues but is recoverable.
    Recoverable { warnings: Vec<String> },
    /// Checkpoint is corrupted and cannot be used.
    Corrupted { errors: Vec<String> },
}

impl IntegrityStatus {
    /// Whether resume is safe.
    pub fn can_resume(&self) -> bool {
        matches!(self, Self::Valid | Self::Recoverable { .. })
    }
}

/// Validate a checkpoint's integrity before resuming.
pub fn validate_checkpoint(checkpoint: &Checkpoint) -> IntegrityStatus {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();
    let run = &checkpoint.run;

    if checkpoint.version > Checkpoint::CURRENT_VERSION {
        errors.push(format!(
            "version {} > current {}",
            checkpoint.version,
            Checkpoint::CURRENT_VERSION
        ));
    }

    if checkpoint.sequence != run.checkpoint_seq() {
        errors.push(format!(
            "checkpoint sequence {} does not match run sequence {}",
            checkpoint.sequence,
            run.checkpoint_seq()
        ));
    }

    if let Some(last) = run.transitions().last() {
        if last.to != run.phase() {
            errors.push(format!(
                "last transition target {} doesn't match current phase {}",
                last.to,
                run.phase()
            ));
        }
    }

    for score in run.scores().values() {
        if !score.is_within_bounds() {
            errors.push(format!("criterion '{}' is out of bounds", score.criterion()));
        }
        if score.history().len() != run.round() as usize {
            errors.push(format!(
                "criterion '{}' has {} history entries at round {}",
                score.criterion(),
                score.history().len(),
                run.round()
            ));
        }
    }

    for exchange in run.exchanges() {
        if exchange.round > run.round() {
            errors.push(format!(
                "exchange for round {} exceeds current round {}",
                exchange.round,
                run.round()
            ));
        }
        if !run.scores().contains_key(&exchange.criterion) {
            warnings.push(format!(
                "exchange references unknown criterion '{}'",
                exchange.criterion
            ));
        }
    }

    if run.verdict().is_some() != (run.phase() == crate::state::RunPhase::Locked) {
        errors.push(format!(
            "verdict presence inconsistent with phase {}",
            run.phase()
        ));
    }

    if run.budget_consumed() > run.budget_ceiling() {
        warnings.push(format!(
            "budget consumed {:.2} exceeds ceiling {:.2}",
            run.budget_consumed(),
            run.budget_ceiling()
        ));
    }

    if !errors.is_empty() {
        IntegrityStatus::Corrupted { errors }
    } else if !warnings.is_empty() {
        IntegrityStatus::Recoverable { warnings }
    } else {
        IntegrityStatus::Valid
    }
}

/// Parse a checkpoint and refuse it if corrupted.
pub fn restore(json: &str) -> Result<(Checkpoint, IntegrityStatus), PersistenceError> {
    let checkpoint = Checkpoint::from_json(json)?;
    let status = validate_checkpoint(&checkpoint);

    if let IntegrityStatus::Corrupted { ref errors } = status {
        return Err(PersistenceError::IntegrityCheckFailed {
            reason: errors.join("; "),
        });
    }

    Ok((checkpoint, status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RunPhase;
    use crate::types::CriterionScore;

    fn make_run() -> Run {
        let mut run = Run::new("r-1", "item-1", 15.0, 1);
        run.transition(RunPhase::Evaluating, "start").unwrap();
        run.record_score(CriterionScore::new("risk", "risk", 6.0, 0.7, "ok"))
            .unwrap();
        run.transition(RunPhase::Debating, "evaluated").unwrap();
        run.open_round().unwrap();
        run
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let mut run = make_run();
        let cp = run.checkpoint("round 1");
        let json = cp.to_json().unwrap();
        let restored = Checkpoint::from_json(&json).unwrap();

        assert_eq!(restored.version, Checkpoint::CURRENT_VERSION);
        assert_eq!(restored.run_id(), "r-1");
        assert_eq!(restored.run.phase(), RunPhase::Debating);
        assert_eq!(restored.run.round(), 1);
        assert_eq!(restored.run.scores(), run.scores());
        assert_eq!(restored.run.exchanges().len(), run.exchanges().len());
        assert_eq!(restored.sequence, 1);
    }

    #[test]
    fn test_version_mismatch() {
        let cp = make_run().checkpoint("test");
        let mut json_val: serde_json::Value = serde_json::to_value(&cp).unwrap();
        json_val["version"] = serde_json::Value::Number(serde_json::Number::from(999));
        let json = serde_json::to_string(&json_val).unwrap();

        let err = Checkpoint::from_json(&json).unwrap_err();
        assert!(matches!(err, PersistenceError::VersionMismatch { .. }));
    }

    #[test]
    fn test_validate_valid_checkpoint() {
        let cp = make_run().checkpoint("test");
        let status = validate_checkpoint(&cp);
        assert_eq!(status, IntegrityStatus::Valid);
        assert!(status.can_resume());
    }

    #[test]
    fn test_validate_history_mismatch() {
        let cp = make_run().checkpoint("test");
        let mut json_val = serde_json::to_value(&cp).unwrap();
        json_val["run"]["round"] = serde_json::json!(4);
        let json = serde_json::to_string(&json_val).unwrap();

        let err = restore(&json).unwrap_err();
        match err {
            PersistenceError::IntegrityCheckFailed { reason } => {
                assert!(reason.contains("history entries"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validate_transition_mismatch() {
        let cp = make_run().checkpoint("test");
        let mut json_val = serde_json::to_value(&cp).unwrap();
        json_val["run"]["phase"] = serde_json::json!("REVIEWING");
        let corrupted: Checkpoint = serde_json::from_value(json_val).unwrap();
        let status = validate_checkpoint(&corrupted);
        assert!(matches!(status, IntegrityStatus::Corrupted { .. }));
        assert!(!status.can_resume());
    }

    #[test]
    fn test_validate_recoverable_overspend() {
        let mut run = make_run();
        run.record_usage(16.0, 0);
        let cp = run.checkpoint("test");
        let status = validate_checkpoint(&cp);
        assert!(matches!(status, IntegrityStatus::Recoverable { .. }));
        assert!(status.can_resume());
    }

    #[test]
    fn test_staleness() {
        let cp = make_run().checkpoint("test");
        let horizon = Duration::from_secs(24 * 3600);
        assert!(!cp.is_stale(horizon, Utc::now()));
        let later = cp.created_at + chrono::Duration::hours(25);
        assert!(cp.is_stale(horizon, later));
        assert_eq!(cp.age(cp.created_at - chrono::Duration::hours(1)), Duration::ZERO);
    }
}
