//! Evaluation Convergence Engine
//!
//! Evaluates free-form proposals ("items") by:
//! - fanning out to independent reviewers, one per criterion category
//! - running bounded rounds of adversarial cross-examination
//!   (challenge → defense → arbitration) against the current scores
//! - detecting convergence from score stability, confidence, challenge
//!   resolution and topic saturation
//! - resolving contradictory claims with a fixed precedence order
//! - locking one immutable [`FinalVerdict`] per run
//!
//! Runs are checkpointed at every phase boundary and after every round,
//! can be cancelled and resumed, never run twice at once for the same item
//! and never spend past their cost ceiling.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use convergence::{
//!     EngineConfig, EvaluationRequest, HttpReviewer, HttpReviewerConfig, LockManager,
//!     MemoryCheckpointStore, RunController, RunOutcome,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = EngineConfig::default();
//! let reviewer = Arc::new(HttpReviewer::new(HttpReviewerConfig::from_env())?);
//! let controller = RunController::new(
//!     config.clone(),
//!     reviewer,
//!     Arc::new(MemoryCheckpointStore::new()),
//!     LockManager::new(config.lock.clone()),
//! )?;
//!
//! let request = EvaluationRequest::new("item-42", "Replace the batch importer with a stream");
//! if let RunOutcome::Locked(verdict) = controller.evaluate(request, CancellationToken::new()).await? {
//!     println!("{} after {} rounds", verdict.termination_reason, verdict.rounds_completed);
//! }
//! # Ok(())
//! # }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod budget;
pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod convergence;
pub mod debate;
pub mod error;
pub mod lock;
pub mod retry;
pub mod review;
pub mod state;
pub mod synthesis;
pub mod telemetry;
pub mod types;

pub use budget::{BudgetConfig, BudgetGuard, CostModel};
pub use checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointStore, FileCheckpointStore, IntegrityStatus,
    MemoryCheckpointStore, PersistenceError,
};
pub use config::{CategorySpec, EngineConfig};
pub use controller::{EvaluationRequest, ResumeOptions, RunController, RunOutcome};
pub use convergence::{ConvergenceConfig, ConvergenceDetector, ConvergenceReport, LimitStatus};
pub use debate::{DebateConfig, DebateOrchestrator};
pub use error::{EngineError, EngineResult, ErrorClass, RetryCategory, ReviewError};
pub use lock::{LockConfig, LockGuard, LockKey, LockManager};
pub use retry::{with_retry, Attempt, RetryPolicy};
pub use review::{Billed, HttpReviewer, HttpReviewerConfig, ReviewCapability};
pub use state::{Run, RunPhase, StateTransitionError};
pub use synthesis::{ConflictResolver, Resolution, SynthesisConfig, Winner};
pub use types::{
    ClaimBasis, CriterionScore, Exchange, ExchangeVerdict, FinalVerdict, Grounding,
    TerminationReason,
};
