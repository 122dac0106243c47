//! Error taxonomy with retry classification.
//!
//! Every failure the engine can observe is represented here. Callers query
//! [`ReviewError::retry_category`] and [`EngineError::class`] instead of
//! string matching.
//!
//! ## Retry categories
//!
//! | Category      | Retriable | Handling                                   |
//! |---------------|-----------|--------------------------------------------|
//! | Transient     | yes       | exponential back-off, bounded attempts     |
//! | RateLimit     | yes       | back-off, honoring `Retry-After`           |
//! | ParseFailure  | yes       | retried with a reformulated request only   |
//! | Fatal         | no        | abort the operation, run goes to `FAILED`  |
//! | Limit         | no        | budget / wall-clock ceiling, never retried |
//! | Cancelled     | no        | run suspended at its last checkpoint       |

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::checkpoint::PersistenceError;
use crate::state::{RunPhase, StateTransitionError};
use crate::types::TerminationReason;

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Classification used by the retry wrapper to decide whether to try again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCategory {
    /// Transient network / backend error.
    Transient,
    /// Remote rate limit.
    RateLimit,
    /// Response failed schema validation; retry only with a reformulated request.
    ParseFailure,
    /// Authorization failure or a request the remote side will never accept.
    Fatal,
    /// Cost or time ceiling reached.
    Limit,
    /// Explicit cancellation.
    Cancelled,
}

impl RetryCategory {
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimit | Self::ParseFailure)
    }
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::ParseFailure => write!(f, "parse_failure"),
            Self::Fatal => write!(f, "fatal"),
            Self::Limit => write!(f, "limit"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Errors returned by a [`ReviewCapability`](crate::review::ReviewCapability).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReviewError {
    #[error("transient remote error: {0}")]
    Transient(String),

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The response did not match the expected schema.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ReviewError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse(message.into())
    }

    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::Transient(_) | Self::Timeout(_) => RetryCategory::Transient,
            Self::RateLimited { .. } => RetryCategory::RateLimit,
            Self::MalformedResponse(_) => RetryCategory::ParseFailure,
            Self::Unauthorized(_) | Self::Rejected(_) => RetryCategory::Fatal,
        }
    }
}

/// Error classes of the engine's failure-handling design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient remote error that exhausted its retries.
    TransientRemote,
    /// Non-retriable remote error; the run fails.
    FatalRemote,
    /// Budget, round or wall-clock ceiling; recorded as the termination reason.
    Limit,
    /// Programming or operational contract violation; surfaced immediately.
    ContractViolation,
    /// Storage failure.
    Persistence,
    /// Cancellation requested by the caller.
    Cancelled,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransientRemote => write!(f, "transient_remote"),
            Self::FatalRemote => write!(f, "fatal_remote"),
            Self::Limit => write!(f, "limit"),
            Self::ContractViolation => write!(f, "contract_violation"),
            Self::Persistence => write!(f, "persistence"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    StateTransition(#[from] StateTransitionError),

    #[error("run {run_id} is sealed in phase {phase} and cannot be mutated")]
    RunImmutable { run_id: String, phase: RunPhase },

    #[error("lock on {key} not acquired within {waited_ms}ms (held by {holder})")]
    LockTimeout {
        key: String,
        holder: String,
        waited_ms: u64,
    },

    #[error("lock on {key} is not held by {holder}")]
    LockNotHeld { key: String, holder: String },

    #[error(
        "budget exceeded: consumed {consumed:.2} + projected {projected:.2} > ceiling {ceiling:.2}"
    )]
    BudgetExceeded {
        consumed: f64,
        projected: f64,
        ceiling: f64,
    },

    #[error("wall-clock ceiling of {limit_ms}ms exceeded ({elapsed_ms}ms elapsed)")]
    DeadlineExceeded { elapsed_ms: u64, limit_ms: u64 },

    #[error("round {round} exceeded its {limit_ms}ms timeout")]
    RoundTimeout { round: u32, limit_ms: u64 },

    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: ReviewError,
    },

    #[error("{operation} failed: {source}")]
    Fatal {
        operation: String,
        #[source]
        source: ReviewError,
    },

    #[error("no successful evaluation for categories: {}", categories.join(", "))]
    FanOutFailed { categories: Vec<String> },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("checkpoint for run {run_id} is {age_ms}ms old; resume requires confirmation")]
    StaleCheckpoint { run_id: String, age_ms: u64 },

    #[error("no checkpoint found for run {0}")]
    CheckpointNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("run {0} was cancelled")]
    Cancelled(String),
}

impl EngineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Map the error onto the failure-handling classes.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RetriesExhausted { .. } => ErrorClass::TransientRemote,
            Self::Fatal { .. } | Self::FanOutFailed { .. } => ErrorClass::FatalRemote,
            Self::BudgetExceeded { .. }
            | Self::DeadlineExceeded { .. }
            | Self::RoundTimeout { .. } => ErrorClass::Limit,
            Self::StateTransition(_)
            | Self::RunImmutable { .. }
            | Self::LockTimeout { .. }
            | Self::LockNotHeld { .. }
            | Self::StaleCheckpoint { .. }
            | Self::CheckpointNotFound(_)
            | Self::Config(_) => ErrorClass::ContractViolation,
            Self::Persistence(_) => ErrorClass::Persistence,
            Self::Cancelled(_) => ErrorClass::Cancelled,
        }
    }

    /// Whether the error must fail the enclosing run rather than one exchange.
    pub fn fails_run(&self) -> bool {
        !matches!(self.class(), ErrorClass::TransientRemote)
    }

    /// Termination reason recorded on the run when this error ends it.
    pub fn termination_reason(&self) -> Option<TerminationReason> {
        match self {
            Self::BudgetExceeded { .. } => Some(TerminationReason::BudgetExceeded),
            Self::DeadlineExceeded { .. } | Self::RoundTimeout { .. } => {
                Some(TerminationReason::Timeout)
            }
            _ => None,
        }
    }
}
