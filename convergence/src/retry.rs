//! Retry wrapper for remote review calls.
//!
//! One primitive shared by every evaluate / challenge / defend / arbitrate
//! call: per-call timeout, exponential back-off for transient failures,
//! reformulated retries for malformed responses, immediate failure for
//! everything else.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult, RetryCategory, ReviewError};

/// Retry policy for remote calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum retries for transient / rate-limit failures (0 = no retries).
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff multiplier (e.g., 2.0 for exponential).
    pub backoff_multiplier: f64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Retries allowed after a malformed response, each with `reformulate` set.
    pub max_reformulations: u32,
    /// Timeout applied to every individual attempt.
    pub call_timeout_ms: u64,
}

impl RetryPolicy {
    /// Delay before retry number `retry`; the first attempt (0) never waits.
    pub fn backoff_ms(&self, retry: u32) -> u64 {
        let Some(exponent) = retry.checked_sub(1) else {
            return 0;
        };
        let grown = self.backoff_multiplier.powi(exponent.min(i32::MAX as u32) as i32);
        (self.initial_backoff_ms as f64 * grown).min(self.max_backoff_ms as f64) as u64
    }

    /// Whether another retry is allowed given the retries already spent.
    pub fn should_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// [`Self::backoff_ms`] as a sleepable duration.
    pub fn backoff_duration(&self, retry: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(retry))
    }

    /// Upper bound on a single attempt, retries excluded.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for RetryPolicy {
    /// Default: 3 retries, 500ms initial backoff, 2x multiplier, 8s max, 60s per call.
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 8_000,
            max_reformulations: 1,
            call_timeout_ms: 60_000,
        }
    }
}

/// Attempt metadata handed to the wrapped call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    /// The previous attempt returned a malformed response; rephrase the request.
    pub reformulate: bool,
}

impl Attempt {
    pub fn first() -> Self {
        Self {
            number: 1,
            reformulate: false,
        }
    }
}

/// Run `call` under `policy`.
///
/// - transient / rate-limit errors back off and retry up to `max_retries`,
///   then fail with [`EngineError::RetriesExhausted`];
/// - malformed responses retry with `reformulate` set up to
///   `max_reformulations`, then fail with [`EngineError::Fatal`];
/// - any other error fails immediately with [`EngineError::Fatal`].
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> EngineResult<T>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T, ReviewError>>,
{
    let timeout = policy.call_timeout();
    let mut retries = 0u32;
    let mut reformulations = 0u32;
    let mut attempt = Attempt::first();

    loop {
        let result = match tokio::time::timeout(timeout, call(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(ReviewError::Timeout(timeout)),
        };

        let err = match result {
            Ok(value) => {
                if attempt.number > 1 {
                    debug!(operation, attempts = attempt.number, "Call succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        match err.retry_category() {
            RetryCategory::Transient | RetryCategory::RateLimit => {
                if !policy.should_retry(retries) {
                    return Err(EngineError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt.number,
                        last: err,
                    });
                }
                retries += 1;
                let mut backoff = policy.backoff_duration(retries);
                if let ReviewError::RateLimited {
                    retry_after: Some(after),
                } = &err
                {
                    backoff = backoff.max(*after);
                }
                warn!(
                    operation,
                    attempt = attempt.number,
                    max_retries = policy.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Transient error, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt = Attempt {
                    number: attempt.number + 1,
                    reformulate: false,
                };
            }
            RetryCategory::ParseFailure => {
                if reformulations >= policy.max_reformulations {
                    return Err(EngineError::Fatal {
                        operation: operation.to_string(),
                        source: err,
                    });
                }
                reformulations += 1;
                warn!(
                    operation,
                    attempt = attempt.number,
                    error = %err,
                    "Malformed response, retrying with reformulated request"
                );
                attempt = Attempt {
                    number: attempt.number + 1,
                    reformulate: true,
                };
            }
            _ => {
                return Err(EngineError::Fatal {
                    operation: operation.to_string(),
                    source: err,
                });
            }
        }
    }
}
