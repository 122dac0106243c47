//! Budget guard: cost ceiling and wall-clock ceiling for one run.
//!
//! Every remote call reserves its projected cost before it is issued. A
//! reservation that would cross the ceiling is rejected before execution;
//! settling a reservation replaces the projection with the billed cost.
//!
//! ```text
//! authorize(projected) ─┬─ consumed + reserved + projected > ceiling → BudgetExceeded
//!                       └─ Reservation ── settle(actual) → consumed += actual
//!                                     └── drop (call failed/aborted) → reservation released
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;

use crate::error::{EngineError, EngineResult};

/// Cost and time ceilings for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Maximum cost-equivalent a run may consume.
    pub ceiling: f64,
    /// Wall-clock ceiling for a run in milliseconds (0 = unlimited).
    pub wall_clock_ms: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            ceiling: 15.0,
            wall_clock_ms: 300_000,
        }
    }
}

/// Projected cost of each remote call kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    pub evaluate: f64,
    pub challenge: f64,
    pub defend: f64,
    pub arbitrate: f64,
}

impl CostModel {
    /// Projected cost of one full challenge → defense → verdict exchange.
    pub fn exchange(&self) -> f64 {
        self.challenge + self.defend + self.arbitrate
    }
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            evaluate: 0.40,
            challenge: 0.10,
            defend: 0.10,
            arbitrate: 0.10,
        }
    }
}

#[derive(Debug, Default)]
struct Ledger {
    consumed: f64,
    reserved: f64,
}

/// Tracks consumption against the ceilings. Shared across the tasks of a round.
#[derive(Debug)]
pub struct BudgetGuard {
    ceiling: f64,
    wall_clock: Option<Duration>,
    started: Instant,
    prior_elapsed: Duration,
    ledger: Mutex<Ledger>,
    exhausted: AtomicBool,
}

impl BudgetGuard {
    /// A fresh guard with nothing consumed.
    pub fn new(config: &BudgetConfig) -> Self {
        Self::resume(config, 0.0, Duration::ZERO)
    }

    /// A guard for a restored run that already consumed `consumed` and
    /// spent `elapsed` of its wall-clock allowance.
    pub fn resume(config: &BudgetConfig, consumed: f64, elapsed: Duration) -> Self {
        let wall_clock = (config.wall_clock_ms > 0).then(|| Duration::from_millis(config.wall_clock_ms));
        Self {
            ceiling: config.ceiling,
            wall_clock,
            started: Instant::now(),
            prior_elapsed: elapsed,
            ledger: Mutex::new(Ledger {
                consumed,
                reserved: 0.0,
            }),
            exhausted: AtomicBool::new(consumed > config.ceiling),
        }
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ceiling(&self) -> f64 {
        self.ceiling
    }

    pub fn consumed(&self) -> f64 {
        self.ledger().consumed
    }

    /// Ceiling minus consumed and outstanding reservations.
    pub fn remaining(&self) -> f64 {
        let ledger = self.ledger();
        (self.ceiling - ledger.consumed - ledger.reserved).max(0.0)
    }

    /// Whether a settled charge has pushed consumption past the ceiling.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    /// Whether `projected` could be reserved right now.
    pub fn can_afford(&self, projected: f64) -> bool {
        !self.is_exhausted() && projected <= self.remaining() + f64::EPSILON
    }

    /// Wall-clock time spent by the run, including time before a resume.
    pub fn elapsed(&self) -> Duration {
        self.prior_elapsed + self.started.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }

    pub fn wall_clock(&self) -> Option<Duration> {
        self.wall_clock
    }

    /// Fail if the wall-clock ceiling has passed.
    pub fn check_deadline(&self) -> EngineResult<()> {
        if let Some(limit) = self.wall_clock {
            let elapsed = self.elapsed();
            if elapsed >= limit {
                return Err(EngineError::DeadlineExceeded {
                    elapsed_ms: elapsed.as_millis() as u64,
                    limit_ms: limit.as_millis() as u64,
                });
            }
        }
        Ok(())
    }

    /// Reserve `projected` before issuing a call.
    pub fn authorize(&self, projected: f64) -> EngineResult<Reservation<'_>> {
        self.check_deadline()?;
        let mut ledger = self.ledger();
        if self.is_exhausted() || ledger.consumed + ledger.reserved + projected > self.ceiling {
            self.exhausted.store(true, Ordering::SeqCst);
            warn!(
                consumed = ledger.consumed,
                reserved = ledger.reserved,
                projected,
                ceiling = self.ceiling,
                "Budget ceiling reached; rejecting call before execution"
            );
            return Err(EngineError::BudgetExceeded {
                consumed: ledger.consumed,
                projected,
                ceiling: self.ceiling,
            });
        }
        ledger.reserved += projected;
        Ok(Reservation {
            guard: self,
            amount: projected,
            settled: false,
        })
    }

    fn release(&self, amount: f64) {
        let mut ledger = self.ledger();
        ledger.reserved = (ledger.reserved - amount).max(0.0);
    }

    fn settle(&self, amount: f64, actual: f64) -> EngineResult<()> {
        let mut ledger = self.ledger();
        ledger.reserved = (ledger.reserved - amount).max(0.0);
        ledger.consumed += actual.max(0.0);
        if ledger.consumed > self.ceiling {
            self.exhausted.store(true, Ordering::SeqCst);
            return Err(EngineError::BudgetExceeded {
                consumed: ledger.consumed,
                projected: 0.0,
                ceiling: self.ceiling,
            });
        }
        Ok(())
    }
}

/// Outstanding reservation against a [`BudgetGuard`].
///
/// Dropped without settling (failed or aborted call) it releases its amount.
#[derive(Debug)]
pub struct Reservation<'a> {
    guard: &'a BudgetGuard,
    amount: f64,
    settled: bool,
}

impl Reservation<'_> {
    pub fn amount(&self) -> f64 {
        self.amount
    }

    /// Record the billed cost of the call.
    ///
    /// Fails with `BudgetExceeded` if the actual cost pushed consumption past
    /// the ceiling; the cost is recorded either way.
    pub fn settle(mut self, actual: f64) -> EngineResult<()> {
        self.settled = true;
        self.guard.settle(self.amount, actual)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.guard.release(self.amount);
        }
    }
}
