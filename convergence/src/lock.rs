//! Advisory, time-bounded resource lock.
//!
//! One live lock per `(item, operation)` key. A lock expires after
//! `expiry_ms` so a crashed holder cannot block the item forever; acquisition
//! waits up to `acquire_timeout_ms` and then fails with
//! [`EngineError::LockTimeout`].
//!
//! Every grant carries a fencing token. Release and renewal check the token,
//! so a holder whose lock expired and was re-granted elsewhere cannot release
//! the new holder's lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};

/// Lock timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lifetime of a grant before it is considered abandoned.
    pub expiry_ms: u64,
    /// How long `acquire` waits for a contended key.
    pub acquire_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            expiry_ms: 600_000,
            acquire_timeout_ms: 30_000,
        }
    }
}

/// Resource key: item identifier plus operation kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockKey {
    pub item_id: String,
    pub operation: String,
}

impl LockKey {
    pub fn new(item_id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            operation: operation.into(),
        }
    }

    /// Key guarding evaluation runs for `item_id`.
    pub fn evaluation(item_id: &str) -> Self {
        Self::new(item_id, "evaluate")
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.item_id, self.operation)
    }
}

#[derive(Debug, Clone)]
struct Grant {
    holder: String,
    token: u64,
    expires_at: Instant,
}

impl Grant {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Process-wide lock table.
#[derive(Debug)]
pub struct LockManager {
    config: LockConfig,
    grants: Mutex<HashMap<LockKey, Grant>>,
    released: Notify,
    next_token: AtomicU64,
}

impl LockManager {
    pub fn new(config: LockConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            grants: Mutex::new(HashMap::new()),
            released: Notify::new(),
            next_token: AtomicU64::new(1),
        })
    }

    fn grants(&self) -> std::sync::MutexGuard<'_, HashMap<LockKey, Grant>> {
        self.grants.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expiry(&self) -> Duration {
        Duration::from_millis(self.config.expiry_ms)
    }

    /// Claim `key` if it is free or its grant expired; otherwise return the live grant.
    fn claim(&self, key: &LockKey, holder: &str) -> Result<u64, Grant> {
        let now = Instant::now();
        let mut grants = self.grants();
        if let Some(current) = grants.get(key) {
            if current.is_live(now) {
                return Err(current.clone());
            }
            warn!(
                key = %key,
                previous_holder = %current.holder,
                "Reclaiming expired lock"
            );
        }
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        grants.insert(
            key.clone(),
            Grant {
                holder: holder.to_string(),
                token,
                expires_at: now + self.expiry(),
            },
        );
        Ok(token)
    }

    /// Acquire without waiting. `None` when another holder has a live grant.
    pub fn try_acquire(self: &Arc<Self>, key: LockKey, holder: &str) -> Option<LockGuard> {
        let token = self.claim(&key, holder).ok()?;
        info!(key = %key, holder, token, "Lock acquired");
        Some(LockGuard::new(self.clone(), key, holder, token))
    }

    /// Acquire `key`, waiting for release or expiry up to the acquire timeout.
    pub async fn acquire(self: &Arc<Self>, key: LockKey, holder: &str) -> EngineResult<LockGuard> {
        let timeout = Duration::from_millis(self.config.acquire_timeout_ms);
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            // Register for wake-ups before checking, so a release between
            // the check and the wait is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let current = match self.claim(&key, holder) {
                Ok(token) => {
                    info!(
                        key = %key,
                        holder,
                        token,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Lock acquired"
                    );
                    return Ok(LockGuard::new(self.clone(), key, holder, token));
                }
                Err(current) => current,
            };

            if Instant::now() >= deadline {
                return Err(EngineError::LockTimeout {
                    key: key.to_string(),
                    holder: current.holder,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            debug!(key = %key, holder, current_holder = %current.holder, "Waiting for lock");
            let wake_at = current.expires_at.min(deadline);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Current live holder of `key`, if any.
    pub fn holder(&self, key: &LockKey) -> Option<String> {
        let now = Instant::now();
        self.grants()
            .get(key)
            .filter(|g| g.is_live(now))
            .map(|g| g.holder.clone())
    }

    fn release(&self, key: &LockKey, token: u64) -> bool {
        let removed = {
            let mut grants = self.grants();
            match grants.get(key) {
                Some(grant) if grant.token == token => grants.remove(key).is_some(),
                _ => false,
            }
        };
        if removed {
            self.released.notify_waiters();
        }
        removed
    }

    fn renew(&self, key: &LockKey, token: u64) -> bool {
        let now = Instant::now();
        let mut grants = self.grants();
        match grants.get_mut(key) {
            Some(grant) if grant.token == token && grant.is_live(now) => {
                grant.expires_at = now + self.expiry();
                true
            }
            _ => false,
        }
    }
}

/// A held lock. Released on [`LockGuard::release`] or drop.
#[derive(Debug)]
pub struct LockGuard {
    manager: Arc<LockManager>,
    key: LockKey,
    holder: String,
    token: u64,
    released: bool,
}

impl LockGuard {
    fn new(manager: Arc<LockManager>, key: LockKey, holder: &str, token: u64) -> Self {
        Self {
            manager,
            key,
            holder: holder.to_string(),
            token,
            released: false,
        }
    }

    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Fencing token of this grant; strictly increasing across grants.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Extend the grant by a full expiry period.
    pub fn renew(&self) -> EngineResult<()> {
        if self.manager.renew(&self.key, self.token) {
            Ok(())
        } else {
            Err(self.not_held())
        }
    }

    /// Release the lock. Fails if the grant expired and was taken over.
    pub fn release(mut self) -> EngineResult<()> {
        self.released = true;
        if self.manager.release(&self.key, self.token) {
            info!(key = %self.key, holder = %self.holder, "Lock released");
            Ok(())
        } else {
            Err(self.not_held())
        }
    }

    fn not_held(&self) -> EngineError {
        EngineError::LockNotHeld {
            key: self.key.to_string(),
            holder: self.holder.clone(),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.manager.release(&self.key, self.token);
        }
    }
}
