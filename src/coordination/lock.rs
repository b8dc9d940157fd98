//! Distributed lock with TTL-based crash recovery.
//!
//! Acquisition is a single SET-if-absent with TTL (the holder id is the
//! value); release deletes the key only when it still carries our holder id,
//! so a lock that expired and was re-acquired elsewhere is never clobbered.
//! Contention is handled with exponential backoff plus jitter.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use rand::Rng;
use tracing::debug;
use tracing::warn;

use crate::registry::Registry;
use crate::registry::RegistryError;

/// Configuration for [`DistributedLock`].
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Time-to-live of an acquired lock.
    pub ttl: Duration,
    /// Maximum time to spend trying to acquire.
    pub acquire_timeout: Duration,
    /// Initial backoff between attempts.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

/// A distributed mutex over one registry key.
pub struct DistributedLock {
    registry: Arc<dyn Registry>,
    key: String,
    holder_id: String,
    config: LockConfig,
}

impl DistributedLock {
    pub fn new(
        registry: Arc<dyn Registry>,
        key: impl Into<String>,
        holder_id: impl Into<String>,
        config: LockConfig,
    ) -> Self {
        Self {
            registry,
            key: key.into(),
            holder_id: holder_id.into(),
            config,
        }
    }

    /// Acquire the lock, retrying with backoff until the timeout elapses.
    pub async fn acquire(&self) -> Result<LockGuard, RegistryError> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        let mut backoff = self.config.initial_backoff;

        loop {
            if let Some(guard) = self.try_acquire().await? {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                return Err(RegistryError::Timeout { op: "lock-acquire" });
            }

            let jitter = rand::rng().random_range(0..backoff.as_millis().max(1) as u64 / 2 + 1);
            let sleep = backoff + Duration::from_millis(jitter);
            debug!(key = %self.key, holder = %self.holder_id, backoff_ms = sleep.as_millis() as u64, "lock held, backing off");
            tokio::time::sleep(sleep).await;
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    /// One acquisition attempt; `None` when another holder owns the lock.
    pub async fn try_acquire(&self) -> Result<Option<LockGuard>, RegistryError> {
        if self
            .registry
            .set_nx_ex(&self.key, &self.holder_id, self.config.ttl)
            .await?
        {
            debug!(key = %self.key, holder = %self.holder_id, ttl_ms = self.config.ttl.as_millis() as u64, "lock acquired");
            Ok(Some(LockGuard {
                registry: self.registry.clone(),
                key: self.key.clone(),
                holder_id: self.holder_id.clone(),
                released: false,
            }))
        } else {
            Ok(None)
        }
    }
}

/// Guard for a held lock; releases on [`LockGuard::release`] or best-effort
/// on drop (the TTL bounds the damage if that write is lost).
pub struct LockGuard {
    registry: Arc<dyn Registry>,
    key: String,
    holder_id: String,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("holder_id", &self.holder_id)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    /// Release the lock, reporting whether we still held it.
    pub async fn release(mut self) -> Result<bool, RegistryError> {
        self.released = true;
        let still_held = self.registry.del_eq(&self.key, &self.holder_id).await?;
        if still_held {
            debug!(key = %self.key, holder = %self.holder_id, "lock released");
        } else {
            warn!(key = %self.key, holder = %self.holder_id, "lock release found another holder");
        }
        Ok(still_held)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let registry = self.registry.clone();
        let key = std::mem::take(&mut self.key);
        let holder = std::mem::take(&mut self.holder_id);
        tokio::spawn(async move {
            match registry.del_eq(&key, &holder).await {
                Ok(_) => debug!(key = %key, "lock released on drop"),
                Err(e) => debug!(key = %key, error = %e, "lock release on drop failed (will expire via TTL)"),
            }
        });
    }
}
