//! Per-key locking for artifact writers.
//!
//! `put` and `delete` on the same key MUST be serialized; operations on
//! distinct keys MUST NOT contend. Each key gets its own async mutex, created
//! on first use and dropped again once no task holds or awaits it.
//!
//! Acquisition has a timeout and emits diagnostics if contention occurs.
//! The evictor only ever uses [`KeyedLocks::try_lock`] so it never waits
//! behind an in-flight write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rpc_cache_protocol::ArtifactKey;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Lock result type
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock on {key} not acquired within {timeout:?}")]
    Timeout { key: ArtifactKey, timeout: Duration },
}

type Slot = Arc<tokio::sync::Mutex<()>>;
type SlotMap = Arc<Mutex<HashMap<ArtifactKey, Slot>>>;

/// How long a waiter blocks before contention is logged.
const CONTENTION_WARN_AFTER: Duration = Duration::from_millis(500);

/// Table of per-key mutexes.
#[derive(Debug, Default, Clone)]
pub struct KeyedLocks {
    slots: SlotMap,
}

/// Exclusive hold on one key.
///
/// The lock is released when this guard is dropped.
#[derive(Debug)]
pub struct KeyGuard {
    key: ArtifactKey,
    slots: SlotMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting up to `timeout`.
    pub async fn lock(&self, key: &ArtifactKey, timeout: Duration) -> LockResult<KeyGuard> {
        let slot = self.slot(key);
        if let Ok(guard) = slot.clone().try_lock_owned() {
            return Ok(self.guard(key, guard));
        }

        let start = Instant::now();
        let mut acquire = Box::pin(slot.lock_owned());
        let quiet = CONTENTION_WARN_AFTER.min(timeout);
        if let Ok(guard) = tokio::time::timeout(quiet, &mut acquire).await {
            return Ok(self.guard(key, guard));
        }
        if timeout <= quiet {
            return Err(LockError::Timeout {
                key: key.clone(),
                timeout,
            });
        }

        warn!(key = %key, "lock contention, waiting");
        match tokio::time::timeout(timeout - quiet, acquire).await {
            Ok(guard) => {
                debug!(
                    key = %key,
                    waited_ms = start.elapsed().as_millis() as u64,
                    "lock acquired after contention"
                );
                Ok(self.guard(key, guard))
            }
            Err(_) => Err(LockError::Timeout {
                key: key.clone(),
                timeout,
            }),
        }
    }

    /// Acquire the lock for `key` only if nobody holds it right now.
    pub fn try_lock(&self, key: &ArtifactKey) -> Option<KeyGuard> {
        let slot = self.slot(key);
        let guard = slot.try_lock_owned().ok()?;
        Some(self.guard(key, guard))
    }

    /// Whether some task currently holds `key`.
    pub fn is_locked(&self, key: &ArtifactKey) -> bool {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(key)
            .map(|slot| slot.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of keys with a live lock slot.
    pub fn active(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn slot(&self, key: &ArtifactKey) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key.clone()).or_default().clone()
    }

    fn guard(&self, key: &ArtifactKey, guard: OwnedMutexGuard<()>) -> KeyGuard {
        KeyGuard {
            key: key.clone(),
            slots: Arc::clone(&self.slots),
            guard: Some(guard),
        }
    }
}

impl KeyGuard {
    pub fn key(&self) -> &ArtifactKey {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Release first so the slot's refcount reflects only the map and waiters.
        self.guard.take();
        if let Ok(mut slots) = self.slots.lock() {
            let unused = slots
                .get(&self.key)
                .map(|slot| Arc::strong_count(slot) == 1)
                .unwrap_or(false);
            if unused {
                slots.remove(&self.key);
            }
        }
    }
}
