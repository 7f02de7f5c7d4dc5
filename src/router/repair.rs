//! Repair queue
//!
//! Keys whose writes or deletes could not reach their owners are tagged
//! here. The repair task periodically drains the queue and re-attempts
//! delivery against the ring current at that time; undelivered keys are
//! tagged again for the next pass.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rpc_cache_protocol::ArtifactKey;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::RequestRouter;

/// Operation still owed to a key's owners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOp {
    Store,
    Delete,
}

/// Keys awaiting delivery to their owners.
///
/// One entry per key; the most recent operation replaces an older one.
#[derive(Debug, Default)]
pub struct RepairQueue {
    pending: Mutex<BTreeMap<ArtifactKey, RepairOp>>,
}

impl RepairQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag `key`, replacing any earlier operation.
    pub fn tag(&self, key: ArtifactKey, op: RepairOp) {
        self.lock().insert(key, op);
    }

    /// Tag `key` unless a newer operation was tagged meanwhile.
    pub fn retag(&self, key: ArtifactKey, op: RepairOp) {
        self.lock().entry(key).or_insert(op);
    }

    /// Take every pending entry in key order.
    pub fn drain(&self) -> Vec<(ArtifactKey, RepairOp)> {
        std::mem::take(&mut *self.lock()).into_iter().collect()
    }

    pub fn get(&self, key: &ArtifactKey) -> Option<RepairOp> {
        self.lock().get(key).copied()
    }

    pub fn contains(&self, key: &ArtifactKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ArtifactKey, RepairOp>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outcome of one repair pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub attempted: usize,
    pub repaired: usize,
    pub deferred: usize,
}

/// Run the repair pass every `interval` until `cancel` fires.
pub fn spawn_repair(router: Arc<RequestRouter>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if router.repair_queue().is_empty() {
                        continue;
                    }
                    let report = router.repair_pass().await;
                    if report.repaired > 0 {
                        info!(
                            repaired = report.repaired,
                            deferred = report.deferred,
                            "repair pass complete"
                        );
                    } else {
                        debug!(deferred = report.deferred, "repair pass made no progress");
                    }
                }
            }
        }
        debug!("repair task stopped");
    })
}
