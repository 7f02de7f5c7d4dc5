//! Artifact eviction
//!
//! Each cycle works from a point-in-time snapshot of the store:
//! 1. Age pass: delete every artifact not read for longer than `max_artifact_age`
//! 2. Size pass: if the aggregate size exceeds the high water mark, delete in
//!    least-recently-used order (ties broken by key) until at or below the low
//!    water mark
//!
//! Eviction MUST NOT wait on a key held by a writer; such keys are skipped and
//! reconsidered next cycle. A failure on one key is logged and the cycle moves on.
//! A cancelled cycle stops between deletions, so the store is never left
//! half-way through removing an artifact. Spawned cycles run on the blocking
//! pool.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rpc_cache_protocol::ArtifactKey;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::store::{ArtifactMeta, ArtifactStore, EvictOutcome};

/// Retention configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionPolicy {
    /// Size to clean down to once cleaning starts.
    pub low_water_mark: u64,
    /// Aggregate size above which size-based cleaning starts.
    pub high_water_mark: u64,
    /// Artifacts not read for this long are removed regardless of size.
    pub max_artifact_age: Duration,
    /// Interval between cycles.
    pub clean_frequency: Duration,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        const GIB: u64 = 1024 * 1024 * 1024;
        Self {
            low_water_mark: 18 * GIB,
            high_water_mark: 20 * GIB,
            max_artifact_age: Duration::from_secs(720 * 60 * 60),
            clean_frequency: Duration::from_secs(10 * 60),
        }
    }
}

/// Result of one eviction cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Number of artifacts in the snapshot
    pub scanned: usize,
    /// Keys removed by the age pass
    pub aged_out: Vec<ArtifactKey>,
    /// Keys removed by the size pass, in eviction order
    pub size_evicted: Vec<ArtifactKey>,
    /// Bytes reclaimed
    pub bytes_reclaimed: u64,
    /// Candidates skipped (locked by a writer or read since the snapshot)
    pub skipped: usize,
    /// Errors encountered (non-fatal)
    pub errors: Vec<String>,
    /// The cycle was cancelled before finishing
    pub aborted: bool,
}

impl EvictionReport {
    pub fn deleted(&self) -> usize {
        self.aged_out.len() + self.size_evicted.len()
    }
}

/// Background retention enforcer.
pub struct Evictor {
    store: Arc<ArtifactStore>,
    policy: EvictionPolicy,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Pass {
    Age,
    Size,
}

impl Evictor {
    pub fn new(store: Arc<ArtifactStore>, policy: EvictionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    /// Run one eviction cycle. Blocks on filesystem I/O.
    pub fn run_cycle(&self, cancel: &CancellationToken) -> EvictionReport {
        let mut report = EvictionReport::default();
        let snapshot = self.store.snapshot();
        report.scanned = snapshot.len();

        let now = self.store.clock().now();
        let cutoff = chrono::Duration::from_std(self.policy.max_artifact_age)
            .ok()
            .and_then(|max_age| now.checked_sub_signed(max_age));

        // Age pass
        let mut handled = HashSet::new();
        if let Some(cutoff) = cutoff {
            for meta in snapshot.iter().filter(|m| m.last_access < cutoff) {
                if cancel.is_cancelled() {
                    report.aborted = true;
                    return report;
                }
                handled.insert(meta.key.clone());
                self.evict_one(meta, Pass::Age, &mut report);
            }
        }

        // Size pass
        if self.store.total_size() > self.policy.high_water_mark {
            let mut candidates: Vec<&ArtifactMeta> =
                snapshot.iter().filter(|m| !handled.contains(&m.key)).collect();
            candidates.sort_by(|a, b| a.last_access.cmp(&b.last_access).then_with(|| a.key.cmp(&b.key)));

            for meta in candidates {
                if self.store.total_size() <= self.policy.low_water_mark {
                    break;
                }
                if cancel.is_cancelled() {
                    report.aborted = true;
                    return report;
                }
                self.evict_one(meta, Pass::Size, &mut report);
            }
        }

        report
    }

    fn evict_one(&self, meta: &ArtifactMeta, pass: Pass, report: &mut EvictionReport) {
        match self.store.try_evict(&meta.key, meta.last_access) {
            Ok(EvictOutcome::Evicted(size)) => {
                debug!(key = %meta.key, bytes = size, "evicted artifact");
                report.bytes_reclaimed += size;
                match pass {
                    Pass::Age => report.aged_out.push(meta.key.clone()),
                    Pass::Size => report.size_evicted.push(meta.key.clone()),
                }
            }
            Ok(EvictOutcome::Absent) => {}
            Ok(EvictOutcome::Locked) | Ok(EvictOutcome::Refreshed) => report.skipped += 1,
            Err(e) => {
                warn!(key = %meta.key, error = %e, "failed to evict artifact");
                report.errors.push(format!("{}: {}", meta.key, e));
            }
        }
    }

    /// Run cycles every `clean_frequency` until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let evictor = Arc::new(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(evictor.policy.clean_frequency);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; cleaning starts one period in.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let cycle = {
                    let evictor = Arc::clone(&evictor);
                    let cancel = cancel.clone();
                    tokio::task::spawn_blocking(move || evictor.run_cycle(&cancel))
                };
                let report = match cycle.await {
                    Ok(report) => report,
                    Err(e) => {
                        error!("eviction cycle panicked: {}", e);
                        continue;
                    }
                };
                let stats = evictor.store.stat();
                info!(
                    scanned = report.scanned,
                    deleted = report.deleted(),
                    bytes_reclaimed = report.bytes_reclaimed,
                    skipped = report.skipped,
                    errors = report.errors.len(),
                    total_size = stats.total_size,
                    artifacts = stats.artifact_count,
                    "eviction cycle complete"
                );
                if report.aborted {
                    break;
                }
            }
            debug!("evictor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::StoreConfig;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;
    use std::thread::{self, ThreadId};
    use tempfile::TempDir;

    fn key(s: &str) -> ArtifactKey {
        ArtifactKey::parse(s).unwrap()
    }

    fn setup(temp: &TempDir) -> (Arc<ArtifactStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = ArtifactStore::open_with_clock(
            StoreConfig::new(temp.path().join("cache")),
            clock.clone(),
        )
        .unwrap();
        (Arc::new(store), clock)
    }

    fn policy(low: u64, high: u64) -> EvictionPolicy {
        EvictionPolicy {
            low_water_mark: low,
            high_water_mark: high,
            max_artifact_age: Duration::from_secs(3600),
            clean_frequency: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_eviction_policy_default() {
        let policy = EvictionPolicy::default();
        assert_eq!(policy.low_water_mark, 18 * 1024 * 1024 * 1024);
        assert_eq!(policy.high_water_mark, 20 * 1024 * 1024 * 1024);
        assert_eq!(policy.max_artifact_age, Duration::from_secs(30 * 24 * 3600));
        assert_eq!(policy.clean_frequency, Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_empty_store() {
        let temp = TempDir::new().unwrap();
        let (store, _) = setup(&temp);
        let report = Evictor::new(store, policy(10, 20)).run_cycle(&CancellationToken::new());
        assert_eq!(report, EvictionReport::default());
    }

    #[tokio::test]
    async fn test_below_high_water_mark_keeps_everything() {
        let temp = TempDir::new().unwrap();
        let (store, clock) = setup(&temp);
        for i in 0..3 {
            store.put(&key(&format!("p/t/{}", i)), &[0u8; 5]).await.unwrap();
            clock.advance(Duration::from_secs(1));
        }
        let report = Evictor::new(store.clone(), policy(10, 20)).run_cycle(&CancellationToken::new());
        assert_eq!(report.deleted(), 0);
        assert_eq!(store.total_size(), 15);
    }

    #[tokio::test]
    async fn test_size_pass_evicts_least_recently_used() {
        let temp = TempDir::new().unwrap();
        let (store, clock) = setup(&temp);
        for i in 0..5 {
            store.put(&key(&format!("p/t/{}", i)), &[0u8; 10]).await.unwrap();
            clock.advance(Duration::from_secs(1));
        }
        // Reading the oldest makes it the most recently used.
        store.get(&key("p/t/0")).await.unwrap();

        let report = Evictor::new(store.clone(), policy(25, 40)).run_cycle(&CancellationToken::new());
        assert_eq!(report.size_evicted, vec![key("p/t/1"), key("p/t/2"), key("p/t/3")]);
        assert_eq!(report.bytes_reclaimed, 30);
        assert_eq!(store.total_size(), 20);
        assert!(store.contains(&key("p/t/0")));
        assert!(store.contains(&key("p/t/4")));
    }

    #[tokio::test]
    async fn test_size_pass_breaks_ties_by_key() {
        let temp = TempDir::new().unwrap();
        let (store, _clock) = setup(&temp);
        for name in ["p/t/c", "p/t/a", "p/t/b"] {
            store.put(&key(name), &[0u8; 10]).await.unwrap();
        }
        let report = Evictor::new(store.clone(), policy(10, 20)).run_cycle(&CancellationToken::new());
        assert_eq!(report.size_evicted, vec![key("p/t/a"), key("p/t/b")]);
    }

    #[tokio::test]
    async fn test_age_pass_ignores_size() {
        let temp = TempDir::new().unwrap();
        let (store, clock) = setup(&temp);
        store.put(&key("p/t/old"), &[0u8; 1]).await.unwrap();
        clock.advance(Duration::from_secs(7200));
        store.put(&key("p/t/new"), &[0u8; 1]).await.unwrap();

        let report = Evictor::new(store.clone(), policy(100, 200)).run_cycle(&CancellationToken::new());
        assert_eq!(report.aged_out, vec![key("p/t/old")]);
        assert!(report.size_evicted.is_empty());
        assert!(store.contains(&key("p/t/new")));
    }

    #[tokio::test]
    async fn test_locked_artifact_is_skipped() {
        let temp = TempDir::new().unwrap();
        let (store, clock) = setup(&temp);
        store.put(&key("p/t/held"), &[0u8; 1]).await.unwrap();
        clock.advance(Duration::from_secs(7200));

        let held = store.locks().try_lock(&key("p/t/held")).unwrap();
        let evictor = Evictor::new(store.clone(), policy(100, 200));
        let report = evictor.run_cycle(&CancellationToken::new());
        assert_eq!(report.skipped, 1);
        assert!(store.contains(&key("p/t/held")));

        drop(held);
        let report = evictor.run_cycle(&CancellationToken::new());
        assert_eq!(report.aged_out, vec![key("p/t/held")]);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_stops_cleanly() {
        let temp = TempDir::new().unwrap();
        let (store, clock) = setup(&temp);
        store.put(&key("p/t/1"), &[0u8; 1]).await.unwrap();
        clock.advance(Duration::from_secs(7200));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = Evictor::new(store.clone(), policy(100, 200)).run_cycle(&cancel);
        assert!(report.aborted);
        assert!(store.contains(&key("p/t/1")));
        assert_eq!(store.stat().artifact_count, 1);
    }

    /// Clock recording which thread asked for the time.
    struct ThreadRecordingClock {
        inner: ManualClock,
        threads: Mutex<Vec<ThreadId>>,
    }

    impl Clock for ThreadRecordingClock {
        fn now(&self) -> DateTime<Utc> {
            self.threads.lock().unwrap().push(thread::current().id());
            self.inner.now()
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_spawned_cycle_runs_off_the_runtime_thread() {
        let temp = TempDir::new().unwrap();
        let clock = Arc::new(ThreadRecordingClock {
            inner: ManualClock::new(Utc::now()),
            threads: Mutex::new(Vec::new()),
        });
        let store = Arc::new(
            ArtifactStore::open_with_clock(StoreConfig::new(temp.path().join("cache")), clock.clone()).unwrap(),
        );
        store.put(&key("p/t/stale"), &[0u8; 4]).await.unwrap();
        clock.inner.advance(Duration::from_secs(7200));
        clock.threads.lock().unwrap().clear();

        let cancel = CancellationToken::new();
        let evictor = Evictor::new(
            store.clone(),
            EvictionPolicy {
                clean_frequency: Duration::from_millis(20),
                ..policy(100, 200)
            },
        );
        let handle = evictor.spawn(cancel.clone());
        for _ in 0..250 {
            if !store.contains(&key("p/t/stale")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        assert!(!store.contains(&key("p/t/stale")));
        let runtime_thread = thread::current().id();
        let threads = clock.threads.lock().unwrap().clone();
        assert!(!threads.is_empty());
        assert!(threads.iter().all(|t| *t != runtime_thread));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_evictor_stops_on_cancel() {
        let temp = TempDir::new().unwrap();
        let (store, _) = setup(&temp);
        let cancel = CancellationToken::new();
        let handle = Evictor::new(store, policy(10, 20)).spawn(cancel.clone());
        tokio::time::sleep(Duration::from_secs(130)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
