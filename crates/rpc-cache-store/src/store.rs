//! Filesystem-backed artifact store.
//!
//! Features:
//! - Atomic writes via write-to-temp-then-rename
//! - Per-key serialization of `put`/`delete` through [`KeyedLocks`]
//! - Aggregate size and artifact count maintained incrementally
//! - Last-access refresh on read, persisted to file mtime in the background

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use rpc_cache_protocol::ArtifactKey;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{StoreError, StoreResult};
use crate::layout;
use crate::lock::{KeyGuard, KeyedLocks};
use crate::scan;

/// Directory under the root holding in-progress writes.
pub const TEMP_DIR: &str = ".tmp";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory for the store.
    pub root: PathBuf,
    /// Maximum time a writer waits for a key held by another writer.
    pub lock_timeout: Duration,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_timeout: Duration::from_secs(30),
        }
    }
}

/// Metadata about a resident artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub key: ArtifactKey,
    /// Payload size in bytes.
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

/// Aggregate counters for external reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_size: u64,
    pub artifact_count: u64,
}

/// Result of an eviction attempt on one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    /// Removed; carries the reclaimed size.
    Evicted(u64),
    /// A writer holds the key; retry next cycle.
    Locked,
    /// Already gone.
    Absent,
    /// Read after the snapshot was taken; no longer a candidate.
    Refreshed,
}

/// Durable key/value store for artifact payloads.
///
/// Thread-safe; share it behind an `Arc`.
pub struct ArtifactStore {
    root: PathBuf,
    temp_dir: PathBuf,
    index: RwLock<HashMap<ArtifactKey, ArtifactMeta>>,
    total_size: AtomicU64,
    artifact_count: AtomicU64,
    locks: KeyedLocks,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("root", &self.root)
            .field("stats", &self.stat())
            .finish()
    }
}

impl ArtifactStore {
    /// Open the store using the system clock.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Open the store at `config.root`, creating it if needed.
    ///
    /// Scans existing artifacts to rebuild the index and aggregate size, and
    /// discards temp files left behind by interrupted writes.
    pub fn open_with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        let root = config.root;
        let temp_dir = root.join(TEMP_DIR);
        fs::create_dir_all(&temp_dir).map_err(StoreError::io(&temp_dir))?;

        let stale = scan::clear_temp(&temp_dir)?;
        if stale > 0 {
            info!(count = stale, "removed interrupted writes");
        }
        let scanned = scan::scan(&root)?;
        info!(
            root = %root.display(),
            artifacts = scanned.index.len(),
            bytes = scanned.total_size,
            "opened artifact store"
        );

        Ok(Self {
            artifact_count: AtomicU64::new(scanned.index.len() as u64),
            total_size: AtomicU64::new(scanned.total_size),
            index: RwLock::new(scanned.index),
            root,
            temp_dir,
            locks: KeyedLocks::new(),
            clock,
            lock_timeout: config.lock_timeout,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        layout::artifact_path(&self.root, key)
    }

    /// Persist `payload` under `key`, replacing any previous payload.
    pub async fn put(&self, key: &ArtifactKey, payload: &[u8]) -> StoreResult<()> {
        let _guard = self.locks.lock(key, self.lock_timeout).await?;

        let final_path = self.path_for(key);
        let temp_path = self.temp_dir.join(uuid::Uuid::new_v4().to_string());
        if let Err(e) = self.write_temp(&temp_path, key, payload).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e);
        }

        if let Some(parent) = final_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(StoreError::io(parent)(e));
            }
        }
        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(StoreError::io(&final_path)(e));
        }

        let now = self.clock.now();
        let size = payload.len() as u64;
        let previous = self.write_index().insert(
            key.clone(),
            ArtifactMeta {
                key: key.clone(),
                size,
                created_at: now,
                last_access: now,
            },
        );
        match previous {
            Some(old) => self.adjust_size(old.size, size),
            None => {
                self.total_size.fetch_add(size, Ordering::SeqCst);
                self.artifact_count.fetch_add(1, Ordering::SeqCst);
            }
        }

        debug!(key = %key, bytes = size, "stored artifact");
        Ok(())
    }

    async fn write_temp(&self, temp_path: &Path, key: &ArtifactKey, payload: &[u8]) -> StoreResult<()> {
        let mut file = tokio::fs::File::create(temp_path)
            .await
            .map_err(StoreError::io(temp_path))?;
        file.write_all(&layout::header(key))
            .await
            .map_err(StoreError::io(temp_path))?;
        file.write_all(payload).await.map_err(StoreError::io(temp_path))?;
        file.sync_all().await.map_err(StoreError::io(temp_path))?;
        Ok(())
    }

    /// Read the payload stored under `key`.
    ///
    /// A hit refreshes the key's last-access time. The on-disk timestamp is
    /// updated by a background task whose failure never affects the read.
    pub async fn get(&self, key: &ArtifactKey) -> StoreResult<Vec<u8>> {
        let path = self.path_for(key);
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound || !self.contains(key) => {
                return Err(StoreError::NotFound(key.clone()));
            }
            Err(e) => return Err(StoreError::io(&path)(e)),
        };
        let payload = match layout::split(&contents) {
            Some((recorded, payload)) if recorded == key.as_str() => payload.to_vec(),
            _ => {
                warn!(key = %key, path = %path.display(), "artifact file does not record its key");
                return Err(StoreError::NotFound(key.clone()));
            }
        };

        let now = self.clock.now();
        if let Some(meta) = self.write_index().get_mut(key) {
            meta.last_access = now;
        }
        let mtime = SystemTime::from(now);
        tokio::task::spawn_blocking(move || {
            let touched = fs::File::options()
                .write(true)
                .open(&path)
                .and_then(|file| file.set_modified(mtime));
            if let Err(e) = touched {
                debug!(path = %path.display(), error = %e, "failed to persist access time");
            }
        });

        Ok(payload)
    }

    /// Remove the artifact under `key`.
    ///
    /// Returns whether it existed; deleting an absent key is not an error.
    pub async fn delete(&self, key: &ArtifactKey) -> StoreResult<bool> {
        let guard = self.locks.lock(key, self.lock_timeout).await?;
        let path = self.path_for(key);
        let on_disk = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(StoreError::io(&path)(e)),
        };
        Ok(self.unindex(&guard, on_disk).is_some())
    }

    /// Evict `key` unless a writer holds it or it was read after `seen_access`.
    ///
    /// Blocks on filesystem I/O; call it off the async runtime.
    pub fn try_evict(&self, key: &ArtifactKey, seen_access: DateTime<Utc>) -> StoreResult<EvictOutcome> {
        let Some(guard) = self.locks.try_lock(key) else {
            return Ok(EvictOutcome::Locked);
        };
        let current = self.read_index().get(key).map(|m| m.last_access);
        match current {
            None => return Ok(EvictOutcome::Absent),
            Some(last_access) if last_access > seen_access => return Ok(EvictOutcome::Refreshed),
            Some(_) => {}
        }

        let path = self.path_for(key);
        let on_disk = match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(StoreError::io(&path)(e)),
        };
        Ok(match self.unindex(&guard, on_disk) {
            Some(size) => EvictOutcome::Evicted(size),
            None => EvictOutcome::Absent,
        })
    }

    /// Drop the index entry for a key whose lock is held and whose file is gone.
    fn unindex(&self, guard: &KeyGuard, on_disk: bool) -> Option<u64> {
        let key = guard.key();
        let removed = self.write_index().remove(key);
        if let Some(meta) = &removed {
            self.total_size.fetch_sub(meta.size, Ordering::SeqCst);
            self.artifact_count.fetch_sub(1, Ordering::SeqCst);
        }
        if on_disk {
            debug!(key = %key, "deleted artifact");
        }
        removed.map(|m| m.size)
    }

    fn adjust_size(&self, old: u64, new: u64) {
        if new > old {
            self.total_size.fetch_add(new - old, Ordering::SeqCst);
        } else if old > new {
            self.total_size.fetch_sub(old - new, Ordering::SeqCst);
        }
    }

    /// Whether `key` is resident.
    pub fn contains(&self, key: &ArtifactKey) -> bool {
        self.read_index().contains_key(key)
    }

    /// Metadata for a resident key.
    pub fn meta(&self, key: &ArtifactKey) -> Option<ArtifactMeta> {
        self.read_index().get(key).cloned()
    }

    /// Aggregate size and artifact count.
    pub fn stat(&self) -> StoreStats {
        StoreStats {
            total_size: self.total_size.load(Ordering::SeqCst),
            artifact_count: self.artifact_count.load(Ordering::SeqCst),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::SeqCst)
    }

    /// Point-in-time listing of all resident artifacts.
    pub fn snapshot(&self) -> Vec<ArtifactMeta> {
        self.read_index().values().cloned().collect()
    }

    fn read_index(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ArtifactKey, ArtifactMeta>> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_index(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ArtifactKey, ArtifactMeta>> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }
}
