//! Startup scan of an existing store directory.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use rpc_cache_protocol::ArtifactKey;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{StoreError, StoreResult};
use crate::layout;
use crate::store::{ArtifactMeta, TEMP_DIR};

/// Result of scanning the store root.
pub(crate) struct ScanResult {
    pub index: HashMap<ArtifactKey, ArtifactMeta>,
    pub total_size: u64,
}

/// Walk `root` and rebuild the artifact index.
///
/// Files that are not where their recorded key places them are skipped with
/// a warning.
pub(crate) fn scan(root: &Path) -> StoreResult<ScanResult> {
    let mut index = HashMap::new();
    let mut total_size = 0u64;

    let walker = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && e.file_name() == TEMP_DIR));

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            StoreError::Io {
                path,
                source: e.into(),
            }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(key) = key_for(root, entry.path())? else {
            warn!(path = %entry.path().display(), "skipping file that is not an artifact");
            continue;
        };
        let meta = entry.metadata().map_err(|e| StoreError::Io {
            path: entry.path().to_path_buf(),
            source: e.into(),
        })?;
        let size = meta.len().saturating_sub(layout::header_len(&key));

        let modified: DateTime<Utc> = meta.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());
        let created: DateTime<Utc> = meta.created().map(DateTime::from).unwrap_or(modified);

        total_size += size;
        index.insert(
            key.clone(),
            ArtifactMeta {
                key,
                size,
                created_at: created,
                last_access: modified,
            },
        );
    }

    debug!(artifacts = index.len(), bytes = total_size, "scanned store");
    Ok(ScanResult { index, total_size })
}

/// Remove leftovers of writes interrupted by a crash.
pub(crate) fn clear_temp(temp_dir: &Path) -> StoreResult<usize> {
    if !temp_dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(temp_dir).map_err(StoreError::io(temp_dir))? {
        let entry = entry.map_err(StoreError::io(temp_dir))?;
        let path = entry.path();
        if path.is_file() {
            fs::remove_file(&path).map_err(StoreError::io(&path))?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// The key recorded in `path`, if the file sits where that key belongs.
fn key_for(root: &Path, path: &Path) -> StoreResult<Option<ArtifactKey>> {
    let named = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(layout::is_artifact_name);
    if !named {
        return Ok(None);
    }
    let key = layout::read_key(path).map_err(StoreError::io(path))?;
    Ok(key.filter(|key| layout::artifact_path(root, key) == path))
}
