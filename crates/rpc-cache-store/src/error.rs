//! Store errors.

use std::io;
use std::path::PathBuf;

use rpc_cache_protocol::{ArtifactKey, CacheError};
use thiserror::Error;

use crate::lock::LockError;

/// Store result type.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from artifact store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact not found: {0}")]
    NotFound(ArtifactKey),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> StoreError {
        let path = path.into();
        move |source| StoreError::Io { path, source }
    }
}

impl From<StoreError> for CacheError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::NotFound(key) => CacheError::not_found(key),
            // Paths stay in the server log; clients only see the failure class.
            StoreError::Io { source, .. } => CacheError::storage(format!("storage I/O failure: {}", source)),
            StoreError::Lock(e) => CacheError::storage(e.to_string()),
        }
    }
}
