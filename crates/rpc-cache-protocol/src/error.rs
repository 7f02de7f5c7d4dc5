//! Error taxonomy for cache operations.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::key::ArtifactKey;

/// Error codes returned to clients and peers.
///
/// These codes are stable and used for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Key absent, locally and cluster-wide.
    NotFound,
    /// Authenticated but the capability is insufficient for the operation.
    PermissionDenied,
    /// TLS identity missing or unrecognized while trust sets are configured.
    Unauthenticated,
    /// Local I/O failure.
    StorageError,
    /// A forward or lookup could not reach any owner.
    ClusterUnavailable,
    /// Contradictory or incomplete startup configuration.
    ConfigError,
    /// Malformed request (bad key, missing payload, unknown operation).
    InvalidRequest,
    /// The caller-supplied deadline elapsed.
    DeadlineExceeded,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::StorageError => "STORAGE_ERROR",
            Self::ClusterUnavailable => "CLUSTER_UNAVAILABLE",
            Self::ConfigError => "CONFIG_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
        }
    }

    /// Whether a forwarding caller may try the next owner after this error.
    ///
    /// Only failures to reach a node qualify; an answer such as `NOT_FOUND`
    /// or `PERMISSION_DENIED` is authoritative.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ClusterUnavailable | Self::DeadlineExceeded)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Error payload returned by every cache operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheError {
    /// Error code from the registry.
    pub code: ErrorCode,
    /// Human-readable, single-line error message.
    pub message: String,
    /// Optional machine-readable details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CacheError {
    /// Create a new error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Create a new error with additional data.
    pub fn with_data(code: ErrorCode, message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Create a NOT_FOUND error.
    pub fn not_found(key: &ArtifactKey) -> Self {
        Self::with_data(
            ErrorCode::NotFound,
            format!("artifact '{}' not found", key),
            serde_json::json!({ "key": key.as_str() }),
        )
    }

    /// Create a PERMISSION_DENIED error.
    pub fn permission_denied(op: &str) -> Self {
        Self::with_data(
            ErrorCode::PermissionDenied,
            format!("client is not permitted to {}", op),
            serde_json::json!({ "op": op }),
        )
    }

    /// Create an UNAUTHENTICATED error.
    pub fn unauthenticated(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthenticated, reason)
    }

    /// Create a STORAGE_ERROR error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StorageError, message)
    }

    /// Create a CLUSTER_UNAVAILABLE error naming the nodes that were tried.
    pub fn cluster_unavailable(tried: &[String]) -> Self {
        Self::with_data(
            ErrorCode::ClusterUnavailable,
            format!("no owner reachable (tried {})", tried.join(", ")),
            serde_json::json!({ "tried": tried }),
        )
    }

    /// Create a CONFIG_ERROR error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigError, message)
    }

    /// Create an INVALID_REQUEST error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// Create a DEADLINE_EXCEEDED error.
    pub fn deadline_exceeded(op: &str) -> Self {
        Self::with_data(
            ErrorCode::DeadlineExceeded,
            format!("deadline exceeded during {}", op),
            serde_json::json!({ "op": op }),
        )
    }

    /// Whether this is a NOT_FOUND error.
    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CacheError {}
