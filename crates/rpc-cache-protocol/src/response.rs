//! Response envelope.

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::request::payload_b64;
use crate::PROTOCOL_VERSION;

/// Response envelope for client and peer requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub protocol_version: i32,
    /// Request ID echoed from the request.
    pub request_id: String,
    /// Whether the operation succeeded.
    pub ok: bool,
    /// Artifact bytes (retrieve only).
    #[serde(default, skip_serializing_if = "Option::is_none", with = "payload_b64")]
    pub payload: Option<Vec<u8>>,
    /// Error details (present when ok=false).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CacheError>,
}

impl RpcResponse {
    /// Create a success response without a payload.
    pub fn success(request_id: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            request_id: request_id.into(),
            ok: true,
            payload: None,
            error: None,
        }
    }

    /// Create a success response carrying artifact bytes.
    pub fn with_payload(request_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            payload: Some(payload),
            ..Self::success(request_id)
        }
    }

    /// Create an error response.
    pub fn error(request_id: impl Into<String>, error: CacheError) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            request_id: request_id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }

    /// Build a response from an operation result.
    pub fn from_result(request_id: impl Into<String>, result: CacheResult<Option<Vec<u8>>>) -> Self {
        match result {
            Ok(Some(payload)) => Self::with_payload(request_id, payload),
            Ok(None) => Self::success(request_id),
            Err(e) => Self::error(request_id, e),
        }
    }

    /// Convert back into an operation result.
    pub fn into_result(self) -> CacheResult<Option<Vec<u8>>> {
        if self.ok {
            Ok(self.payload)
        } else {
            Err(self
                .error
                .unwrap_or_else(|| CacheError::invalid_request("error response without error body")))
        }
    }
}
