//! Request envelopes.

use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::key::ArtifactKey;
use crate::ops::Operation;
use crate::PROTOCOL_VERSION;

/// Client request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Protocol version.
    pub protocol_version: i32,
    /// Operation name.
    pub op: String,
    /// Caller-chosen request ID for correlation.
    pub request_id: String,
    /// Artifact key the operation applies to.
    pub key: ArtifactKey,
    /// Artifact bytes (store only), base64 on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "payload_b64")]
    pub payload: Option<Vec<u8>>,
    /// Caller deadline budget in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl RpcRequest {
    pub fn new(op: Operation, request_id: impl Into<String>, key: ArtifactKey) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            op: op.as_str().to_string(),
            request_id: request_id.into(),
            key,
            payload: None,
            timeout_ms: None,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Resolve the operation, rejecting unknown names and bad versions.
    pub fn operation(&self) -> Result<Operation, CacheError> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(CacheError::invalid_request(format!(
                "unsupported protocol_version {}",
                self.protocol_version
            )));
        }
        Operation::from_name(&self.op)
            .ok_or_else(|| CacheError::invalid_request(format!("unknown operation: {}", self.op)))
    }
}

/// How a receiving peer should treat a cluster-internal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerMode {
    /// The sender is not an owner; the receiver acts as primary and fans out.
    Forward,
    /// Apply to the local store only; never fan out further.
    Replicate,
}

/// Request sent between cluster nodes.
///
/// Peers are trusted on the cluster port, so no capability is carried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRequest {
    pub request_id: String,
    pub op: Operation,
    pub key: ArtifactKey,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "payload_b64")]
    pub payload: Option<Vec<u8>>,
    pub mode: PeerMode,
    /// Remaining deadline budget of the originating request.
    pub budget_ms: u64,
    /// Name of the node that sent the request.
    pub origin: String,
}

/// Serde adapter encoding optional byte payloads as base64 strings.
pub mod payload_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}
