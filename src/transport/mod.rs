//! JSON-lines TCP transport
//!
//! Two listeners per node:
//! - Client port: `RpcRequest` in, `RpcResponse` out, one per line
//! - Cluster port: [`ClusterMessage`] in, [`ClusterReply`] out, carrying
//!   gossip and peer forwarding on the same socket
//!
//! The client port speaks TLS when the server has a key pair; the client
//! certificate presented in the handshake is the connection's identity.
//! Plaintext connections present none and are served only in open mode.

pub mod client;
pub mod codec;
pub mod server;

use std::io;

use rpc_cache_cluster::{GossipRequest, GossipResponse};
use rpc_cache_protocol::{PeerRequest, RpcResponse};
use serde::{Deserialize, Serialize};

pub use client::{CacheClient, TcpGossipTransport, TcpPeerClient};
pub use codec::{read_frame, write_frame, MAX_FRAME_BYTES};
pub use server::{
    serve_client_connection, serve_clients, serve_cluster, verify_peer_address, ClientService, ClusterService,
    HANDSHAKE_TIMEOUT,
};

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
}

/// Request on the cluster port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum ClusterMessage {
    Gossip { request: GossipRequest },
    Peer { request: PeerRequest },
}

/// Reply on the cluster port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum ClusterReply {
    Gossip { response: GossipResponse },
    Peer { response: RpcResponse },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc_cache_cluster::{ClusterNode, MemberRecord};
    use rpc_cache_protocol::ops::Operation;
    use rpc_cache_protocol::{ArtifactKey, PeerMode};

    #[test]
    fn test_cluster_message_wire_format() {
        let record = MemberRecord::new(ClusterNode::new("a", "a:7946", "a:7946"), 3);
        let msg = ClusterMessage::Gossip {
            request: GossipRequest::Join { record },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["channel"], "gossip");
        assert_eq!(json["request"]["type"], "join");

        let peer = ClusterMessage::Peer {
            request: PeerRequest {
                request_id: "p1".to_string(),
                op: Operation::Store,
                key: ArtifactKey::parse("pkg/a/1").unwrap(),
                payload: Some(b"xyz".to_vec()),
                mode: PeerMode::Replicate,
                budget_ms: 500,
                origin: "a".to_string(),
            },
        };
        let line = serde_json::to_string(&peer).unwrap();
        let back: ClusterMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(back, peer);
    }
}
