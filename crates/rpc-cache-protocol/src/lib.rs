//! RPC Cache Protocol Types
//!
//! Transport-neutral types shared by the cache server, its clients and its
//! cluster peers: artifact keys, capabilities, the error taxonomy and the
//! request/response envelopes.

pub mod capability;
pub mod deadline;
pub mod error;
pub mod key;
pub mod ops;
pub mod request;
pub mod response;

pub use capability::Capability;
pub use deadline::Deadline;
pub use error::{CacheError, CacheResult, ErrorCode};
pub use key::{ArtifactKey, KeyError};
pub use request::{PeerMode, PeerRequest, RpcRequest};
pub use response::RpcResponse;

/// Protocol version carried in every envelope.
pub const PROTOCOL_VERSION: i32 = 1;
