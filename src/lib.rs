//! RPC Cache Server
//!
//! A clustered remote artifact cache for build clients. This crate composes
//! the store and cluster crates into a server:
//! - `config`: layered, validated server configuration
//! - `auth`: TLS identity to capability mapping
//! - `router`: store / retrieve / delete across ring owners, with repair
//! - `transport`: JSON-lines TCP listeners and clients
//! - `server`: startup, status and graceful shutdown
//! - `signal`: SIGINT/SIGTERM handling

pub mod auth;
pub mod config;
pub mod router;
pub mod server;
pub mod signal;
pub mod transport;

pub use auth::{AuthGate, ClientIdentity, TrustSet};
pub use config::{ConfigError, LoadedConfig, ServerConfig};
pub use router::{InProcessPeers, PeerClient, RepairQueue, RequestRouter, RouterConfig};
pub use server::{CacheServer, ServerError, ServerStatus};
pub use signal::{SignalAction, SignalHandler, SignalState};
pub use transport::{CacheClient, TransportError};
