//! Artifact storage for the RPC cache.
//!
//! - [`ArtifactStore`]: durable key/value storage with atomic writes and an
//!   incrementally maintained aggregate size
//! - [`KeyedLocks`]: per-key mutual exclusion for writers and the evictor
//! - [`Evictor`]: periodic age- and size-based retention
//!
//! ## Layout
//!
//! Each artifact lives at `<root>/ab/cd/<digest>`, named by the hex SHA-256
//! of its key, with the key recorded ahead of the payload (see [`layout`]).
//! In-progress writes go to `<root>/.tmp/` and are renamed into place, so a
//! reader sees either the previous payload or the new one, never a prefix.

pub mod clock;
pub mod error;
pub mod evictor;
pub mod layout;
pub mod lock;
mod scan;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StoreError, StoreResult};
pub use evictor::{EvictionPolicy, EvictionReport, Evictor};
pub use lock::{KeyGuard, KeyedLocks, LockError, LockResult};
pub use store::{ArtifactMeta, ArtifactStore, EvictOutcome, StoreConfig, StoreStats};
