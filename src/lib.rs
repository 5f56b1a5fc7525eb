//! # coordkv
//!
//! Coordination primitives over an etcd-compatible store:
//! - Timeout-bounded key-value operations
//! - Lease-scoped keys that vanish when their owner stops renewing
//! - Optimistic-concurrency puts (compare-and-swap on mod revision)
//! - Distributed locks built from lease-bound conditional key creation
//! - Watch streams for keys and prefixes
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Coordinator (one per process)            │
//! │  kv · cas put · lease · lock · watch     │
//! └───────────────┬──────────────────────────┘
//!                 │ StoreHandle + RequestScope (deadline)
//!        ┌────────┴─────────┐
//!        │ CoordStore trait │
//!        └───┬──────────┬───┘
//!   ┌────────▼───┐  ┌───▼──────────┐
//!   │ EtcdStore  │  │ MemStore     │
//!   │ (gRPC)     │  │ (in-process) │
//!   └────────────┘  └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use coordkv::{Coordinator, StoreConfig};
//!
//! # async fn run() -> coordkv::Result<()> {
//! let coord = Coordinator::new();
//! coord
//!     .initialize(&StoreConfig::new(vec!["127.0.0.1:2379".into()], 5, 3))
//!     .await?;
//!
//! let lease = coord.grant(10).await?;
//! if coord.acquire_lock("job-42", lease.id).await? {
//!     // ... critical section ...
//!     coord.release_lock("job-42").await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod common;
pub mod store;

// Re-export commonly used types
pub use client::{Coordinator, RequestScope, StoreHandle};
pub use common::{is_valid_as_key_path, lock_key, Config, Error, Result, StoreConfig};
pub use store::{
    CoordStore, DeleteOptions, EtcdStore, GetOptions, KeyValue, Lease, LeaseId, MemStore,
    PutOptions, Revision, WatchEvent, WatchOptions, WatchStream,
};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
