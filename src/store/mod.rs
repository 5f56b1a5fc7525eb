//! Coordination store protocol
//!
//! [`CoordStore`] is the seam between the coordination primitives and the
//! replicated store they run against. Two backends are provided:
//! - [`EtcdStore`]: an etcd v3 cluster over gRPC
//! - [`MemStore`]: an in-process store with the same revision, lease and
//!   watch semantics, for tests and single-process use

pub mod etcd;
pub mod memory;

pub use etcd::EtcdStore;
pub use memory::MemStore;

use crate::common::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Store-maintained modification counter.
pub type Revision = i64;

/// Opaque lease identifier assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseId(pub i64);

impl LeaseId {
    /// The "no lease" id used by keys not bound to any lease.
    pub const NONE: LeaseId = LeaseId(0);
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A granted lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    /// Number of modifications since creation.
    pub version: i64,
    pub lease: LeaseId,
}

impl KeyValue {
    /// Value as UTF-8, lossily.
    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    pub lease: Option<LeaseId>,
    pub prev_kv: bool,
}

impl PutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lease(mut self, lease: LeaseId) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetOptions {
    pub prefix: bool,
    /// Zero or `None` means unlimited.
    pub limit: Option<i64>,
    /// Read at this historical revision instead of the latest.
    pub revision: Option<Revision>,
    pub keys_only: bool,
    pub count_only: bool,
}

impl GetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_revision(mut self, revision: Revision) -> Self {
        self.revision = Some(revision);
        self
    }

    pub fn with_keys_only(mut self) -> Self {
        self.keys_only = true;
        self
    }

    pub fn with_count_only(mut self) -> Self {
        self.count_only = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub prefix: bool,
    pub prev_kv: bool,
}

impl DeleteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchOptions {
    pub prefix: bool,
    /// Replay history from this revision; `None` starts from now.
    pub start_revision: Option<Revision>,
    pub prev_kv: bool,
}

impl WatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    pub fn with_start_revision(mut self, revision: Revision) -> Self {
        self.start_revision = Some(revision);
        self
    }

    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }
}

/// Result of a put. `revision` is the store revision after the write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutResult {
    pub revision: Revision,
    pub prev_kv: Option<KeyValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResult {
    pub revision: Revision,
    pub kvs: Vec<KeyValue>,
    /// Total number of matching keys, ignoring `limit`.
    pub count: i64,
    pub more: bool,
}

impl GetResult {
    pub fn first(&self) -> Option<&KeyValue> {
        self.kvs.first()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub revision: Revision,
    pub deleted: i64,
    pub prev_kvs: Vec<KeyValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRevoked {
    pub revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    Less,
}

impl CompareOp {
    pub(crate) fn holds<T: Ord + ?Sized>(self, actual: &T, expected: &T) -> bool {
        match self {
            CompareOp::Equal => actual == expected,
            CompareOp::NotEqual => actual != expected,
            CompareOp::Greater => actual > expected,
            CompareOp::Less => actual < expected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareTarget {
    Version(i64),
    CreateRevision(Revision),
    ModRevision(Revision),
    Value(Vec<u8>),
    Lease(LeaseId),
}

/// One transaction guard. A missing key compares as zero revisions,
/// version zero, no lease and an empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: String,
    pub op: CompareOp,
    pub target: CompareTarget,
}

impl Compare {
    pub fn mod_revision(key: impl Into<String>, op: CompareOp, revision: Revision) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::ModRevision(revision),
        }
    }

    pub fn create_revision(key: impl Into<String>, op: CompareOp, revision: Revision) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::CreateRevision(revision),
        }
    }

    pub fn version(key: impl Into<String>, op: CompareOp, version: i64) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::Version(version),
        }
    }

    pub fn value(key: impl Into<String>, op: CompareOp, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::Value(value.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put {
        key: String,
        value: Vec<u8>,
        options: PutOptions,
    },
    Get {
        key: String,
        options: GetOptions,
    },
    Delete {
        key: String,
        options: DeleteOptions,
    },
}

impl TxnOp {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>, options: PutOptions) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            options,
        }
    }

    pub fn get(key: impl Into<String>, options: GetOptions) -> Self {
        TxnOp::Get {
            key: key.into(),
            options,
        }
    }

    pub fn delete(key: impl Into<String>, options: DeleteOptions) -> Self {
        TxnOp::Delete {
            key: key.into(),
            options,
        }
    }
}

/// `if all(compare) then success else failure`, applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    pub compare: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: Vec<Compare>) -> Self {
        self.compare = compare;
        self
    }

    pub fn and_then(mut self, ops: Vec<TxnOp>) -> Self {
        self.success = ops;
        self
    }

    pub fn or_else(mut self, ops: Vec<TxnOp>) -> Self {
        self.failure = ops;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOpResult {
    Put(PutResult),
    Get(GetResult),
    Delete(DeleteResult),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnResult {
    pub succeeded: bool,
    pub revision: Revision,
    /// One entry per op of the branch that ran.
    pub responses: Vec<TxnOpResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Put,
    Delete,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Put => write!(f, "PUT"),
            EventKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// A single change. For deletes, `kv` holds the key and the deletion
/// revision in `mod_revision`, with an empty value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

/// Live change feed. Dropping it cancels the underlying watch.
pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// Transactional KV protocol spoken by the coordination store.
///
/// Implementations must be safe to share across tasks; every method is one
/// request against the store and applies no timeout of its own.
#[async_trait]
pub trait CoordStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>, options: PutOptions) -> Result<PutResult>;

    async fn get(&self, key: &str, options: GetOptions) -> Result<GetResult>;

    async fn delete(&self, key: &str, options: DeleteOptions) -> Result<DeleteResult>;

    async fn txn(&self, txn: Txn) -> Result<TxnResult>;

    /// Grant a lease of `ttl` seconds.
    async fn lease_grant(&self, ttl: i64) -> Result<Lease>;

    /// End a lease, deleting every key attached to it.
    async fn lease_revoke(&self, id: LeaseId) -> Result<LeaseRevoked>;

    async fn watch(&self, key: &str, options: WatchOptions) -> Result<WatchStream>;
}
