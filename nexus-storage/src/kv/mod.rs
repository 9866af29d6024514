//! Backing key-value store contract.
//!
//! The graph layer needs a linearizable store with a single global revision
//! counter, compare-and-swap transactions on per-key revisions, ordered range
//! reads and a prefix-scoped watch stream. etcd is the reference shape; the
//! in-memory and LMDB backends in this module reproduce the same revision
//! semantics for a single process.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use nexus_core::NexusResult;
use serde::{Deserialize, Serialize};

pub mod lmdb;
pub mod memory;

pub use lmdb::{LmdbError, LmdbKvStore};
pub use memory::InMemoryKvStore;

/// A stored key with its revision metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision of the transaction that created the key.
    pub create_revision: i64,
    /// Revision of the last transaction that wrote the key.
    pub mod_revision: i64,
    /// Number of writes since creation.
    pub version: i64,
}

/// Result of a read, stamped with the store revision it observed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetResponse {
    pub header_revision: i64,
    pub kvs: Vec<KeyValue>,
}

impl GetResponse {
    pub fn first(&self) -> Option<&KeyValue> {
        self.kvs.first()
    }
}

/// Guard evaluated atomically at the start of a transaction.
///
/// A missing key has create and mod revision 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    CreateRevision { key: String, revision: i64 },
    ModRevision { key: String, revision: i64 },
}

/// Mutation applied by a transaction branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
    DeletePrefix { prefix: String },
}

impl TxnOp {
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete { key: key.into() }
    }

    pub fn delete_prefix(prefix: impl Into<String>) -> Self {
        TxnOp::DeletePrefix {
            prefix: prefix.into(),
        }
    }
}

/// Outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnResponse {
    /// Whether all compares held and the success branch ran.
    pub succeeded: bool,
    /// Store revision after the transaction.
    pub header_revision: i64,
    /// Number of keys removed by delete ops.
    pub deleted: i64,
}

/// Kind of a watched mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchKind {
    Put,
    Delete,
}

/// One mutation delivered by [`KvStore::watch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    /// New value for puts, empty for deletes.
    pub value: Vec<u8>,
    pub kind: WatchKind,
    pub mod_revision: i64,
}

/// Ordered stream of mutations under a watched prefix.
pub type WatchStream = BoxStream<'static, WatchEvent>;

/// Backing store used by the graph layer.
///
/// All mutating calls are atomic and advance the global revision by one
/// when they change anything. Implementations must be safe to share across
/// tasks.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a single key.
    async fn get(&self, key: &str) -> NexusResult<GetResponse>;

    /// Read every key starting with `prefix`, in key order.
    async fn get_prefix(&self, prefix: &str) -> NexusResult<GetResponse>;

    /// Read keys in `[start, end)` in key order, at most `limit` of them
    /// (0 means unlimited).
    async fn range(&self, start: &str, end: &str, limit: usize) -> NexusResult<GetResponse>;

    /// Run `success` if every compare holds, `failure` otherwise.
    async fn txn(
        &self,
        compares: Vec<Compare>,
        success: Vec<TxnOp>,
        failure: Vec<TxnOp>,
    ) -> NexusResult<TxnResponse>;

    /// Subscribe to mutations of keys starting with `prefix`.
    ///
    /// Events are delivered in revision order. Only mutations committed after
    /// the call are observed.
    async fn watch(&self, prefix: &str) -> NexusResult<WatchStream>;

    /// Current store revision.
    async fn current_revision(&self) -> NexusResult<i64>;

    /// Discard history at or below `revision`.
    async fn compact(&self, revision: i64, physical: bool) -> NexusResult<i64>;
}

/// Exclusive upper bound for keys starting with `prefix`.
pub fn prefix_range_end(prefix: &str) -> String {
    format!("{prefix}\u{ff}")
}
