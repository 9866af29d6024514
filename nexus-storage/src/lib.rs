//! NEXUS storage layer.
//!
//! [`kv`] defines the revisioned key-value contract and its backends;
//! [`graph`] maps nodes and links onto it.

pub mod graph;
pub mod keys;
pub mod kv;
pub mod retry;

pub use graph::{GraphStore, GraphStoreStats};
pub use keys::{created_key, link_key, links_prefix, parent_link_key, rlink_key, rlinks_prefix};
pub use kv::{
    prefix_range_end, Compare, GetResponse, InMemoryKvStore, KeyValue, KvStore, LmdbError,
    LmdbKvStore, TxnOp, TxnResponse, WatchEvent, WatchKind, WatchStream,
};
pub use retry::{is_transient, with_retry};
