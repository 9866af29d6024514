//! Graph store counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of [`GraphStoreCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStoreStats {
    pub db_read: u64,
    pub db_write: u64,
    pub node_read: u64,
    pub node_update: u64,
    pub link_read: u64,
    pub link_add: u64,
    pub link_delete: u64,
    pub link_update: u64,
    pub rlink_add: u64,
    pub rlink_delete: u64,
}

#[derive(Debug, Default)]
pub(crate) struct GraphStoreCounters {
    pub db_read: AtomicU64,
    pub db_write: AtomicU64,
    pub node_read: AtomicU64,
    pub node_update: AtomicU64,
    pub link_read: AtomicU64,
    pub link_add: AtomicU64,
    pub link_delete: AtomicU64,
    pub link_update: AtomicU64,
    pub rlink_add: AtomicU64,
    pub rlink_delete: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl GraphStoreCounters {
    pub fn snapshot(&self) -> GraphStoreStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        GraphStoreStats {
            db_read: get(&self.db_read),
            db_write: get(&self.db_write),
            node_read: get(&self.node_read),
            node_update: get(&self.node_update),
            link_read: get(&self.link_read),
            link_add: get(&self.link_add),
            link_delete: get(&self.link_delete),
            link_update: get(&self.link_update),
            rlink_add: get(&self.rlink_add),
            rlink_delete: get(&self.rlink_delete),
        }
    }
}
