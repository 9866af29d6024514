//! Subscription-driven node cache.
//!
//! [`CacheManager`] owns the node table and the [`SubscriptionTree`] and
//! dispatches callbacks. Store reconciliation (fetch, sync, link
//! mark-and-sweep, notification handling) lives in `data_cache` as methods
//! on [`DataModel`](crate::DataModel), since it needs the graph store.

mod data_cache;
mod manager;
mod subtree;

pub use subtree::SubscriptionTree;

pub(crate) use data_cache::CacheHandler;
pub(crate) use manager::CacheManager;

use crate::scheduler::Scheduler;

pub(crate) struct DataModelCache {
    pub(crate) manager: CacheManager,
    /// Serializes fetch, sync and notification handling per node id.
    pub(crate) scheduler: Scheduler,
}

impl DataModelCache {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            manager: CacheManager::new(name),
            scheduler: Scheduler::new(format!("{name}-cache")),
        }
    }
}
