//! Named per-key critical sections.
//!
//! [`Scheduler::wait`] parks the caller until every earlier holder of the
//! same key has released it; waiters are served in arrival order. Slots are
//! created on first use and removed once the last waiter leaves, so the
//! table only ever holds keys that are contended right now.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Slot {
    lock: Arc<AsyncMutex<()>>,
    users: usize,
}

pub struct Scheduler {
    name: String,
    slots: Mutex<HashMap<String, Slot>>,
}

impl Scheduler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Block until `key` is free and take it.
    pub async fn wait(&self, key: &str) -> SchedulerGuard<'_> {
        let lock = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
                lock: Arc::new(AsyncMutex::new(())),
                users: 0,
            });
            slot.users += 1;
            Arc::clone(&slot.lock)
        };
        // Registered before awaiting so a dropped waiter still releases its slot.
        let mut guard = SchedulerGuard {
            scheduler: self,
            key: key.to_string(),
            held: None,
        };
        guard.held = Some(lock.lock_owned().await);
        tracing::trace!(scheduler = %self.name, key, "acquired");
        guard
    }

    /// Number of keys currently held or waited on.
    pub fn active_keys(&self) -> usize {
        self.slots.lock().len()
    }

    fn release(&self, key: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            slot.users -= 1;
            if slot.users == 0 {
                slots.remove(key);
            }
        }
    }
}

/// Holds a key of a [`Scheduler`] until dropped.
pub struct SchedulerGuard<'a> {
    scheduler: &'a Scheduler,
    key: String,
    held: Option<OwnedMutexGuard<()>>,
}

impl SchedulerGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for SchedulerGuard<'_> {
    fn drop(&mut self) {
        self.held.take();
        self.scheduler.release(&self.key);
        tracing::trace!(scheduler = %self.scheduler.name, key = %self.key, "released");
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let sch = Arc::new(Scheduler::new("test"));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let sch = Arc::clone(&sch);
            let inside = Arc::clone(&inside);
            let max_seen = Arc::clone(&max_seen);
            tasks.push(tokio::spawn(async move {
                let _g = sch.wait("/A/a").await;
                let n = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(n, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(sch.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let sch = Scheduler::new("test");
        let a = sch.wait("/A/a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), sch.wait("/A/b"))
            .await
            .expect("distinct key must not block");
        assert_eq!(a.key(), "/A/a");
        assert_eq!(b.key(), "/A/b");
        assert_eq!(sch.active_keys(), 2);
        drop(a);
        drop(b);
        assert_eq!(sch.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_slot() {
        let sch = Scheduler::new("test");
        let held = sch.wait("k").await;
        let timed_out = tokio::time::timeout(Duration::from_millis(10), sch.wait("k")).await;
        assert!(timed_out.is_err());
        drop(held);
        assert_eq!(sch.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_waiters_served_in_arrival_order() {
        let sch = Arc::new(Scheduler::new("test"));
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = sch.wait("k").await;

        let mut tasks = Vec::new();
        for i in 0..4 {
            let sch = Arc::clone(&sch);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _g = sch.wait("k").await;
                order.lock().push(i);
            }));
            // let each waiter enqueue before the next one starts
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(first);
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }
}
