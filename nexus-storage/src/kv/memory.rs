//! In-memory [`KvStore`] with etcd-style revisions.
//!
//! Keys live in a `BTreeMap` behind a mutex; watchers share one broadcast
//! channel and filter by prefix. Events are published while the state lock
//! is held so subscribers see mutations in revision order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use nexus_core::{NexusResult, StoreError};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::{
    Compare, GetResponse, KeyValue, KvStore, TxnOp, TxnResponse, WatchEvent, WatchKind,
    WatchStream,
};

const WATCH_CHANNEL_CAPACITY: usize = 65_536;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    create_revision: i64,
    mod_revision: i64,
    version: i64,
}

#[derive(Debug)]
struct State {
    revision: i64,
    compacted: i64,
    data: BTreeMap<String, Entry>,
}

impl State {
    fn kv(&self, key: &str, e: &Entry) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: e.value.clone(),
            create_revision: e.create_revision,
            mod_revision: e.mod_revision,
            version: e.version,
        }
    }

    fn holds(&self, cmp: &Compare) -> bool {
        match cmp {
            Compare::CreateRevision { key, revision } => {
                self.data.get(key).map_or(0, |e| e.create_revision) == *revision
            }
            Compare::ModRevision { key, revision } => {
                self.data.get(key).map_or(0, |e| e.mod_revision) == *revision
            }
        }
    }
}

/// Process-local store, the default backend for tests and single-node use.
pub struct InMemoryKvStore {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
    injected_faults: AtomicU32,
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(State {
                revision: 1,
                compacted: 0,
                data: BTreeMap::new(),
            }),
            events,
            injected_faults: AtomicU32::new(0),
        }
    }

    /// Make the next `n` calls fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, n: u32) {
        self.injected_faults.store(n, Ordering::SeqCst);
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All keys in order, for diagnostics and tests.
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().data.keys().cloned().collect()
    }

    fn check_fault(&self) -> NexusResult<()> {
        let taken = self
            .injected_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(StoreError::Unavailable {
                reason: "injected fault".to_string(),
            }
            .into()),
            Err(_) => Ok(()),
        }
    }

    fn publish(&self, ev: WatchEvent) {
        // no receivers is fine
        let _ = self.events.send(ev);
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> NexusResult<GetResponse> {
        self.check_fault()?;
        let state = self.state.lock();
        let kvs = state
            .data
            .get(key)
            .map(|e| vec![state.kv(key, e)])
            .unwrap_or_default();
        Ok(GetResponse {
            header_revision: state.revision,
            kvs,
        })
    }

    async fn get_prefix(&self, prefix: &str) -> NexusResult<GetResponse> {
        self.check_fault()?;
        let state = self.state.lock();
        let kvs = state
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| state.kv(k, e))
            .collect();
        Ok(GetResponse {
            header_revision: state.revision,
            kvs,
        })
    }

    async fn range(&self, start: &str, end: &str, limit: usize) -> NexusResult<GetResponse> {
        self.check_fault()?;
        let state = self.state.lock();
        if start >= end {
            return Ok(GetResponse {
                header_revision: state.revision,
                kvs: Vec::new(),
            });
        }
        let limit = if limit == 0 { usize::MAX } else { limit };
        let kvs = state
            .data
            .range(start.to_string()..end.to_string())
            .take(limit)
            .map(|(k, e)| state.kv(k, e))
            .collect();
        Ok(GetResponse {
            header_revision: state.revision,
            kvs,
        })
    }

    async fn txn(
        &self,
        compares: Vec<Compare>,
        success: Vec<TxnOp>,
        failure: Vec<TxnOp>,
    ) -> NexusResult<TxnResponse> {
        self.check_fault()?;
        let mut state = self.state.lock();
        let succeeded = compares.iter().all(|c| state.holds(c));
        let ops = if succeeded { success } else { failure };

        let next = state.revision + 1;
        let mut events = Vec::new();
        let mut deleted = 0;
        for op in ops {
            match op {
                TxnOp::Put { key, value } => {
                    let entry = match state.data.get(&key) {
                        Some(e) => Entry {
                            value: value.clone(),
                            create_revision: e.create_revision,
                            mod_revision: next,
                            version: e.version + 1,
                        },
                        None => Entry {
                            value: value.clone(),
                            create_revision: next,
                            mod_revision: next,
                            version: 1,
                        },
                    };
                    state.data.insert(key.clone(), entry);
                    events.push(WatchEvent {
                        key,
                        value,
                        kind: WatchKind::Put,
                        mod_revision: next,
                    });
                }
                TxnOp::Delete { key } => {
                    if state.data.remove(&key).is_some() {
                        deleted += 1;
                        events.push(WatchEvent {
                            key,
                            value: Vec::new(),
                            kind: WatchKind::Delete,
                            mod_revision: next,
                        });
                    }
                }
                TxnOp::DeletePrefix { prefix } => {
                    let doomed: Vec<String> = state
                        .data
                        .range(prefix.clone()..)
                        .take_while(|(k, _)| k.starts_with(&prefix))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in doomed {
                        state.data.remove(&key);
                        deleted += 1;
                        events.push(WatchEvent {
                            key,
                            value: Vec::new(),
                            kind: WatchKind::Delete,
                            mod_revision: next,
                        });
                    }
                }
            }
        }
        if !events.is_empty() {
            state.revision = next;
        }
        for ev in events {
            self.publish(ev);
        }
        Ok(TxnResponse {
            succeeded,
            header_revision: state.revision,
            deleted,
        })
    }

    async fn watch(&self, prefix: &str) -> NexusResult<WatchStream> {
        let prefix = prefix.to_string();
        let rx = self.events.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(move |item| {
            let out = match item {
                Ok(ev) if ev.key.starts_with(&prefix) => Some(ev),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, prefix = %prefix, "watch receiver lagged");
                    None
                }
            };
            futures_util::future::ready(out)
        });
        Ok(stream.boxed())
    }

    async fn current_revision(&self) -> NexusResult<i64> {
        self.check_fault()?;
        Ok(self.state.lock().revision)
    }

    async fn compact(&self, revision: i64, _physical: bool) -> NexusResult<i64> {
        self.check_fault()?;
        let mut state = self.state.lock();
        if revision <= state.compacted {
            return Err(StoreError::Compacted { revision }.into());
        }
        state.compacted = revision.min(state.revision);
        Ok(state.compacted)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_put_tracks_revisions() {
        let store = InMemoryKvStore::new();
        let r1 = store
            .txn(vec![], vec![TxnOp::put("/a", b"1".to_vec())], vec![])
            .await
            .expect("txn should succeed");
        let r2 = store
            .txn(vec![], vec![TxnOp::put("/a", b"2".to_vec())], vec![])
            .await
            .expect("txn should succeed");
        assert!(r2.header_revision > r1.header_revision);

        let got = store.get("/a").await.expect("get should succeed");
        let kv = got.first().expect("key should exist");
        assert_eq!(kv.value, b"2");
        assert_eq!(kv.create_revision, r1.header_revision);
        assert_eq!(kv.mod_revision, r2.header_revision);
        assert_eq!(kv.version, 2);
    }

    #[tokio::test]
    async fn test_txn_branches_on_create_revision() {
        let store = InMemoryKvStore::new();
        let first = store
            .txn(
                vec![Compare::CreateRevision {
                    key: "/a/_created".into(),
                    revision: 0,
                }],
                vec![
                    TxnOp::put("/a/_created", b"c".to_vec()),
                    TxnOp::put("/a", b"v1".to_vec()),
                ],
                vec![TxnOp::put("/a", b"v1".to_vec())],
            )
            .await
            .expect("txn should succeed");
        assert!(first.succeeded);

        let second = store
            .txn(
                vec![Compare::CreateRevision {
                    key: "/a/_created".into(),
                    revision: 0,
                }],
                vec![TxnOp::put("/a/_created", b"c2".to_vec())],
                vec![TxnOp::put("/a", b"v2".to_vec())],
            )
            .await
            .expect("txn should succeed");
        assert!(!second.succeeded);
        let created = store.get("/a/_created").await.expect("get");
        assert_eq!(created.first().map(|kv| kv.value.clone()), Some(b"c".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_prefix_and_range() {
        let store = InMemoryKvStore::new();
        let puts = ["/n/a", "/n/a/x", "/n/a/y", "/n/ab", "/n/b"]
            .iter()
            .map(|k| TxnOp::put(*k, vec![]))
            .collect();
        store.txn(vec![], puts, vec![]).await.expect("txn");

        let ranged = store
            .range("/n/a", "/n/b", 2)
            .await
            .expect("range should succeed");
        let keys: Vec<_> = ranged.kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/n/a", "/n/a/x"]);

        let resp = store
            .txn(vec![], vec![TxnOp::delete_prefix("/n/a/")], vec![])
            .await
            .expect("txn");
        assert_eq!(resp.deleted, 2);
        assert_eq!(store.keys(), vec!["/n/a", "/n/ab", "/n/b"]);
    }

    #[tokio::test]
    async fn test_noop_txn_keeps_revision() {
        let store = InMemoryKvStore::new();
        let before = store.current_revision().await.expect("rev");
        let resp = store
            .txn(vec![], vec![TxnOp::delete("/missing")], vec![])
            .await
            .expect("txn");
        assert_eq!(resp.header_revision, before);
        assert_eq!(resp.deleted, 0);
    }

    #[tokio::test]
    async fn test_watch_filters_by_prefix() {
        let store = InMemoryKvStore::new();
        let mut stream = store.watch("/w/").await.expect("watch should succeed");
        store
            .txn(
                vec![],
                vec![
                    TxnOp::put("/other", b"x".to_vec()),
                    TxnOp::put("/w/a", b"y".to_vec()),
                ],
                vec![],
            )
            .await
            .expect("txn");
        store
            .txn(vec![], vec![TxnOp::delete("/w/a")], vec![])
            .await
            .expect("txn");

        let put = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("event should arrive")
            .expect("stream open");
        assert_eq!(put.key, "/w/a");
        assert_eq!(put.kind, WatchKind::Put);
        let del = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("event should arrive")
            .expect("stream open");
        assert_eq!(del.kind, WatchKind::Delete);
        assert!(del.mod_revision > put.mod_revision);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = InMemoryKvStore::new();
        store.fail_next(2);
        assert!(store.get("/a").await.is_err());
        assert!(store.get("/a").await.is_err());
        assert!(store.get("/a").await.is_ok());
    }

    #[tokio::test]
    async fn test_compact_rejects_old_revision() {
        let store = InMemoryKvStore::new();
        store
            .txn(vec![], vec![TxnOp::put("/a", vec![])], vec![])
            .await
            .expect("txn");
        let rev = store.current_revision().await.expect("rev");
        assert_eq!(store.compact(rev, false).await.expect("compact"), rev);
        assert!(store.compact(rev, false).await.is_err());
    }
}
