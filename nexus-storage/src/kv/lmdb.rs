//! LMDB-backed [`KvStore`].
//!
//! Uses the heed crate to persist keys together with their revision
//! metadata, so a process restarted on the same directory resumes at the
//! same store revision. Watch delivery is process-local.
//!
//! # Record layout
//!
//! Each value in the `data` database is
//! `[create_revision: i64 LE][mod_revision: i64 LE][version: i64 LE][value]`.
//! The `meta` database holds the global `revision` and `compacted` counters.

use std::ops::Bound;
use std::path::Path;

use async_trait::async_trait;
use futures_util::StreamExt;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use nexus_core::{NexusError, NexusResult, StoreError};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::{
    prefix_range_end, Compare, GetResponse, KeyValue, KvStore, TxnOp, TxnResponse, WatchEvent,
    WatchKind, WatchStream,
};

const HEADER_LEN: usize = 24;
const META_REVISION: &str = "revision";
const META_COMPACTED: &str = "compacted";

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// A stored record is shorter than its header.
    #[error("Corrupt record at {0}")]
    Corrupt(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbError> for NexusError {
    fn from(e: LmdbError) -> Self {
        match e {
            LmdbError::Corrupt(key) => StoreError::Codec {
                key,
                reason: "record shorter than header".to_string(),
            }
            .into(),
            other => StoreError::TransactionFailed {
                reason: other.to_string(),
            }
            .into(),
        }
    }
}

fn txn_err(e: heed::Error) -> LmdbError {
    LmdbError::Transaction(e.to_string())
}

fn encode_record(create_revision: i64, mod_revision: i64, version: i64, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + value.len());
    out.extend_from_slice(&create_revision.to_le_bytes());
    out.extend_from_slice(&mod_revision.to_le_bytes());
    out.extend_from_slice(&version.to_le_bytes());
    out.extend_from_slice(value);
    out
}

fn read_i64(bytes: &[u8], at: usize) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    i64::from_le_bytes(buf)
}

fn decode_record(key: &str, bytes: &[u8]) -> Result<KeyValue, LmdbError> {
    if bytes.len() < HEADER_LEN {
        return Err(LmdbError::Corrupt(key.to_string()));
    }
    Ok(KeyValue {
        key: key.to_string(),
        create_revision: read_i64(bytes, 0),
        mod_revision: read_i64(bytes, 8),
        version: read_i64(bytes, 16),
        value: bytes[HEADER_LEN..].to_vec(),
    })
}

/// Durable single-process store.
///
/// # Example
///
/// ```ignore
/// use nexus_storage::kv::{KvStore, LmdbKvStore, TxnOp};
///
/// let store = LmdbKvStore::open("/var/lib/nexus", 256)?;
/// store.txn(vec![], vec![TxnOp::put("/Config/default", b"{}".to_vec())], vec![]).await?;
/// ```
pub struct LmdbKvStore {
    env: Env,
    data: Database<Str, Bytes>,
    meta: Database<Str, Bytes>,
    write_lock: Mutex<()>,
    events: broadcast::Sender<WatchEvent>,
}

impl LmdbKvStore {
    /// Open (or create) a store rooted at `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment directory is owned by this store; callers
        // must not open the same directory twice within one process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(2)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let data: Database<Str, Bytes> = env
            .create_database(&mut wtxn, Some("data"))
            .map_err(|e| LmdbError::DbOpen(e.to_string()))?;
        let meta: Database<Str, Bytes> = env
            .create_database(&mut wtxn, Some("meta"))
            .map_err(|e| LmdbError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        let (events, _) = broadcast::channel(65_536);
        Ok(Self {
            env,
            data,
            meta,
            write_lock: Mutex::new(()),
            events,
        })
    }

    fn meta_i64(&self, txn: &RoTxn<'_>, key: &str, default: i64) -> Result<i64, LmdbError> {
        match self.meta.get(txn, key).map_err(txn_err)? {
            Some(bytes) if bytes.len() == 8 => Ok(read_i64(bytes, 0)),
            _ => Ok(default),
        }
    }

    fn put_meta(&self, txn: &mut RwTxn<'_>, key: &str, value: i64) -> Result<(), LmdbError> {
        self.meta
            .put(txn, key, &value.to_le_bytes())
            .map_err(txn_err)
    }

    fn read(&self, txn: &RoTxn<'_>, key: &str) -> Result<Option<KeyValue>, LmdbError> {
        match self.data.get(txn, key).map_err(txn_err)? {
            Some(bytes) => decode_record(key, bytes).map(Some),
            None => Ok(None),
        }
    }

    fn scan(
        &self,
        txn: &RoTxn<'_>,
        start: &str,
        end: &str,
        limit: usize,
    ) -> Result<Vec<KeyValue>, LmdbError> {
        if start >= end {
            return Ok(Vec::new());
        }
        let bounds = (Bound::Included(start), Bound::Excluded(end));
        let iter = self.data.range(txn, &bounds).map_err(txn_err)?;
        let limit = if limit == 0 { usize::MAX } else { limit };
        let mut out = Vec::new();
        for item in iter.take(limit) {
            let (key, bytes) = item.map_err(txn_err)?;
            out.push(decode_record(key, bytes)?);
        }
        Ok(out)
    }

    fn holds(&self, txn: &RoTxn<'_>, cmp: &Compare) -> Result<bool, LmdbError> {
        Ok(match cmp {
            Compare::CreateRevision { key, revision } => {
                self.read(txn, key)?.map_or(0, |kv| kv.create_revision) == *revision
            }
            Compare::ModRevision { key, revision } => {
                self.read(txn, key)?.map_or(0, |kv| kv.mod_revision) == *revision
            }
        })
    }

    fn apply(
        &self,
        compares: &[Compare],
        success: Vec<TxnOp>,
        failure: Vec<TxnOp>,
    ) -> Result<(TxnResponse, Vec<WatchEvent>), LmdbError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let mut succeeded = true;
        for cmp in compares {
            if !self.holds(&wtxn, cmp)? {
                succeeded = false;
                break;
            }
        }
        let ops = if succeeded { success } else { failure };
        let current = self.meta_i64(&wtxn, META_REVISION, 1)?;
        let next = current + 1;
        let mut events = Vec::new();
        let mut deleted = 0;

        for op in ops {
            match op {
                TxnOp::Put { key, value } => {
                    let record = match self.read(&wtxn, &key)? {
                        Some(kv) => encode_record(kv.create_revision, next, kv.version + 1, &value),
                        None => encode_record(next, next, 1, &value),
                    };
                    self.data.put(&mut wtxn, &key, &record).map_err(txn_err)?;
                    events.push(WatchEvent {
                        key,
                        value,
                        kind: WatchKind::Put,
                        mod_revision: next,
                    });
                }
                TxnOp::Delete { key } => {
                    if self.data.delete(&mut wtxn, &key).map_err(txn_err)? {
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
                    let end = prefix_range_end(&prefix);
                    let doomed: Vec<String> = self
                        .scan(&wtxn, &prefix, &end, 0)?
                        .into_iter()
                        .map(|kv| kv.key)
                        .collect();
                    for key in doomed {
                        self.data.delete(&mut wtxn, &key).map_err(txn_err)?;
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

        let header_revision = if events.is_empty() {
            current
        } else {
            self.put_meta(&mut wtxn, META_REVISION, next)?;
            next
        };
        wtxn.commit().map_err(txn_err)?;
        Ok((
            TxnResponse {
                succeeded,
                header_revision,
                deleted,
            },
            events,
        ))
    }
}

#[async_trait]
impl KvStore for LmdbKvStore {
    async fn get(&self, key: &str) -> NexusResult<GetResponse> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let header_revision = self.meta_i64(&rtxn, META_REVISION, 1)?;
        let kvs = self.read(&rtxn, key)?.into_iter().collect();
        Ok(GetResponse {
            header_revision,
            kvs,
        })
    }

    async fn get_prefix(&self, prefix: &str) -> NexusResult<GetResponse> {
        self.range(prefix, &prefix_range_end(prefix), 0).await
    }

    async fn range(&self, start: &str, end: &str, limit: usize) -> NexusResult<GetResponse> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let header_revision = self.meta_i64(&rtxn, META_REVISION, 1)?;
        let kvs = self.scan(&rtxn, start, end, limit)?;
        Ok(GetResponse {
            header_revision,
            kvs,
        })
    }

    async fn txn(
        &self,
        compares: Vec<Compare>,
        success: Vec<TxnOp>,
        failure: Vec<TxnOp>,
    ) -> NexusResult<TxnResponse> {
        let _guard = self.write_lock.lock();
        let (resp, events) = self.apply(&compares, success, failure)?;
        for ev in events {
            let _ = self.events.send(ev);
        }
        Ok(resp)
    }

    async fn watch(&self, prefix: &str) -> NexusResult<WatchStream> {
        let prefix = prefix.to_string();
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(move |item| {
            let out = match item {
                Ok(ev) if ev.key.starts_with(&prefix) => Some(ev),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, prefix = %prefix, "lmdb watch receiver lagged");
                    None
                }
            };
            futures_util::future::ready(out)
        });
        Ok(stream.boxed())
    }

    async fn current_revision(&self) -> NexusResult<i64> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        Ok(self.meta_i64(&rtxn, META_REVISION, 1)?)
    }

    async fn compact(&self, revision: i64, _physical: bool) -> NexusResult<i64> {
        let _guard = self.write_lock.lock();
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let compacted = self.meta_i64(&wtxn, META_COMPACTED, 0)?;
        if revision <= compacted {
            return Err(StoreError::Compacted { revision }.into());
        }
        let current = self.meta_i64(&wtxn, META_REVISION, 1)?;
        let target = revision.min(current);
        self.put_meta(&mut wtxn, META_COMPACTED, target)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(target)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbKvStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LmdbKvStore::open(temp_dir.path(), 10).expect("Failed to open store");
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (store, _temp_dir) = create_test_store();
        let resp = store
            .txn(vec![], vec![TxnOp::put("/Config/default", b"{}".to_vec())], vec![])
            .await
            .expect("txn should succeed");
        assert!(resp.succeeded);

        let got = store.get("/Config/default").await.expect("get should succeed");
        let kv = got.first().expect("key should exist");
        assert_eq!(kv.value, b"{}");
        assert_eq!(kv.create_revision, resp.header_revision);
        assert_eq!(got.header_revision, resp.header_revision);
    }

    #[tokio::test]
    async fn test_compare_mod_revision_guards_write() {
        let (store, _temp_dir) = create_test_store();
        let first = store
            .txn(vec![], vec![TxnOp::put("/k", b"1".to_vec())], vec![])
            .await
            .expect("txn");
        let stale = store
            .txn(
                vec![Compare::ModRevision {
                    key: "/k".into(),
                    revision: first.header_revision - 1,
                }],
                vec![TxnOp::put("/k", b"2".to_vec())],
                vec![],
            )
            .await
            .expect("txn");
        assert!(!stale.succeeded);
        let fresh = store
            .txn(
                vec![Compare::ModRevision {
                    key: "/k".into(),
                    revision: first.header_revision,
                }],
                vec![TxnOp::put("/k", b"2".to_vec())],
                vec![],
            )
            .await
            .expect("txn");
        assert!(fresh.succeeded);
        let kv = store.get("/k").await.expect("get");
        assert_eq!(kv.first().map(|kv| kv.version), Some(2));
    }

    #[tokio::test]
    async fn test_revision_survives_reopen() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let rev = {
            let store = LmdbKvStore::open(temp_dir.path(), 10).expect("open");
            store
                .txn(vec![], vec![TxnOp::put("/a", vec![])], vec![])
                .await
                .expect("txn")
                .header_revision
        };
        let store = LmdbKvStore::open(temp_dir.path(), 10).expect("reopen");
        assert_eq!(store.current_revision().await.expect("rev"), rev);
        assert_eq!(store.get_prefix("/").await.expect("prefix").kvs.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let (store, _temp_dir) = create_test_store();
        store
            .txn(
                vec![],
                vec![
                    TxnOp::put("/a", vec![]),
                    TxnOp::put("/a/b", vec![]),
                    TxnOp::put("/a/c", vec![]),
                ],
                vec![],
            )
            .await
            .expect("txn");
        let resp = store
            .txn(vec![], vec![TxnOp::delete_prefix("/a/")], vec![])
            .await
            .expect("txn");
        assert_eq!(resp.deleted, 2);
        assert_eq!(store.get_prefix("/a").await.expect("prefix").kvs.len(), 1);
    }
}
