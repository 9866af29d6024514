//! Notification bus: watch stream in, structured notifications out.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use nexus_core::{
    link_prop, node_prop, BusConfig, BusError, Notification, NotificationStats, NexusResult,
    Properties, TraceId, UpdateType,
};
use nexus_storage::keys::created_key;
use nexus_storage::{KvStore, WatchEvent, WatchKind};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::classify::{classify, KeyKind};
use crate::created::CreatedBuffer;

const MAX_WARNED_KEYS: usize = 4096;

/// Receiver of decoded notifications.
///
/// Each notification is delivered on its own task; implementations must
/// not assume any ordering across calls.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn on_notification(&self, notification: Notification);
}

pub struct NotificationBus {
    name: String,
    watch_prefix: String,
    created: CreatedBuffer,
    handler: RwLock<Option<Arc<dyn NotificationHandler>>>,
    message_delay_ms: AtomicU64,
    running: AtomicBool,
    node_update_rx: AtomicU64,
    link_update_rx: AtomicU64,
    warned: Mutex<HashSet<String>>,
    shutdown: watch::Sender<bool>,
}

impl NotificationBus {
    pub fn new(name: impl Into<String>, config: &BusConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name: name.into(),
            watch_prefix: config.watch_prefix.clone(),
            created: CreatedBuffer::new(
                Duration::from_secs(config.created_buffer_rotation_secs),
                config.created_buffer_max_entries,
            ),
            handler: RwLock::new(None),
            message_delay_ms: AtomicU64::new(config.message_delay_ms),
            running: AtomicBool::new(false),
            node_update_rx: AtomicU64::new(0),
            link_update_rx: AtomicU64::new(0),
            warned: Mutex::new(HashSet::new()),
            shutdown,
        }
    }

    pub fn register_handler(&self, handler: Arc<dyn NotificationHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn set_message_delay(&self, ms: u64) {
        tracing::warn!(bus = %self.name, delay_ms = ms, "notification delivery delay enabled");
        self.message_delay_ms.store(ms, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> NotificationStats {
        NotificationStats {
            node_update_rx: self.node_update_rx.load(Ordering::Relaxed),
            link_update_rx: self.link_update_rx.load(Ordering::Relaxed),
        }
    }

    /// Open the watch and start delivering notifications.
    ///
    /// The watch is established before this returns, so every mutation
    /// committed afterwards is observed.
    pub async fn start(self: &Arc<Self>, kv: Arc<dyn KvStore>) -> NexusResult<JoinHandle<()>> {
        let mut stream = kv.watch(&self.watch_prefix).await?;
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::Release);
        tracing::debug!(bus = %self.name, prefix = %self.watch_prefix, "watch started");

        let bus = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let mut count: u64 = 0;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    item = stream.next() => match item {
                        Some(ev) => {
                            count += 1;
                            if let Some(n) = bus.decode(&ev) {
                                bus.dispatch(n);
                            }
                        }
                        None => {
                            tracing::warn!(bus = %bus.name, error = %BusError::WatchClosed, "watch ended");
                            break;
                        }
                    }
                }
            }
            bus.running.store(false, Ordering::Release);
            tracing::info!(bus = %bus.name, events = count, "watch loop exited");
        }))
    }

    /// Stop the watch loop. Notifications already dispatched still run.
    pub fn shutdown(&self) {
        tracing::info!(bus = %self.name, "stopping notification bus");
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown.send(true);
    }

    fn warn_unknown_once(&self, key: &str) {
        let mut warned = self.warned.lock();
        if warned.len() >= MAX_WARNED_KEYS {
            warned.clear();
        }
        if warned.insert(key.to_string()) {
            tracing::warn!(bus = %self.name, key, "skipping key of unknown shape");
        }
    }

    fn parse_value(&self, ev: &WatchEvent) -> Option<Properties> {
        if ev.value.is_empty() {
            return Some(Properties::new());
        }
        match serde_json::from_slice::<Value>(&ev.value) {
            Ok(Value::Object(map)) => Some(map),
            Ok(other) => {
                let err = BusError::MalformedValue {
                    key: ev.key.clone(),
                    reason: format!("expected object, got {other}"),
                };
                tracing::error!(bus = %self.name, error = %err, "dropping notification");
                None
            }
            Err(e) => {
                let err = BusError::MalformedValue {
                    key: ev.key.clone(),
                    reason: e.to_string(),
                };
                tracing::error!(bus = %self.name, error = %err, "dropping notification");
                None
            }
        }
    }

    fn enrich(&self, key: &str, value: &mut Properties, created_by: &str, creation_time: &str) {
        if let Some(c) = self.created.get(&created_key(key)) {
            for name in [created_by, creation_time] {
                if let Some(v) = c.get(name) {
                    value.insert(name.to_string(), v.clone());
                }
            }
        }
    }

    /// Decode one watch event. Markers, rlinks and unknown keys yield
    /// `None`; `_created` markers are remembered for later enrichment.
    pub fn decode(&self, ev: &WatchEvent) -> Option<Notification> {
        let ck = classify(&ev.key);
        tracing::trace!(bus = %self.name, key = %ev.key, revision = ev.mod_revision, kind = ?ev.kind, "watch event");

        let is_delete = ev.kind == WatchKind::Delete;
        let mut n = match ck.kind {
            KeyKind::Unknown => {
                self.warn_unknown_once(&ev.key);
                return None;
            }
            KeyKind::Created => {
                if !is_delete {
                    if let Some(v) = self.parse_value(ev) {
                        self.created.insert(ev.key.clone(), v);
                    }
                }
                return None;
            }
            KeyKind::Lock | KeyKind::RLink { .. } => return None,
            KeyKind::Link {
                ref dest_type,
                ref dest_key,
            } => {
                let mut value = self.parse_value(ev)?;
                if !is_delete {
                    self.enrich(
                        &ev.key,
                        &mut value,
                        link_prop::CREATED_BY,
                        link_prop::CREATION_TIME,
                    );
                }
                self.link_update_rx.fetch_add(1, Ordering::Relaxed);
                Notification {
                    trace_id: TraceId::new(&ck.path),
                    update_type: if is_delete {
                        UpdateType::LinkDelete
                    } else {
                        UpdateType::LinkUpdate
                    },
                    updated_obj_id: ev.key.clone(),
                    updated_obj_type: dest_type.clone(),
                    updated_obj_key: dest_key.clone(),
                    updated_obj_parent_id: ck.node_id.clone(),
                    object_path: ck.path.clone(),
                    revision: ev.mod_revision,
                    value,
                }
            }
            KeyKind::Node => {
                let mut value = self.parse_value(ev)?;
                if !is_delete {
                    self.enrich(
                        &ev.key,
                        &mut value,
                        node_prop::CREATED_BY,
                        node_prop::CREATION_TIME,
                    );
                }
                self.node_update_rx.fetch_add(1, Ordering::Relaxed);
                Notification {
                    trace_id: TraceId::new(&ck.path),
                    update_type: if is_delete {
                        UpdateType::NodeDelete
                    } else {
                        UpdateType::NodeUpdate
                    },
                    updated_obj_id: ck.node_id.clone(),
                    updated_obj_type: ck.node_type().to_string(),
                    updated_obj_key: ck.node_key().to_string(),
                    updated_obj_parent_id: ck.parent_id.clone(),
                    object_path: ck.path.clone(),
                    revision: ev.mod_revision,
                    value,
                }
            }
        };
        n.value.insert(node_prop::REVISION.into(), Value::from(ev.mod_revision));
        Some(n)
    }

    fn dispatch(&self, n: Notification) {
        let Some(handler) = self.handler.read().clone() else {
            return;
        };
        let delay = self.message_delay_ms.load(Ordering::Relaxed);
        let name = self.name.clone();
        tokio::spawn(async move {
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            tracing::debug!(bus = %name, trace_id = %n.trace_id, id = %n.updated_obj_id, update = %n.update_type, revision = n.revision, "notification");
            handler.on_notification(n).await;
        });
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_core::{path_of_id, LinkEnd, NexusConfig, UpsertLinkRequest};
    use nexus_storage::{GraphStore, InMemoryKvStore, TxnOp};
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Recorder(mpsc::UnboundedSender<Notification>);

    #[async_trait]
    impl NotificationHandler for Recorder {
        async fn on_notification(&self, notification: Notification) {
            let _ = self.0.send(notification);
        }
    }

    async fn started() -> (
        Arc<InMemoryKvStore>,
        Arc<NotificationBus>,
        mpsc::UnboundedReceiver<Notification>,
    ) {
        let kv = Arc::new(InMemoryKvStore::new());
        let bus = Arc::new(NotificationBus::new("test", &BusConfig::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        bus.register_handler(Arc::new(Recorder(tx)));
        bus.start(kv.clone()).await.expect("start");
        (kv, bus, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Notification {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("notification in time")
            .expect("channel open")
    }

    fn end(id: &str) -> LinkEnd {
        let path = path_of_id(id).expect("valid id");
        let last = path.last().cloned().expect("segment");
        LinkEnd {
            node_id: id.to_string(),
            node_type: last.node_type,
            key_name: "name".into(),
            key_value: last.key,
            path,
        }
    }

    fn put(key: &str, value: &[u8]) -> TxnOp {
        TxnOp::put(key, value.to_vec())
    }

    #[tokio::test]
    async fn test_node_notification_is_enriched_with_created() {
        let (kv, _bus, mut rx) = started().await;
        let graph = GraphStore::new(kv, &NexusConfig::default());
        graph
            .upsert_node("dm-1", "Config", "default", &Properties::new())
            .await
            .expect("upsert");

        let n = next(&mut rx).await;
        assert_eq!(n.update_type, UpdateType::NodeUpdate);
        assert_eq!(n.updated_obj_id, "/Config/default");
        assert_eq!(n.updated_obj_parent_id, "");
        assert_eq!(n.value[node_prop::CREATED_BY], json!("dm-1"));
        assert_eq!(n.value[node_prop::REVISION], json!(n.revision));
    }

    #[tokio::test]
    async fn test_child_upsert_yields_node_and_link() {
        let (kv, bus, mut rx) = started().await;
        let graph = GraphStore::new(kv, &NexusConfig::default());
        let root = graph
            .upsert_node("dm-1", "Config", "default", &Properties::new())
            .await
            .expect("root");
        next(&mut rx).await;
        graph
            .upsert_child_node(
                "dm-1",
                &root.id,
                None,
                &Properties::new(),
                "Tenant",
                json!({"name": "acme"}).as_object().expect("object"),
            )
            .await
            .expect("child");

        let mut got = vec![next(&mut rx).await, next(&mut rx).await];
        got.sort_by_key(|n| n.update_type.is_link());
        assert_eq!(got[0].update_type, UpdateType::NodeUpdate);
        assert_eq!(got[0].updated_obj_parent_id, "/Config/default");
        assert_eq!(got[1].update_type, UpdateType::LinkUpdate);
        assert_eq!(got[1].updated_obj_id, "/Config/default/_links/Tenant/acme");
        assert_eq!(got[1].updated_obj_type, "Tenant");
        assert_eq!(got[1].updated_obj_key, "acme");
        assert_eq!(got[1].updated_obj_parent_id, "/Config/default");
        assert_eq!(got[1].value[link_prop::CREATED_BY], json!("dm-1"));

        let stats = bus.stats();
        assert_eq!(stats.node_update_rx, 2);
        assert_eq!(stats.link_update_rx, 1);
    }

    #[tokio::test]
    async fn test_rlinks_are_not_notified() {
        let (kv, bus, mut rx) = started().await;
        let graph = GraphStore::new(kv, &NexusConfig::default());
        let a = graph
            .upsert_node("dm-1", "Group", "eng", &Properties::new())
            .await
            .expect("a");
        let b = graph
            .upsert_node("dm-1", "User", "bob", &Properties::new())
            .await
            .expect("b");
        next(&mut rx).await;
        next(&mut rx).await;
        let req = UpsertLinkRequest {
            source: end(&a.id),
            destination: end(&b.id),
            link_type: "User".into(),
            properties: Properties::new(),
            singleton: false,
        };
        graph.upsert_link("dm-1", &req).await.expect("link");

        let n = next(&mut rx).await;
        assert_eq!(n.updated_obj_id, "/Group/eng/_links/User/bob");
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err(),
            "rlink must not produce a notification"
        );
        assert_eq!(bus.stats().link_update_rx, 1);
    }

    #[test]
    fn test_decode_skips_markers_and_unknown() {
        let bus = NotificationBus::new("t", &BusConfig::default());
        let ev = |key: &str| WatchEvent {
            key: key.to_string(),
            value: b"{}".to_vec(),
            kind: WatchKind::Put,
            mod_revision: 3,
        };
        assert!(bus.decode(&ev("/Config/default/_lock")).is_none());
        assert!(bus.decode(&ev("/Config/default/_created")).is_none());
        assert!(bus.decode(&ev("/Config/default/_junk/x")).is_none());
        assert!(bus.decode(&ev("/Config/default/_junk/x")).is_none());
        assert_eq!(bus.warned.lock().len(), 1);
        assert!(bus.decode(&ev("/Config/default")).is_some());
    }

    #[test]
    fn test_malformed_value_is_dropped() {
        let bus = NotificationBus::new("t", &BusConfig::default());
        let ev = WatchEvent {
            key: "/Config/default".into(),
            value: b"{oops".to_vec(),
            kind: WatchKind::Put,
            mod_revision: 9,
        };
        assert!(bus.decode(&ev).is_none());
        assert_eq!(bus.stats().node_update_rx, 0);
    }

    #[tokio::test]
    async fn test_delete_notification() {
        let (kv, _bus, mut rx) = started().await;
        kv.txn(vec![], vec![put("/Config/x", b"{}")], vec![])
            .await
            .expect("put");
        next(&mut rx).await;
        kv.txn(vec![], vec![TxnOp::delete("/Config/x")], vec![])
            .await
            .expect("delete");
        let n = next(&mut rx).await;
        assert_eq!(n.update_type, UpdateType::NodeDelete);
    }

    #[tokio::test]
    async fn test_shutdown_stops_delivery() {
        let (kv, bus, mut rx) = started().await;
        assert!(bus.is_running());
        bus.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;
        kv.txn(vec![], vec![put("/Config/y", b"{}")], vec![])
            .await
            .expect("put");
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .map(|n| n.is_none())
                .unwrap_or(true),
            "no notification after shutdown"
        );
        assert!(!bus.is_running());
    }

    #[tokio::test]
    async fn test_message_delay() {
        let (kv, bus, mut rx) = started().await;
        bus.set_message_delay(50);
        let start = tokio::time::Instant::now();
        kv.txn(vec![], vec![put("/Config/z", b"{}")], vec![])
            .await
            .expect("put");
        next(&mut rx).await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
