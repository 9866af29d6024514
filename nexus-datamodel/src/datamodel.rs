//! The data model facade.
//!
//! A [`DataModel`] ties a [`GraphStore`], a [`NotificationBus`] and the node
//! cache together. Mutations write the store first and then apply the
//! returned record to the cache; reads go through the cache and fall back
//! to the store.
//!
//! Store failures that survive the bounded retries are treated as
//! consistency faults and routed through [`fatal`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use nexus_core::{
    child_id, fatal, get_str, last_segment, link_prop, node_id_of, node_prop, GraphLink,
    NexusConfig, NexusResult, NodePath, NotificationStats, Properties, UpdateType,
    UpsertLinkRequest, DEFAULT_KEY_NAME,
};
use nexus_events::NotificationBus;
use nexus_storage::{link_key, rlink_key, GraphStore, GraphStoreStats, KvStore};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::{CacheHandler, CacheManager, DataModelCache};
use crate::callback::{link_callback, node_callback, LinkCallback, NodeCallback};
use crate::node::Node;
use crate::scheduler::Scheduler;

/// Namespace under which [`DataModel::set_id`] derives identities.
const ID_NAMESPACE: Uuid = Uuid::from_u128(0x55e5b027_3214_1234_2222_7e58898f2b31);

/// Counters of a data model's store and notification traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DataModelStats {
    pub db: GraphStoreStats,
    pub msg: NotificationStats,
}

enum LinkPropChange<'a> {
    Add(&'a Properties),
    Remove(&'a [String]),
}

pub(crate) struct DataModelInner {
    name: String,
    id: RwLock<String>,
    config: NexusConfig,
    pub(crate) graph: GraphStore,
    bus: Arc<NotificationBus>,
    pub(crate) cache: DataModelCache,
    /// Serializes data model operations per node id.
    scheduler: Scheduler,
    running: AtomicBool,
    watch: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a connected data model. Clones share state.
#[derive(Clone)]
pub struct DataModel {
    pub(crate) inner: Arc<DataModelInner>,
}

impl std::fmt::Debug for DataModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataModel")
            .field("name", &self.inner.name)
            .field("id", &self.id())
            .field("running", &self.is_running())
            .finish()
    }
}

impl DataModel {
    /// Connect a data model named `name` to `kv` and start watching it.
    pub async fn connect(
        name: impl Into<String>,
        kv: Arc<dyn KvStore>,
        config: NexusConfig,
    ) -> NexusResult<Self> {
        let name = name.into();
        let graph = GraphStore::new(Arc::clone(&kv), &config);
        let bus = Arc::new(NotificationBus::new(name.clone(), &config.bus));
        let dm = DataModel {
            inner: Arc::new(DataModelInner {
                cache: DataModelCache::new(&name),
                scheduler: Scheduler::new(format!("{name}-dm")),
                id: RwLock::new(Uuid::new_v4().to_string()),
                name,
                config,
                graph,
                bus,
                running: AtomicBool::new(false),
                watch: Mutex::new(None),
            }),
        };
        dm.inner
            .bus
            .register_handler(Arc::new(CacheHandler(dm.downgrade())));
        dm.inner.running.store(true, Ordering::SeqCst);
        match dm.inner.bus.start(kv).await {
            Ok(handle) => *dm.inner.watch.lock() = Some(handle),
            Err(e) => {
                dm.inner.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
        tracing::info!(
            name = %dm.inner.name,
            id = %dm.id(),
            rlink = dm.rlink_enabled(),
            "data model connected"
        );
        Ok(dm)
    }

    pub(crate) fn from_inner(inner: Arc<DataModelInner>) -> Self {
        DataModel { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<DataModelInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn cache_manager(&self) -> &CacheManager {
        &self.inner.cache.manager
    }

    /// Unwrap a store result, escalating errors to a consistency fault.
    pub(crate) fn must<T>(&self, res: NexusResult<T>) -> T {
        match res {
            Ok(v) => v,
            Err(e) => fatal(self.inner.config.fatal_policy, &e),
        }
    }

    // ------------------------------------------------------------------
    // Identity and lifecycle
    // ------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Identity stamped into `createdBy`/`updatedBy`.
    pub fn id(&self) -> String {
        self.inner.id.read().clone()
    }

    /// Derive a stable identity from `seed`, so a restarted process
    /// recognises what it wrote before.
    pub fn set_id(&self, seed: &str) {
        let id = Uuid::new_v3(&ID_NAMESPACE, seed.as_bytes()).to_string();
        tracing::info!(name = %self.inner.name, %id, "data model id set");
        *self.inner.id.write() = id;
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn rlink_enabled(&self) -> bool {
        self.inner.graph.rlink_enabled()
    }

    pub fn config(&self) -> &NexusConfig {
        &self.inner.config
    }

    /// Stop the bus. Background work observes [`is_running`](Self::is_running)
    /// and winds down.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.bus.shutdown();
        if let Some(handle) = self.inner.watch.lock().take() {
            handle.abort();
        }
        tracing::info!(name = %self.inner.name, "data model shut down");
    }

    pub fn set_messaging_delay(&self, ms: u64) {
        self.inner.bus.set_message_delay(ms);
    }

    pub fn stats(&self) -> DataModelStats {
        DataModelStats {
            db: self.inner.graph.stats(),
            msg: self.inner.bus.stats(),
        }
    }

    pub async fn latest_revision(&self) -> NexusResult<i64> {
        self.inner.graph.latest_revision().await
    }

    pub async fn compact_revision(&self, revision: i64, physical: bool) -> NexusResult<i64> {
        self.inner.graph.compact_revision(revision, physical).await
    }

    /// JSON snapshot of the subscription tree and node table.
    pub fn dump_cached_nodes(&self) -> Value {
        self.cache_manager().dump()
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// A live cached node, without touching the store.
    pub fn get_cached_node(&self, id: &str) -> Option<Node> {
        self.cache_manager()
            .get(id)
            .filter(|n| !n.is_deleted())
    }

    /// Node `id`, fetched into the cache if needed. With `sync` a cached
    /// node is re-read first.
    pub async fn get_node(
        &self,
        parent_id: &str,
        node_type: &str,
        id: &str,
        sync: bool,
        sync_subtrees: bool,
    ) -> Option<Node> {
        let _guard = self.inner.scheduler.wait(id).await;
        tracing::trace!(parent_id, node_type, node_id = id, sync, "get node");
        self.load_node(parent_id, id, sync, sync_subtrees).await
    }

    pub async fn get_root_node(&self, node_type: &str, name: &str, sync: bool) -> Option<Node> {
        let id = node_id_of(&[NodePath::new(node_type, name)]);
        self.get_node("", node_type, &id, sync, false).await
    }

    /// Re-read `node` from the store unless a subscription keeps it current.
    pub async fn sync(&self, node: &Node, forced: bool) {
        let _guard = self.inner.scheduler.wait(node.id()).await;
        self.sync_internal(node, forced, false).await;
    }

    pub async fn next_child_key_list(
        &self,
        node_id: &str,
        dest_type: &str,
        start: &str,
        count: usize,
    ) -> Vec<String> {
        self.must(
            self.inner
                .graph
                .next_link_keys(node_id, dest_type, start, count)
                .await,
        )
    }

    pub async fn next_rlink_child_key_list(
        &self,
        node_id: &str,
        src_type: &str,
        start: &str,
        count: usize,
    ) -> Vec<String> {
        self.must(
            self.inner
                .graph
                .next_rlink_keys(node_id, src_type, start, count)
                .await,
        )
    }

    // ------------------------------------------------------------------
    // Node writes
    // ------------------------------------------------------------------

    /// Create or update the root node `/<node_type>/<name>`.
    ///
    /// # Panics
    ///
    /// Panics if `name` is empty.
    pub async fn upsert_root_node(&self, node_type: &str, name: &str, props: &Properties) -> Node {
        assert!(!name.is_empty(), "root node of type {node_type} needs a name");
        let id = node_id_of(&[NodePath::new(node_type, name)]);
        let _guard = self.inner.scheduler.wait(&id).await;
        let snapshot = self.must(
            self.inner
                .graph
                .upsert_node(&self.id(), node_type, name, props)
                .await,
        );
        let node = self.populate_cache_and_return_node("", &snapshot).await;
        node.set_parent(None);
        node
    }

    /// Create or update a child of `parent_id` with its hard link.
    ///
    /// # Panics
    ///
    /// Panics if `props` lacks the key property.
    pub async fn upsert_node(
        &self,
        parent_id: &str,
        key_name: Option<&str>,
        link_props: &Properties,
        node_type: &str,
        props: &Properties,
    ) -> (Node, GraphLink) {
        let key_prop = key_name.unwrap_or(DEFAULT_KEY_NAME);
        let Some(key) = get_str(props, key_prop) else {
            panic!("key property {key_prop} is missing from {node_type} properties");
        };
        let id = child_id(parent_id, node_type, key);
        let _guard = self.inner.scheduler.wait(&id).await;
        let (snapshot, link) = self.must(
            self.inner
                .graph
                .upsert_child_node(&self.id(), parent_id, key_name, link_props, node_type, props)
                .await,
        );
        let node = self
            .populate_cache_and_return_node(parent_id, &snapshot)
            .await;
        if let Some(parent) = self.get_cached_node(parent_id) {
            node.set_parent(Some(&parent));
            parent.upsert_immediate_link(node_type, node.key_value(), link.clone());
        }
        (node, link)
    }

    async fn populate_cache_and_return_node(
        &self,
        parent_id: &str,
        snapshot: &nexus_core::GraphNode,
    ) -> Node {
        let node = match self.get_cached_node(&snapshot.id) {
            Some(n) => n,
            None => {
                let n = Node::new(
                    self,
                    &snapshot.id,
                    &snapshot.node_type,
                    snapshot.key_name(),
                    snapshot.properties.clone(),
                );
                if !self.cache_manager().write_to_cache(parent_id, &n) {
                    return n;
                }
                n
            }
        };
        self.populate_cache_links(&node, snapshot, false).await;
        node
    }

    pub async fn update_node_add_properties(&self, id: &str, props: &Properties) {
        if props.is_empty() {
            return;
        }
        let _guard = self.inner.scheduler.wait(id).await;
        let Some(node) = self.get_cached_node(id) else {
            tracing::debug!(node_id = id, "property update for uncached node dropped");
            return;
        };
        self.must(
            self.inner
                .graph
                .update_node_add_properties(&self.id(), id, props)
                .await,
        );
        self.sync_node_property(&node, true).await;
    }

    pub async fn update_node_remove_properties(&self, id: &str, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        let _guard = self.inner.scheduler.wait(id).await;
        let Some(node) = self.get_cached_node(id) else {
            tracing::debug!(node_id = id, "property removal for uncached node dropped");
            return;
        };
        self.must(
            self.inner
                .graph
                .update_node_remove_properties(&self.id(), id, keys)
                .await,
        );
        self.sync_node_property(&node, true).await;
    }

    /// Delete `node` with its hard-linked subtree and every soft link into
    /// or out of it. Returns false if there was nothing to delete.
    pub async fn delete(&self, node: &Node) -> bool {
        self.delete_tree(node.id(), 0).await
    }

    /// Store-driven cascading delete. The `toBeDeleted` marker is written
    /// before any descendant goes, so an interrupted delete can be resumed
    /// by deleting the same node again.
    fn delete_tree<'a>(&'a self, id: &'a str, depth: usize) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            assert!(!id.is_empty(), "delete called with an empty node id");
            let guard = self.inner.scheduler.wait(id).await;
            let cached = self.cache_manager().get(id);
            if cached.as_ref().is_some_and(Node::is_delete_completed) {
                return false;
            }
            let Some(snapshot) = self.must(self.inner.graph.describe_node(id).await) else {
                if cached.is_some() {
                    self.cache_manager().purge_cache_tree(id);
                }
                return cached.is_some();
            };
            drop(guard);
            tracing::debug!(node_id = id, depth, "deleting node");

            self.must(self.inner.graph.mark_to_be_deleted(&self.id(), id).await);
            if let Some(n) = &cached {
                n.set_to_be_deleted();
                self.sync_node_property(n, true).await;
            }
            for link in snapshot.links.iter().filter(|l| l.is_hard()) {
                self.delete_tree(&link.destination_node_id, depth + 1).await;
            }

            let guard = self.inner.scheduler.wait(id).await;
            if let Some(n) = &cached {
                n.set_deleted();
            }
            let (own_type, own_key) = last_segment(id).unwrap_or_default();
            let rlink = self.rlink_enabled();

            // Soft links pointing here.
            let incoming = if rlink {
                self.must(self.inner.graph.delete_links(id).await)
            } else {
                Vec::new()
            };
            if !rlink {
                for (source_id, rev) in cached.iter().flat_map(Node::reverse_links) {
                    let link_id = if rev.link_id.is_empty() {
                        link_key(&source_id, own_type, &rev.key)
                    } else {
                        rev.link_id
                    };
                    self.must(self.inner.graph.delete_link(&link_id).await);
                }
            }
            // Soft links leaving here, with their rlinks.
            let mut outgoing = Vec::new();
            for link in snapshot.links.iter().filter(|l| !l.is_hard()) {
                if rlink {
                    let rid = rlink_key(&link.destination_node_id, own_type, own_key);
                    self.must(self.inner.graph.delete_link_with_reverse(&link.id, &rid).await);
                } else {
                    self.must(self.inner.graph.delete_link(&link.id).await);
                }
                outgoing.push(link.destination_node_id.clone());
            }

            self.must(self.inner.graph.delete_node(id).await);
            self.cache_manager().purge_cache_tree(id);
            drop(guard);

            for rl in &incoming {
                let source_id = rl.destination_node_id.as_str();
                let key = get_str(&rl.properties, link_prop::FORWARD_LINK_ID)
                    .and_then(last_segment)
                    .map(|(_, k)| k)
                    .unwrap_or(own_key);
                let _guard = self.inner.scheduler.wait(source_id).await;
                if let Some(src) = self.get_cached_node(source_id) {
                    if src.links().has(own_type, key) {
                        src.delete_immediate_link(own_type, key);
                    }
                }
            }
            for dest_id in &outgoing {
                let _guard = self.inner.scheduler.wait(dest_id).await;
                if let Some(dest) = self.get_cached_node(dest_id) {
                    dest.remove_reverse_link(id);
                    if rlink && dest.links().get_rlink(own_type, own_key).is_some() {
                        dest.delete_immediate_rlink(own_type, own_key);
                    }
                }
            }
            tracing::debug!(node_id = id, incoming = incoming.len(), outgoing = outgoing.len(), "node deleted");
            true
        })
    }

    // ------------------------------------------------------------------
    // Link writes
    // ------------------------------------------------------------------

    /// Create or update a soft link, then cache it on the source and its
    /// rlink on the destination.
    pub async fn upsert_link(&self, req: &UpsertLinkRequest) -> GraphLink {
        let src_id = req.source.node_id.as_str();
        let dest_id = req.destination.node_id.as_str();
        let (link, rlink) = {
            let _guard = self.inner.scheduler.wait(src_id).await;
            let (link, rlink) = self.must(self.inner.graph.upsert_link(&self.id(), req).await);
            if let Some(src) = self.get_cached_node_synced(src_id).await {
                src.upsert_immediate_link(
                    &req.destination.node_type,
                    &req.destination.key_value,
                    link.clone(),
                );
            }
            (link, rlink)
        };
        if !link.is_hard() {
            let _guard = self.inner.scheduler.wait(dest_id).await;
            if let Some(dest) = self.get_cached_node(dest_id) {
                dest.add_reverse_link(src_id, &req.destination.key_value, &link.id);
                if let (true, Some(rlink)) = (self.rlink_enabled(), rlink) {
                    dest.upsert_immediate_rlink(&req.source.node_type, &req.source.key_value, rlink);
                }
            }
        }
        link
    }

    /// Delete the link `(dest_type, dest_key)` of `src_id`; a soft link
    /// takes its rlink with it.
    pub async fn delete_link(&self, src_id: &str, dest_type: &str, dest_key: &str) {
        let guard = self.inner.scheduler.wait(src_id).await;
        let src = self.cache_manager().get(src_id);
        let link = match src.as_ref().and_then(|n| n.links().get(dest_type, dest_key)) {
            Some(l) => Some(l),
            None => self.must(
                self.inner
                    .graph
                    .describe_link_by_id(&link_key(src_id, dest_type, dest_key))
                    .await,
            ),
        };
        let Some(link) = link else {
            tracing::debug!(src_id, dest_type, dest_key, "no link to delete");
            return;
        };

        let reverse = match last_segment(src_id) {
            Some((t, k)) if self.rlink_enabled() && !link.is_hard() => Some((t, k)),
            _ => None,
        };
        match reverse {
            Some((src_type, src_key)) => {
                let rid = rlink_key(&link.destination_node_id, src_type, src_key);
                self.must(self.inner.graph.delete_link_with_reverse(&link.id, &rid).await);
            }
            None => {
                self.must(self.inner.graph.delete_link(&link.id).await);
            }
        }
        if let Some(n) = &src {
            n.delete_immediate_link(dest_type, dest_key);
        }
        drop(guard);

        if let Some((src_type, src_key)) = reverse {
            let _guard = self.inner.scheduler.wait(&link.destination_node_id).await;
            if let Some(dest) = self.get_cached_node(&link.destination_node_id) {
                dest.remove_reverse_link(src_id);
                if dest.links().get_rlink(src_type, src_key).is_some() {
                    dest.delete_immediate_rlink(src_type, src_key);
                }
            }
        }
    }

    /// Delete only the rlink `(src_type, src_key)` held by `node_id`.
    pub async fn delete_rlink(&self, node_id: &str, src_type: &str, src_key: &str) {
        let _guard = self.inner.scheduler.wait(node_id).await;
        self.must(
            self.inner
                .graph
                .delete_link(&rlink_key(node_id, src_type, src_key))
                .await,
        );
        if let Some(n) = self.get_cached_node(node_id) {
            if n.links().get_rlink(src_type, src_key).is_some() {
                n.delete_immediate_rlink(src_type, src_key);
            }
        }
    }

    pub async fn update_link_add_property(
        &self,
        src_id: &str,
        dest_type: &str,
        dest_key: &str,
        props: &Properties,
    ) -> bool {
        self.update_link_property(src_id, dest_type, dest_key, LinkPropChange::Add(props))
            .await
    }

    pub async fn update_link_remove_property(
        &self,
        src_id: &str,
        dest_type: &str,
        dest_key: &str,
        keys: &[String],
    ) -> bool {
        self.update_link_property(src_id, dest_type, dest_key, LinkPropChange::Remove(keys))
            .await
    }

    /// Apply a property change to a cached link in the store, then re-cache
    /// the stored record so link update callbacks see it.
    async fn update_link_property(
        &self,
        src_id: &str,
        dest_type: &str,
        dest_key: &str,
        change: LinkPropChange<'_>,
    ) -> bool {
        let _guard = self.inner.scheduler.wait(src_id).await;
        let Some(src) = self.get_cached_node_synced(src_id).await else {
            return false;
        };
        let Some(link) = src.links().get(dest_type, dest_key) else {
            tracing::debug!(src_id, dest_type, dest_key, "link not cached");
            return false;
        };
        let dm_id = self.id();
        let res = match change {
            LinkPropChange::Add(props) => {
                self.inner
                    .graph
                    .update_link_add_properties(&dm_id, &link.id, props)
                    .await
            }
            LinkPropChange::Remove(keys) => {
                self.inner
                    .graph
                    .update_link_remove_properties(&dm_id, &link.id, keys)
                    .await
            }
        };
        self.must(res);
        match self.must(self.inner.graph.describe_link_by_id(&link.id).await) {
            Some(fresh) => {
                src.upsert_immediate_link(dest_type, dest_key, fresh);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions and callbacks
    // ------------------------------------------------------------------

    /// Subscribe to `path` (wildcard keys allowed). Returns the ids of
    /// cached nodes newly covered, which are force-synced before return.
    /// A `depth` above 1 also schedules an eager refresh below the path.
    pub async fn subscribe(&self, path: &[NodePath], depth: u32) -> Vec<String> {
        let sync_list = self.cache_manager().add_subscription(path, depth);
        tracing::debug!(path = %nexus_core::path_to_json(path), depth, covered = sync_list.len(), "subscribed");
        self.resync(&sync_list).await;
        if depth > 1 {
            let dm = self.clone();
            let path = path.to_vec();
            tokio::spawn(async move {
                if !dm.is_running() {
                    return;
                }
                dm.force_refresh_node(&path, depth, true, None).await;
            });
        }
        sync_list
    }

    pub fn unsubscribe(&self, path: &[NodePath]) {
        self.cache_manager().del_subscription(path);
        tracing::debug!(path = %nexus_core::path_to_json(path), "unsubscribed");
    }

    /// Register a node callback on `path`. Nodes already cached under it
    /// are reported as adds.
    pub fn register_cb(&self, path: &[NodePath], cb: NodeCallback) {
        let ids = self.cache_manager().register_node_cb(path, cb.clone());
        self.fire_retro_node_callbacks(&ids, &cb);
    }

    /// Register a link callback for links of `dest_type` leaving nodes on
    /// `path`. Cached links are reported as adds.
    pub fn register_link_cb(&self, path: &[NodePath], dest_type: &str, cb: LinkCallback) {
        let ids = self
            .cache_manager()
            .register_link_cb(path, dest_type, cb.clone());
        self.fire_retro_link_callbacks(&ids, dest_type, &cb);
    }

    /// Delete every node on `path` last written by another data model,
    /// limited to keys starting with `prefix` (empty matches all).
    /// Registration waits `delay_ms` so peers can settle.
    pub async fn claim_ownership(&self, path: &[NodePath], delay_ms: u64, prefix: &str) {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        let me = self.id();
        let prefix = prefix.to_string();
        self.register_cb(
            path,
            node_callback(move |ev| {
                let me = me.clone();
                let prefix = prefix.clone();
                async move {
                    if ev.update == UpdateType::NodeDelete || !ev.node.key_value().starts_with(&prefix) {
                        return;
                    }
                    let Some(owner) = ev.new.as_ref().and_then(owner_of) else {
                        return;
                    };
                    if owner != me {
                        tracing::info!(node_id = %ev.node.id(), %owner, prefix = %prefix, "deleting node owned by another writer");
                        ev.node.delete().await;
                    }
                }
            }),
        );
    }

    /// Delete every soft link of `dest_type` leaving nodes on `path` that
    /// another data model last wrote.
    pub async fn claim_link_ownership(&self, path: &[NodePath], dest_type: &str, delay_ms: u64) {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        let me = self.id();
        self.register_link_cb(
            path,
            dest_type,
            link_callback(move |ev| {
                let me = me.clone();
                async move {
                    if ev.update == UpdateType::LinkDelete {
                        return;
                    }
                    let Some(props) = ev.new.as_ref() else {
                        return;
                    };
                    if get_str(props, link_prop::HARD_LINK) == Some("true") {
                        return;
                    }
                    let Some(owner) = owner_of(props) else {
                        return;
                    };
                    if owner != me {
                        tracing::info!(node_id = %ev.node.id(), dest_type = %ev.dest_type, dest_key = %ev.dest_key, %owner, "deleting link owned by another writer");
                        ev.node.delete_link(&ev.dest_key, &ev.dest_type).await;
                    }
                }
            }),
        );
    }
}

/// Last writer of a record: `updatedBy`, else `createdBy`.
fn owner_of(props: &Properties) -> Option<String> {
    get_str(props, node_prop::UPDATED_BY)
        .or_else(|| get_str(props, node_prop::CREATED_BY))
        .map(String::from)
}

#[cfg(test)]
pub(crate) async fn test_model(name: &str) -> DataModel {
    let kv: Arc<dyn KvStore> = Arc::new(nexus_storage::InMemoryKvStore::new());
    let config = NexusConfig {
        fatal_policy: nexus_core::FatalPolicy::Panic,
        ..NexusConfig::default()
    };
    DataModel::connect(name, kv, config)
        .await
        .expect("in-memory store connects")
}

// =============================================================================
// TESTS
// =============================================================================
