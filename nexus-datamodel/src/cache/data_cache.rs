//! Store reconciliation for the cache.
//!
//! Everything here runs as methods on [`DataModel`] so it can reach the
//! graph store. Fetch, sync and notification handling are serialized per
//! node id (per parent id for link notifications) on the cache scheduler;
//! link callbacks run on their own tasks, ordered per edge by the callback
//! scheduler.

use std::collections::HashSet;
use std::sync::Weak;

use async_trait::async_trait;
use futures_util::future::{join_all, BoxFuture};
use nexus_core::{
    get_str, link_prop, node_prop, path_of_id, props_differ, GraphLink,
    GraphNode, NodePath, Notification, Properties, UpdateType, LINK_DIFF_EXCLUDE,
};
use nexus_events::NotificationHandler;

use crate::callback::{LinkCallback, LinkEvent, NodeCallback, NodeEvent};
use crate::datamodel::{DataModel, DataModelInner};
use crate::node::Node;
use crate::scheduler::Scheduler;

/// Bus handler feeding notifications into a data model's cache.
pub(crate) struct CacheHandler(pub(crate) Weak<DataModelInner>);

#[async_trait]
impl NotificationHandler for CacheHandler {
    async fn on_notification(&self, notification: Notification) {
        if let Some(inner) = self.0.upgrade() {
            DataModel::from_inner(inner)
                .handle_notification(notification)
                .await;
        }
    }
}

/// Copy creation metadata from `from` when `into` lacks it.
fn fill_created(into: &mut Properties, from: &Properties, created_by: &str, creation_time: &str) {
    if into.contains_key(created_by) {
        return;
    }
    for name in [created_by, creation_time] {
        if let Some(v) = from.get(name) {
            into.insert(name.to_string(), v.clone());
        }
    }
}

fn callback_key(node: &Node, dest_type: &str, dest_key: &str) -> String {
    format!("{}/{dest_type}/{dest_key}", node.id())
}

impl DataModel {
    fn cache_scheduler(&self) -> &Scheduler {
        &self.inner.cache.scheduler
    }

    // ------------------------------------------------------------------
    // Fetch and sync
    // ------------------------------------------------------------------

    /// Fetch `node_id` if needed and return it from the cache.
    pub(crate) fn load_node<'a>(
        &'a self,
        parent_id: &'a str,
        node_id: &'a str,
        sync: bool,
        sync_subtrees: bool,
    ) -> BoxFuture<'a, Option<Node>> {
        Box::pin(async move {
            if self.fetch(parent_id, node_id, sync, sync_subtrees).await {
                self.cache_manager().get(node_id)
            } else {
                None
            }
        })
    }

    /// Bring `node_id` into the cache. A cached node is only re-read when
    /// `forced`. Returns false if the node does not exist (any more).
    ///
    /// # Panics
    ///
    /// Panics if `node_id` is empty.
    async fn fetch(&self, parent_id: &str, node_id: &str, forced: bool, sync_subtrees: bool) -> bool {
        assert!(!node_id.is_empty(), "fetch called with an empty node id");
        if let Some(nd) = self.cache_manager().get(node_id) {
            if !forced {
                return true;
            }
            self.sync_internal(&nd, false, sync_subtrees).await;
            return !nd.is_deleted();
        }

        let _guard = self.cache_scheduler().wait(node_id).await;
        let Some(snapshot) = self.must(self.inner.graph.describe_node(node_id).await) else {
            tracing::debug!(node_id, "fetch found nothing in store");
            return false;
        };
        // Another task may have cached it while we waited.
        match self.cache_manager().get(node_id) {
            None => {
                let node = Node::new(
                    self,
                    &snapshot.id,
                    &snapshot.node_type,
                    snapshot.key_name(),
                    snapshot.properties.clone(),
                );
                if !self.cache_manager().write_to_cache(parent_id, &node) {
                    return false;
                }
                self.populate_cache_links(&node, &snapshot, sync_subtrees).await;
                true
            }
            Some(nd) if !nd.is_deleted() => {
                self.populate_cache_links(&nd, &snapshot, sync_subtrees).await;
                true
            }
            Some(_) => false,
        }
    }

    /// Re-describe `node` and reconcile it. Skipped for subscribed nodes
    /// unless `forced` or walking subtrees; a node gone from the store is
    /// purged.
    pub(crate) fn sync_internal<'a>(
        &'a self,
        node: &'a Node,
        forced: bool,
        sync_subtrees: bool,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let _guard = self.cache_scheduler().wait(node.id()).await;
            if !self.is_running() {
                return;
            }
            if !forced {
                if node.is_delete_completed() {
                    return;
                }
                if !sync_subtrees && self.cache_manager().is_node_subscribed(node.id()) {
                    tracing::debug!(node_id = %node.id(), "subscribed, sync skipped");
                    return;
                }
            }
            match self.must(self.inner.graph.describe_node(node.id()).await) {
                Some(snapshot) => {
                    self.populate_cache_links(node, &snapshot, sync_subtrees)
                        .await
                }
                None => {
                    tracing::debug!(node_id = %node.id(), "node gone from store, purging");
                    self.cache_manager().purge_cache_tree(node.id());
                }
            }
        })
    }

    /// Refresh only the properties of `node`.
    pub async fn sync_node_property(&self, node: &Node, forced: bool) {
        if !forced && self.cache_manager().is_node_subscribed(node.id()) {
            return;
        }
        match self.must(self.inner.graph.get_node_property(node.id()).await) {
            Some(props) => node.set_immediate_properties(props),
            None => {
                tracing::debug!(node_id = %node.id(), "no properties in store, purging");
                self.cache_manager().purge_cache_tree(node.id());
            }
        }
    }

    /// Refresh the link `(child_type, child_key)` of `parent` and the child
    /// behind it, falling back to a full sync of `parent`.
    pub fn sync_child<'a>(
        &'a self,
        parent: &'a Node,
        child_type: &'a str,
        child_key: &'a str,
        forced: bool,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Some(link) = parent.links().get(child_type, child_key) {
                if let Some(child) = self.get_cached_node(&link.destination_node_id) {
                    if !link.id.is_empty() {
                        if !forced && self.cache_manager().is_node_subscribed(child.id()) {
                            return;
                        }
                        if let Some(fresh) =
                            self.must(self.inner.graph.describe_link_by_id(&link.id).await)
                        {
                            self.populate_single_cache_link(parent, fresh, false).await;
                            self.sync_node_property(&child, forced).await;
                            return;
                        }
                    }
                }
            }
            tracing::debug!(parent_id = %parent.id(), child_type, child_key, forced, "full sync of parent");
            self.sync_internal(parent, forced, false).await;
        })
    }

    /// Cached node `id`, re-read from the store first.
    pub(crate) async fn get_cached_node_synced(&self, id: &str) -> Option<Node> {
        let node = self.get_cached_node(id)?;
        let parent_id = node
            .parent()
            .map(|p| p.id().to_string())
            .unwrap_or_default();
        if !self.fetch(&parent_id, id, true, false).await {
            return None;
        }
        self.get_cached_node(id)
    }

    /// Walk `path` from its root, fetching each hop. Returns the node chain,
    /// or nothing if any hop cannot be resolved.
    pub fn populate_path_and_fetch_nodes<'a>(
        &'a self,
        path: &'a [NodePath],
        force: bool,
    ) -> BoxFuture<'a, Vec<Node>> {
        Box::pin(async move {
            let Some((first, rest)) = path.split_first() else {
                return Vec::new();
            };
            let root_id = nexus_core::node_id_of(std::slice::from_ref(first));
            let root = match self.get_cached_node(&root_id) {
                Some(r) => Some(r),
                None => self.load_node("", &root_id, force, false).await,
            };
            let Some(mut nd) = root else {
                return Vec::new();
            };
            let mut out = vec![nd.clone()];
            for seg in rest {
                if !nd.links().has(&seg.node_type, &seg.key) {
                    if let Some(parent) = nd.parent() {
                        self.load_node(parent.id(), nd.id(), force, false).await;
                    }
                }
                let Some(link) = nd.links().get(&seg.node_type, &seg.key) else {
                    tracing::debug!(path = %nexus_core::path_to_json(path), hop = %seg, "path cannot be followed");
                    return Vec::new();
                };
                let cid = link.destination_node_id;
                let cached = if force {
                    self.get_cached_node_synced(&cid).await
                } else {
                    self.get_cached_node(&cid)
                };
                let next = match cached {
                    Some(n) => Some(n),
                    None => self.load_node(nd.id(), &cid, force, false).await,
                };
                let Some(next) = next else {
                    tracing::error!(path = %nexus_core::path_to_json(path), hop = %seg, "node along path is undefined");
                    return Vec::new();
                };
                out.push(next.clone());
                nd = next;
            }
            out
        })
    }

    // ------------------------------------------------------------------
    // Link reconciliation
    // ------------------------------------------------------------------

    /// Apply a store snapshot to `node`: properties, then mark-and-sweep of
    /// links (and rlinks when enabled), then every snapshot link.
    pub(crate) fn populate_cache_links<'a>(
        &'a self,
        node: &'a Node,
        snapshot: &'a GraphNode,
        sync_subtrees: bool,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if node.is_deleted() {
                return;
            }
            let rlinks = self.rlink_enabled();
            node.set_immediate_properties(snapshot.properties.clone());
            mark_and_sweep(node, &snapshot.links, false);
            if rlinks {
                mark_and_sweep(node, &snapshot.rlinks, true);
            }
            for link in &snapshot.links {
                if !self.is_running() {
                    break;
                }
                if link.dest_type().is_some() && link.dest_key().is_some() {
                    self.populate_single_cache_link(node, link.clone(), sync_subtrees)
                        .await;
                } else {
                    tracing::error!(node_id = %node.id(), link_id = %link.id, "link missing fixed properties");
                }
            }
            if rlinks {
                for rlink in &snapshot.rlinks {
                    if !self.is_running() {
                        break;
                    }
                    match (rlink.dest_type(), rlink.dest_key()) {
                        (Some(t), Some(k)) => node.upsert_immediate_rlink(t, k, rlink.clone()),
                        _ => {
                            tracing::error!(node_id = %node.id(), link_id = %rlink.id, "rlink missing fixed properties")
                        }
                    }
                }
            }
        })
    }

    /// Cache one link of `node`. Soft links resolve their destination path
    /// and record the reverse link; hard links pull a covered child in the
    /// background, or inline when walking subtrees.
    async fn populate_single_cache_link(&self, node: &Node, link: GraphLink, sync_subtrees: bool) {
        let (Some(dest_type), Some(dest_key)) = (
            link.dest_type().map(String::from),
            link.dest_key().map(String::from),
        ) else {
            return;
        };
        node.upsert_immediate_link(&dest_type, &dest_key, link.clone());

        if !link.is_hard() {
            let Some(path) = link.soft_dest_path() else {
                tracing::error!(node_id = %node.id(), link_id = %link.id, "soft link without a parsable destination path");
                return;
            };
            for dest in self.populate_path_and_fetch_nodes(&path, false).await {
                if dest.id() == link.destination_node_id {
                    dest.add_reverse_link(node.id(), &dest_key, &link.id);
                }
            }
        } else if self.cache_manager().check_path(&node.child_path(&dest_type, &dest_key)) {
            let dm = self.clone();
            let parent_id = node.id().to_string();
            let child_id = link.destination_node_id;
            tokio::spawn(async move {
                if !dm.is_running() {
                    return;
                }
                dm.load_node(&parent_id, &child_id, false, false).await;
            });
        } else if sync_subtrees {
            self.load_node(node.id(), &link.destination_node_id, true, true)
                .await;
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Force-sync the cached nodes in `ids`.
    pub(crate) async fn resync(&self, ids: &[String]) {
        let nodes: Vec<Node> = ids
            .iter()
            .filter_map(|id| {
                let n = self.cache_manager().get(id);
                if n.is_none() {
                    tracing::error!(node_id = %id, "sync list names a node that is not cached");
                }
                n
            })
            .collect();
        join_all(nodes.iter().map(|n| self.sync_internal(n, true, false))).await;
    }

    /// Eagerly load `path` and then hard-linked children down to `depth`
    /// levels below it.
    pub(crate) fn force_refresh_node<'a>(
        &'a self,
        path: &'a [NodePath],
        depth: u32,
        init: bool,
        nd: Option<Node>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if depth == 0 {
                return;
            }
            if init {
                let chain = self.populate_path_and_fetch_nodes(path, true).await;
                if chain.len() == path.len() {
                    self.force_refresh_node(path, depth, false, chain.last().cloned())
                        .await;
                } else {
                    tracing::debug!(path = %nexus_core::path_to_json(path), resolved = chain.len(), "refresh could not resolve path");
                }
                return;
            }
            let Some(nd) = nd else {
                return;
            };
            for (dest_type, dest_key, link) in nd.links().all() {
                if !link.is_hard() {
                    continue;
                }
                if let Some((child, _)) = nd.get_child(&dest_key, &dest_type, true).await {
                    self.force_refresh_node(path, depth - 1, false, Some(child))
                        .await;
                }
            }
        })
    }

    /// Fire `cb` once for each live cached node in `ids`.
    pub(crate) fn fire_retro_node_callbacks(&self, ids: &[String], cb: &NodeCallback) {
        for id in ids {
            let Some(node) = self.get_cached_node(id) else {
                continue;
            };
            let props = node.cached_properties();
            tokio::spawn(cb(NodeEvent {
                node,
                update: UpdateType::NodeAdd,
                old: None,
                new: Some(props),
            }));
        }
    }

    /// Fire `cb` as a link add for every cached link of `dest_type` leaving
    /// the nodes in `ids`.
    pub(crate) fn fire_retro_link_callbacks(&self, ids: &[String], dest_type: &str, cb: &LinkCallback) {
        for id in ids {
            let Some(node) = self.get_cached_node(id) else {
                continue;
            };
            for (dest_key, link) in node.links().of_type(dest_type) {
                let dm = self.clone();
                let cb = cb.clone();
                let node = node.clone();
                let dest_type = dest_type.to_string();
                tokio::spawn(async move {
                    let key = callback_key(&node, &dest_type, &dest_key);
                    let _guard = dm.cache_manager().cb_scheduler.wait(&key).await;
                    dm.ready_dest_node(&node, &dest_key, &dest_type, &link)
                        .await;
                    cb(LinkEvent {
                        node,
                        update: UpdateType::LinkAdd,
                        dest_type,
                        dest_key,
                        old: None,
                        new: Some(link.properties),
                    })
                    .await;
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Link callbacks
    // ------------------------------------------------------------------

    /// Dispatch add/update callbacks for a link just cached on `node`.
    pub(crate) fn spawn_link_update_callbacks(
        &self,
        node: Node,
        dest_key: String,
        dest_type: String,
        cur: Option<GraphLink>,
        new: GraphLink,
    ) {
        if node.full_path().len() > 1 && node.parent().is_none() {
            tracing::warn!(node_id = %node.id(), "no parent set during callback processing");
            return;
        }
        let dm = self.clone();
        tokio::spawn(async move {
            dm.do_link_update_callbacks(node, dest_key, dest_type, cur, new)
                .await;
        });
    }

    async fn do_link_update_callbacks(
        &self,
        node: Node,
        dest_key: String,
        dest_type: String,
        cur: Option<GraphLink>,
        new: GraphLink,
    ) {
        let key = callback_key(&node, &dest_type, &dest_key);
        let _guard = self.cache_manager().cb_scheduler.wait(&key).await;
        let update = match &cur {
            Some(c) if !props_differ(&c.properties, &new.properties, LINK_DIFF_EXCLUDE) => {
                tracing::debug!(node_id = %node.id(), dest_type, dest_key, "link unchanged, callbacks skipped");
                return;
            }
            Some(_) => UpdateType::LinkUpdate,
            None => UpdateType::LinkAdd,
        };
        let cbs = self
            .cache_manager()
            .link_callbacks(node.full_path(), &dest_type);
        if cbs.is_empty() {
            return;
        }
        tracing::debug!(node_id = %node.id(), dest_type, dest_key, %update, callbacks = cbs.len(), "link callbacks");
        self.ready_dest_node(&node, &dest_key, &dest_type, &new)
            .await;
        let ev = LinkEvent {
            node,
            update,
            dest_type,
            dest_key,
            old: cur.map(|c| c.properties),
            new: Some(new.properties),
        };
        for cb in cbs {
            cb(ev.clone()).await;
        }
    }

    /// Make sure the destination of `link` is cached before a link
    /// callback observes it.
    async fn ready_dest_node(&self, base: &Node, dest_key: &str, dest_type: &str, link: &GraphLink) {
        if self.get_cached_node(&link.destination_node_id).is_some() {
            return;
        }
        if link.is_hard() {
            self.load_node(base.id(), &link.destination_node_id, true, false)
                .await;
        } else if let Some(path) = link.soft_dest_path() {
            self.populate_path_and_fetch_nodes(&path, true).await;
        } else {
            tracing::debug!(node_id = %base.id(), dest_type, dest_key, "destination cannot be readied");
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    pub(crate) async fn handle_notification(&self, msg: Notification) {
        if !self.is_running() {
            return;
        }
        match msg.update_type {
            UpdateType::NodeAdd | UpdateType::NodeUpdate | UpdateType::NodeDelete => {
                self.handle_node_notification(msg).await
            }
            UpdateType::LinkAdd | UpdateType::LinkUpdate | UpdateType::LinkDelete => {
                self.handle_link_notification(msg).await
            }
        }
    }

    async fn handle_node_notification(&self, msg: Notification) {
        let id = msg.updated_obj_id.as_str();
        let _guard = self.cache_scheduler().wait(id).await;
        if !self.cache_manager().check_path(&msg.object_path) {
            return;
        }
        let Some(node) = self.cache_manager().get(id) else {
            // The parent's link notification pulls it in.
            tracing::debug!(node_id = id, "notification for uncached node skipped");
            return;
        };
        let cached = node.revision();
        if msg.revision <= cached {
            tracing::debug!(node_id = id, revision = msg.revision, cached, "stale node notification dropped");
            return;
        }
        if msg.update_type == UpdateType::NodeDelete {
            self.cache_manager().purge_cache_tree(id);
            return;
        }
        let mut props = msg.value.clone();
        fill_created(
            &mut props,
            &node.cached_properties(),
            node_prop::CREATED_BY,
            node_prop::CREATION_TIME,
        );
        node.set_immediate_properties(props);
    }

    async fn handle_link_notification(&self, msg: Notification) {
        let parent_id = msg.updated_obj_parent_id.as_str();
        let _guard = self.cache_scheduler().wait(parent_id).await;
        let Some(parent) = self.cache_manager().get(parent_id) else {
            tracing::debug!(parent_id, link_id = %msg.updated_obj_id, "link notification for uncached parent skipped");
            return;
        };
        let dest_type = msg.updated_obj_type.as_str();
        let dest_key = msg.updated_obj_key.as_str();
        let applied = match parent.links().get(dest_type, dest_key) {
            Some(existing) => apply_existing_link(&parent, existing, &msg),
            None if msg.update_type != UpdateType::LinkDelete => apply_new_link(&parent, &msg),
            None => {
                tracing::debug!(link_id = %msg.updated_obj_id, "delete for uncached link ignored");
                None
            }
        };
        let Some(link) = applied else {
            return;
        };
        if self.cache_manager().contains(&link.destination_node_id) {
            return;
        }
        if link.is_hard() {
            let covered = path_of_id(&link.destination_node_id)
                .is_some_and(|p| self.cache_manager().check_path(&p));
            if covered {
                self.load_node(parent_id, &link.destination_node_id, false, false)
                    .await;
            }
        } else if let Some(path) = link.soft_dest_path() {
            if self.cache_manager().check_path(&path) {
                self.populate_path_and_fetch_nodes(&path, false).await;
            }
        }
    }
}

/// Remove links (or rlinks) of `node` that are absent from the snapshot.
fn mark_and_sweep(node: &Node, snapshot: &[GraphLink], rlinks: bool) {
    let in_store: HashSet<(&str, &str)> = snapshot
        .iter()
        .filter_map(|l| Some((l.dest_type()?, l.dest_key()?)))
        .collect();
    let cached = if rlinks {
        node.links().all_rlinks()
    } else {
        node.links().all()
    };
    for (t, k, _) in cached {
        if in_store.contains(&(t.as_str(), k.as_str())) {
            continue;
        }
        if rlinks {
            node.delete_immediate_rlink(&t, &k);
        } else {
            node.delete_immediate_link(&t, &k);
        }
    }
}

fn apply_existing_link(parent: &Node, existing: GraphLink, msg: &Notification) -> Option<GraphLink> {
    let dest_type = msg.updated_obj_type.as_str();
    let dest_key = msg.updated_obj_key.as_str();
    let cached = existing.revision();
    if msg.revision != 0 && msg.revision <= cached {
        tracing::debug!(link_id = %existing.id, revision = msg.revision, cached, "stale link notification dropped");
        return None;
    }
    if msg.update_type == UpdateType::LinkDelete {
        parent.delete_immediate_link(dest_type, dest_key);
        return None;
    }
    let mut props = msg.value.clone();
    fill_created(
        &mut props,
        &existing.properties,
        link_prop::CREATED_BY,
        link_prop::CREATION_TIME,
    );
    let link = GraphLink {
        properties: props,
        ..existing
    };
    parent.upsert_immediate_link(dest_type, dest_key, link.clone());
    Some(link)
}

fn apply_new_link(parent: &Node, msg: &Notification) -> Option<GraphLink> {
    let mut props = msg.value.clone();
    let Some(dest_id) = get_str(&props, link_prop::DEST_NODE_ID).map(String::from) else {
        tracing::warn!(link_id = %msg.updated_obj_id, "link notification without destination id");
        return None;
    };
    props.insert(link_prop::REVISION.into(), msg.revision.into());
    let link = GraphLink {
        id: msg.updated_obj_id.clone(),
        link_type: get_str(&props, link_prop::NODE_TYPE)
            .unwrap_or(&msg.updated_obj_type)
            .to_string(),
        source_node_id: parent.id().to_string(),
        destination_node_id: dest_id,
        properties: props,
    };
    parent.upsert_immediate_link(&msg.updated_obj_type, &msg.updated_obj_key, link.clone());
    Some(link)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::link_callback;
    use crate::datamodel::test_model;
    use nexus_core::{path_of, FatalPolicy, NexusConfig, TraceId};
    use nexus_storage::{InMemoryKvStore, KvStore};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn props(v: Value) -> Properties {
        serde_json::from_value(v).expect("object")
    }

    async fn pair() -> (DataModel, DataModel) {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let config = NexusConfig {
            fatal_policy: FatalPolicy::Panic,
            ..NexusConfig::default()
        };
        let a = DataModel::connect("writer", Arc::clone(&kv), config.clone())
            .await
            .expect("connect");
        let b = DataModel::connect("reader", kv, config).await.expect("connect");
        (a, b)
    }

    fn node_msg(node: &Node, revision: i64, mut value: Properties) -> Notification {
        value.insert(node_prop::REVISION.into(), revision.into());
        Notification {
            object_path: node.full_path().clone(),
            update_type: UpdateType::NodeUpdate,
            updated_obj_id: node.id().to_string(),
            updated_obj_type: node.node_type().to_string(),
            updated_obj_key: node.key_value().to_string(),
            updated_obj_parent_id: String::new(),
            revision,
            value,
            trace_id: TraceId::new(node.full_path()),
        }
    }

    fn soft_link_props(dest_type: &str, dest_key: &str) -> Properties {
        let mut p = Properties::new();
        p.insert(link_prop::DEST_NODE_ID.into(), format!("/{dest_type}/{dest_key}").into());
        p.insert(link_prop::HARD_LINK.into(), "false".into());
        p.insert(link_prop::NODE_TYPE.into(), dest_type.into());
        p.insert(link_prop::NODE_KEY_VALUE.into(), dest_key.into());
        p
    }

    fn link_msg(parent_id: &str, dest_type: &str, dest_key: &str, revision: i64, update: UpdateType) -> Notification {
        let object_path = path_of_id(parent_id).unwrap_or_default();
        Notification {
            trace_id: TraceId::new(&object_path),
            object_path,
            update_type: update,
            updated_obj_id: nexus_storage::link_key(parent_id, dest_type, dest_key),
            updated_obj_type: dest_type.to_string(),
            updated_obj_key: dest_key.to_string(),
            updated_obj_parent_id: parent_id.to_string(),
            revision,
            value: soft_link_props(dest_type, dest_key),
        }
    }

    #[tokio::test]
    async fn test_node_notification_revision_is_authoritative() {
        let dm = test_model("rev").await;
        let root = dm.upsert_root_node("Config", "default", &Properties::new()).await;
        dm.subscribe(&path_of([("Config", "default")]), 0).await;
        let rev = root.revision();

        dm.handle_notification(node_msg(&root, rev, props(json!({"a": "stale"}))))
            .await;
        assert!(!root.cached_properties().contains_key("a"));

        dm.handle_notification(node_msg(&root, rev + 100, props(json!({"a": "fresh"}))))
            .await;
        assert_eq!(get_str(&root.cached_properties(), "a"), Some("fresh"));
        assert_eq!(root.revision(), rev + 100);

        dm.handle_notification(node_msg(&root, rev + 50, props(json!({"a": "older"}))))
            .await;
        assert_eq!(get_str(&root.cached_properties(), "a"), Some("fresh"));
    }

    #[tokio::test]
    async fn test_node_notification_ignored_when_unsubscribed() {
        let dm = test_model("unsub").await;
        let root = dm.upsert_root_node("Config", "default", &Properties::new()).await;
        let rev = root.revision();
        dm.handle_notification(node_msg(&root, rev + 10, props(json!({"a": "x"}))))
            .await;
        assert!(!root.cached_properties().contains_key("a"));
    }

    #[tokio::test]
    async fn test_link_notification_needs_cached_parent() {
        let dm = test_model("orphan").await;
        dm.handle_notification(link_msg("/X/x", "B", "b1", 100, UpdateType::LinkUpdate))
            .await;
        assert!(dm.get_cached_node("/X/x").is_none());
    }

    #[tokio::test]
    async fn test_link_notifications_add_then_delete() {
        let dm = test_model("links").await;
        let root = dm.upsert_root_node("A", "a1", &Properties::new()).await;
        let base = root.revision() + 100;

        dm.handle_notification(link_msg(root.id(), "B", "b1", base, UpdateType::LinkUpdate))
            .await;
        let link = root.links().get("B", "b1").expect("link cached");
        assert_eq!(link.destination_node_id, "/B/b1");
        assert_eq!(link.revision(), base);

        // Older delete is stale.
        dm.handle_notification(link_msg(root.id(), "B", "b1", base - 1, UpdateType::LinkDelete))
            .await;
        assert!(root.links().has("B", "b1"));

        dm.handle_notification(link_msg(root.id(), "B", "b1", base + 1, UpdateType::LinkDelete))
            .await;
        assert!(!root.links().has("B", "b1"));
    }

    #[tokio::test]
    async fn test_forced_sync_sweeps_links_missing_from_store() {
        let dm = test_model("sweep").await;
        let root = dm.upsert_root_node("A", "a1", &Properties::new()).await;
        let ghost = GraphLink {
            id: nexus_storage::link_key(root.id(), "B", "ghost"),
            link_type: "B".to_string(),
            source_node_id: root.id().to_string(),
            destination_node_id: "/B/ghost".to_string(),
            properties: soft_link_props("B", "ghost"),
        };
        root.upsert_immediate_link("B", "ghost", ghost);
        assert!(root.links().has("B", "ghost"));

        dm.sync(&root, true).await;
        assert!(!root.links().has("B", "ghost"));
    }

    #[tokio::test]
    async fn test_populate_path_walks_from_root() {
        let (writer, reader) = pair().await;
        let root = writer.upsert_root_node("Config", "default", &Properties::new()).await;
        let (tenant, _) = writer
            .upsert_node(root.id(), Some("name"), &Properties::new(), "Tenant", &props(json!({"name": "acme"})))
            .await;
        let (vpc, _) = writer
            .upsert_node(tenant.id(), None, &Properties::new(), "Vpc", &props(json!({"name": "v1"})))
            .await;

        let chain = reader
            .populate_path_and_fetch_nodes(vpc.full_path(), false)
            .await;
        let ids: Vec<&str> = chain.iter().map(Node::id).collect();
        assert_eq!(ids, vec![root.id(), tenant.id(), vpc.id()]);
        assert!(reader.get_cached_node(vpc.id()).is_some());

        let missing = path_of([("Config", "default"), ("Tenant", "nobody")]);
        assert!(reader.populate_path_and_fetch_nodes(&missing, false).await.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_unknown_node_is_none() {
        let dm = test_model("unknown").await;
        assert!(dm.load_node("", "/Nope/none", false, false).await.is_none());
        assert!(dm.get_cached_node("/Nope/none").is_none());
    }

    #[tokio::test]
    async fn test_retro_link_callback_reports_existing_links() {
        let dm = test_model("retro").await;
        let a = dm.upsert_root_node("A", "a1", &Properties::new()).await;
        let b = dm.upsert_root_node("B", "b1", &Properties::new()).await;
        a.upsert_link(&b, &Properties::new(), false, false).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        dm.register_link_cb(
            &path_of([("A", "a1")]),
            "B",
            link_callback(move |ev| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((ev.update, ev.dest_key));
                }
            }),
        );
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("callback fired")
            .expect("channel open");
        assert_eq!(got, (UpdateType::LinkAdd, "b1".to_string()));
    }
}
