//! Node table, subscription tree and callback dispatch.

use dashmap::DashMap;
use nexus_core::{
    path_to_json, props_differ, NodePath, NodePathList, Properties, UpdateType,
    NODE_DIFF_EXCLUDE,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use super::subtree::SubscriptionTree;
use crate::callback::{LinkCallback, LinkEvent, NodeCallback, NodeEvent};
use crate::node::{is_marked_to_be_deleted, Node};
use crate::scheduler::Scheduler;

pub(crate) struct CacheManager {
    name: String,
    nodes: DashMap<String, Node>,
    tree: Mutex<SubscriptionTree>,
    /// Orders link add/update callbacks per `source/destType/destKey`.
    pub(crate) cb_scheduler: Scheduler,
}

fn spawn_node_callbacks(cbs: Vec<NodeCallback>, ev: NodeEvent) {
    for cb in cbs {
        tokio::spawn(cb(ev.clone()));
    }
}

impl CacheManager {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            nodes: DashMap::new(),
            tree: Mutex::new(SubscriptionTree::new()),
            cb_scheduler: Scheduler::new(format!("{name}-cb")),
        }
    }

    /// Cached node regardless of its delete state.
    pub(crate) fn get(&self, id: &str) -> Option<Node> {
        self.nodes.get(id).map(|n| n.value().clone())
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub(crate) fn is_present_and_valid(&self, id: &str) -> bool {
        self.nodes.get(id).is_some_and(|n| !n.is_deleted())
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn check_path(&self, path: &[NodePath]) -> bool {
        self.tree.lock().check_path(path)
    }

    pub(crate) fn is_node_subscribed(&self, id: &str) -> bool {
        match self.get(id) {
            Some(n) => self.check_path(n.full_path()),
            None => false,
        }
    }

    /// Insert `node` under `parent_id`, firing node add callbacks.
    ///
    /// A non-root whose parent is not cached is refused: it is expected to
    /// go away with a delete already running up its parent chain.
    pub(crate) fn write_to_cache(&self, parent_id: &str, node: &Node) -> bool {
        let parent = if parent_id.is_empty() {
            None
        } else {
            self.get(parent_id)
        };
        match parent {
            Some(p) => node.set_parent(Some(&p)),
            None if node.full_path().len() > 1 => {
                tracing::warn!(cache = %self.name, node_id = %node.id(), parent_id, "refusing to cache node without parent");
                return false;
            }
            None => {}
        }
        tracing::debug!(cache = %self.name, node_id = %node.id(), parent_id, "node cached");
        self.nodes.insert(node.id().to_string(), node.clone());
        let cbs = {
            let mut tree = self.tree.lock();
            tree.add_cached(node.id(), node.full_path());
            tree.node_callbacks(node.full_path())
        };
        spawn_node_callbacks(
            cbs,
            NodeEvent {
                node: node.clone(),
                update: UpdateType::NodeAdd,
                old: None,
                new: Some(node.cached_properties()),
            },
        );
        true
    }

    /// Drop `id` and its hard-linked subtree from the cache.
    ///
    /// Soft links leaving the subtree, the parent's link and every cached
    /// soft link pointing into the subtree are removed with delete
    /// callbacks.
    pub(crate) fn purge_cache_tree(&self, id: &str) {
        let Some(node) = self.get(id) else {
            return;
        };
        if node.is_delete_completed() {
            return;
        }
        for (dest_type, dest_key, link) in node.links().all() {
            if link.is_hard() {
                self.purge_cache_tree(&link.destination_node_id);
            } else {
                node.delete_immediate_link(&dest_type, &dest_key);
            }
        }
        if let Some(parent) = node.parent() {
            parent.delete_immediate_link(node.node_type(), node.key_value());
        }
        for (source_id, rev) in node.reverse_links() {
            if let Some(src) = self.get(&source_id) {
                if src.links().has(node.node_type(), &rev.key) {
                    src.delete_immediate_link(node.node_type(), &rev.key);
                }
            }
        }
        self.purge_entry(&node);
    }

    fn purge_entry(&self, node: &Node) {
        let cbs = self.tree.lock().node_callbacks(node.full_path());
        spawn_node_callbacks(
            cbs,
            NodeEvent {
                node: node.clone(),
                update: UpdateType::NodeDelete,
                old: Some(node.cached_properties()),
                new: None,
            },
        );
        node.set_deleted();
        node.set_delete_completed();
        self.nodes.remove(node.id());
        self.tree.lock().del_cached(node.id(), node.full_path());
        tracing::debug!(cache = %self.name, node_id = %node.id(), "node purged");
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    pub(crate) fn add_subscription(&self, path: &[NodePath], depth: u32) -> Vec<String> {
        self.tree.lock().add_subscription(path, depth)
    }

    pub(crate) fn del_subscription(&self, path: &[NodePath]) {
        self.tree.lock().del_subscription(path);
    }

    pub(crate) fn register_node_cb(&self, path: &[NodePath], cb: NodeCallback) -> Vec<String> {
        self.tree.lock().register_node_cb(path, cb)
    }

    pub(crate) fn register_link_cb(
        &self,
        path: &[NodePath],
        dest_type: &str,
        cb: LinkCallback,
    ) -> Vec<String> {
        self.tree.lock().register_link_cb(path, dest_type, cb)
    }

    pub(crate) fn link_callbacks(&self, path: &[NodePath], dest_type: &str) -> Vec<LinkCallback> {
        self.tree.lock().link_callbacks(path, dest_type)
    }

    // ------------------------------------------------------------------
    // Callback dispatch
    // ------------------------------------------------------------------

    /// Fire node update callbacks unless only excluded metadata changed.
    /// Becoming marked for deletion always counts as a change.
    pub(crate) fn do_node_update_callbacks(&self, node: &Node, old: Properties, new: Properties) {
        let marked = !is_marked_to_be_deleted(&old) && is_marked_to_be_deleted(&new);
        if !marked && !props_differ(&old, &new, NODE_DIFF_EXCLUDE) {
            return;
        }
        let cbs = self.tree.lock().node_callbacks(node.full_path());
        if cbs.is_empty() {
            return;
        }
        tracing::debug!(cache = %self.name, node_id = %node.id(), callbacks = cbs.len(), "node update callbacks");
        spawn_node_callbacks(
            cbs,
            NodeEvent {
                node: node.clone(),
                update: UpdateType::NodeUpdate,
                old: Some(old),
                new: Some(new),
            },
        );
    }

    pub(crate) fn do_link_delete_callbacks(
        &self,
        node: &Node,
        dest_type: &str,
        dest_key: &str,
        old: Properties,
    ) {
        let cbs = self.link_callbacks(node.full_path(), dest_type);
        tracing::debug!(cache = %self.name, node_id = %node.id(), dest_type, dest_key, callbacks = cbs.len(), "link delete callbacks");
        let ev = LinkEvent {
            node: node.clone(),
            update: UpdateType::LinkDelete,
            dest_type: dest_type.to_string(),
            dest_key: dest_key.to_string(),
            old: Some(old),
            new: None,
        };
        for cb in cbs {
            tokio::spawn(cb(ev.clone()));
        }
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    pub(crate) fn cached_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub(crate) fn subscriptions(&self) -> Vec<(NodePathList, u32, u32)> {
        self.tree.lock().subscriptions()
    }

    pub(crate) fn dump(&self) -> Value {
        let mut nodes = Map::new();
        for id in self.cached_ids() {
            let Some(n) = self.get(&id) else {
                continue;
            };
            let links: Vec<Value> = n
                .links()
                .all()
                .into_iter()
                .map(|(t, k, l)| json!({"type": t, "key": k, "id": l.id, "dest": l.destination_node_id}))
                .collect();
            let rlinks: Vec<Value> = n
                .links()
                .all_rlinks()
                .into_iter()
                .map(|(t, k, l)| json!({"type": t, "key": k, "id": l.id, "source": l.destination_node_id}))
                .collect();
            nodes.insert(
                id,
                json!({
                    "type": n.node_type(),
                    "path": path_to_json(n.full_path()),
                    "parent": n.parent().map(|p| p.id().to_string()),
                    "properties": n.cached_properties(),
                    "links": links,
                    "rlinks": rlinks,
                    "deleted": n.is_deleted(),
                    "toBeDeleted": n.is_to_be_deleted(),
                }),
            );
        }
        json!({
            "name": self.name,
            "subscriptionTree": self.tree.lock().dump(),
            "nodes": nodes,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
