//! Cached graph nodes.
//!
//! A [`Node`] is a cheap handle onto state owned by the cache table. The
//! only back reference a node keeps is a weak pointer to its parent; links
//! and reverse links name other nodes by id.

mod links;
mod ops;

pub use links::LinkManager;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use nexus_core::{
    get_str, link_prop, node_prop, path_of_id, path_to_json, revision_of, GraphLink, NodePathList,
    Properties, DEFAULT_KEY_NAME,
};
use parking_lot::RwLock;
use serde_json::Value;

use crate::datamodel::{DataModel, DataModelInner};

/// Ancestor hops after which parent traversal is considered corrupt.
const MAX_PARENT_HOPS: u32 = 32;

/// A soft link some other node holds towards this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseLink {
    /// Key under which the source stores the link.
    pub key: String,
    pub link_id: String,
}

struct NodeState {
    properties: Properties,
    parent: Option<Weak<NodeInner>>,
    /// Source node id to the soft link it holds towards this node.
    reverse: HashMap<String, ReverseLink>,
    deleted: bool,
    to_be_deleted: bool,
    delete_completed: bool,
}

pub(crate) struct NodeInner {
    id: String,
    node_type: String,
    key_name: String,
    key_value: String,
    path: NodePathList,
    dm: Weak<DataModelInner>,
    links: LinkManager,
    state: RwLock<NodeState>,
}

/// Handle to a cached node.
#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.0.id)
            .field("revision", &self.revision())
            .finish()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Node {
    pub(crate) fn new(
        dm: &DataModel,
        id: &str,
        node_type: &str,
        key_name: &str,
        properties: Properties,
    ) -> Self {
        let path = path_of_id(id).unwrap_or_default();
        let key_value = path.last().map(|p| p.key.clone()).unwrap_or_default();
        let key_name = if key_name.is_empty() {
            DEFAULT_KEY_NAME
        } else {
            key_name
        };
        let to_be_deleted = is_marked_to_be_deleted(&properties);
        Node(Arc::new(NodeInner {
            id: id.to_string(),
            node_type: node_type.to_string(),
            key_name: key_name.to_string(),
            key_value,
            path,
            dm: dm.downgrade(),
            links: LinkManager::new(),
            state: RwLock::new(NodeState {
                properties,
                parent: None,
                reverse: HashMap::new(),
                deleted: false,
                to_be_deleted,
                delete_completed: false,
            }),
        }))
    }

    pub(crate) fn dm(&self) -> Option<DataModel> {
        self.0.dm.upgrade().map(DataModel::from_inner)
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn node_type(&self) -> &str {
        &self.0.node_type
    }

    pub fn key_name(&self) -> &str {
        &self.0.key_name
    }

    pub fn key_value(&self) -> &str {
        &self.0.key_value
    }

    /// Path derived from the node id.
    pub fn full_path(&self) -> &NodePathList {
        &self.0.path
    }

    pub fn links(&self) -> &LinkManager {
        &self.0.links
    }

    /// Cached properties without a store round trip.
    pub fn cached_properties(&self) -> Properties {
        self.0.state.read().properties.clone()
    }

    pub fn revision(&self) -> i64 {
        revision_of(&self.0.state.read().properties)
    }

    pub fn parent(&self) -> Option<Node> {
        self.0
            .state
            .read()
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Node)
    }

    pub(crate) fn set_parent(&self, parent: Option<&Node>) {
        self.0.state.write().parent = parent.map(|p| Arc::downgrade(&p.0));
    }

    // ------------------------------------------------------------------
    // Lifecycle flags
    // ------------------------------------------------------------------

    pub fn is_deleted(&self) -> bool {
        self.0.state.read().deleted
    }

    pub(crate) fn set_deleted(&self) {
        self.0.state.write().deleted = true;
    }

    pub fn is_to_be_deleted(&self) -> bool {
        self.0.state.read().to_be_deleted
    }

    pub(crate) fn set_to_be_deleted(&self) {
        self.0.state.write().to_be_deleted = true;
    }

    pub fn is_delete_completed(&self) -> bool {
        self.0.state.read().delete_completed
    }

    pub(crate) fn set_delete_completed(&self) {
        self.0.state.write().delete_completed = true;
    }

    /// True if this node or any ancestor finished deletion.
    ///
    /// # Panics
    ///
    /// Panics if the parent chain is deeper than 32 hops.
    pub fn is_any_parent_deleted(&self) -> bool {
        self.any_parent_deleted(0)
    }

    fn any_parent_deleted(&self, hops: u32) -> bool {
        if self.is_delete_completed() {
            return true;
        }
        let Some(parent) = self.parent() else {
            return false;
        };
        assert!(
            hops <= MAX_PARENT_HOPS,
            "parent chain of {} exceeds {MAX_PARENT_HOPS} hops",
            self.0.id
        );
        parent.any_parent_deleted(hops + 1)
    }

    // ------------------------------------------------------------------
    // Reverse soft-link bookkeeping
    // ------------------------------------------------------------------

    pub(crate) fn add_reverse_link(&self, source_id: &str, key: &str, link_id: &str) {
        self.0.state.write().reverse.insert(
            source_id.to_string(),
            ReverseLink {
                key: key.to_string(),
                link_id: link_id.to_string(),
            },
        );
    }

    pub(crate) fn remove_reverse_link(&self, source_id: &str) {
        self.0.state.write().reverse.remove(source_id);
    }

    /// Snapshot of `(source id, reverse link)` pairs.
    pub fn reverse_links(&self) -> Vec<(String, ReverseLink)> {
        self.0
            .state
            .read()
            .reverse
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    // ------------------------------------------------------------------
    // Immediate (cache only) mutations
    // ------------------------------------------------------------------

    /// Replace the cached properties and fire node update callbacks.
    /// Properties older than the cached revision are ignored.
    pub(crate) fn set_immediate_properties(&self, new: Properties) {
        let old = {
            let mut st = self.0.state.write();
            if st.deleted {
                return;
            }
            let (cached, incoming) = (revision_of(&st.properties), revision_of(&new));
            if incoming < cached {
                tracing::debug!(node_id = %self.0.id, incoming, cached, "older properties ignored");
                return;
            }
            if is_marked_to_be_deleted(&new) {
                st.to_be_deleted = true;
            }
            std::mem::replace(&mut st.properties, new.clone())
        };
        if let Some(dm) = self.dm() {
            dm.cache_manager().do_node_update_callbacks(self, old, new);
        }
    }

    /// Drop a cached link and fire link delete callbacks. Dropping a soft
    /// link also clears the reverse link and rlink cached on its
    /// destination.
    pub(crate) fn delete_immediate_link(&self, dest_type: &str, dest_key: &str) {
        let old = self.0.links.delete(dest_type, dest_key);
        tracing::debug!(node_id = %self.0.id, dest_type, dest_key, existed = old.is_some(), "link removed from cache");
        let (Some(old), Some(dm)) = (old, self.dm()) else {
            return;
        };
        if !old.is_hard() {
            if let Some(dest) = dm.cache_manager().get(&old.destination_node_id) {
                dest.remove_reverse_link(&self.0.id);
                if dm.rlink_enabled() {
                    dest.0.links.delete_rlink(&self.0.node_type, &self.0.key_value);
                }
            }
        }
        dm.cache_manager()
            .do_link_delete_callbacks(self, dest_type, dest_key, old.properties);
    }

    pub(crate) fn delete_immediate_rlink(&self, src_type: &str, src_key: &str) {
        self.assert_rlink_enabled();
        self.0.links.delete_rlink(src_type, src_key);
    }

    /// Insert or replace a cached link and fire link callbacks. A soft link
    /// to a cached destination also refreshes the destination's rlink.
    pub(crate) fn upsert_immediate_link(&self, dest_type: &str, dest_key: &str, link: GraphLink) {
        let cur = self.0.links.add(dest_type, dest_key, link.clone());
        let Some(dm) = self.dm() else {
            return;
        };
        if dm.rlink_enabled()
            && get_str(&link.properties, link_prop::HARD_LINK) == Some("false")
            && !link.properties.contains_key(link_prop::RSOFT_LINK_DEST_PATH)
            && link.properties.contains_key(link_prop::SOFT_LINK_DEST_PATH)
        {
            if let Some(dest) = dm.cache_manager().get(&link.destination_node_id) {
                let rlink = self.reverse_link_for(&link);
                dest.upsert_immediate_rlink(self.node_type(), self.key_value(), rlink);
            }
        }
        let key = get_str(&link.properties, link_prop::NODE_KEY_VALUE)
            .unwrap_or(dest_key)
            .to_string();
        let ty = get_str(&link.properties, link_prop::NODE_TYPE)
            .unwrap_or(dest_type)
            .to_string();
        dm.spawn_link_update_callbacks(self.clone(), key, ty, cur, link);
    }

    pub(crate) fn upsert_immediate_rlink(&self, src_type: &str, src_key: &str, rlink: GraphLink) {
        self.assert_rlink_enabled();
        tracing::debug!(node_id = %self.0.id, src_type, src_key, "rlink cached");
        self.0.links.add_rlink(src_type, src_key, rlink);
    }

    /// The rlink record mirroring soft `link` from this node, as the store
    /// would hold it under the destination.
    fn reverse_link_for(&self, link: &GraphLink) -> GraphLink {
        let mut props = Properties::new();
        if let Some(by) = link.properties.get(link_prop::CREATED_BY) {
            props.insert(link_prop::CREATED_BY.into(), by.clone());
            props.insert(link_prop::UPDATED_BY.into(), by.clone());
        }
        if let Some(at) = link.properties.get(link_prop::CREATION_TIME) {
            props.insert(link_prop::CREATION_TIME.into(), at.clone());
            props.insert(
                link_prop::UPDATE_TIME.into(),
                link.properties
                    .get(link_prop::UPDATE_TIME)
                    .cloned()
                    .unwrap_or_else(|| at.clone()),
            );
        }
        props.insert(link_prop::HARD_LINK.into(), Value::from("false"));
        props.insert(link_prop::NODE_KEY_NAME.into(), Value::from(self.key_name()));
        props.insert(link_prop::NODE_KEY_VALUE.into(), Value::from(self.key_value()));
        props.insert(link_prop::NODE_TYPE.into(), Value::from(self.node_type()));
        props.insert(
            link_prop::RSOFT_LINK_DEST_PATH.into(),
            Value::from(path_to_json(self.full_path())),
        );
        props.insert(link_prop::DEST_NODE_ID.into(), Value::from(link.source_node_id.as_str()));
        props.insert(link_prop::FORWARD_LINK_ID.into(), Value::from(link.id.as_str()));
        GraphLink {
            id: nexus_storage::rlink_key(&link.destination_node_id, self.node_type(), self.key_value()),
            link_type: self.node_type().to_string(),
            source_node_id: link.destination_node_id.clone(),
            destination_node_id: link.source_node_id.clone(),
            properties: props,
        }
    }

    fn assert_rlink_enabled(&self) {
        if let Some(dm) = self.dm() {
            assert!(
                dm.rlink_enabled(),
                "rlink operation on {} with the rlink feature disabled",
                self.0.id
            );
        }
    }
}

pub(crate) fn is_marked_to_be_deleted(props: &Properties) -> bool {
    match props.get(node_prop::TO_BE_DELETED) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "true",
        _ => false,
    }
}
