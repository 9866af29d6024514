//! Store-backed node operations.
//!
//! Every mutation here goes through the [`DataModel`], which writes the
//! store first and then applies the result to the cache.

use nexus_core::{
    GraphLink, LinkEnd, NodePath, NodePathList, Properties, UpsertLinkRequest,
    SINGLETON_KEY_VALUE,
};

use super::Node;
use crate::datamodel::DataModel;

fn require_args(key: &str, node_type: &str) {
    assert!(
        !key.is_empty() && !node_type.is_empty(),
        "invalid arguments key={key:?} node_type={node_type:?}"
    );
}

impl Node {
    fn require_dm(&self) -> Option<DataModel> {
        let dm = self.dm();
        if dm.is_none() {
            tracing::warn!(node_id = %self.id(), "data model dropped, operation skipped");
        }
        dm
    }

    /// Re-read this node from the store unless a subscription keeps it
    /// current; `forced` always re-reads.
    pub async fn sync(&self, forced: bool) {
        if let Some(dm) = self.require_dm() {
            dm.sync(self, forced).await;
        }
    }

    /// Current properties, or `None` once the node is deleted. Unsubscribed
    /// nodes are refreshed from the store first.
    pub async fn get_properties(&self) -> Option<Properties> {
        if self.is_deleted() {
            return None;
        }
        let dm = self.require_dm()?;
        dm.sync_node_property(self, false).await;
        Some(self.cached_properties())
    }

    /// Write properties. With `merge` unset, user properties absent from
    /// `props` are removed first; reserved names and the key are kept.
    pub async fn set_properties(&self, props: &Properties, merge: bool) {
        let Some(dm) = self.require_dm() else {
            return;
        };
        if !merge {
            let to_delete: Vec<String> = {
                let cur = self.cached_properties();
                cur.keys()
                    .filter(|k| {
                        !props.contains_key(k.as_str())
                            && !k.starts_with('_')
                            && k.as_str() != self.key_name()
                    })
                    .cloned()
                    .collect()
            };
            if !to_delete.is_empty() {
                dm.update_node_remove_properties(self.id(), &to_delete).await;
            }
        }
        dm.update_node_add_properties(self.id(), props).await;
    }

    pub async fn del_properties(&self, keys: &[String]) {
        if let Some(dm) = self.require_dm() {
            dm.update_node_remove_properties(self.id(), keys).await;
        }
    }

    /// Create or update a child reached through a hard link.
    ///
    /// # Panics
    ///
    /// Panics if `node_type` or `key_name` is empty, or `props` lacks the
    /// key property.
    pub async fn upsert_child(
        &self,
        node_type: &str,
        key_name: &str,
        props: &Properties,
        link_props: &Properties,
    ) -> Option<(Node, GraphLink)> {
        require_args(key_name, node_type);
        let dm = self.require_dm()?;
        tracing::debug!(node_id = %self.id(), node_type, key_name, "upsert child");
        Some(
            dm.upsert_node(self.id(), Some(key_name), link_props, node_type, props)
                .await,
        )
    }

    /// Create or update a soft link from this node to `dest`.
    ///
    /// The link is keyed by the destination key, by the colon-joined
    /// destination path with `use_path_key`, or by `"default"` for a
    /// singleton.
    pub async fn upsert_link(
        &self,
        dest: &Node,
        link_props: &Properties,
        singleton: bool,
        use_path_key: bool,
    ) -> Option<GraphLink> {
        let dm = self.require_dm()?;
        let mut key_value = dest.key_value().to_string();
        if use_path_key {
            key_value = dest
                .full_path()
                .iter()
                .flat_map(|p| [p.node_type.as_str(), p.key.as_str()])
                .collect::<Vec<_>>()
                .join(":");
        }
        if singleton {
            key_value = SINGLETON_KEY_VALUE.to_string();
        }
        let req = UpsertLinkRequest {
            source: LinkEnd {
                node_id: self.id().to_string(),
                node_type: self.node_type().to_string(),
                key_name: self.key_name().to_string(),
                key_value: self.key_value().to_string(),
                path: self.full_path().clone(),
            },
            destination: LinkEnd {
                node_id: dest.id().to_string(),
                node_type: dest.node_type().to_string(),
                key_name: dest.key_name().to_string(),
                key_value: key_value.clone(),
                path: dest.full_path().clone(),
            },
            link_type: dest.node_type().to_string(),
            properties: link_props.clone(),
            singleton,
        };
        let link = dm.upsert_link(&req).await;
        dest.add_reverse_link(self.id(), &key_value, &link.id);
        Some(link)
    }

    /// Delete the link to `(dest_type, dest_key)`. Returns true if it
    /// resolved to at least one soft-linked destination.
    pub async fn delete_link(&self, dest_key: &str, dest_type: &str) -> bool {
        let Some(dm) = self.require_dm() else {
            return false;
        };
        let legs = self.get_soft_linked_child_leg(dest_key, dest_type).await;
        for leg in &legs {
            leg.remove_reverse_link(self.id());
        }
        dm.delete_link(self.id(), dest_type, dest_key).await;
        !legs.is_empty()
    }

    /// Delete the link of type `dest_type` pointing at `dest`.
    pub async fn delete_link_to_node(&self, dest: &Node, dest_type: &str) -> bool {
        let key = self
            .links()
            .of_type(dest_type)
            .into_iter()
            .find(|(_, l)| l.destination_node_id == dest.id())
            .map(|(k, _)| k);
        match key {
            Some(k) => self.delete_link(&k, dest_type).await,
            None => {
                tracing::debug!(node_id = %self.id(), dest = %dest.id(), "no link to destination");
                false
            }
        }
    }

    /// Delete this node and everything it owns.
    pub async fn delete(&self) {
        let Some(dm) = self.require_dm() else {
            return;
        };
        let parent = self.parent();
        self.set_to_be_deleted();
        dm.delete(self).await;
        self.set_deleted();
        if let Some(p) = parent {
            if p.links().has(self.node_type(), self.key_value()) {
                dm.delete_link(p.id(), self.node_type(), self.key_value()).await;
            }
        }
    }

    /// Child reached through the link `(dest_type, dest_key)` together with
    /// the link properties, fetching it if needed.
    ///
    /// # Panics
    ///
    /// Panics if either argument is empty.
    pub async fn get_child(
        &self,
        dest_key: &str,
        dest_type: &str,
        forced: bool,
    ) -> Option<(Node, Properties)> {
        require_args(dest_key, dest_type);
        let dm = self.require_dm()?;
        dm.sync_child(self, dest_type, dest_key, forced).await;
        let link = self.links().get(dest_type, dest_key)?;
        let child = dm
            .get_node(self.id(), dest_type, &link.destination_node_id, false, false)
            .await?;
        Some((child, link.properties))
    }

    /// Like [`get_child`](Node::get_child) without any store access.
    pub fn get_cached_child(&self, dest_key: &str, dest_type: &str) -> Option<(Node, Properties)> {
        require_args(dest_key, dest_type);
        let link = self.links().get(dest_type, dest_key)?;
        let child = self.dm()?.get_cached_node(&link.destination_node_id)?;
        Some((child, link.properties))
    }

    /// Nodes along the destination path of the soft link
    /// `(dest_type, dest_key)`, root first.
    ///
    /// # Panics
    ///
    /// Panics if the link is a hard link.
    pub async fn get_soft_linked_child_leg(&self, dest_key: &str, dest_type: &str) -> Vec<Node> {
        require_args(dest_key, dest_type);
        let Some(dm) = self.require_dm() else {
            return Vec::new();
        };
        dm.sync_child(self, dest_type, dest_key, false).await;
        let Some(link) = self.links().get(dest_type, dest_key) else {
            return Vec::new();
        };
        assert!(
            !link.is_hard(),
            "soft link lookup on hard link {}",
            link.id
        );
        let Some(path) = link.soft_dest_path() else {
            tracing::warn!(link_id = %link.id, "soft link has no destination path");
            return Vec::new();
        };
        dm.populate_path_and_fetch_nodes(&path, false).await
    }

    /// Properties of the link `(dest_type, dest_key)`.
    pub async fn get_child_link(&self, dest_key: &str, dest_type: &str) -> Option<Properties> {
        require_args(dest_key, dest_type);
        if let Some(dm) = self.require_dm() {
            dm.sync_child(self, dest_type, dest_key, false).await;
        }
        self.links().get(dest_type, dest_key).map(|l| l.properties)
    }

    /// Cached hard-linked children with their links, optionally filtered by
    /// type. Children that are not cached are skipped.
    pub fn cached_children(&self, dest_type: Option<&str>) -> Vec<(Node, GraphLink)> {
        let Some(dm) = self.dm() else {
            return Vec::new();
        };
        let links: Vec<GraphLink> = match dest_type {
            Some(t) => self.links().of_type(t).into_iter().map(|(_, l)| l).collect(),
            None => self.links().all().into_iter().map(|(_, _, l)| l).collect(),
        };
        links
            .into_iter()
            .filter(GraphLink::is_hard)
            .filter_map(|l| dm.get_cached_node(&l.destination_node_id).map(|n| (n, l)))
            .collect()
    }

    /// Cached sources of rlinks into this node, optionally filtered by
    /// source type.
    ///
    /// # Panics
    ///
    /// Panics if the rlink feature is disabled.
    pub fn cached_rlinks(&self, src_type: Option<&str>) -> Vec<(Node, GraphLink)> {
        self.assert_rlink_enabled();
        let Some(dm) = self.dm() else {
            return Vec::new();
        };
        let rlinks: Vec<GraphLink> = match src_type {
            Some(t) => self.links().rlinks_of_type(t).into_iter().map(|(_, l)| l).collect(),
            None => self.links().all_rlinks().into_iter().map(|(_, _, l)| l).collect(),
        };
        rlinks
            .into_iter()
            .filter_map(|l| dm.get_cached_node(&l.destination_node_id).map(|n| (n, l)))
            .collect()
    }

    /// Up to `count` child keys of `dest_type` after `start`, read from the
    /// store.
    pub async fn next_child_key_list(&self, dest_type: &str, start: &str, count: usize) -> Vec<String> {
        match self.require_dm() {
            Some(dm) => dm.next_child_key_list(self.id(), dest_type, start, count).await,
            None => Vec::new(),
        }
    }

    /// Up to `count` rlink source ids of `src_type` after `start`, read from
    /// the store.
    pub async fn next_rlink_child_key_list(&self, src_type: &str, start: &str, count: usize) -> Vec<String> {
        self.assert_rlink_enabled();
        match self.require_dm() {
            Some(dm) => dm.next_rlink_child_key_list(self.id(), src_type, start, count).await,
            None => Vec::new(),
        }
    }

    /// The cached child key following `after` among links to `dest_type`.
    /// Starting a walk (empty `after`) schedules a background sync.
    pub fn next_child_key(&self, dest_type: &str, after: &str) -> Option<String> {
        assert!(!dest_type.is_empty(), "next_child_key needs a node type");
        if after.is_empty() {
            let node = self.clone();
            tokio::spawn(async move {
                if node.dm().is_some_and(|dm| dm.is_running()) {
                    node.sync(false).await;
                }
            });
        }
        self.links().next_key(dest_type, after)
    }

    pub async fn link_add_property(&self, dest_key: &str, dest_type: &str, props: &Properties) -> bool {
        if self.is_deleted() {
            return false;
        }
        match self.require_dm() {
            Some(dm) => dm.update_link_add_property(self.id(), dest_type, dest_key, props).await,
            None => false,
        }
    }

    pub async fn link_remove_property(&self, dest_key: &str, dest_type: &str, keys: &[String]) -> bool {
        if self.is_deleted() {
            return false;
        }
        match self.require_dm() {
            Some(dm) => {
                dm.update_link_remove_property(self.id(), dest_type, dest_key, keys)
                    .await
            }
            None => false,
        }
    }

    /// Subscribe to `pattern` on this node's data model.
    pub async fn subscribe(&self, pattern: &[NodePath], depth: u32) -> Vec<String> {
        match self.require_dm() {
            Some(dm) => dm.subscribe(pattern, depth).await,
            None => Vec::new(),
        }
    }

    pub fn unsubscribe(&self, pattern: &[NodePath]) {
        if let Some(dm) = self.require_dm() {
            dm.unsubscribe(pattern);
        }
    }

    /// Path of the child `(node_type, key)` below this node.
    pub fn child_path(&self, node_type: &str, key: &str) -> NodePathList {
        let mut path = self.full_path().clone();
        path.push(NodePath::new(node_type, key));
        path
    }
}
