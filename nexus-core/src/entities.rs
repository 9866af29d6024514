//! Graph records as read from and written to the store.

use crate::path::{last_segment, NodePathList};
use crate::props::{get_str, link_prop, node_prop, revision_of, Properties, DEFAULT_KEY_NAME};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A node record with its forward and reverse links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub node_type: String,
    pub properties: Properties,
    pub links: Vec<GraphLink>,
    pub rlinks: Vec<GraphLink>,
}

impl GraphNode {
    pub fn revision(&self) -> i64 {
        revision_of(&self.properties)
    }

    /// Name of the property holding this node's key.
    pub fn key_name(&self) -> &str {
        get_str(&self.properties, node_prop::KEY_NAME).unwrap_or(DEFAULT_KEY_NAME)
    }
}

/// A directed edge record.
///
/// Hard links express ownership; soft links are cross references that carry
/// the destination's full path and are mirrored by an rlink on the
/// destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphLink {
    pub id: String,
    pub link_type: String,
    pub source_node_id: String,
    pub destination_node_id: String,
    pub properties: Properties,
}

impl GraphLink {
    pub fn is_hard(&self) -> bool {
        get_str(&self.properties, link_prop::HARD_LINK) == Some("true")
    }

    pub fn revision(&self) -> i64 {
        revision_of(&self.properties)
    }

    /// Destination type, from properties or the destination id.
    pub fn dest_type(&self) -> Option<&str> {
        get_str(&self.properties, link_prop::NODE_TYPE)
            .or_else(|| last_segment(&self.destination_node_id).map(|(t, _)| t))
    }

    /// Destination key value, from properties or the destination id.
    pub fn dest_key(&self) -> Option<&str> {
        get_str(&self.properties, link_prop::NODE_KEY_VALUE)
            .or_else(|| last_segment(&self.destination_node_id).map(|(_, k)| k))
    }

    /// Destination path of a soft link, if recorded.
    pub fn soft_dest_path(&self) -> Option<NodePathList> {
        get_str(&self.properties, link_prop::SOFT_LINK_DEST_PATH)
            .and_then(|s| crate::path::path_from_json(s).ok())
    }
}

/// One end of a link being upserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEnd {
    pub node_id: String,
    pub node_type: String,
    pub key_name: String,
    pub key_value: String,
    pub path: NodePathList,
}

/// Request to create or update a soft link and its rlink.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertLinkRequest {
    pub source: LinkEnd,
    pub destination: LinkEnd,
    pub link_type: String,
    pub properties: Properties,
    pub singleton: bool,
}

/// Kind of change delivered to callbacks and carried by notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateType {
    NodeAdd,
    NodeUpdate,
    NodeDelete,
    LinkAdd,
    LinkUpdate,
    LinkDelete,
}

impl UpdateType {
    pub fn is_delete(self) -> bool {
        matches!(self, UpdateType::NodeDelete | UpdateType::LinkDelete)
    }

    pub fn is_link(self) -> bool {
        matches!(
            self,
            UpdateType::LinkAdd | UpdateType::LinkUpdate | UpdateType::LinkDelete
        )
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateType::NodeAdd => "NodeAdd",
            UpdateType::NodeUpdate => "NodeUpdate",
            UpdateType::NodeDelete => "NodeDelete",
            UpdateType::LinkAdd => "LinkAdd",
            UpdateType::LinkUpdate => "LinkUpdate",
            UpdateType::LinkDelete => "LinkDelete",
        };
        f.write_str(s)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_link_destination_fallback_to_id() {
        let link = GraphLink {
            id: "/A/a/_links/B/b".into(),
            link_type: "B".into(),
            source_node_id: "/A/a".into(),
            destination_node_id: "/A/a/B/b".into(),
            properties: Properties::new(),
        };
        assert_eq!(link.dest_type(), Some("B"));
        assert_eq!(link.dest_key(), Some("b"));
        assert!(!link.is_hard());
    }

    #[test]
    fn test_link_soft_dest_path() {
        let mut properties = Properties::new();
        properties.insert(
            link_prop::SOFT_LINK_DEST_PATH.into(),
            json!(r#"[["Config","default"],["User","bob"]]"#),
        );
        properties.insert(link_prop::HARD_LINK.into(), json!("false"));
        let link = GraphLink {
            id: "/Config/default/_links/User/bob".into(),
            link_type: "User".into(),
            source_node_id: "/Config/default".into(),
            destination_node_id: "/Config/default/User/bob".into(),
            properties,
        };
        let path = link.soft_dest_path().expect("soft path should parse");
        assert_eq!(path.len(), 2);
        assert_eq!(path[1].key, "bob");
    }

    #[test]
    fn test_update_type_classes() {
        assert!(UpdateType::NodeDelete.is_delete());
        assert!(!UpdateType::LinkAdd.is_delete());
        assert!(UpdateType::LinkUpdate.is_link());
        assert_eq!(UpdateType::NodeUpdate.to_string(), "NodeUpdate");
    }
}
