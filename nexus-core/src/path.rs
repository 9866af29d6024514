//! Node paths and NodeID encoding.
//!
//! A node is identified by its path from a root: an ordered list of
//! `(type, key)` segments. The NodeID is the string encoding
//! `/<Type>/<Key>/<Type>/<Key>...`. Root nodes have a single segment.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wildcard key matching any key at a subscription level.
pub const WILDCARD_KEY: &str = "*";

/// One `(type, key)` hop of a node path.
///
/// Serialized as a two element array `["Type", "key"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct NodePath {
    pub node_type: String,
    pub key: String,
}

/// Full path of a node from its root.
pub type NodePathList = Vec<NodePath>;

impl NodePath {
    pub fn new(node_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            key: key.into(),
        }
    }

    /// True when this segment matches any key.
    pub fn is_wildcard(&self) -> bool {
        self.key == WILDCARD_KEY
    }
}

impl From<(String, String)> for NodePath {
    fn from((node_type, key): (String, String)) -> Self {
        Self { node_type, key }
    }
}

impl From<NodePath> for (String, String) {
    fn from(p: NodePath) -> Self {
        (p.node_type, p.key)
    }
}

impl From<(&str, &str)> for NodePath {
    fn from((node_type, key): (&str, &str)) -> Self {
        Self::new(node_type, key)
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_type, self.key)
    }
}

/// Build a path list from `(type, key)` pairs.
pub fn path_of<'a, I>(segments: I) -> NodePathList
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    segments.into_iter().map(NodePath::from).collect()
}

/// Encode a path into its NodeID.
pub fn node_id_of(path: &[NodePath]) -> String {
    let mut id = String::new();
    for seg in path {
        id.push('/');
        id.push_str(&seg.node_type);
        id.push('/');
        id.push_str(&seg.key);
    }
    id
}

/// Decode a NodeID into its path.
///
/// Returns `None` when the id does not have an even, non-zero number of
/// segments after the leading slash.
pub fn path_of_id(id: &str) -> Option<NodePathList> {
    let rest = id.strip_prefix('/')?;
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.is_empty() || parts.len() % 2 != 0 {
        return None;
    }
    Some(
        parts
            .chunks(2)
            .map(|pair| NodePath::new(pair[0], pair[1]))
            .collect(),
    )
}

/// NodeID of a child of `parent_id`.
pub fn child_id(parent_id: &str, node_type: &str, key: &str) -> String {
    format!("{parent_id}/{node_type}/{key}")
}

/// Type and key of the last segment of a NodeID.
pub fn last_segment(id: &str) -> Option<(&str, &str)> {
    let mut it = id.rsplitn(3, '/');
    let key = it.next()?;
    let node_type = it.next()?;
    it.next()?;
    Some((node_type, key))
}

/// NodeID of the parent, or `None` for a root id.
pub fn parent_id(id: &str) -> Option<&str> {
    let (node_type, key) = last_segment(id)?;
    let cut = id.len() - node_type.len() - key.len() - 2;
    if cut == 0 {
        None
    } else {
        Some(&id[..cut])
    }
}

/// Number of `(type, key)` segments in a NodeID.
pub fn depth_of_id(id: &str) -> usize {
    id.split('/').count().saturating_sub(1) / 2
}

/// Path list as its JSON string, the form stored in soft link records.
pub fn path_to_json(path: &[NodePath]) -> String {
    serde_json::to_string(path).unwrap_or_else(|_| String::from("[]"))
}

/// Parse a JSON path list.
pub fn path_from_json(s: &str) -> Result<NodePathList, serde_json::Error> {
    serde_json::from_str(s)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_node_id_encoding() {
        let path = path_of([("Config", "default"), ("Tenant", "acme")]);
        assert_eq!(node_id_of(&path), "/Config/default/Tenant/acme");
        assert_eq!(path_of_id("/Config/default/Tenant/acme"), Some(path));
    }

    #[test]
    fn test_path_of_id_rejects_odd_segments() {
        assert!(path_of_id("/Config").is_none());
        assert!(path_of_id("Config/default").is_none());
        assert!(path_of_id("/Config/default/Tenant").is_none());
    }

    #[test]
    fn test_parent_and_last_segment() {
        let id = "/Config/default/Tenant/acme";
        assert_eq!(last_segment(id), Some(("Tenant", "acme")));
        assert_eq!(parent_id(id), Some("/Config/default"));
        assert_eq!(parent_id("/Config/default"), None);
        assert_eq!(depth_of_id(id), 2);
        assert_eq!(depth_of_id("/Config/default"), 1);
    }

    #[test]
    fn test_path_json_shape() {
        let path = path_of([("Config", "default"), ("Tenant", "*")]);
        let json = path_to_json(&path);
        assert_eq!(json, r#"[["Config","default"],["Tenant","*"]]"#);
        let back = path_from_json(&json).expect("path json should parse");
        assert!(back[1].is_wildcard());
    }

    proptest! {
        #[test]
        fn prop_id_decodes_to_same_path(
            segs in prop::collection::vec(("[A-Z][a-z]{1,6}", "[a-z0-9]{1,8}"), 1..5)
        ) {
            let path: NodePathList = segs
                .iter()
                .map(|(t, k)| NodePath::new(t.as_str(), k.as_str()))
                .collect();
            let id = node_id_of(&path);
            prop_assert_eq!(depth_of_id(&id), path.len());
            prop_assert_eq!(path_of_id(&id), Some(path));
        }
    }
}
