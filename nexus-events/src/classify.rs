//! Classification of raw store keys.

use nexus_core::{NodePath, NodePathList};
use nexus_storage::keys::{CREATED, LINKS, LOCK, RLINKS};

/// Which record a store key addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    Node,
    Link { dest_type: String, dest_key: String },
    RLink { source_type: String, source_key: String },
    Created,
    Lock,
    Unknown,
}

/// A store key split into its owning node path and record kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedKey {
    pub kind: KeyKind,
    /// Path of the node the key belongs to (the source for link keys).
    pub path: NodePathList,
    pub node_id: String,
    /// Empty for roots.
    pub parent_id: String,
}

impl ClassifiedKey {
    fn unknown() -> Self {
        Self {
            kind: KeyKind::Unknown,
            path: Vec::new(),
            node_id: String::new(),
            parent_id: String::new(),
        }
    }

    pub fn node_type(&self) -> &str {
        self.path.last().map(|p| p.node_type.as_str()).unwrap_or("")
    }

    pub fn node_key(&self) -> &str {
        self.path.last().map(|p| p.key.as_str()).unwrap_or("")
    }
}

fn is_reserved(segment: &str) -> bool {
    segment == CREATED || segment == LINKS || segment == RLINKS || segment == LOCK
}

/// Classify `key` against the store layout.
pub fn classify(key: &str) -> ClassifiedKey {
    let Some(rest) = key.strip_prefix('/') else {
        return ClassifiedKey::unknown();
    };
    let segs: Vec<&str> = rest.split('/').collect();

    let mut path = NodePathList::new();
    let mut kind = KeyKind::Node;
    let mut i = 0;
    while i < segs.len() {
        let seg = segs[i];
        if seg.is_empty() || (seg.starts_with('_') && !is_reserved(seg)) {
            tracing::debug!(key, segment = seg, "unknown object type in key");
            return ClassifiedKey::unknown();
        }
        if seg == CREATED {
            kind = KeyKind::Created;
            break;
        }
        if seg == LOCK {
            kind = KeyKind::Lock;
            break;
        }
        if seg == LINKS || seg == RLINKS {
            let (Some(t), Some(k)) = (segs.get(i + 1), segs.get(i + 2)) else {
                return ClassifiedKey::unknown();
            };
            kind = match segs.get(i + 3) {
                Some(&CREATED) => KeyKind::Created,
                Some(&LOCK) => KeyKind::Lock,
                Some(_) => return ClassifiedKey::unknown(),
                None if seg == LINKS => KeyKind::Link {
                    dest_type: t.to_string(),
                    dest_key: k.to_string(),
                },
                None => KeyKind::RLink {
                    source_type: t.to_string(),
                    source_key: k.to_string(),
                },
            };
            break;
        }
        let Some(k) = segs.get(i + 1).filter(|k| !k.is_empty()) else {
            return ClassifiedKey::unknown();
        };
        path.push(NodePath::new(seg, *k));
        i += 2;
    }

    if path.is_empty() {
        return ClassifiedKey::unknown();
    }
    let node_id = nexus_core::node_id_of(&path);
    let parent_id = nexus_core::node_id_of(&path[..path.len() - 1]);
    ClassifiedKey {
        kind,
        path,
        node_id,
        parent_id,
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_core::path_of;
    use proptest::prelude::*;

    #[test]
    fn test_node_key() {
        let c = classify("/Config/default/Tenant/acme");
        assert_eq!(c.kind, KeyKind::Node);
        assert_eq!(c.node_id, "/Config/default/Tenant/acme");
        assert_eq!(c.parent_id, "/Config/default");
        assert_eq!(c.node_type(), "Tenant");
        assert_eq!(c.node_key(), "acme");

        let root = classify("/Config/default");
        assert_eq!(root.parent_id, "");
    }

    #[test]
    fn test_link_and_rlink_keys() {
        let c = classify("/Config/default/_links/Tenant/acme");
        assert_eq!(
            c.kind,
            KeyKind::Link {
                dest_type: "Tenant".into(),
                dest_key: "acme".into()
            }
        );
        assert_eq!(c.node_id, "/Config/default");
        assert_eq!(c.path, path_of([("Config", "default")]));

        let r = classify("/Config/default/Tenant/acme/_rlinks/Group/eng");
        assert!(matches!(r.kind, KeyKind::RLink { .. }));
    }

    #[test]
    fn test_marker_keys() {
        assert_eq!(classify("/Config/default/_created").kind, KeyKind::Created);
        assert_eq!(
            classify("/Config/default/_links/Tenant/acme/_created").kind,
            KeyKind::Created
        );
        assert_eq!(classify("/Config/default/_lock").kind, KeyKind::Lock);
        assert_eq!(
            classify("/Config/default/_links/Tenant/acme/_lock").kind,
            KeyKind::Lock
        );
    }

    #[test]
    fn test_unknown_shapes() {
        for key in [
            "",
            "Config/default",
            "/Config",
            "/Config/default/_weird/x",
            "/Config/default/_links/Tenant",
            "/Config/default/_links/Tenant/acme/extra",
            "/Config//x",
        ] {
            assert_eq!(classify(key).kind, KeyKind::Unknown, "key {key:?}");
        }
    }

    proptest! {
        #[test]
        fn prop_node_ids_classify_to_themselves(
            segs in prop::collection::vec(("[A-Z][a-z]{1,6}", "[a-z0-9]{1,6}"), 1..5)
        ) {
            let path: NodePathList = segs.iter().map(|(t, k)| NodePath::new(t.as_str(), k.as_str())).collect();
            let id = nexus_core::node_id_of(&path);
            let c = classify(&id);
            prop_assert_eq!(c.kind, KeyKind::Node);
            prop_assert_eq!(c.node_id, id);
            prop_assert_eq!(c.path, path);
        }
    }
}
