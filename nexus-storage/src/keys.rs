//! Store key layout.
//!
//! ```text
//! /<Type>/<Key>                                   node record
//! /<Type>/<Key>/_created                          node created marker
//! /<Type>/<Key>/_links/<DestType>/<DestKey>       link record
//! /<Type>/<Key>/_links/<DestType>/<DestKey>/_created
//! /<Type>/<Key>/_rlinks/<SrcType>/<SrcKey>        rlink record (+ /_created)
//! .../_lock                                       advisory lock marker
//! ```

use nexus_core::last_segment;

pub const CREATED: &str = "_created";
pub const LINKS: &str = "_links";
pub const RLINKS: &str = "_rlinks";
pub const LOCK: &str = "_lock";

pub fn created_key(id: &str) -> String {
    format!("{id}/{CREATED}")
}

pub fn link_key(source_id: &str, dest_type: &str, dest_key: &str) -> String {
    format!("{source_id}/{LINKS}/{dest_type}/{dest_key}")
}

pub fn rlink_key(dest_id: &str, source_type: &str, source_key: &str) -> String {
    format!("{dest_id}/{RLINKS}/{source_type}/{source_key}")
}

/// Prefix under which all forward links of `node_id` live.
pub fn links_prefix(node_id: &str) -> String {
    format!("{node_id}/{LINKS}/")
}

/// Prefix under which all reverse links of `node_id` live.
pub fn rlinks_prefix(node_id: &str) -> String {
    format!("{node_id}/{RLINKS}/")
}

/// Key of the link from the parent to `node_id`, or `None` for a root.
pub fn parent_link_key(node_id: &str) -> Option<String> {
    let parent = nexus_core::parent_id(node_id)?;
    let (node_type, key) = last_segment(node_id)?;
    Some(link_key(parent, node_type, key))
}

/// Source NodeID of a link or rlink record key.
pub fn source_of_link_key(link_id: &str) -> Option<&str> {
    let mut end = link_id.len();
    for _ in 0..3 {
        end = link_id[..end].rfind('/')?;
    }
    if end == 0 {
        None
    } else {
        Some(&link_id[..end])
    }
}

/// True for the created marker and lock leaves of a link directory.
pub fn is_marker_leaf(segment: &str) -> bool {
    segment == CREATED || segment == LOCK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_keys() {
        assert_eq!(
            link_key("/Config/default", "Tenant", "acme"),
            "/Config/default/_links/Tenant/acme"
        );
        assert_eq!(
            rlink_key("/Config/default/User/bob", "Group", "eng"),
            "/Config/default/User/bob/_rlinks/Group/eng"
        );
        assert_eq!(
            parent_link_key("/Config/default/Tenant/acme").as_deref(),
            Some("/Config/default/_links/Tenant/acme")
        );
        assert_eq!(parent_link_key("/Config/default"), None);
    }

    #[test]
    fn test_source_of_link_key() {
        assert_eq!(
            source_of_link_key("/Config/default/_links/Tenant/acme"),
            Some("/Config/default")
        );
        assert_eq!(source_of_link_key("/_links/Tenant/acme"), None);
        assert_eq!(source_of_link_key("acme"), None);
    }
}
