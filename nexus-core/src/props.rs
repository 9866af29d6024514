//! Property maps and the system ("fixed") property names.
//!
//! Node and link properties are free-form JSON maps. A fixed set of
//! underscore-prefixed names is reserved for metadata maintained by the
//! graph store; callers never write those directly.

use chrono::Utc;
use serde_json::{Map, Value};

/// Property map of a node or link.
pub type Properties = Map<String, Value>;

/// Default key name when a child is created without an explicit link key.
pub const DEFAULT_KEY_NAME: &str = "name";

/// Key value used for singleton children.
pub const SINGLETON_KEY_VALUE: &str = "default";

/// Reserved node property names.
pub mod node_prop {
    pub const CREATED_BY: &str = "_createdBy";
    pub const CREATION_TIME: &str = "_creationTime";
    pub const UPDATED_BY: &str = "_updatedBy";
    pub const UPDATE_TIME: &str = "_updateTime";
    pub const CHANGE_ID: &str = "_changeId";
    pub const REVISION: &str = "_revision";
    pub const IS_ROOT: &str = "_isRoot";
    pub const KEY_NAME: &str = "_nodeKeyName";
    pub const TO_BE_DELETED: &str = "_toBeDeleted";
}

/// Reserved link property names.
pub mod link_prop {
    pub const CREATED_BY: &str = "_createdBy";
    pub const CREATION_TIME: &str = "_creationTime";
    pub const UPDATED_BY: &str = "_updatedBy";
    pub const UPDATE_TIME: &str = "_updateTime";
    pub const REVISION: &str = "_revision";
    pub const NODE_KEY_NAME: &str = "_nodeKeyName";
    pub const NODE_KEY_VALUE: &str = "_nodeKeyValue";
    pub const NODE_TYPE: &str = "_nodeType";
    pub const HARD_LINK: &str = "_hardLink";
    pub const DEST_NODE_ID: &str = "_destNodeId";
    pub const SOFT_LINK_DEST_PATH: &str = "_softLinkDestPath";
    pub const RSOFT_LINK_DEST_PATH: &str = "_rSoftLinkDestPath";
    /// On an rlink, the id of the forward link it mirrors.
    pub const FORWARD_LINK_ID: &str = "_forwardLinkId";
}

const FIXED_PROPS: &[&str] = &[
    node_prop::CREATED_BY,
    node_prop::CREATION_TIME,
    node_prop::UPDATED_BY,
    node_prop::UPDATE_TIME,
    node_prop::CHANGE_ID,
    node_prop::REVISION,
    node_prop::IS_ROOT,
    node_prop::KEY_NAME,
    node_prop::TO_BE_DELETED,
    link_prop::NODE_KEY_VALUE,
    link_prop::NODE_TYPE,
    link_prop::HARD_LINK,
    link_prop::DEST_NODE_ID,
    link_prop::SOFT_LINK_DEST_PATH,
    link_prop::RSOFT_LINK_DEST_PATH,
    link_prop::FORWARD_LINK_ID,
];

/// Diff exclusions for node update callbacks.
pub const NODE_DIFF_EXCLUDE: &[&str] = &[
    node_prop::CREATION_TIME,
    node_prop::CREATED_BY,
    node_prop::UPDATED_BY,
    node_prop::UPDATE_TIME,
    node_prop::CHANGE_ID,
    node_prop::REVISION,
    node_prop::TO_BE_DELETED,
];

/// Diff exclusions for link update callbacks.
pub const LINK_DIFF_EXCLUDE: &[&str] = &[
    link_prop::CREATED_BY,
    link_prop::CREATION_TIME,
    link_prop::UPDATED_BY,
    link_prop::UPDATE_TIME,
    link_prop::REVISION,
];

/// True if `name` is reserved for store metadata.
pub fn is_fixed_prop(name: &str) -> bool {
    FIXED_PROPS.contains(&name)
}

/// Copy of `props` with all reserved names removed.
pub fn copy_without_fixed(props: &Properties) -> Properties {
    props
        .iter()
        .filter(|(k, _)| !is_fixed_prop(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Current time in the store's timestamp format (UTC, millisecond precision).
pub fn now_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Fresh change id stamped on every property write.
pub fn new_change_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// String value of `key`, if present and a string.
pub fn get_str<'a>(props: &'a Properties, key: &str) -> Option<&'a str> {
    props.get(key).and_then(Value::as_str)
}

/// Revision carried in `props`, or 0.
pub fn revision_of(props: &Properties) -> i64 {
    props
        .get(node_prop::REVISION)
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .unwrap_or(0)
}

/// Compare two property values, treating numbers by value so that
/// `1` and `1.0` are equal.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// True if `new` differs from `cur`, ignoring the names in `exclude`.
///
/// An empty `exclude` also reports a change when the map sizes differ.
/// A transition into `_toBeDeleted` is always a change.
pub fn props_differ(cur: &Properties, new: &Properties, exclude: &[&str]) -> bool {
    if exclude.is_empty() && cur.len() != new.len() {
        return true;
    }
    if new.contains_key(node_prop::TO_BE_DELETED) && !cur.contains_key(node_prop::TO_BE_DELETED) {
        return true;
    }
    for (k, v) in cur {
        if exclude.contains(&k.as_str()) {
            continue;
        }
        match new.get(k) {
            Some(nv) if !values_equal(v, nv) => return true,
            None => return true,
            _ => {}
        }
    }
    new.keys()
        .filter(|k| !exclude.contains(&k.as_str()))
        .any(|k| !cur.contains_key(k))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(v: Value) -> Properties {
        v.as_object().cloned().expect("object literal")
    }

    #[test]
    fn test_copy_without_fixed_strips_reserved() {
        let p = props(json!({
            "name": "acme",
            "_revision": 4,
            "_hardLink": "true",
            "color": "blue"
        }));
        let stripped = copy_without_fixed(&p);
        assert_eq!(stripped.len(), 2);
        assert!(stripped.contains_key("name"));
        assert!(stripped.contains_key("color"));
    }

    #[test]
    fn test_values_equal_numeric_coercion() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(!values_equal(&json!(1), &json!("1")));
        assert!(values_equal(&json!({"a": 1}), &json!({"a": 1})));
    }

    #[test]
    fn test_metadata_only_change_is_suppressed() {
        let cur = props(json!({
            "name": "a",
            "_revision": 3,
            "_updatedBy": "x",
            "_updateTime": "2026-01-01T00:00:00.000Z"
        }));
        let new = props(json!({
            "name": "a",
            "_revision": 9,
            "_updatedBy": "y",
            "_updateTime": "2026-01-02T00:00:00.000Z"
        }));
        assert!(!props_differ(&cur, &new, NODE_DIFF_EXCLUDE));
    }

    #[test]
    fn test_real_change_is_reported() {
        let cur = props(json!({"name": "a", "color": "red"}));
        let new = props(json!({"name": "a", "color": "blue"}));
        assert!(props_differ(&cur, &new, NODE_DIFF_EXCLUDE));

        let removed = props(json!({"name": "a"}));
        assert!(props_differ(&cur, &removed, NODE_DIFF_EXCLUDE));

        let added = props(json!({"name": "a", "color": "red", "size": 2}));
        assert!(props_differ(&cur, &added, NODE_DIFF_EXCLUDE));
    }

    #[test]
    fn test_to_be_deleted_transition_not_masked() {
        let cur = props(json!({"name": "a"}));
        let new = props(json!({"name": "a", "_toBeDeleted": true}));
        assert!(props_differ(&cur, &new, NODE_DIFF_EXCLUDE));

        // already marked: flag alone is not a change
        let again = props(json!({"name": "a", "_toBeDeleted": true, "_revision": 7}));
        assert!(!props_differ(&new, &again, NODE_DIFF_EXCLUDE));
    }

    #[test]
    fn test_empty_exclude_compares_sizes() {
        let cur = props(json!({"a": 1}));
        let new = props(json!({"a": 1, "_revision": 2}));
        assert!(props_differ(&cur, &new, &[]));
    }

    #[test]
    fn test_revision_of() {
        assert_eq!(revision_of(&props(json!({"_revision": 12}))), 12);
        assert_eq!(revision_of(&props(json!({}))), 0);
    }
}
