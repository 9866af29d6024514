//! Structured change notifications decoded from the store's watch stream.

use crate::entities::UpdateType;
use crate::path::{path_to_json, NodePathList};
use crate::props::Properties;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Correlates log lines for a single notification, rendered `<M:uuid:path>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceId {
    pub id: Uuid,
    pub path: String,
}

impl TraceId {
    pub fn new(path: &[crate::path::NodePath]) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path_to_json(path),
        }
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<M:{}:{}>", self.id, self.path)
    }
}

/// A decoded node or link mutation.
///
/// For node events `updated_obj_id` is the NodeID and the type/key are the
/// node's last segment. For link events `updated_obj_id` is the link record
/// key, the type/key are those of the destination and
/// `updated_obj_parent_id` is the source NodeID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub object_path: NodePathList,
    pub update_type: UpdateType,
    pub updated_obj_id: String,
    pub updated_obj_type: String,
    pub updated_obj_key: String,
    pub updated_obj_parent_id: String,
    pub revision: i64,
    pub value: Properties,
    pub trace_id: TraceId,
}

/// Counters kept by the notification bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationStats {
    pub node_update_rx: u64,
    pub link_update_rx: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::path_of;

    #[test]
    fn test_trace_id_format() {
        let trace = TraceId::new(&path_of([("Config", "default")]));
        let s = trace.to_string();
        assert!(s.starts_with("<M:"));
        assert!(s.ends_with(r#":[["Config","default"]]>"#));
    }
}
