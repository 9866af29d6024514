//! Nexus Core - Graph Types
//!
//! Pure data structures shared by every nexus crate: node paths and ids,
//! property maps, graph records, notifications, errors and configuration.

pub mod config;
pub mod entities;
pub mod error;
pub mod fatal;
pub mod notification;
pub mod path;
pub mod props;

pub use config::{
    parse_feature_flags, BusConfig, FatalPolicy, NexusConfig, RetryConfig, UpdateRetryConfig,
    RLINK_FEATURE_FLAG,
};
pub use entities::{GraphLink, GraphNode, LinkEnd, UpdateType, UpsertLinkRequest};
pub use error::{BusError, ConfigError, GraphError, NexusError, NexusResult, StoreError};
pub use fatal::fatal;
pub use notification::{Notification, NotificationStats, TraceId};
pub use path::{
    child_id, depth_of_id, last_segment, node_id_of, parent_id, path_from_json, path_of,
    path_of_id, path_to_json, NodePath, NodePathList, WILDCARD_KEY,
};
pub use props::{
    copy_without_fixed, get_str, is_fixed_prop, link_prop, new_change_id, node_prop,
    now_timestamp, props_differ, revision_of, values_equal, Properties, DEFAULT_KEY_NAME,
    LINK_DIFF_EXCLUDE, NODE_DIFF_EXCLUDE, SINGLETON_KEY_VALUE,
};
