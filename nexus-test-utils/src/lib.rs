//! NEXUS Test Utilities
//!
//! Shared test infrastructure for the NEXUS workspace:
//! - Fixtures that connect data models to in-memory or LMDB stores
//! - Callback recorders for asserting on node and link events
//! - Proptest generators for paths, patterns and property maps
//! - Polling helpers for eventually-consistent cache state

pub use nexus_core::{
    path_of, FatalPolicy, NexusConfig, NodePath, NodePathList, Properties, UpdateType,
};
pub use nexus_datamodel::{DataModel, Node};
pub use nexus_storage::{InMemoryKvStore, KvStore, LmdbKvStore};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built data models and records.

    use super::*;

    /// Default config with panicking fatal faults, so a store failure fails
    /// the test instead of aborting the runner.
    pub fn test_config() -> NexusConfig {
        NexusConfig {
            fatal_policy: FatalPolicy::Panic,
            ..NexusConfig::default()
        }
    }

    /// Like [`test_config`] with reverse-link maintenance switched off.
    pub fn test_config_without_rlinks() -> NexusConfig {
        NexusConfig {
            feature_flags: Vec::new(),
            ..test_config()
        }
    }

    pub fn memory_store() -> Arc<dyn KvStore> {
        Arc::new(InMemoryKvStore::new())
    }

    /// A durable store in a fresh temporary directory. Keep the directory
    /// alive for as long as the store is used.
    pub fn lmdb_store() -> (tempfile::TempDir, Arc<dyn KvStore>) {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("failed to create temp dir: {e}"),
        };
        match LmdbKvStore::open(dir.path(), 64) {
            Ok(kv) => (dir, Arc::new(kv)),
            Err(e) => panic!("failed to open lmdb store: {e}"),
        }
    }

    /// A data model on a fresh in-memory store.
    pub async fn connected_model(name: &str) -> DataModel {
        model_on(name, memory_store()).await
    }

    /// A data model on `kv`, which may be shared with other models to
    /// simulate independent processes.
    pub async fn model_on(name: &str, kv: Arc<dyn KvStore>) -> DataModel {
        model_with(name, kv, test_config()).await
    }

    pub async fn model_with(name: &str, kv: Arc<dyn KvStore>, config: NexusConfig) -> DataModel {
        match DataModel::connect(name, kv, config).await {
            Ok(dm) => dm,
            Err(e) => panic!("failed to connect test data model {name}: {e}"),
        }
    }

    /// Build a property map from a JSON object literal.
    ///
    /// # Panics
    ///
    /// Panics if `value` is not an object.
    pub fn props(value: serde_json::Value) -> Properties {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("expected a JSON object, got {other}"),
        }
    }

    /// `/Config/default` with a `Tenant` child keyed by `name`.
    pub async fn config_with_tenant(dm: &DataModel, tenant: &str) -> (Node, Node) {
        let root = dm
            .upsert_root_node("Config", "default", &Properties::new())
            .await;
        let child = root
            .upsert_child(
                "Tenant",
                "name",
                &props(serde_json::json!({ "name": tenant })),
                &Properties::new(),
            )
            .await;
        match child {
            Some((t, _)) => (root, t),
            None => panic!("data model dropped while creating tenant {tenant}"),
        }
    }
}

// ============================================================================
// RECORDERS
// ============================================================================

pub mod recorders {
    //! Callbacks that remember what they saw.

    use super::*;
    use nexus_datamodel::{link_callback, node_callback, LinkCallback, NodeCallback};
    use parking_lot::Mutex;

    /// One observed node event.
    #[derive(Debug, Clone, PartialEq)]
    pub struct SeenNode {
        pub update: UpdateType,
        pub id: String,
        pub old: Option<Properties>,
        pub new: Option<Properties>,
    }

    /// One observed link event.
    #[derive(Debug, Clone, PartialEq)]
    pub struct SeenLink {
        pub update: UpdateType,
        pub source_id: String,
        pub dest_type: String,
        pub dest_key: String,
        pub new: Option<Properties>,
    }

    #[derive(Clone, Default)]
    pub struct NodeRecorder {
        seen: Arc<Mutex<Vec<SeenNode>>>,
    }

    impl NodeRecorder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn callback(&self) -> NodeCallback {
            let seen = Arc::clone(&self.seen);
            node_callback(move |ev| {
                seen.lock().push(SeenNode {
                    update: ev.update,
                    id: ev.node.id().to_string(),
                    old: ev.old,
                    new: ev.new,
                });
                async {}
            })
        }

        pub fn events(&self) -> Vec<SeenNode> {
            self.seen.lock().clone()
        }

        pub fn count(&self, update: UpdateType, id: &str) -> usize {
            self.seen
                .lock()
                .iter()
                .filter(|e| e.update == update && e.id == id)
                .count()
        }
    }

    #[derive(Clone, Default)]
    pub struct LinkRecorder {
        seen: Arc<Mutex<Vec<SeenLink>>>,
    }

    impl LinkRecorder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn callback(&self) -> LinkCallback {
            let seen = Arc::clone(&self.seen);
            link_callback(move |ev| {
                seen.lock().push(SeenLink {
                    update: ev.update,
                    source_id: ev.node.id().to_string(),
                    dest_type: ev.dest_type,
                    dest_key: ev.dest_key,
                    new: ev.new,
                });
                async {}
            })
        }

        pub fn events(&self) -> Vec<SeenLink> {
            self.seen.lock().clone()
        }

        pub fn count(&self, update: UpdateType, dest_key: &str) -> usize {
            self.seen
                .lock()
                .iter()
                .filter(|e| e.update == update && e.dest_key == dest_key)
                .count()
        }
    }
}

// ============================================================================
// POLLING
// ============================================================================

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Async variant of [`eventually`].
pub async fn eventually_async<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Let spawned callback and notification tasks run for `ms`.
pub async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for graph paths and properties.

    use super::*;
    use nexus_core::WILDCARD_KEY;
    use proptest::prelude::*;

    /// A short capitalized node type.
    pub fn arb_node_type() -> impl Strategy<Value = String> {
        "[A-Z][a-z]{1,6}"
    }

    /// A key value that is never the wildcard.
    pub fn arb_key() -> impl Strategy<Value = String> {
        "[a-z0-9]{1,8}"
    }

    pub fn arb_segment() -> impl Strategy<Value = NodePath> {
        (arb_node_type(), arb_key()).prop_map(|(t, k)| NodePath::new(t, k))
    }

    /// A concrete path of 1 to `max_len` segments.
    pub fn arb_path(max_len: usize) -> impl Strategy<Value = NodePathList> {
        prop::collection::vec(arb_segment(), 1..=max_len.max(1))
    }

    /// A path where each key is replaced by `*` with probability 1/3.
    pub fn arb_pattern(max_len: usize) -> impl Strategy<Value = NodePathList> {
        prop::collection::vec((arb_segment(), prop::bool::weighted(0.33)), 1..=max_len.max(1))
            .prop_map(|segs| {
                segs.into_iter()
                    .map(|(s, wild)| if wild { NodePath::new(s.node_type, WILDCARD_KEY) } else { s })
                    .collect()
            })
    }

    /// User properties with string values; names never start with `_`.
    pub fn arb_properties() -> impl Strategy<Value = Properties> {
        prop::collection::btree_map("[a-z]{1,6}", "[a-zA-Z0-9 ]{0,12}", 0..6).prop_map(|m| {
            m.into_iter()
                .map(|(k, v)| (k, serde_json::Value::from(v)))
                .collect()
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::generators::*;
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_patterns_keep_types(p in arb_pattern(4)) {
            prop_assert!(!p.is_empty() && p.len() <= 4);
            for seg in &p {
                prop_assert!(!seg.node_type.is_empty());
            }
        }

        #[test]
        fn prop_properties_are_user_names(props in arb_properties()) {
            for k in props.keys() {
                prop_assert!(!nexus_core::is_fixed_prop(k));
            }
        }
    }

    #[tokio::test]
    async fn test_eventually_times_out() {
        assert!(!eventually(Duration::from_millis(30), || false).await);
        assert!(eventually(Duration::from_millis(30), || true).await);
    }
}
