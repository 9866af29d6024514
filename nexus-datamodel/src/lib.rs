//! NEXUS Data Model - subscription-driven graph cache.
//!
//! A [`DataModel`] keeps a local, partial view of the graph held in a
//! [`KvStore`](nexus_storage::KvStore). Which part of the graph is kept
//! live is decided by subscriptions: a path pattern (with `*` keys) and a
//! depth. Covered nodes are updated from the notification stream; anything
//! else is re-read from the store on access.
//!
//! ```ignore
//! let dm = DataModel::connect("controller", kv, NexusConfig::default()).await?;
//! let root = dm.upsert_root_node("Config", "default", &Properties::new()).await;
//! dm.subscribe(&path_of([("Config", "default"), ("Tenant", "*")]), 0).await;
//! dm.register_cb(
//!     &path_of([("Config", "default"), ("Tenant", "*")]),
//!     node_callback(|ev| async move { println!("{} {}", ev.update, ev.node.id()) }),
//! );
//! ```

pub mod cache;
pub mod callback;
pub mod datamodel;
pub mod node;
pub mod scheduler;
pub mod telemetry;

pub use cache::SubscriptionTree;
pub use callback::{link_callback, node_callback, LinkCallback, LinkEvent, NodeCallback, NodeEvent};
pub use datamodel::{DataModel, DataModelStats};
pub use node::{LinkManager, Node, ReverseLink};
pub use scheduler::{Scheduler, SchedulerGuard};
pub use telemetry::{init_tracing, TelemetryConfig};
