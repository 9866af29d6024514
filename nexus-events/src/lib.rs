//! NEXUS Events - watch stream decoding and notification dispatch.
//!
//! The [`NotificationBus`] watches the graph prefix of a [`KvStore`],
//! classifies each raw key and turns node and link mutations into
//! [`Notification`]s. Created and lock markers never produce
//! notifications; rlink mutations are dropped because reverse-link state
//! is recomputed on fetch.
//!
//! [`KvStore`]: nexus_storage::KvStore
//! [`Notification`]: nexus_core::Notification

mod bus;
mod classify;
mod created;

pub use bus::{NotificationBus, NotificationHandler};
pub use classify::{classify, ClassifiedKey, KeyKind};
pub use created::CreatedBuffer;
