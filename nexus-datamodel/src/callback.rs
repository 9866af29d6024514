//! Node and link change callbacks.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use nexus_core::{Properties, UpdateType};

use crate::node::Node;

/// A change to a cached node's properties.
///
/// `old` is `None` for adds, `new` is `None` for deletes.
#[derive(Clone)]
pub struct NodeEvent {
    pub node: Node,
    pub update: UpdateType,
    pub old: Option<Properties>,
    pub new: Option<Properties>,
}

/// A change to one of a cached node's forward links.
#[derive(Clone)]
pub struct LinkEvent {
    /// Source of the link.
    pub node: Node,
    pub update: UpdateType,
    pub dest_type: String,
    pub dest_key: String,
    pub old: Option<Properties>,
    pub new: Option<Properties>,
}

pub type NodeCallback = Arc<dyn Fn(NodeEvent) -> BoxFuture<'static, ()> + Send + Sync>;
pub type LinkCallback = Arc<dyn Fn(LinkEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`NodeCallback`].
pub fn node_callback<F, Fut>(f: F) -> NodeCallback
where
    F: Fn(NodeEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ev| Box::pin(f(ev)))
}

/// Wrap an async closure as a [`LinkCallback`].
pub fn link_callback<F, Fut>(f: F) -> LinkCallback
where
    F: Fn(LinkEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ev| Box::pin(f(ev)))
}
