//! Subscription tree.
//!
//! Mirrors the type/key hierarchy of node paths. Each position carries a
//! subscription weight, an eager depth, registered callbacks and the ids of
//! cached nodes sitting at that concrete path. A `*` key matches any key at
//! its level. Cached ids are only ever recorded at concrete positions.

use std::collections::{BTreeSet, HashMap};

use nexus_core::{path_of_id, path_to_json, NodePath, NodePathList, WILDCARD_KEY};
use serde_json::{json, Map, Value};

use crate::callback::{LinkCallback, NodeCallback};

type Children = HashMap<String, HashMap<String, SubNode>>;

#[derive(Default)]
struct SubNode {
    weight: u32,
    depth: u32,
    node_cbs: Vec<NodeCallback>,
    link_cbs: HashMap<String, Vec<LinkCallback>>,
    cached: BTreeSet<String>,
    children: Children,
}

impl SubNode {
    fn is_empty(&self) -> bool {
        self.weight == 0
            && self.depth == 0
            && self.node_cbs.is_empty()
            && self.link_cbs.is_empty()
            && self.cached.is_empty()
            && self.children.is_empty()
    }
}

struct Subscription {
    path: NodePathList,
    depth: u32,
    count: u32,
}

/// Keys at a position that match the path segment key `key`.
fn match_keys(key: &str) -> impl Iterator<Item = &str> {
    std::iter::once(key).chain((key != WILDCARD_KEY).then_some(WILDCARD_KEY))
}

fn entry<'a>(children: &'a mut Children, seg: &NodePath, rest: &[NodePath]) -> &'a mut SubNode {
    let n = children
        .entry(seg.node_type.clone())
        .or_default()
        .entry(seg.key.clone())
        .or_default();
    match rest.split_first() {
        None => n,
        Some((s, r)) => entry(&mut n.children, s, r),
    }
}

fn covers(children: &Children, path: &[NodePath]) -> bool {
    let Some((seg, rest)) = path.split_first() else {
        return false;
    };
    let Some(by_key) = children.get(&seg.node_type) else {
        return false;
    };
    match_keys(&seg.key).any(|key| {
        by_key.get(key).is_some_and(|n| {
            if rest.is_empty() {
                n.weight > 0
            } else {
                // depth counts levels below this position, at the root too
                (n.weight > 0 && n.depth as usize >= rest.len()) || covers(&n.children, rest)
            }
        })
    })
}

fn for_each_match<'a>(children: &'a Children, path: &[NodePath], f: &mut dyn FnMut(&'a SubNode)) {
    let Some((seg, rest)) = path.split_first() else {
        return;
    };
    let Some(by_key) = children.get(&seg.node_type) else {
        return;
    };
    for key in match_keys(&seg.key) {
        if let Some(n) = by_key.get(key) {
            if rest.is_empty() {
                f(n);
            } else {
                for_each_match(&n.children, rest, f);
            }
        }
    }
}

/// Concrete positions matched by `pattern`, where a `*` in the pattern
/// matches every concrete key.
fn for_each_concrete<'a>(
    children: &'a Children,
    pattern: &[NodePath],
    f: &mut dyn FnMut(&'a SubNode, bool),
) {
    let Some((seg, rest)) = pattern.split_first() else {
        return;
    };
    let Some(by_key) = children.get(&seg.node_type) else {
        return;
    };
    for (key, n) in by_key {
        if key == WILDCARD_KEY || !(seg.is_wildcard() || key == &seg.key) {
            continue;
        }
        f(n, rest.is_empty());
        if !rest.is_empty() {
            for_each_concrete(&n.children, rest, f);
        }
    }
}

fn collect_all(children: &Children, out: &mut BTreeSet<String>) {
    for n in children.values().flat_map(HashMap::values) {
        out.extend(n.cached.iter().cloned());
        collect_all(&n.children, out);
    }
}

fn bump(children: &mut Children, seg: &NodePath, rest: &[NodePath], depth: u32) {
    let n = entry(children, seg, &[]);
    n.weight += 1;
    match rest.split_first() {
        None => {
            if depth != 0 {
                n.depth = depth;
            }
        }
        Some((s, r)) => bump(&mut n.children, s, r, depth),
    }
}

fn unbump(children: &mut Children, seg: &NodePath, rest: &[NodePath], clear_depth: bool) {
    let Some(by_key) = children.get_mut(&seg.node_type) else {
        panic!("subscription tree has no position for type {}", seg.node_type);
    };
    let Some(n) = by_key.get_mut(&seg.key) else {
        panic!("subscription tree has no position for {seg}");
    };
    n.weight = n.weight.saturating_sub(1);
    match rest.split_first() {
        None => {
            if clear_depth {
                n.depth = 0;
            }
        }
        Some((s, r)) => unbump(&mut n.children, s, r, clear_depth),
    }
    if n.is_empty() {
        by_key.remove(&seg.key);
        if by_key.is_empty() {
            children.remove(&seg.node_type);
        }
    }
}

fn uncache(children: &mut Children, id: &str, seg: &NodePath, rest: &[NodePath]) {
    let Some(by_key) = children.get_mut(&seg.node_type) else {
        return;
    };
    let Some(n) = by_key.get_mut(&seg.key) else {
        return;
    };
    match rest.split_first() {
        None => {
            n.cached.remove(id);
        }
        Some((s, r)) => uncache(&mut n.children, id, s, r),
    }
    if n.is_empty() {
        by_key.remove(&seg.key);
        if by_key.is_empty() {
            children.remove(&seg.node_type);
        }
    }
}

fn dump_children(children: &Children) -> Value {
    let mut out = Map::new();
    for (t, by_key) in children {
        let mut keys = Map::new();
        for (k, n) in by_key {
            let link_cbs: Map<String, Value> = n
                .link_cbs
                .iter()
                .map(|(t, v)| (t.clone(), Value::from(v.len())))
                .collect();
            keys.insert(
                k.clone(),
                json!({
                    "weight": n.weight,
                    "depth": n.depth,
                    "nodeCallbacks": n.node_cbs.len(),
                    "linkCallbacks": link_cbs,
                    "cachedNodes": n.cached,
                    "children": dump_children(&n.children),
                }),
            );
        }
        out.insert(t.clone(), Value::Object(keys));
    }
    Value::Object(out)
}

#[derive(Default)]
pub struct SubscriptionTree {
    top: Children,
    subscriptions: HashMap<String, Subscription>,
}

impl SubscriptionTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one unit of interest in `path`, covering `depth` levels below it.
    ///
    /// Returns the cached node ids that were not covered before and are now,
    /// which the caller must re-sync. The depth of a path is fixed by its
    /// first subscription; later ones only add weight.
    ///
    /// # Panics
    ///
    /// Panics if `path` is empty.
    pub fn add_subscription(&mut self, path: &[NodePath], depth: u32) -> Vec<String> {
        let Some((first, rest)) = path.split_first() else {
            panic!("subscription path must not be empty");
        };
        let spath = path_to_json(path);
        let new_depth = match self.subscriptions.get_mut(&spath) {
            Some(sub) => {
                if depth != sub.depth {
                    tracing::warn!(
                        path = %spath,
                        depth,
                        current = sub.depth,
                        "path already subscribed, keeping its depth"
                    );
                }
                sub.count += 1;
                0
            }
            None => {
                self.subscriptions.insert(
                    spath,
                    Subscription {
                        path: path.to_vec(),
                        depth,
                        count: 1,
                    },
                );
                depth
            }
        };

        let mut candidates = BTreeSet::new();
        for_each_concrete(&self.top, path, &mut |n, leaf| {
            candidates.extend(n.cached.iter().cloned());
            if leaf {
                collect_all(&n.children, &mut candidates);
            }
        });
        let before: Vec<(String, NodePathList)> = candidates
            .into_iter()
            .filter_map(|id| path_of_id(&id).map(|p| (id, p)))
            .filter(|(_, p)| !covers(&self.top, p))
            .collect();

        bump(&mut self.top, first, rest, new_depth);

        before
            .into_iter()
            .filter(|(_, p)| covers(&self.top, p))
            .map(|(id, _)| id)
            .collect()
    }

    /// Remove one unit of interest added by [`add_subscription`].
    ///
    /// # Panics
    ///
    /// Panics if `path` is not currently subscribed.
    ///
    /// [`add_subscription`]: SubscriptionTree::add_subscription
    pub fn del_subscription(&mut self, path: &[NodePath]) {
        let spath = path_to_json(path);
        let Some(sub) = self.subscriptions.get_mut(&spath) else {
            panic!("unsubscribe of {spath} which is not subscribed");
        };
        sub.count -= 1;
        let last = sub.count == 0;
        if last {
            self.subscriptions.remove(&spath);
        }
        if let Some((first, rest)) = path.split_first() {
            unbump(&mut self.top, first, rest, last);
        }
    }

    /// Whether the cache must actively track the concrete `path`.
    pub fn check_path(&self, path: &[NodePath]) -> bool {
        covers(&self.top, path)
    }

    /// Register a node callback at `path`, returning the ids of cached nodes
    /// it already matches.
    pub fn register_node_cb(&mut self, path: &[NodePath], cb: NodeCallback) -> Vec<String> {
        let Some((first, rest)) = path.split_first() else {
            panic!("callback path must not be empty");
        };
        entry(&mut self.top, first, rest).node_cbs.push(cb);
        self.cached_matching(path)
    }

    /// Register a link callback for links of `dest_type` leaving nodes at
    /// `path`, returning the ids of cached source nodes it already matches.
    pub fn register_link_cb(
        &mut self,
        path: &[NodePath],
        dest_type: &str,
        cb: LinkCallback,
    ) -> Vec<String> {
        let Some((first, rest)) = path.split_first() else {
            panic!("callback path must not be empty");
        };
        entry(&mut self.top, first, rest)
            .link_cbs
            .entry(dest_type.to_string())
            .or_default()
            .push(cb);
        self.cached_matching(path)
    }

    fn cached_matching(&self, pattern: &[NodePath]) -> Vec<String> {
        let mut out = BTreeSet::new();
        for_each_concrete(&self.top, pattern, &mut |n, leaf| {
            if leaf {
                out.extend(n.cached.iter().cloned());
            }
        });
        out.into_iter().collect()
    }

    pub fn node_callbacks(&self, path: &[NodePath]) -> Vec<NodeCallback> {
        let mut out = Vec::new();
        for_each_match(&self.top, path, &mut |n| out.extend(n.node_cbs.iter().cloned()));
        out
    }

    pub fn link_callbacks(&self, path: &[NodePath], dest_type: &str) -> Vec<LinkCallback> {
        let mut out = Vec::new();
        for_each_match(&self.top, path, &mut |n| {
            if let Some(cbs) = n.link_cbs.get(dest_type) {
                out.extend(cbs.iter().cloned());
            }
        });
        out
    }

    /// Record that node `id` at `path` is cached.
    pub fn add_cached(&mut self, id: &str, path: &[NodePath]) {
        if let Some((first, rest)) = path.split_first() {
            entry(&mut self.top, first, rest).cached.insert(id.to_string());
        }
    }

    /// Forget cached node `id`, pruning positions left empty.
    pub fn del_cached(&mut self, id: &str, path: &[NodePath]) {
        if let Some((first, rest)) = path.split_first() {
            uncache(&mut self.top, id, first, rest);
        }
    }

    /// Active subscriptions with their depth and reference count.
    pub fn subscriptions(&self) -> Vec<(NodePathList, u32, u32)> {
        self.subscriptions
            .values()
            .map(|s| (s.path.clone(), s.depth, s.count))
            .collect()
    }

    pub fn dump(&self) -> Value {
        let subs: Vec<Value> = self
            .subscriptions
            .iter()
            .map(|(p, s)| json!({"path": p, "depth": s.depth, "count": s.count}))
            .collect();
        json!({
            "tree": dump_children(&self.top),
            "subscriptions": subs,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_core::{node_id_of, path_of};
    use crate::callback::{link_callback, node_callback};
    use proptest::prelude::*;

    fn tenant_tree() -> SubscriptionTree {
        let mut tree = SubscriptionTree::new();
        let root = path_of([("Config", "default")]);
        let acme = path_of([("Config", "default"), ("Tenant", "acme")]);
        tree.add_cached(&node_id_of(&root), &root);
        tree.add_cached(&node_id_of(&acme), &acme);
        tree
    }

    #[test]
    fn test_wildcard_subscription_returns_cached_children() {
        let mut tree = tenant_tree();
        let pattern = path_of([("Config", "default"), ("Tenant", "*")]);
        let sync = tree.add_subscription(&pattern, 0);
        assert!(sync.contains(&"/Config/default/Tenant/acme".to_string()));
        assert!(sync.contains(&"/Config/default".to_string()));

        assert!(tree.check_path(&path_of([("Config", "default"), ("Tenant", "acme")])));
        assert!(tree.check_path(&path_of([("Config", "default"), ("Tenant", "other")])));
        assert!(!tree.check_path(&path_of([("Config", "other"), ("Tenant", "acme")])));
        assert!(!tree.check_path(&path_of([
            ("Config", "default"),
            ("Tenant", "acme"),
            ("User", "bob")
        ])));
    }

    #[test]
    fn test_second_subscription_syncs_nothing_new() {
        let mut tree = tenant_tree();
        let pattern = path_of([("Config", "default"), ("Tenant", "*")]);
        assert!(!tree.add_subscription(&pattern, 0).is_empty());
        assert!(tree.add_subscription(&pattern, 0).is_empty());
        tree.del_subscription(&pattern);
        assert!(tree.check_path(&path_of([("Config", "default"), ("Tenant", "acme")])));
        tree.del_subscription(&pattern);
        assert!(!tree.check_path(&path_of([("Config", "default"), ("Tenant", "acme")])));
    }

    #[test]
    fn test_depth_covers_descendants() {
        let mut tree = SubscriptionTree::new();
        let root = path_of([("Config", "default")]);
        tree.add_subscription(&root, 2);
        assert!(tree.check_path(&path_of([("Config", "default"), ("Tenant", "a")])));
        assert!(tree.check_path(&path_of([
            ("Config", "default"),
            ("Tenant", "a"),
            ("User", "u")
        ])));
        assert!(!tree.check_path(&path_of([
            ("Config", "default"),
            ("Tenant", "a"),
            ("User", "u"),
            ("Key", "k")
        ])));

        // the first subscription's depth sticks
        tree.add_subscription(&root, 3);
        assert!(!tree.check_path(&path_of([
            ("Config", "default"),
            ("Tenant", "a"),
            ("User", "u"),
            ("Key", "k")
        ])));
        tree.del_subscription(&root);
        assert!(tree.check_path(&path_of([("Config", "default"), ("Tenant", "a")])));
        tree.del_subscription(&root);
        assert!(!tree.check_path(&path_of([("Config", "default"), ("Tenant", "a")])));
    }

    #[test]
    #[should_panic(expected = "not subscribed")]
    fn test_unbalanced_unsubscribe_panics() {
        let mut tree = SubscriptionTree::new();
        tree.del_subscription(&path_of([("Config", "default")]));
    }

    #[test]
    fn test_callbacks_match_wildcards_and_report_cached() {
        let mut tree = tenant_tree();
        let cb = node_callback(|_| async {});
        let matched =
            tree.register_node_cb(&path_of([("Config", "default"), ("Tenant", "*")]), cb);
        assert_eq!(matched, vec!["/Config/default/Tenant/acme".to_string()]);

        let acme = path_of([("Config", "default"), ("Tenant", "acme")]);
        assert_eq!(tree.node_callbacks(&acme).len(), 1);
        assert!(tree.node_callbacks(&path_of([("Config", "default")])).is_empty());

        let lcb = link_callback(|_| async {});
        tree.register_link_cb(&path_of([("Config", "default")]), "Tenant", lcb);
        assert_eq!(tree.link_callbacks(&path_of([("Config", "default")]), "Tenant").len(), 1);
        assert!(tree.link_callbacks(&path_of([("Config", "default")]), "User").is_empty());
    }

    #[test]
    fn test_del_cached_prunes_empty_positions() {
        let mut tree = tenant_tree();
        tree.del_cached(
            "/Config/default/Tenant/acme",
            &path_of([("Config", "default"), ("Tenant", "acme")]),
        );
        tree.del_cached("/Config/default", &path_of([("Config", "default")]));
        assert!(tree.top.is_empty());
    }

    fn segment() -> impl Strategy<Value = NodePath> {
        (prop::sample::select(vec!["A", "B"]), prop::sample::select(vec!["x", "y", "*"]))
            .prop_map(|(t, k)| NodePath::new(t, k))
    }

    fn concrete_segment() -> impl Strategy<Value = NodePath> {
        (prop::sample::select(vec!["A", "B"]), prop::sample::select(vec!["x", "y"]))
            .prop_map(|(t, k)| NodePath::new(t, k))
    }

    proptest! {
        #[test]
        fn prop_subscribe_then_unsubscribe_restores_coverage(
            existing in prop::collection::vec((prop::collection::vec(segment(), 1..4), 0u32..3), 0..6),
            added in prop::collection::vec(segment(), 1..4),
            depth in 0u32..3,
            probes in prop::collection::vec(prop::collection::vec(concrete_segment(), 1..5), 1..20),
        ) {
            let mut tree = SubscriptionTree::new();
            for (p, d) in &existing {
                tree.add_subscription(p, *d);
            }
            let before: Vec<bool> = probes.iter().map(|p| tree.check_path(p)).collect();
            tree.add_subscription(&added, depth);
            tree.del_subscription(&added);
            let after: Vec<bool> = probes.iter().map(|p| tree.check_path(p)).collect();
            prop_assert_eq!(before, after);
        }
    }
}
