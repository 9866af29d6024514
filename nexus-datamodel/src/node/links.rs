//! Forward and reverse link maps of a cached node.

use std::collections::{BTreeMap, HashMap};

use nexus_core::GraphLink;
use parking_lot::RwLock;

type LinkMap = HashMap<String, BTreeMap<String, GraphLink>>;

/// Links keyed by destination type then key, rlinks by source type then
/// key. Each map has its own lock; callers never hold one across an await.
#[derive(Default)]
pub struct LinkManager {
    links: RwLock<LinkMap>,
    rlinks: RwLock<LinkMap>,
}

fn put(map: &mut LinkMap, node_type: &str, key: &str, link: GraphLink) -> Option<GraphLink> {
    map.entry(node_type.to_string())
        .or_default()
        .insert(key.to_string(), link)
}

fn take(map: &mut LinkMap, node_type: &str, key: &str) -> Option<GraphLink> {
    let by_key = map.get_mut(node_type)?;
    let old = by_key.remove(key);
    if by_key.is_empty() {
        map.remove(node_type);
    }
    old
}

fn flatten(map: &LinkMap) -> Vec<(String, String, GraphLink)> {
    map.iter()
        .flat_map(|(t, by_key)| {
            by_key
                .iter()
                .map(move |(k, l)| (t.clone(), k.clone(), l.clone()))
        })
        .collect()
}

impl LinkManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a link, returning the previous one.
    pub fn add(&self, dest_type: &str, dest_key: &str, link: GraphLink) -> Option<GraphLink> {
        put(&mut self.links.write(), dest_type, dest_key, link)
    }

    pub fn delete(&self, dest_type: &str, dest_key: &str) -> Option<GraphLink> {
        take(&mut self.links.write(), dest_type, dest_key)
    }

    pub fn get(&self, dest_type: &str, dest_key: &str) -> Option<GraphLink> {
        self.links.read().get(dest_type)?.get(dest_key).cloned()
    }

    pub fn has(&self, dest_type: &str, dest_key: &str) -> bool {
        self.links
            .read()
            .get(dest_type)
            .is_some_and(|m| m.contains_key(dest_key))
    }

    #[cfg(test)]
    pub(crate) fn has_type(&self, dest_type: &str) -> bool {
        self.links.read().contains_key(dest_type)
    }

    /// Snapshot of all links as `(dest_type, dest_key, link)`.
    pub fn all(&self) -> Vec<(String, String, GraphLink)> {
        flatten(&self.links.read())
    }

    /// Snapshot of the links to `dest_type`, sorted by key.
    pub fn of_type(&self, dest_type: &str) -> Vec<(String, GraphLink)> {
        self.links
            .read()
            .get(dest_type)
            .map(|m| m.iter().map(|(k, l)| (k.clone(), l.clone())).collect())
            .unwrap_or_default()
    }

    /// Sorted keys of the links to `dest_type`.
    #[cfg(test)]
    pub(crate) fn keys_of_type(&self, dest_type: &str) -> Vec<String> {
        self.links
            .read()
            .get(dest_type)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The cached key following `after` among links to `dest_type`.
    pub fn next_key(&self, dest_type: &str, after: &str) -> Option<String> {
        use std::ops::Bound::{Excluded, Unbounded};
        let links = self.links.read();
        let by_key = links.get(dest_type)?;
        if after.is_empty() {
            return by_key.keys().next().cloned();
        }
        by_key
            .range::<str, _>((Excluded(after), Unbounded))
            .next()
            .map(|(k, _)| k.clone())
    }

    pub fn len(&self) -> usize {
        self.links.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_rlink(&self, src_type: &str, src_key: &str, link: GraphLink) -> Option<GraphLink> {
        put(&mut self.rlinks.write(), src_type, src_key, link)
    }

    pub fn delete_rlink(&self, src_type: &str, src_key: &str) -> Option<GraphLink> {
        take(&mut self.rlinks.write(), src_type, src_key)
    }

    pub fn get_rlink(&self, src_type: &str, src_key: &str) -> Option<GraphLink> {
        self.rlinks.read().get(src_type)?.get(src_key).cloned()
    }

    pub fn all_rlinks(&self) -> Vec<(String, String, GraphLink)> {
        flatten(&self.rlinks.read())
    }

    pub fn rlinks_of_type(&self, src_type: &str) -> Vec<(String, GraphLink)> {
        self.rlinks
            .read()
            .get(src_type)
            .map(|m| m.iter().map(|(k, l)| (k.clone(), l.clone())).collect())
            .unwrap_or_default()
    }

    pub fn rlink_len(&self) -> usize {
        self.rlinks.read().values().map(BTreeMap::len).sum()
    }

    /// Drop every link and rlink.
    #[cfg(test)]
    pub(crate) fn clear(&self) {
        self.links.write().clear();
        self.rlinks.write().clear();
    }
}

// =============================================================================
// TESTS
// =============================================================================
