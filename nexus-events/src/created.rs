//! Rotating side buffer of recently seen `_created` markers.
//!
//! Watch events for a node or link record do not carry its creation
//! metadata; the marker arrives as a separate key in the same transaction.
//! Two maps are kept: writes go to the active one, lookups consult both.
//! Rotation clears the inactive map and makes it active, so an entry
//! survives at least one full rotation period.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use nexus_core::Properties;
use parking_lot::Mutex;

struct Buffers {
    maps: [HashMap<String, Properties>; 2],
    active: usize,
    rotated_at: Instant,
}

impl Buffers {
    fn rotate(&mut self) {
        let next = 1 - self.active;
        self.maps[next].clear();
        self.active = next;
        self.rotated_at = Instant::now();
    }
}

pub struct CreatedBuffer {
    inner: Mutex<Buffers>,
    rotation: Duration,
    max_entries: usize,
}

impl CreatedBuffer {
    pub fn new(rotation: Duration, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Buffers {
                maps: [HashMap::new(), HashMap::new()],
                active: 0,
                rotated_at: Instant::now(),
            }),
            rotation,
            max_entries,
        }
    }

    /// Record the marker value seen at `key`.
    pub fn insert(&self, key: String, value: Properties) {
        let mut b = self.inner.lock();
        if b.rotated_at.elapsed() >= self.rotation {
            b.rotate();
        }
        let active = b.active;
        b.maps[active].insert(key, value);
        if b.maps[active].len() > self.max_entries {
            tracing::debug!(entries = b.maps[active].len(), "created buffer full, rotating");
            b.rotate();
        }
    }

    pub fn get(&self, key: &str) -> Option<Properties> {
        let b = self.inner.lock();
        b.maps[b.active]
            .get(key)
            .or_else(|| b.maps[1 - b.active].get(key))
            .cloned()
    }

    pub fn len(&self) -> usize {
        let b = self.inner.lock();
        b.maps[0].len() + b.maps[1].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn marker(by: &str) -> Properties {
        let mut p = Properties::new();
        p.insert("_createdBy".into(), Value::from(by));
        p
    }

    #[test]
    fn test_lookup_spans_both_maps() {
        let buf = CreatedBuffer::new(Duration::from_secs(3600), 2);
        buf.insert("a".into(), marker("x"));
        buf.insert("b".into(), marker("y"));
        // third entry overflows the active map and rotates
        buf.insert("c".into(), marker("z"));
        assert_eq!(buf.get("a").map(|p| p["_createdBy"].clone()), Some(json!("x")));
        buf.insert("d".into(), marker("w"));
        assert!(buf.get("d").is_some());
    }

    #[test]
    fn test_two_rotations_drop_old_entries() {
        let buf = CreatedBuffer::new(Duration::from_secs(3600), 1);
        buf.insert("a".into(), marker("x"));
        buf.insert("b".into(), marker("x"));
        buf.insert("c".into(), marker("x"));
        buf.insert("d".into(), marker("x"));
        assert!(buf.get("a").is_none());
        assert!(buf.get("d").is_some());
    }

    #[test]
    fn test_time_based_rotation() {
        let buf = CreatedBuffer::new(Duration::ZERO, 100);
        buf.insert("a".into(), marker("x"));
        buf.insert("b".into(), marker("x"));
        buf.insert("c".into(), marker("x"));
        assert!(buf.get("a").is_none());
        assert!(buf.get("c").is_some());
    }
}
