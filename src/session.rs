//! Connected-client registry
//!
//! Keyed by client identifier. The engine holds no cross-event state of its
//! own; everything that survives a dispatch call lives here. Correctness
//! relies on the cache providing atomic get/set per key, which the default
//! concurrent-map implementation does without external locking.

use dashmap::DashMap;

/// Record stored per connected client.
///
/// Registered empty at CONNECT time; downstream work handlers fill in the
/// transport binding once they learn it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecord {
    /// Transport connection currently bound to this client id
    pub connection_id: Option<u64>,
    /// Negotiated keep-alive interval in seconds
    pub keep_alive: u16,
}

/// Key-value store for session records, safe for multi-writer access.
pub trait SessionCache: Send + Sync {
    fn get(&self, key: &str) -> Option<SessionRecord>;
    fn set(&self, key: &str, record: SessionRecord);
    fn delete(&self, key: &str);
}

/// In-process session cache backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemorySessionCache {
    table: DashMap<String, SessionRecord>,
}

impl MemorySessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl SessionCache for MemorySessionCache {
    fn get(&self, key: &str) -> Option<SessionRecord> {
        self.table.get(key).map(|entry| entry.clone())
    }

    fn set(&self, key: &str, record: SessionRecord) {
        self.table.insert(key.to_string(), record);
    }

    fn delete(&self, key: &str) {
        self.table.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn set_get_delete() {
        let cache = MemorySessionCache::new();
        assert_eq!(cache.get("c1"), None);

        cache.set("c1", SessionRecord::default());
        assert_eq!(cache.get("c1"), Some(SessionRecord::default()));

        let bound = SessionRecord {
            connection_id: Some(9),
            keep_alive: 30,
        };
        cache.set("c1", bound.clone());
        assert_eq!(cache.get("c1"), Some(bound));

        cache.delete("c1");
        assert_eq!(cache.get("c1"), None);
        assert!(cache.is_empty());
    }
}
