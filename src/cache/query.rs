//! Generation-tagged cache for storage reads.
//!
//! Keys are the canonical JSON serialization of (query kind, filter,
//! pagination); the filter carries the tenant, so entries never serve another
//! tenant's query. Each entry remembers the write generation it was filled
//! at. A lookup at a newer generation is a miss, so no sweep is needed.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::model::{GraphEdge, GraphNode};
use crate::store::Page;

use super::lru::{CacheStats, LruCache};

/// Cached read result.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Node(Option<GraphNode>),
    Nodes(Page<GraphNode>),
    Edges(Page<GraphEdge>),
}

#[derive(Debug, Clone)]
struct Entry {
    generation: u64,
    value: CachedValue,
}

/// Canonical cache key for a read with the given parameters.
pub fn cache_key<F: Serialize, P: Serialize>(kind: &str, filter: &F, page: &P) -> String {
    let filter = serde_json::to_string(filter).unwrap_or_default();
    let page = serde_json::to_string(page).unwrap_or_default();
    format!("{kind}\u{1f}{filter}\u{1f}{page}")
}

/// LRU of read results tagged with the generation they were filled at.
#[derive(Debug)]
pub struct QueryCache {
    entries: Mutex<LruCache<String, Entry>>,
    stale: Mutex<u64>,
}

impl QueryCache {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        let lru = match ttl {
            Some(ttl) => LruCache::with_ttl(capacity, ttl),
            None => LruCache::new(capacity),
        };
        Self {
            entries: Mutex::new(lru),
            stale: Mutex::new(0),
        }
    }

    /// Cached value for `key`, if it was filled at `generation`.
    pub fn get(&self, key: &str, generation: u64) -> Option<CachedValue> {
        let mut entries = self.entries.lock();
        let entry = entries.get(&key.to_string())?;
        if entry.generation == generation {
            Some(entry.value)
        } else {
            entries.record_rejected_hit();
            entries.remove(&key.to_string());
            *self.stale.lock() += 1;
            None
        }
    }

    pub fn insert(&self, key: String, generation: u64, value: CachedValue) {
        self.entries.lock().put(key, Entry { generation, value });
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.entries.lock().stats()
    }

    /// Lookups rejected because their generation was stale.
    pub fn stale_count(&self) -> u64 {
        *self.stale.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NodeFilter, Pagination};

    #[test]
    fn stale_generation_is_a_miss() {
        let cache = QueryCache::new(8, None);
        let key = cache_key("nodes", &NodeFilter::new(), &Pagination::all());
        cache.insert(key.clone(), 3, CachedValue::Nodes(Page::empty()));
        assert!(cache.get(&key, 3).is_some());
        assert!(cache.get(&key, 4).is_none());
        assert_eq!(cache.stale_count(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn keys_differ_by_tenant_and_pagination() {
        use crate::model::TenantId;
        let a = cache_key("nodes", &NodeFilter::new().tenant(TenantId::new("a")), &Pagination::all());
        let b = cache_key("nodes", &NodeFilter::new().tenant(TenantId::new("b")), &Pagination::all());
        let c = cache_key(
            "nodes",
            &NodeFilter::new().tenant(TenantId::new("a")),
            &Pagination::offset(0, 10),
        );
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
