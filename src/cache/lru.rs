//! Bounded LRU map with optional TTL and hit/miss accounting.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Least-recently-used cache.
///
/// Not synchronized; wrap it in a lock to share it.
#[derive(Debug)]
pub struct LruCache<K, V> {
    entries: HashMap<K, (V, Instant)>,
    /// Front = most recently used.
    order: VecDeque<K>,
    capacity: usize,
    ttl: Option<Duration>,
    hits: u64,
    misses: u64,
}

impl<K: Hash + Eq + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            ttl: None,
            hits: 0,
            misses: 0,
        }
    }

    pub fn with_ttl(capacity: usize, ttl: Duration) -> Self {
        let mut cache = Self::new(capacity);
        cache.ttl = Some(ttl);
        cache
    }

    fn touch(&mut self, key: &K) {
        self.order.retain(|k| k != key);
        self.order.push_front(key.clone());
    }

    fn evict_if_needed(&mut self) {
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_back() {
                self.entries.remove(&old);
            }
        }
    }

    fn expired(&self, inserted: Instant) -> bool {
        self.ttl.is_some_and(|ttl| inserted.elapsed() >= ttl)
    }

    /// Look up `key`, refreshing its recency. Expired entries are removed.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let found = self.entries.get(key).map(|(v, at)| (v.clone(), *at));
        match found {
            Some((value, inserted)) if !self.expired(inserted) => {
                self.hits += 1;
                self.touch(key);
                Some(value)
            }
            Some(_) => {
                self.misses += 1;
                self.remove(key);
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn put(&mut self, key: K, value: V) {
        self.touch(&key);
        self.entries.insert(key, (value, Instant::now()));
        self.evict_if_needed();
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.order.retain(|k| k != key);
        self.entries.remove(key).map(|(v, _)| v)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a lookup that found an entry but rejected it (e.g. stale).
    pub(crate) fn record_rejected_hit(&mut self) {
        self.hits = self.hits.saturating_sub(1);
        self.misses += 1;
    }

    pub fn stats(&self) -> CacheStats {
        let total = self.hits + self.misses;
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            hit_rate: if total > 0 {
                self.hits as f64 / total as f64
            } else {
                0.0
            },
            size: self.entries.len(),
            capacity: self.capacity,
        }
    }

    pub fn reset_stats(&mut self) {
        self.hits = 0;
        self.misses = 0;
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub capacity: usize,
}
