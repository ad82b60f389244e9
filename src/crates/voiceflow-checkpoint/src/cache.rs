//! Bounded LRU cache backing the lazy checkpointer
//!
//! Recency is tracked with a monotonically increasing tick per entry and a
//! `BTreeMap` from tick to key, so insert, touch and evict are all
//! `O(log n)` with no linear scans.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Cache metrics
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    /// Total number of cache hits
    pub hits: usize,

    /// Total number of cache misses
    pub misses: usize,

    /// Total number of evictions
    pub evictions: usize,
}

impl CacheMetrics {
    /// Calculate hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    tick: u64,
}

/// Least-recently-used cache keyed by checkpoint id
#[derive(Debug, Clone)]
pub struct LruCache<V> {
    entries: HashMap<String, Slot<V>>,
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    max_size: usize,
    metrics: CacheMetrics,
}

impl<V: Clone> LruCache<V> {
    /// A zero `max_size` is treated as one
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_tick: 0,
            max_size: max_size.max(1),
            metrics: CacheMetrics::default(),
        }
    }

    fn bump(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    /// Insert or replace, moving the key to most-recently-used
    ///
    /// Returns the evicted key, if capacity was exceeded.
    pub fn insert(&mut self, key: String, value: V) -> Option<String> {
        let tick = self.bump();
        if let Some(old) = self.entries.insert(key.clone(), Slot { value, tick }) {
            self.recency.remove(&old.tick);
        }
        self.recency.insert(tick, key);

        if self.entries.len() > self.max_size {
            if let Some((_, evicted)) = self.recency.pop_first() {
                self.entries.remove(&evicted);
                self.metrics.evictions += 1;
                return Some(evicted);
            }
        }
        None
    }

    /// Look up and mark as most-recently-used
    pub fn get(&mut self, key: &str) -> Option<V> {
        let tick = self.bump();
        match self.entries.get_mut(key) {
            Some(slot) => {
                self.recency.remove(&slot.tick);
                slot.tick = tick;
                self.recency.insert(tick, key.to_string());
                self.metrics.hits += 1;
                Some(slot.value.clone())
            }
            None => {
                self.metrics.misses += 1;
                None
            }
        }
    }

    /// Look up without touching recency or metrics
    pub fn peek(&self, key: &str) -> Option<&V> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        let slot = self.entries.remove(key)?;
        self.recency.remove(&slot.tick);
        Some(slot.value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Values from least to most recently used
    pub fn values(&self) -> Vec<V> {
        self.recency
            .values()
            .filter_map(|key| self.entries.get(key).map(|slot| slot.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.metrics
    }
}
