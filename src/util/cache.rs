//! Keyed cache with TTL and LRU eviction.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

/// A small TTL + LRU cache, cheap to clone and share.
#[derive(Clone)]
pub struct TtlCache<K, V> {
    inner: Arc<RwLock<CacheInner<K, V>>>,
}

struct CacheInner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    max_entries: usize,
    ttl: Duration,
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    last_accessed: Instant,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CacheInner {
                entries: HashMap::new(),
                max_entries: max_entries.max(1),
                ttl,
            })),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.read().ttl
    }

    /// Get a cached value, returning None if expired or missing.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.write();
        let ttl = inner.ttl;

        let expired = inner
            .entries
            .get(key)
            .map(|e| e.inserted_at.elapsed() > ttl)?;
        if expired {
            inner.entries.remove(key);
            return None;
        }
        let entry = inner.entries.get_mut(key)?;
        entry.last_accessed = Instant::now();
        Some(entry.value.clone())
    }

    /// Insert a value, evicting the least recently used entry at capacity.
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.write();

        let ttl = inner.ttl;
        inner.entries.retain(|_, e| e.inserted_at.elapsed() <= ttl);

        if inner.entries.len() >= inner.max_entries && !inner.entries.contains_key(&key) {
            if let Some(lru_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&lru_key);
            }
        }

        let now = Instant::now();
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                last_accessed: now,
            },
        );
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.write().entries.remove(key).map(|e| e.value)
    }

    pub fn clear(&self) {
        self.inner.write().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
