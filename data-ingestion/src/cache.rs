//! Snapshot caches consulted by the collector.
//!
//! * [`TtlCache`] - size-capped, TTL-bounded local cache. Writes sweep
//!   expired entries first, then evict oldest-inserted entries past the cap.
//! * [`SharedSnapshotCache`] - pre-warmed cache other components fill ahead
//!   of time; the collector only reads it.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use common::{MarketSnapshot, Symbol};
use dashmap::DashMap;
use lru::LruCache;
use tokio::time::Instant;
use tracing::debug;

/// Local cache seam so the collector can be tested with any backing store.
pub trait SnapshotCache: Send + Sync {
    /// Returns the snapshot only while it is within its TTL.
    fn get(&self, symbol: &str) -> Option<MarketSnapshot>;
    fn insert(&self, symbol: Symbol, snapshot: MarketSnapshot);
    fn len(&self) -> usize;
    fn clear(&self);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read side of a cache populated elsewhere.
pub trait PrewarmedCache: Send + Sync {
    fn get(&self, symbol: &str) -> Option<MarketSnapshot>;
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    data: V,
    inserted_at: Instant,
}

/// Bounded TTL cache. Reads never reorder entries, so eviction order is
/// insertion order.
pub struct TtlCache<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, CacheEntry<V>>>,
    ttl: Duration,
    capacity: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            ttl,
            capacity,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get_fresh(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.peek(key)?;
        (entry.inserted_at.elapsed() <= self.ttl).then(|| entry.data.clone())
    }

    /// Inserts `value`, returning how many entries were dropped
    /// (expired plus evicted).
    pub fn put(&self, key: K, value: V) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        let expired: Vec<K> = entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.inserted_at) > self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        let mut dropped = expired.len();
        for key in &expired {
            entries.pop(key);
        }

        let entry = CacheEntry {
            data: value,
            inserted_at: now,
        };
        if entries.contains(&key) {
            entries.put(key, entry);
        } else if entries.push(key, entry).is_some() {
            dropped += 1;
        }
        dropped
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn purge(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}

impl SnapshotCache for TtlCache<Symbol, MarketSnapshot> {
    fn get(&self, symbol: &str) -> Option<MarketSnapshot> {
        self.get_fresh(&symbol.to_string())
    }

    fn insert(&self, symbol: Symbol, snapshot: MarketSnapshot) {
        let dropped = self.put(symbol, snapshot);
        if dropped > 0 {
            debug!(dropped, "local snapshot cache sweep");
        }
    }

    fn len(&self) -> usize {
        self.entry_count()
    }

    fn clear(&self) {
        self.purge();
    }
}

/// Pre-warmed snapshots keyed by symbol.
#[derive(Debug, Default)]
pub struct SharedSnapshotCache {
    snapshots: DashMap<Symbol, MarketSnapshot>,
}

impl SharedSnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warm(&self, snapshot: MarketSnapshot) {
        self.snapshots.insert(snapshot.symbol.clone(), snapshot);
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl PrewarmedCache for SharedSnapshotCache {
    fn get(&self, symbol: &str) -> Option<MarketSnapshot> {
        self.snapshots.get(symbol).map(|s| s.value().clone())
    }
}
