//! A single concurrent LRU-with-TTL map shared by all three cache tiers.
//!
//! Grounded on the reference `DashMap`-backed backend this crate's ancestor
//! shipped as an educational example: a concurrent hash map of entries with
//! manual `Instant`-based expiry. That implementation had no eviction policy
//! ("manual cleanup required"); this one adds an intrusive recency index so
//! tiers can enforce a capacity and the memory watchdog can walk entries in
//! LRU order for priority-weighted eviction, without serializing ordinary
//! `get`/`insert` traffic through a single lock — the recency index is only
//! touched for the O(log n) splice, not for reading the value itself.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
    inserted_at: Instant,
    seq: u64,
}

/// One tier's LRU-with-TTL store. Cheap to clone (all state is `Arc`-shared).
pub struct ConcurrentLruTtl<V: Clone + Send + Sync + 'static> {
    map: Arc<DashMap<String, Entry<V>>>,
    /// seq -> key, maintained so the oldest entry is always the first element.
    order: Arc<Mutex<BTreeMap<u64, String>>>,
    seq_counter: Arc<AtomicU64>,
    capacity: usize,
    default_ttl: Duration,
    /// Whether `get` counts as a touch that refreshes recency (L2/L3) or not (L1 rules).
    refresh_on_get: bool,
}

/// A snapshot entry used by the memory watchdog's priority-weighted eviction pass.
pub struct EvictionCandidate {
    pub key: String,
    pub age: Duration,
    /// 0 = least recently used (best eviction candidate by recency alone).
    pub lru_rank: usize,
    pub total: usize,
}

impl<V: Clone + Send + Sync + 'static> Clone for ConcurrentLruTtl<V> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
            order: self.order.clone(),
            seq_counter: self.seq_counter.clone(),
            capacity: self.capacity,
            default_ttl: self.default_ttl,
            refresh_on_get: self.refresh_on_get,
        }
    }
}

impl<V: Clone + Send + Sync + 'static> ConcurrentLruTtl<V> {
    #[must_use]
    pub fn new(capacity: usize, default_ttl: Duration, refresh_on_get: bool) -> Self {
        Self {
            map: Arc::new(DashMap::new()),
            order: Arc::new(Mutex::new(BTreeMap::new())),
            seq_counter: Arc::new(AtomicU64::new(0)),
            capacity,
            default_ttl,
            refresh_on_get,
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn touch_order(&self, key: &str, old_seq: Option<u64>, new_seq: u64) {
        let mut order = self.order.lock();
        if let Some(old) = old_seq {
            order.remove(&old);
        }
        order.insert(new_seq, key.to_string());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        let mut removed_expired = false;
        let result = {
            let entry = self.map.get(key)?;
            if entry.expires_at <= Instant::now() {
                removed_expired = true;
                None
            } else {
                Some((entry.value.clone(), entry.seq))
            }
        };
        if removed_expired {
            self.map.remove(key);
            return None;
        }
        let (value, old_seq) = result?;
        if self.refresh_on_get {
            let new_seq = self.next_seq();
            if let Some(mut entry) = self.map.get_mut(key) {
                entry.seq = new_seq;
            }
            self.touch_order(key, Some(old_seq), new_seq);
        }
        Some(value)
    }

    pub fn insert(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let seq = self.next_seq();
        let old_seq = self
            .map
            .insert(
                key.clone(),
                Entry { value, expires_at: Instant::now() + ttl, inserted_at: Instant::now(), seq },
            )
            .map(|old| old.seq);
        self.touch_order(&key, old_seq, seq);
        self.evict_over_capacity();
    }

    pub fn insert_default_ttl(&self, key: impl Into<String>, value: V) {
        self.insert(key, value, self.default_ttl);
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let removed = self.map.remove(key)?.1;
        self.order.lock().remove(&removed.seq);
        Some(removed.value)
    }

    /// Removes every key starting with `prefix`. Used by provider-scoped invalidation.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let mut removed_keys = Vec::new();
        self.map.retain(|k, v| {
            if k.starts_with(prefix) {
                removed_keys.push(v.seq);
                false
            } else {
                true
            }
        });
        if !removed_keys.is_empty() {
            let mut order = self.order.lock();
            for seq in &removed_keys {
                order.remove(seq);
            }
        }
        removed_keys.len()
    }

    pub fn clear(&self) {
        self.map.clear();
        self.order.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn evict_over_capacity(&self) {
        if self.capacity == 0 {
            return;
        }
        while self.map.len() > self.capacity {
            let oldest_key = {
                let mut order = self.order.lock();
                let Some((&seq, key)) = order.iter().next() else { break };
                let key = key.clone();
                order.remove(&seq);
                key
            };
            self.map.remove(&oldest_key);
        }
    }

    /// Drops entries whose TTL has elapsed. Tiers are also lazily cleaned on
    /// `get`, but a periodic sweep (driven by the memory watchdog) bounds
    /// worst-case memory for keys that are never read again.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = Vec::new();
        self.map.retain(|_, v| {
            if v.expires_at <= now {
                removed.push(v.seq);
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            let mut order = self.order.lock();
            for seq in &removed {
                order.remove(seq);
            }
        }
        removed.len()
    }

    /// Snapshot of every live key in LRU order (oldest first), for the memory
    /// watchdog's priority-weighted eviction scoring.
    #[must_use]
    pub fn eviction_candidates(&self) -> Vec<EvictionCandidate> {
        let order = self.order.lock();
        let total = order.len();
        let now = Instant::now();
        order
            .values()
            .enumerate()
            .filter_map(|(rank, key)| {
                let entry = self.map.get(key)?;
                Some(EvictionCandidate {
                    key: key.clone(),
                    age: now.saturating_duration_since(entry.inserted_at),
                    lru_rank: rank,
                    total,
                })
            })
            .collect()
    }

    /// Evicts the given keys, returning how many were actually present.
    pub fn evict_many<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> usize {
        let mut count = 0;
        for key in keys {
            if self.remove(key).is_some() {
                count += 1;
            }
        }
        count
    }
}
