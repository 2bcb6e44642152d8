// Bounded, in-process associative store with TTL and access-order tracking.
//
// Used directly as the L1 layer and as the backing structure for the query
// plan / result caches in `db::optimizer`. Eviction picks the entry with the
// smallest last-access time, breaking ties by earliest created time.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// The handful of shapes a cache entry's payload can take. Values are
/// tagged at the boundary rather than relying on runtime reflection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum CacheValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
    Record(serde_json::Value),
}

#[derive(Debug, Clone)]
struct Entry {
    value: CacheValue,
    created_at: DateTime<Utc>,
    expiry: DateTime<Utc>,
    original_ttl: Duration,
    access_count: u64,
    last_access: DateTime<Utc>,
    tags: Vec<String>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }
}

#[derive(Debug, Clone, Default)]
pub struct LruStatistics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl LruStatistics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Inner {
    entries: HashMap<String, Entry>,
    stats: LruStatistics,
}

/// A bounded, thread-safe LRU store. `capacity` is the hard limit on the
/// number of live entries; `set` past capacity evicts the entry with the
/// smallest `last_access`, breaking ties by earliest `created_at`.
pub struct LruStore {
    capacity: usize,
    inner: RwLock<Inner>,
}

impl LruStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                stats: LruStatistics::default(),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<CacheValue> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let expired = match inner.entries.get(key) {
            Some(e) => e.is_expired(now),
            None => {
                inner.stats.misses += 1;
                return None;
            }
        };
        if expired {
            inner.entries.remove(key);
            inner.stats.misses += 1;
            inner.stats.expirations += 1;
            return None;
        }
        let entry = inner.entries.get_mut(key).unwrap();
        entry.last_access = now;
        entry.access_count += 1;
        inner.stats.hits += 1;
        Some(inner.entries.get(key).unwrap().value.clone())
    }

    pub fn set(&self, key: &str, value: CacheValue, ttl: Duration) {
        self.set_with_tags(key, value, ttl, Vec::new());
    }

    pub fn set_with_tags(&self, key: &str, value: CacheValue, ttl: Duration, tags: Vec<String>) {
        let now = Utc::now();
        let mut inner = self.inner.write();
        if !inner.entries.contains_key(key) && inner.entries.len() >= self.capacity {
            Self::evict_one(&mut inner);
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                created_at: now,
                expiry: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
                original_ttl: ttl,
                access_count: 0,
                last_access: now,
                tags,
            },
        );
        inner.stats.sets += 1;
    }

    fn evict_one(inner: &mut Inner) {
        let victim = inner
            .entries
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.last_access
                    .cmp(&b.last_access)
                    .then_with(|| a.created_at.cmp(&b.created_at))
            })
            .map(|(k, _)| k.clone());
        if let Some(k) = victim {
            inner.entries.remove(&k);
            inner.stats.evictions += 1;
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.write();
        let existed = inner.entries.remove(key).is_some();
        if existed {
            inner.stats.deletes += 1;
        }
        existed
    }

    pub fn has(&self, key: &str) -> bool {
        let now = Utc::now();
        let inner = self.inner.read();
        matches!(inner.entries.get(key), Some(e) if !e.is_expired(now))
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
    }

    pub fn size(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sweep expired entries eagerly. Intended to be called from a periodic
    /// background tick; `get` also expires lazily on read.
    pub fn cleanup(&self) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let expired_keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        let count = expired_keys.len();
        for k in &expired_keys {
            inner.entries.remove(k);
        }
        inner.stats.expirations += count as u64;
        count
    }

    pub fn statistics(&self) -> LruStatistics {
        self.inner.read().stats.clone()
    }

    pub fn keys_with_tag(&self, tag: &str) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .entries
            .iter()
            .filter(|(_, e)| e.tags.iter().any(|t| t == tag))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// All live (non-expired) keys. Used by pattern invalidation, which has
    /// no native scan on this layer and falls back to an O(n) sweep —
    /// acceptable given L1's bounded capacity.
    pub fn all_keys(&self) -> Vec<String> {
        let now = Utc::now();
        let inner = self.inner.read();
        inner
            .entries
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Remaining TTL fraction left on an entry, used by refresh-ahead.
    pub fn remaining_ttl_fraction(&self, key: &str) -> Option<f64> {
        let now = Utc::now();
        let inner = self.inner.read();
        let entry = inner.entries.get(key)?;
        if entry.original_ttl.is_zero() {
            return Some(0.0);
        }
        let remaining = (entry.expiry - now).num_milliseconds().max(0) as f64;
        let total = entry.original_ttl.as_millis() as f64;
        Some((remaining / total).clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_returns_value() {
        let store = LruStore::new(4);
        store.set("a", CacheValue::Int(1), Duration::from_secs(10));
        assert_eq!(store.get("a"), Some(CacheValue::Int(1)));
    }

    #[test]
    fn delete_makes_key_absent() {
        let store = LruStore::new(4);
        store.set("a", CacheValue::Int(1), Duration::from_secs(10));
        assert!(store.delete("a"));
        assert_eq!(store.get("a"), None);
    }

    #[test]
    fn capacity_evicts_smallest_last_access() {
        let store = LruStore::new(2);
        store.set("a", CacheValue::Int(1), Duration::from_secs(60));
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.set("b", CacheValue::Int(2), Duration::from_secs(60));
        // touch b so a remains the least-recently-used
        store.get("b");
        store.set("c", CacheValue::Int(3), Duration::from_secs(60));
        assert_eq!(store.get("a"), None);
        assert!(store.has("b"));
        assert!(store.has("c"));
    }

    #[test]
    fn ttl_expiry_returns_absent() {
        let store = LruStore::new(4);
        store.set("a", CacheValue::Int(1), Duration::from_millis(1));
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(store.get("a"), None);
        let stats = store.statistics();
        assert_eq!(stats.expirations, 1);
    }

    #[test]
    fn hit_rate_is_bounded() {
        let store = LruStore::new(4);
        store.set("a", CacheValue::Int(1), Duration::from_secs(10));
        store.get("a");
        store.get("missing");
        let stats = store.statistics();
        assert!(stats.hit_rate() >= 0.0 && stats.hit_rate() <= 1.0);
    }
}
