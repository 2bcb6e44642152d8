// L1 (in-process, wraps `LruStore`) and L2 (shared networked store) share
// one `CacheLayer` contract; the manager in `cache::manager` walks both in
// priority order for the generic get/set/invalidate path. L3 is a separate,
// narrower store keyed only by (query fingerprint, params fingerprint) —
// it does not implement `CacheLayer` and is reachable only through
// `CacheManager::get_query_result`/`set_query_result` or directly from
// `db::optimizer::QueryOptimizer`.
//
// Open question (deferred, see SPEC_FULL.md): the real wire format of L2 is
// implementation-defined. `InMemorySharedStore` satisfies the contract with
// `dashmap` so the manager and invalidation coordinator can be built and
// tested against it; a production backend (e.g. Redis) would implement the
// same `CacheLayer` trait.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cache::lru::{CacheValue, LruStore};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerName {
    L1,
    L2,
    L3,
}

impl std::fmt::Display for LayerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerName::L1 => write!(f, "L1"),
            LayerName::L2 => write!(f, "L2"),
            LayerName::L3 => write!(f, "L3"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LayerDescriptor {
    pub name: LayerName,
    pub enabled: bool,
    pub priority: u8,
    pub default_ttl: Duration,
}

/// Common contract shared by L1, L2, and L3. Transport failure on a layer
/// must surface as `Error::transient` — the manager downgrades that to a
/// miss and continues with the next layer, it never propagates the error
/// to the caller on a read path.
#[async_trait]
pub trait CacheLayer: Send + Sync {
    fn name(&self) -> LayerName;

    async fn get(&self, key: &str) -> Result<Option<CacheValue>>;

    async fn set(&self, key: &str, value: CacheValue, ttl: Duration, tags: &[String]) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// `None` if this layer does not support tag-based invalidation.
    async fn invalidate_by_tag(&self, _tag: &str) -> Result<Option<usize>> {
        Ok(None)
    }

    /// `None` if this layer does not support pattern-based invalidation.
    async fn invalidate_by_pattern(&self, _pattern: &str) -> Result<Option<usize>> {
        Ok(None)
    }

    /// Remaining TTL as a fraction of the entry's original TTL, used by
    /// refresh-ahead. `None` if the layer doesn't track per-entry TTL
    /// fractions or the key isn't present.
    async fn remaining_ttl_fraction(&self, _key: &str) -> Option<f64> {
        None
    }
}

/// L1: zero-network-hop in-process layer wrapping `LruStore`.
pub struct L1Layer {
    store: LruStore,
}

impl L1Layer {
    pub fn new(capacity: usize) -> Self {
        Self {
            store: LruStore::new(capacity),
        }
    }

    pub fn lru(&self) -> &LruStore {
        &self.store
    }
}

#[async_trait]
impl CacheLayer for L1Layer {
    fn name(&self) -> LayerName {
        LayerName::L1
    }

    async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        Ok(self.store.get(key))
    }

    async fn set(&self, key: &str, value: CacheValue, ttl: Duration, tags: &[String]) -> Result<bool> {
        self.store.set_with_tags(key, value, ttl, tags.to_vec());
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.store.delete(key))
    }

    async fn invalidate_by_tag(&self, tag: &str) -> Result<Option<usize>> {
        let keys = self.store.keys_with_tag(tag);
        let n = keys.len();
        for k in keys {
            self.store.delete(&k);
        }
        Ok(Some(n))
    }

    async fn invalidate_by_pattern(&self, pattern: &str) -> Result<Option<usize>> {
        let re = glob_to_regex(pattern)?;
        let matched: Vec<String> = self
            .store
            .all_keys()
            .into_iter()
            .filter(|k| re.is_match(k))
            .collect();
        for k in &matched {
            self.store.delete(k);
        }
        Ok(Some(matched.len()))
    }

    async fn remaining_ttl_fraction(&self, key: &str) -> Option<f64> {
        self.store.remaining_ttl_fraction(key)
    }
}

/// Translate a `*`-wildcard glob into an anchored regex, per the pattern
/// semantics in spec section 6 (only `*` is a wildcard).
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut out = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            c if regex_syntax::is_meta_character(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| Error::validation(format!("invalid pattern '{pattern}': {e}")))
}

mod regex_syntax {
    pub fn is_meta_character(c: char) -> bool {
        matches!(
            c,
            '.' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\'
        )
    }
}

struct L2Entry {
    value: CacheValue,
    expiry: chrono::DateTime<chrono::Utc>,
    tags: Vec<String>,
}

/// L2: shared networked key/value store. `InMemorySharedStore` is the
/// in-process stand-in for the open wire-format question; it maintains a
/// tag -> keys index so `invalidate_by_tag` doesn't need a native scan.
pub struct InMemorySharedStore {
    entries: DashMap<String, L2Entry>,
    tag_index: DashMap<String, HashSet<String>>,
}

impl Default for InMemorySharedStore {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            tag_index: DashMap::new(),
        }
    }
}

impl InMemorySharedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheLayer for InMemorySharedStore {
    fn name(&self) -> LayerName {
        LayerName::L2
    }

    async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        let now = chrono::Utc::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expiry > now {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: CacheValue, ttl: Duration, tags: &[String]) -> Result<bool> {
        let expiry = chrono::Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        for tag in tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.entries.insert(
            key.to_string(),
            L2Entry {
                value,
                expiry,
                tags: tags.to_vec(),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        if let Some((_, entry)) = self.entries.remove(key) {
            for tag in entry.tags {
                if let Some(mut set) = self.tag_index.get_mut(&tag) {
                    set.remove(key);
                }
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn invalidate_by_tag(&self, tag: &str) -> Result<Option<usize>> {
        let keys: Vec<String> = self
            .tag_index
            .get(tag)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for k in &keys {
            self.entries.remove(k);
        }
        self.tag_index.remove(tag);
        Ok(Some(keys.len()))
    }

    async fn invalidate_by_pattern(&self, pattern: &str) -> Result<Option<usize>> {
        let re = glob_to_regex(pattern)?;
        let matched: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| re.is_match(k))
            .collect();
        for k in &matched {
            self.delete(k).await?;
        }
        Ok(Some(matched.len()))
    }
}

/// L3: persisted-rows store holding only query results, keyed by the pair
/// (query fingerprint, params fingerprint) that
/// `db::optimizer::result_cache_fingerprints` produces. Unlike L1/L2, L3
/// does not implement `CacheLayer` — there is no `set(key, ...)` that takes
/// an arbitrary string, so it cannot be wired into `CacheManager`'s generic
/// layer fan-out and cannot receive HTTP/domain cache writes. It is only
/// reachable through `CacheManager::get_query_result`/`set_query_result` or
/// directly from `db::optimizer::QueryOptimizer`.
pub struct L3Layer {
    rows: DashMap<String, L2Entry>,
}

impl Default for L3Layer {
    fn default() -> Self {
        Self { rows: DashMap::new() }
    }
}

impl L3Layer {
    pub fn new() -> Self {
        Self::default()
    }

    fn compose_key(query_fingerprint: &str, params_fingerprint: &str) -> String {
        format!("{query_fingerprint}:{params_fingerprint}")
    }

    pub async fn get_result(&self, query_fingerprint: &str, params_fingerprint: &str) -> Option<CacheValue> {
        let key = Self::compose_key(query_fingerprint, params_fingerprint);
        let now = chrono::Utc::now();
        if let Some(entry) = self.rows.get(&key) {
            if entry.expiry > now {
                return Some(entry.value.clone());
            }
        }
        self.rows.remove(&key);
        None
    }

    pub async fn set_result(&self, query_fingerprint: &str, params_fingerprint: &str, value: CacheValue, ttl: Duration) -> bool {
        let key = Self::compose_key(query_fingerprint, params_fingerprint);
        let expiry = chrono::Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        self.rows.insert(key, L2Entry { value, expiry, tags: Vec::new() });
        true
    }

    pub async fn delete_result(&self, query_fingerprint: &str, params_fingerprint: &str) -> bool {
        let key = Self::compose_key(query_fingerprint, params_fingerprint);
        self.rows.remove(&key).is_some()
    }
}
