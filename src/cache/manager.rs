// Orchestrates the generic L1/L2 cache layers for reads, writes, and
// invalidation, plus a separate path to the dedicated L3 query-result cache.
//
// Implements cache-aside reads (promote on hit, skip-populate the higher
// layers), write-through, write-behind (via the durable job queue), and
// refresh-ahead scheduling. Emits `CacheEvent`s for every hit/miss/set so
// the warmer, invalidation coordinator, and metrics subsystem can observe
// traffic without the manager depending on any of them directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashSet;
use tracing::{debug, instrument, warn};

use crate::cache::layers::{CacheLayer, L3Layer, LayerDescriptor, LayerName};
use crate::cache::lru::CacheValue;
use crate::error::Result;
use crate::events::{CacheEvent, EventBus};
use crate::jobqueue::{JobQueue, Priority};

/// Caller-supplied source of truth for write-through/write-behind writes
/// and for cache-aside misses.
#[async_trait]
pub trait Store: Send + Sync {
    async fn write(&self, key: &str, value: CacheValue) -> Result<()>;
}

struct Layer {
    descriptor: LayerDescriptor,
    layer: Arc<dyn CacheLayer>,
}

pub struct CacheManager {
    layers: Vec<Layer>,
    events: Arc<EventBus<CacheEvent>>,
    refresh_threshold: f64,
    in_flight_refresh: DashSet<String>,
    jobs: Option<Arc<JobQueue>>,
    result_cache: Option<(Arc<L3Layer>, Duration)>,
}

pub struct CacheManagerBuilder {
    layers: Vec<Layer>,
    refresh_threshold: f64,
    jobs: Option<Arc<JobQueue>>,
    result_cache: Option<(Arc<L3Layer>, Duration)>,
}

impl CacheManagerBuilder {
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            refresh_threshold: 0.2,
            jobs: None,
            result_cache: None,
        }
    }

    pub fn with_layer(mut self, descriptor: LayerDescriptor, layer: Arc<dyn CacheLayer>) -> Self {
        self.layers.push(Layer { descriptor, layer });
        self
    }

    pub fn with_refresh_threshold(mut self, threshold: f64) -> Self {
        self.refresh_threshold = threshold;
        self
    }

    pub fn with_job_queue(mut self, jobs: Arc<JobQueue>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Wire the dedicated query-result cache (L3). Unlike `with_layer`, this
    /// layer never joins the generic get/set/invalidate fan-out — it is
    /// only reachable through `get_query_result`/`set_query_result`.
    pub fn with_result_cache(mut self, layer: Arc<L3Layer>, default_ttl: Duration) -> Self {
        self.result_cache = Some((layer, default_ttl));
        self
    }

    pub fn build(mut self, events: Arc<EventBus<CacheEvent>>) -> CacheManager {
        self.layers.sort_by_key(|l| l.descriptor.priority);
        CacheManager {
            layers: self.layers,
            events,
            refresh_threshold: self.refresh_threshold,
            in_flight_refresh: DashSet::new(),
            jobs: self.jobs,
            result_cache: self.result_cache,
        }
    }
}

impl Default for CacheManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheManager {
    fn enabled_layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter().filter(|l| l.descriptor.enabled)
    }

    /// Cache-aside read: walk enabled layers in priority order. On a hit at
    /// layer `i`, repopulate layers `0..i` with the value using each
    /// layer's own default TTL, emit `hit`, and return. On a full miss,
    /// emit `miss` and return `None` — the caller is expected to fetch and
    /// call `set`.
    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Option<CacheValue> {
        let layers: Vec<&Layer> = self.enabled_layers().collect();
        for (i, layer) in layers.iter().enumerate() {
            let start = Instant::now();
            let value = match layer.layer.get(key).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(layer = %layer.descriptor.name, error = %e, "layer transport error, treating as miss");
                    None
                }
            };
            if let Some(value) = value {
                let latency = start.elapsed();
                for earlier in &layers[..i] {
                    let _ = earlier
                        .layer
                        .set(key, value.clone(), earlier.descriptor.default_ttl, &[])
                        .await;
                }
                self.events.publish(CacheEvent::Hit {
                    key: key.to_string(),
                    layer: layer.descriptor.name,
                    latency_us: latency.as_micros() as u64,
                });
                self.maybe_schedule_refresh(layer, key).await;
                return Some(value);
            }
        }
        self.events.publish(CacheEvent::Miss { key: key.to_string() });
        None
    }

    /// If the hit layer reports remaining TTL below `refresh_threshold` of
    /// the original TTL, mark the key for a background refresh — at most
    /// one concurrent refresh per key. The actual fetch is supplied by the
    /// caller out of band (via `RefreshScheduled` event); this only tracks
    /// the at-most-one-concurrent invariant and never blocks the hit path.
    async fn maybe_schedule_refresh(&self, layer: &Layer, key: &str) {
        let Some(fraction) = layer.layer.remaining_ttl_fraction(key).await else {
            return;
        };
        if fraction >= self.refresh_threshold {
            return;
        }
        if self.in_flight_refresh.insert(key.to_string()) {
            self.events.publish(CacheEvent::RefreshScheduled { key: key.to_string() });
        }
    }

    /// Called by the caller-supplied refresh function once it completes,
    /// freeing the key for a future refresh-ahead cycle.
    pub fn complete_refresh(&self, key: &str) {
        self.in_flight_refresh.remove(key);
    }

    /// Write value to every enabled layer. Returns the number of layers
    /// that succeeded; a partial success (>0) still counts as a set.
    pub async fn set(&self, key: &str, value: CacheValue, tags: &[String]) -> usize {
        let mut succeeded = 0;
        for layer in self.enabled_layers() {
            match layer
                .layer
                .set(key, value.clone(), layer.descriptor.default_ttl, tags)
                .await
            {
                Ok(true) => succeeded += 1,
                Ok(false) => {}
                Err(e) => warn!(layer = %layer.descriptor.name, error = %e, "layer set failed"),
            }
        }
        if succeeded > 0 {
            self.events.publish(CacheEvent::Set { key: key.to_string() });
        }
        succeeded
    }

    /// Write-through: write to the source of truth first, then `set` on all
    /// enabled layers. Layer failures are logged, not fatal — success is
    /// determined solely by the store write.
    pub async fn write_through(&self, key: &str, value: CacheValue, store: &dyn Store) -> Result<()> {
        store.write(key, value.clone()).await?;
        self.set(key, value, &[]).await;
        Ok(())
    }

    /// Write-behind: `set` on all enabled layers synchronously, then
    /// enqueue an asynchronous store write. Loss of the in-flight job
    /// (queue at terminal failure) is surfaced as a `WriteBehindLost` event
    /// — the layers are now ahead of the source of truth until reconciled.
    pub async fn write_behind(&self, key: &str, value: CacheValue) -> Result<()> {
        self.set(key, value.clone(), &[]).await;
        match &self.jobs {
            Some(jobs) => {
                let payload = serde_json::json!({ "key": key, "kind": "write_behind" });
                jobs.submit(Priority::High, payload, 5);
                Ok(())
            }
            None => {
                self.events.publish(CacheEvent::WriteBehindLost {
                    key: key.to_string(),
                    reason: "no job queue configured".to_string(),
                });
                Ok(())
            }
        }
    }

    /// Fan out a tag invalidation to every layer that supports it; returns
    /// the sum of per-layer affected counts.
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut total = 0;
        for layer in self.enabled_layers() {
            if let Ok(Some(n)) = layer.layer.invalidate_by_tag(tag).await {
                total += n;
            }
        }
        self.events.publish(CacheEvent::Invalidated {
            kind: crate::events::InvalidationKind::Tag,
            target: tag.to_string(),
            affected: total,
        });
        total
    }

    pub async fn invalidate_by_pattern(&self, pattern: &str) -> usize {
        let mut total = 0;
        for layer in self.enabled_layers() {
            if let Ok(Some(n)) = layer.layer.invalidate_by_pattern(pattern).await {
                total += n;
            }
        }
        self.events.publish(CacheEvent::Invalidated {
            kind: crate::events::InvalidationKind::Pattern,
            target: pattern.to_string(),
            affected: total,
        });
        total
    }

    pub async fn delete(&self, key: &str) -> usize {
        let mut total = 0;
        for layer in self.enabled_layers() {
            if let Ok(true) = layer.layer.delete(key).await {
                total += 1;
            }
        }
        self.events.publish(CacheEvent::Deleted { key: key.to_string() });
        total
    }

    /// Look up a cached query result by its (query fingerprint, params
    /// fingerprint) pair in the dedicated L3 result cache. `None` if no
    /// result cache is configured or the pair misses — this never falls
    /// through to L1/L2, which don't hold query results.
    pub async fn get_query_result(&self, query_fingerprint: &str, params_fingerprint: &str) -> Option<CacheValue> {
        let (layer, _) = self.result_cache.as_ref()?;
        let value = layer.get_result(query_fingerprint, params_fingerprint).await;
        if value.is_some() {
            self.events.publish(CacheEvent::Hit {
                key: format!("{query_fingerprint}:{params_fingerprint}"),
                layer: LayerName::L3,
                latency_us: 0,
            });
        }
        value
    }

    /// Store a query result in the dedicated L3 result cache. Returns
    /// `false` if no result cache is configured.
    pub async fn set_query_result(&self, query_fingerprint: &str, params_fingerprint: &str, value: CacheValue) -> bool {
        let Some((layer, ttl)) = &self.result_cache else {
            return false;
        };
        let stored = layer.set_result(query_fingerprint, params_fingerprint, value, *ttl).await;
        if stored {
            self.events.publish(CacheEvent::Set { key: format!("{query_fingerprint}:{params_fingerprint}") });
        }
        stored
    }
}

/// HTTP-layer skip rules: mutating methods, auth/cookie headers, explicit
/// no-store/no-cache, and configured path prefixes bypass the cache.
pub struct HttpCacheSkipRules {
    pub bypass_path_prefixes: Vec<String>,
}

impl HttpCacheSkipRules {
    pub fn should_skip(&self, method: &str, has_auth_header: bool, has_cookie: bool, cache_control: Option<&str>, path: &str) -> bool {
        let mutating = !matches!(method.to_ascii_uppercase().as_str(), "GET" | "HEAD");
        let no_store = cache_control
            .map(|cc| cc.contains("no-store") || cc.contains("no-cache"))
            .unwrap_or(false);
        let bypass_path = self
            .bypass_path_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()));
        mutating || has_auth_header || has_cookie || no_store || bypass_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::layers::{InMemorySharedStore, L1Layer};

    fn descriptor(name: LayerName, priority: u8) -> LayerDescriptor {
        LayerDescriptor {
            name,
            enabled: true,
            priority,
            default_ttl: Duration::from_secs(30),
        }
    }

    struct NoopStore;

    #[async_trait]
    impl Store for NoopStore {
        async fn write(&self, _key: &str, _value: CacheValue) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn l2_hit_promotes_to_l1() {
        let l1: Arc<dyn CacheLayer> = Arc::new(L1Layer::new(16));
        let l2: Arc<dyn CacheLayer> = Arc::new(InMemorySharedStore::new());
        l2.set("u:42", CacheValue::Str("x".into()), Duration::from_secs(30), &[])
            .await
            .unwrap();

        let events = Arc::new(EventBus::default());
        let manager = CacheManagerBuilder::new()
            .with_layer(descriptor(LayerName::L1, 0), l1.clone())
            .with_layer(descriptor(LayerName::L2, 1), l2.clone())
            .build(events);

        let got = manager.get("u:42").await;
        assert_eq!(got, Some(CacheValue::Str("x".into())));
        assert_eq!(l1.get("u:42").await.unwrap(), Some(CacheValue::Str("x".into())));
    }

    #[tokio::test]
    async fn write_through_populates_all_layers() {
        let l1: Arc<dyn CacheLayer> = Arc::new(L1Layer::new(16));
        let l2: Arc<dyn CacheLayer> = Arc::new(InMemorySharedStore::new());
        let events = Arc::new(EventBus::default());
        let manager = CacheManagerBuilder::new()
            .with_layer(descriptor(LayerName::L1, 0), l1.clone())
            .with_layer(descriptor(LayerName::L2, 1), l2.clone())
            .build(events);

        manager
            .write_through("s:cfg", CacheValue::Int(1), &NoopStore)
            .await
            .unwrap();

        assert_eq!(l1.get("s:cfg").await.unwrap(), Some(CacheValue::Int(1)));
        assert_eq!(l2.get("s:cfg").await.unwrap(), Some(CacheValue::Int(1)));
    }

    #[tokio::test]
    async fn tag_invalidation_sums_across_layers() {
        let l1: Arc<dyn CacheLayer> = Arc::new(L1Layer::new(16));
        let l2: Arc<dyn CacheLayer> = Arc::new(InMemorySharedStore::new());
        l1.set("customer:1", CacheValue::Bool(true), Duration::from_secs(30), &["customer".into()])
            .await
            .unwrap();
        l2.set("customer:1", CacheValue::Bool(true), Duration::from_secs(30), &["customer".into()])
            .await
            .unwrap();
        let events = Arc::new(EventBus::default());
        let manager = CacheManagerBuilder::new()
            .with_layer(descriptor(LayerName::L1, 0), l1)
            .with_layer(descriptor(LayerName::L2, 1), l2)
            .build(events);

        let affected = manager.invalidate_by_tag("customer").await;
        assert_eq!(affected, 2);
    }

    #[tokio::test]
    async fn low_remaining_ttl_schedules_one_refresh() {
        let l1: Arc<dyn CacheLayer> = Arc::new(L1Layer::new(16));
        l1.set("p:7", CacheValue::Int(1), Duration::from_millis(50), &[])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(45)).await;

        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe();
        let manager = CacheManagerBuilder::new()
            .with_layer(descriptor(LayerName::L1, 0), l1)
            .with_refresh_threshold(0.5)
            .build(events);

        manager.get("p:7").await;
        let evt = tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(evt, CacheEvent::Hit { .. }));
        let evt2 = tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(evt2, CacheEvent::RefreshScheduled { key } if key == "p:7"));
    }

    #[tokio::test]
    async fn query_result_cache_is_isolated_from_generic_layers() {
        let events = Arc::new(EventBus::default());
        let l3 = Arc::new(crate::cache::layers::L3Layer::new());
        let manager = CacheManagerBuilder::new()
            .with_result_cache(l3, Duration::from_secs(30))
            .build(events);

        assert!(manager.set_query_result("qfp", "pfp", CacheValue::Int(9)).await);
        assert_eq!(manager.get_query_result("qfp", "pfp").await, Some(CacheValue::Int(9)));
        assert_eq!(manager.get_query_result("other", "pfp").await, None);
        assert_eq!(manager.get("qfp:pfp").await, None, "result cache entries must not leak into the generic get path");
    }

    #[tokio::test]
    async fn query_result_cache_absent_by_default() {
        let events = Arc::new(EventBus::default());
        let manager = CacheManagerBuilder::new().build(events);
        assert!(!manager.set_query_result("qfp", "pfp", CacheValue::Int(1)).await);
        assert_eq!(manager.get_query_result("qfp", "pfp").await, None);
    }

    #[test]
    fn skip_rules_bypass_on_mutation_and_auth() {
        let rules = HttpCacheSkipRules { bypass_path_prefixes: vec!["/admin".into()] };
        assert!(rules.should_skip("POST", false, false, None, "/x"));
        assert!(rules.should_skip("GET", true, false, None, "/x"));
        assert!(rules.should_skip("GET", false, false, Some("no-store"), "/x"));
        assert!(rules.should_skip("GET", false, false, None, "/admin/y"));
        assert!(!rules.should_skip("GET", false, false, None, "/x"));
    }
}
