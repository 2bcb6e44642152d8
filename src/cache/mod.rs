// Multi-layer cache hierarchy: LRU storage, the per-layer contract, the
// manager that walks layers in priority order, predictive warming,
// event-driven invalidation, and windowed metrics/alerting.
//
// Submodules map one-to-one onto the cache components:
// - `lru`: bounded, TTL-aware, tag-aware single-process store (L1's backing)
// - `layers`: the `CacheLayer` contract plus L1/L2/L3 implementations
// - `manager`: cache-aside/write-through/write-behind orchestration across layers
// - `warmer`: startup, scheduled, and predictive prefetch
// - `invalidation`: event-, tag-, pattern-, and schedule-driven invalidation
// - `metrics`: time-windowed aggregation, threshold alerts, and export

pub mod invalidation;
pub mod layers;
pub mod lru;
pub mod manager;
pub mod metrics;
pub mod warmer;

pub use invalidation::{DependencyChain, InvalidationCoordinator, InvalidationItem, InvalidationRule};
pub use layers::{CacheLayer, InMemorySharedStore, L1Layer, L3Layer, LayerDescriptor, LayerName};
pub use lru::{CacheValue, LruStore};
pub use manager::{CacheManager, CacheManagerBuilder, HttpCacheSkipRules, Store};
pub use metrics::{Alert, AlertManager, AlertSeverity, ExportFormat, MetricsCollector, MetricsSnapshot};
pub use warmer::{AccessPatternTracker, CacheWarmer, PredictiveConfig, ScoringAlgorithm, WarmDataSet};
