// Time-windowed metrics aggregation, threshold alerting, and multi-format
// export for the cache hierarchy.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::cache::layers::{L1Layer, LayerName};
use crate::config::MetricsThresholds;
use crate::events::{CacheEvent, EventBus};

#[derive(Debug, Clone, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    sets: u64,
    deletes: u64,
    errors: u64,
    latencies_us: Vec<u64>,
    evictions: HashMap<LayerName, u64>,
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub at: DateTime<Utc>,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub avg_response_ms: f64,
    pub p95_response_ms: f64,
    pub p99_response_ms: f64,
    pub throughput_ops: f64,
    pub error_rate: f64,
    pub evictions_per_layer: HashMap<LayerName, u64>,
    /// L1 occupancy as a fraction of capacity. `0.0` when no L1 is wired.
    pub memory_util: f64,
    pub evictions_per_min: f64,
    pub get_count: u64,
    pub set_count: u64,
    pub delete_count: u64,
}

fn percentile(sorted_us: &[u64], pct: f64) -> f64 {
    if sorted_us.is_empty() {
        return 0.0;
    }
    let idx = ((sorted_us.len() as f64 - 1.0) * pct).round() as usize;
    sorted_us[idx] as f64 / 1000.0
}

#[derive(Debug, Clone)]
pub struct AggregatedWindow {
    pub window_start: DateTime<Utc>,
    pub min_hit_rate: f64,
    pub max_hit_rate: f64,
    pub avg_hit_rate: f64,
    pub sum_ops: u64,
}

pub struct MetricsCollector {
    events: Arc<EventBus<CacheEvent>>,
    window: Mutex<Counters>,
    raw_snapshots: Mutex<VecDeque<MetricsSnapshot>>,
    aggregated: Mutex<VecDeque<AggregatedWindow>>,
    raw_retention: usize,
    agg_retention: usize,
    l1: Option<Arc<L1Layer>>,
    last_eviction_total: Mutex<u64>,
}

impl MetricsCollector {
    pub fn new(events: Arc<EventBus<CacheEvent>>, raw_retention: usize, agg_retention: usize, l1: Option<Arc<L1Layer>>) -> Self {
        Self {
            events,
            window: Mutex::new(Counters::default()),
            raw_snapshots: Mutex::new(VecDeque::new()),
            aggregated: Mutex::new(VecDeque::new()),
            raw_retention,
            agg_retention,
            l1,
            last_eviction_total: Mutex::new(0),
        }
    }

    /// Consume manager events into the current window. Run for the
    /// lifetime of the metrics subsystem.
    pub async fn observe(self: Arc<Self>) {
        let mut rx = self.events.subscribe();
        while let Ok(event) = rx.recv().await {
            let mut window = self.window.lock();
            match event {
                CacheEvent::Hit { latency_us, .. } => {
                    window.hits += 1;
                    window.latencies_us.push(latency_us);
                }
                CacheEvent::Miss { .. } => window.misses += 1,
                CacheEvent::Set { .. } => window.sets += 1,
                CacheEvent::Deleted { .. } => window.deletes += 1,
                CacheEvent::WriteBehindLost { .. } => window.errors += 1,
                _ => {}
            }
        }
    }

    pub fn record_eviction(&self, layer: LayerName) {
        *self.window.lock().evictions.entry(layer).or_insert(0) += 1;
    }

    /// Collect a snapshot of the current window and reset it. Intended to
    /// be called every C seconds by a periodic ticker.
    pub fn collect(&self, elapsed: Duration) -> MetricsSnapshot {
        let mut window = self.window.lock();
        let total_reads = window.hits + window.misses;
        let mut sorted = window.latencies_us.clone();
        sorted.sort_unstable();
        let avg_us = if sorted.is_empty() { 0.0 } else { sorted.iter().sum::<u64>() as f64 / sorted.len() as f64 };
        let total_ops = window.hits + window.misses + window.sets + window.deletes;

        let memory_util = self.l1.as_ref().map(|l1| {
            let store = l1.lru();
            let capacity = store.capacity();
            if capacity == 0 { 0.0 } else { store.size() as f64 / capacity as f64 }
        }).unwrap_or(0.0);

        let evictions_per_min = self.l1.as_ref().map(|l1| {
            let total_evictions = l1.lru().statistics().evictions;
            let mut last = self.last_eviction_total.lock();
            let delta = total_evictions.saturating_sub(*last);
            *last = total_evictions;
            let minutes = elapsed.as_secs_f64() / 60.0;
            if minutes == 0.0 { 0.0 } else { delta as f64 / minutes }
        }).unwrap_or(0.0);

        let snapshot = MetricsSnapshot {
            at: Utc::now(),
            hit_rate: if total_reads == 0 { 0.0 } else { window.hits as f64 / total_reads as f64 },
            miss_rate: if total_reads == 0 { 0.0 } else { window.misses as f64 / total_reads as f64 },
            avg_response_ms: avg_us / 1000.0,
            p95_response_ms: percentile(&sorted, 0.95),
            p99_response_ms: percentile(&sorted, 0.99),
            throughput_ops: if elapsed.as_secs_f64() == 0.0 { 0.0 } else { total_ops as f64 / elapsed.as_secs_f64() },
            error_rate: if total_ops == 0 { 0.0 } else { window.errors as f64 / total_ops as f64 },
            evictions_per_layer: window.evictions.clone(),
            memory_util,
            evictions_per_min,
            get_count: total_reads,
            set_count: window.sets,
            delete_count: window.deletes,
        };

        *window = Counters::default();
        drop(window);

        let mut raw = self.raw_snapshots.lock();
        raw.push_back(snapshot.clone());
        while raw.len() > self.raw_retention {
            raw.pop_front();
        }
        self.maybe_aggregate(&raw);
        snapshot
    }

    fn maybe_aggregate(&self, raw: &VecDeque<MetricsSnapshot>) {
        let window: Vec<&MetricsSnapshot> = raw
            .iter()
            .filter(|s| Utc::now() - s.at <= chrono::Duration::minutes(5))
            .collect();
        if window.is_empty() {
            return;
        }
        let hit_rates: Vec<f64> = window.iter().map(|s| s.hit_rate).collect();
        let agg = AggregatedWindow {
            window_start: window.first().unwrap().at,
            min_hit_rate: hit_rates.iter().cloned().fold(f64::INFINITY, f64::min),
            max_hit_rate: hit_rates.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            avg_hit_rate: hit_rates.iter().sum::<f64>() / hit_rates.len() as f64,
            sum_ops: window.iter().map(|s| s.get_count + s.set_count + s.delete_count).sum(),
        };
        let mut aggregated = self.aggregated.lock();
        aggregated.push_back(agg);
        while aggregated.len() > self.agg_retention {
            aggregated.pop_front();
        }
    }

    pub fn raw_snapshots(&self) -> Vec<MetricsSnapshot> {
        self.raw_snapshots.lock().iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub metric: String,
    pub severity: AlertSeverity,
    pub value: f64,
    pub threshold: f64,
    pub at: DateTime<Utc>,
}

struct CooldownEntry {
    last_fired: DateTime<Utc>,
    active: bool,
}

/// Threshold-based alerting over metrics snapshots, with a per-metric
/// cooldown and a cleared event when the metric returns to normal.
pub struct AlertManager {
    thresholds: MetricsThresholds,
    cooldowns: Mutex<HashMap<String, CooldownEntry>>,
}

impl AlertManager {
    pub fn new(thresholds: MetricsThresholds) -> Self {
        Self {
            thresholds,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate one snapshot, returning newly-fired alerts. A metric
    /// already in cooldown does not re-fire even if still past threshold;
    /// a metric back to normal emits a "cleared" log event exactly once.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> Vec<Alert> {
        let mut alerts = Vec::new();
        self.check_metric(
            "hit_rate",
            snapshot.hit_rate,
            self.thresholds.hit_rate_warning,
            self.thresholds.hit_rate_critical,
            true,
            &mut alerts,
        );
        self.check_metric(
            "avg_response_ms",
            snapshot.avg_response_ms,
            self.thresholds.avg_response_ms_warning,
            self.thresholds.avg_response_ms_critical,
            false,
            &mut alerts,
        );
        self.check_metric(
            "error_rate",
            snapshot.error_rate,
            self.thresholds.error_rate_warning,
            self.thresholds.error_rate_critical,
            false,
            &mut alerts,
        );
        self.check_metric(
            "memory_util",
            snapshot.memory_util,
            self.thresholds.memory_util_warning,
            self.thresholds.memory_util_critical,
            false,
            &mut alerts,
        );
        self.check_metric(
            "evictions_per_min",
            snapshot.evictions_per_min,
            self.thresholds.evictions_per_min_warning,
            self.thresholds.evictions_per_min_critical,
            false,
            &mut alerts,
        );
        alerts
    }

    fn check_metric(
        &self,
        name: &str,
        value: f64,
        warning: f64,
        critical: f64,
        lower_is_worse: bool,
        out: &mut Vec<Alert>,
    ) {
        let breached = if lower_is_worse { value < warning } else { value > warning };
        let mut cooldowns = self.cooldowns.lock();
        let now = Utc::now();
        let entry = cooldowns.entry(name.to_string()).or_insert(CooldownEntry { last_fired: now - chrono::Duration::hours(1), active: false });

        if !breached {
            if entry.active {
                entry.active = false;
                info!(metric = name, "alert cleared");
            }
            return;
        }

        let in_cooldown = now - entry.last_fired < self.thresholds.alert_cooldown_chrono();
        if in_cooldown {
            return;
        }

        let severity = if lower_is_worse {
            if value < critical { AlertSeverity::Critical } else { AlertSeverity::Warning }
        } else if value > critical {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        entry.last_fired = now;
        entry.active = true;
        warn!(metric = name, value, ?severity, "threshold alert");
        out.push(Alert {
            metric: name.to_string(),
            severity,
            value,
            threshold: if matches!(severity, AlertSeverity::Critical) { critical } else { warning },
            at: now,
        });
    }
}

impl MetricsThresholds {
    fn alert_cooldown_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.alert_cooldown).unwrap_or(chrono::Duration::seconds(60))
    }
}

/// The closed set of export wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    LabelValue,
    Csv,
    Graphite,
}

pub fn export(snapshot: &MetricsSnapshot, format: ExportFormat) -> String {
    let rows: Vec<(&str, f64)> = vec![
        ("cache.hit_rate", snapshot.hit_rate),
        ("cache.miss_rate", snapshot.miss_rate),
        ("cache.avg_response_ms", snapshot.avg_response_ms),
        ("cache.p95_response_ms", snapshot.p95_response_ms),
        ("cache.p99_response_ms", snapshot.p99_response_ms),
        ("cache.throughput_ops", snapshot.throughput_ops),
        ("cache.error_rate", snapshot.error_rate),
        ("cache.memory_util", snapshot.memory_util),
        ("cache.evictions_per_min", snapshot.evictions_per_min),
    ];
    match format {
        ExportFormat::LabelValue => rows.iter().map(|(k, v)| format!("{k} {v}")).collect::<Vec<_>>().join("\n"),
        ExportFormat::Csv => {
            let mut out = String::from("metric,value\n");
            for (k, v) in &rows {
                out.push_str(&format!("{k},{v}\n"));
            }
            out
        }
        ExportFormat::Graphite => {
            let ts = snapshot.at.timestamp();
            rows.iter().map(|(k, v)| format!("{k} {v} {ts}")).collect::<Vec<_>>().join("\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(hit_rate: f64, miss_rate: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            at: Utc::now(),
            hit_rate,
            miss_rate,
            avg_response_ms: 10.0,
            p95_response_ms: 20.0,
            p99_response_ms: 30.0,
            throughput_ops: 100.0,
            error_rate: 0.0,
            evictions_per_layer: HashMap::new(),
            memory_util: 0.1,
            evictions_per_min: 0.0,
            get_count: 10,
            set_count: 2,
            delete_count: 1,
        }
    }

    #[test]
    fn hit_rate_plus_miss_rate_is_bounded() {
        let snap = snapshot(0.8, 0.2);
        let sum = (snap.hit_rate + snap.miss_rate) * 100.0;
        assert!(sum >= 99.0 && sum <= 101.0);
        assert!(snap.hit_rate <= 1.0);
    }

    #[test]
    fn low_hit_rate_triggers_warning_then_cooldown_suppresses_repeat() {
        let manager = AlertManager::new(MetricsThresholds::default());
        let snap = snapshot(0.6, 0.4);
        let alerts = manager.evaluate(&snap);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
        let alerts2 = manager.evaluate(&snap);
        assert!(alerts2.is_empty(), "cooldown should suppress immediate re-trigger");
    }

    #[test]
    fn very_low_hit_rate_is_critical() {
        let manager = AlertManager::new(MetricsThresholds::default());
        let snap = snapshot(0.3, 0.7);
        let alerts = manager.evaluate(&snap);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    }

    #[test]
    fn high_memory_util_triggers_warning() {
        let manager = AlertManager::new(MetricsThresholds::default());
        let mut snap = snapshot(0.9, 0.1);
        snap.memory_util = 0.85;
        let alerts = manager.evaluate(&snap);
        assert!(alerts.iter().any(|a| a.metric == "memory_util" && a.severity == AlertSeverity::Warning));
    }

    #[test]
    fn high_evictions_per_min_triggers_critical() {
        let manager = AlertManager::new(MetricsThresholds::default());
        let mut snap = snapshot(0.9, 0.1);
        snap.evictions_per_min = 75.0;
        let alerts = manager.evaluate(&snap);
        assert!(alerts.iter().any(|a| a.metric == "evictions_per_min" && a.severity == AlertSeverity::Critical));
    }

    #[tokio::test]
    async fn collect_reports_l1_memory_util_and_eviction_rate() {
        let events = Arc::new(EventBus::default());
        let l1 = Arc::new(L1Layer::new(2));
        let collector = MetricsCollector::new(events, 10, 10, Some(l1.clone()));

        l1.lru().set("a", crate::cache::lru::CacheValue::Int(1), Duration::from_secs(60));
        let first = collector.collect(Duration::from_secs(60));
        assert_eq!(first.memory_util, 0.5);
        assert_eq!(first.evictions_per_min, 0.0);

        l1.lru().set("b", crate::cache::lru::CacheValue::Int(2), Duration::from_secs(60));
        l1.lru().set("c", crate::cache::lru::CacheValue::Int(3), Duration::from_secs(60));
        let second = collector.collect(Duration::from_secs(60));
        assert!(second.evictions_per_min > 0.0);
    }

    #[test]
    fn export_formats_are_nonempty_and_distinct() {
        let snap = snapshot(0.9, 0.1);
        let lv = export(&snap, ExportFormat::LabelValue);
        let csv = export(&snap, ExportFormat::Csv);
        let graphite = export(&snap, ExportFormat::Graphite);
        assert!(lv.contains("cache.hit_rate"));
        assert!(csv.starts_with("metric,value"));
        assert!(graphite.split_whitespace().count() > lv.lines().count());
    }
}
