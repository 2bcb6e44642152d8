// Startup, scheduled, and predictive cache prefetching.
//
// Predictive warming tracks per-key access patterns from the manager's
// hit/miss event stream and scores them on a fixed interval; strategies are
// independently enable-able per the component design.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::cache::manager::CacheManager;
use crate::cron::CronSchedule;
use crate::events::{CacheEvent, EventBus};

const MAX_HISTORY_PER_KEY: usize = 64;

/// A per-key access history: bounded timestamps, hit/total counts, and the
/// last access time, as described by the data model.
#[derive(Debug, Clone, Default)]
pub struct AccessPattern {
    pub timestamps: VecDeque<DateTime<Utc>>,
    pub hit_count: u64,
    pub total_count: u64,
    pub last_access: Option<DateTime<Utc>>,
}

impl AccessPattern {
    fn record(&mut self, now: DateTime<Utc>, hit: bool) {
        self.timestamps.push_back(now);
        if self.timestamps.len() > MAX_HISTORY_PER_KEY {
            self.timestamps.pop_front();
        }
        self.total_count += 1;
        if hit {
            self.hit_count += 1;
        }
        self.last_access = Some(now);
    }

    pub fn hit_rate(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.hit_count as f64 / self.total_count as f64
        }
    }

    fn frequency_in_window(&self, now: DateTime<Utc>, window: Duration) -> u64 {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        self.timestamps.iter().filter(|t| now - **t <= window).count() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringAlgorithm {
    FrequencyRecency,
    TimeDecay,
    HeuristicMl,
}

pub struct PredictiveConfig {
    pub algorithm: ScoringAlgorithm,
    pub window: Duration,
    pub freq_max: f64,
    pub threshold: f64,
    pub concurrency_cap: usize,
    pub tick_interval: Duration,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            algorithm: ScoringAlgorithm::FrequencyRecency,
            window: Duration::from_secs(600),
            freq_max: 10.0,
            threshold: 0.7,
            concurrency_cap: 8,
            tick_interval: Duration::from_secs(60),
        }
    }
}

/// Tracks access patterns and scores them for predictive prefetch.
pub struct AccessPatternTracker {
    patterns: RwLock<HashMap<String, AccessPattern>>,
}

impl Default for AccessPatternTracker {
    fn default() -> Self {
        Self { patterns: RwLock::new(HashMap::new()) }
    }
}

impl AccessPatternTracker {
    pub fn record_hit(&self, key: &str) {
        self.patterns.write().entry(key.to_string()).or_default().record(Utc::now(), true);
    }

    pub fn record_miss(&self, key: &str) {
        self.patterns.write().entry(key.to_string()).or_default().record(Utc::now(), false);
    }

    pub fn snapshot(&self) -> HashMap<String, AccessPattern> {
        self.patterns.read().clone()
    }

    /// Consume manager events to keep access patterns current. Intended to
    /// run as a background task for the lifetime of the manager.
    pub async fn observe(self: Arc<Self>, events: Arc<EventBus<CacheEvent>>) {
        let mut rx = events.subscribe();
        while let Ok(event) = rx.recv().await {
            match event {
                CacheEvent::Hit { key, .. } => self.record_hit(&key),
                CacheEvent::Miss { key } => self.record_miss(&key),
                _ => {}
            }
        }
    }

    pub fn score(&self, key: &str, config: &PredictiveConfig) -> f64 {
        let patterns = self.patterns.read();
        let Some(pattern) = patterns.get(key) else { return 0.0 };
        let now = Utc::now();
        match config.algorithm {
            ScoringAlgorithm::FrequencyRecency => {
                let freq = pattern.frequency_in_window(now, config.window) as f64;
                let freq_term = 0.5 * (freq / config.freq_max).min(1.0);
                let age = pattern
                    .last_access
                    .map(|t| (now - t).num_seconds().max(0) as f64 / config.window.as_secs_f64())
                    .unwrap_or(1.0);
                let recency_term = 0.5 * (1.0 - age).max(0.0);
                (freq_term + recency_term + 0.2 * pattern.hit_rate()).min(1.0)
            }
            ScoringAlgorithm::TimeDecay => {
                const LAMBDA: f64 = 0.15;
                let sum: f64 = pattern
                    .timestamps
                    .iter()
                    .map(|t| {
                        let age_hours = (now - *t).num_seconds().max(0) as f64 / 3600.0;
                        (-LAMBDA * age_hours).exp()
                    })
                    .sum();
                (sum / (pattern.timestamps.len().max(1) as f64)).min(1.0)
            }
            ScoringAlgorithm::HeuristicMl => {
                let freq = pattern.frequency_in_window(now, config.window) as f64;
                let freq_term = 0.4 * (freq / config.freq_max).min(1.0);
                let recency_term = 0.3
                    * pattern
                        .last_access
                        .map(|t| (1.0 - (now - t).num_seconds().max(0) as f64 / config.window.as_secs_f64()).max(0.0))
                        .unwrap_or(0.0);
                let hit_term = 0.2 * pattern.hit_rate();
                let hour = now.hour();
                let tod_bonus = if (9..18).contains(&hour) { 0.1 } else { 0.0 };
                (freq_term + recency_term + hit_term + tod_bonus).min(1.0)
            }
        }
    }
}

/// A dataset the startup/scheduled strategies iterate, keyed by prefix.
pub struct WarmDataSet {
    pub key_prefix: String,
    pub ttl: Duration,
    pub fetch: Arc<dyn Fn(&str) -> futures_fetch::FetchFuture + Send + Sync>,
}

/// Minimal boxed-future alias so `WarmDataSet::fetch` doesn't need a new
/// async-trait object for a single method.
pub mod futures_fetch {
    use crate::cache::lru::CacheValue;
    use std::future::Future;
    use std::pin::Pin;

    pub type FetchFuture = Pin<Box<dyn Future<Output = Option<(String, CacheValue)>> + Send>>;
}

pub struct CacheWarmer {
    manager: Arc<CacheManager>,
    tracker: Arc<AccessPatternTracker>,
    events: Arc<EventBus<CacheEvent>>,
    predictive: PredictiveConfig,
}

impl CacheWarmer {
    pub fn new(manager: Arc<CacheManager>, events: Arc<EventBus<CacheEvent>>, predictive: PredictiveConfig) -> Self {
        Self {
            manager,
            tracker: Arc::new(AccessPatternTracker::default()),
            events,
            predictive,
        }
    }

    pub fn tracker(&self) -> Arc<AccessPatternTracker> {
        self.tracker.clone()
    }

    /// Startup strategy: after `delay`, iterate `datasets` and populate
    /// each key the dataset's fetch function returns.
    pub async fn run_startup(&self, delay: Duration, datasets: &[WarmDataSet]) {
        tokio::time::sleep(delay).await;
        for dataset in datasets {
            self.warm_dataset(dataset).await;
        }
    }

    async fn warm_dataset(&self, dataset: &WarmDataSet) {
        if let Some((key, value)) = (dataset.fetch)(&dataset.key_prefix).await {
            self.manager.set(&key, value, &[]).await;
            debug!(prefix = %dataset.key_prefix, "startup/scheduled warm populated key");
        }
    }

    /// Scheduled strategy: re-run the startup-style prefetch whenever
    /// `schedule` matches, checked once per minute.
    pub async fn run_scheduled(&self, schedule: CronSchedule, datasets: Vec<WarmDataSet>) {
        let mut last_run_minute: Option<DateTime<Utc>> = None;
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let now = Utc::now();
            if schedule.matches(now) && last_run_minute != Some(now) {
                last_run_minute = Some(now);
                for dataset in &datasets {
                    self.warm_dataset(dataset).await;
                }
            }
        }
    }

    /// Predictive strategy: on every tick, score every tracked key and
    /// prefetch those above threshold, up to `concurrency_cap`, by firing a
    /// `WarmingCandidate` event per key for the caller's fetch callback.
    pub async fn run_predictive(&self) {
        loop {
            tokio::time::sleep(self.predictive.tick_interval).await;
            self.predictive_tick().await;
        }
    }

    pub async fn predictive_tick(&self) -> Vec<String> {
        let snapshot = self.tracker.snapshot();
        let mut candidates: Vec<(String, f64)> = snapshot
            .keys()
            .map(|k| (k.clone(), self.tracker.score(k, &self.predictive)))
            .filter(|(_, score)| *score >= self.predictive.threshold)
            .collect();
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(self.predictive.concurrency_cap);
        for (key, score) in &candidates {
            self.events.publish(CacheEvent::WarmingCandidate { key: key.clone(), score: *score });
        }
        candidates.into_iter().map(|(k, _)| k).collect()
    }
}
