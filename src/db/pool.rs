// DB connection pool: one primary target plus zero-or-more replicas, each
// guarded by its own circuit breaker, with weighted-random replica
// selection, retry-with-backoff on transient failures, and a background
// health prober.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{info, warn};

use crate::db::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub operation: Operation,
    pub use_replica: bool,
    pub timeout: Duration,
    pub retries: u32,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self { operation: Operation::Read, use_replica: false, timeout: Duration::from_secs(5), retries: 2 }
    }
}

#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub rows: u64,
    pub duration: Duration,
}

/// The abstract back end a pool target executes against. A real
/// implementation would drive an actual database client; callers under
/// test supply a fake.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str, params: &[String]) -> Result<u64>;
}

struct PoolTarget {
    name: String,
    weight: u32,
    healthy: AtomicBool,
    breaker: CircuitBreaker,
    executor: Arc<dyn QueryExecutor>,
}

#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub checked_out: AtomicU64,
    pub wait_queue_depth: AtomicU64,
    pub total_checkout_wait_us: AtomicU64,
    pub checkout_count: AtomicU64,
    pub slow_queries: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct PoolMetricsSnapshot {
    pub checked_out: u64,
    pub wait_queue_depth: u64,
    pub avg_checkout_wait_us: f64,
    pub slow_queries: u64,
}

impl PoolMetrics {
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        let count = self.checkout_count.load(Ordering::Relaxed);
        let total = self.total_checkout_wait_us.load(Ordering::Relaxed);
        PoolMetricsSnapshot {
            checked_out: self.checked_out.load(Ordering::Relaxed),
            wait_queue_depth: self.wait_queue_depth.load(Ordering::Relaxed),
            avg_checkout_wait_us: if count == 0 { 0.0 } else { total as f64 / count as f64 },
            slow_queries: self.slow_queries.load(Ordering::Relaxed),
        }
    }
}

pub struct DbPool {
    primary: PoolTarget,
    replicas: Vec<PoolTarget>,
    base_backoff: Duration,
    slow_threshold: Duration,
    metrics: PoolMetrics,
}

pub struct ReplicaSpec {
    pub name: String,
    pub weight: u32,
    pub executor: Arc<dyn QueryExecutor>,
}

impl DbPool {
    pub fn new(
        primary_executor: Arc<dyn QueryExecutor>,
        replicas: Vec<ReplicaSpec>,
        circuit_config: CircuitBreakerConfig,
        base_backoff: Duration,
        slow_threshold: Duration,
    ) -> Self {
        let primary = PoolTarget {
            name: "primary".to_string(),
            weight: 1,
            healthy: AtomicBool::new(true),
            breaker: CircuitBreaker::new("primary", circuit_config.clone()),
            executor: primary_executor,
        };
        let replicas = replicas
            .into_iter()
            .map(|r| PoolTarget {
                name: r.name.clone(),
                weight: r.weight,
                healthy: AtomicBool::new(true),
                breaker: CircuitBreaker::new(r.name, circuit_config.clone()),
                executor: r.executor,
            })
            .collect();
        Self { primary, replicas, base_backoff, slow_threshold, metrics: PoolMetrics::default() }
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    fn route(&self, options: &QueryOptions) -> &PoolTarget {
        if options.operation == Operation::Write {
            return &self.primary;
        }
        if options.use_replica {
            let healthy: Vec<&PoolTarget> = self.replicas.iter().filter(|r| r.healthy.load(Ordering::Relaxed)).collect();
            if !healthy.is_empty() {
                let total_weight: u32 = healthy.iter().map(|r| r.weight.max(1)).sum();
                let mut pick = rand::rng().random_range(0..total_weight.max(1));
                for target in &healthy {
                    let w = target.weight.max(1);
                    if pick < w {
                        return target;
                    }
                    pick -= w;
                }
                return healthy[0];
            }
        }
        &self.primary
    }

    /// Route, guard, execute with retries, and record metrics, per the
    /// connection-pool query algorithm.
    pub async fn query(&self, sql: &str, params: &[String], options: QueryOptions) -> Result<QueryOutcome> {
        let target = self.route(&options);
        if target.breaker.state() == CircuitState::Open {
            return Err(Error::unavailable(format!("target '{}' circuit is open", target.name)));
        }

        let annotated = format!("/* req={} */ {sql}", uuid::Uuid::new_v4());
        let mut attempt = 0u32;
        loop {
            let started = std::time::Instant::now();
            let result = tokio::time::timeout(options.timeout, target.breaker.call(target.executor.execute(&annotated, params))).await;
            let outcome = match result {
                Ok(inner) => inner,
                Err(_) => Err(Error::timeout(format!("query against '{}' exceeded {:?}", target.name, options.timeout))),
            };
            let duration = started.elapsed();
            match outcome {
                Ok(rows) => {
                    if duration > self.slow_threshold {
                        self.metrics.slow_queries.fetch_add(1, Ordering::Relaxed);
                        warn!(target = %target.name, ?duration, "slow query");
                    }
                    return Ok(QueryOutcome { rows, duration });
                }
                Err(e) if e.is_retriable() && attempt < options.retries => {
                    attempt += 1;
                    let backoff = self.base_backoff * 2u32.pow(attempt - 1);
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Background health prober: every `interval`, run a trivial probe
    /// against each target and flip its healthy flag.
    pub async fn run_health_probe(&self, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            for target in std::iter::once(&self.primary).chain(self.replicas.iter()) {
                let healthy = target.executor.execute("SELECT 1", &[]).await.is_ok();
                let was_healthy = target.healthy.swap(healthy, Ordering::Relaxed);
                if was_healthy != healthy {
                    info!(target = %target.name, healthy, "health probe flipped status");
                }
            }
        }
    }

    /// Overall status: healthy iff every pool (primary and every replica)
    /// is healthy.
    pub fn is_healthy(&self) -> bool {
        self.primary.healthy.load(Ordering::Relaxed) && self.replicas.iter().all(|r| r.healthy.load(Ordering::Relaxed))
    }
}
