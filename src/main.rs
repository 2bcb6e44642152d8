// Entry point for the billing-core substrate daemon.
//
// Wires the cache hierarchy, DB pool, device pool, and job queue into the
// registry, starts them in dependency order, then waits for a termination
// signal and shuts everything down under a deadline.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use billing_core::cache::{CacheManager, CacheManagerBuilder, InMemorySharedStore, L1Layer, L3Layer, LayerDescriptor, LayerName};
use billing_core::config::BillingConfig;
use billing_core::db::{CircuitBreakerConfig, DbPool, QueryExecutor};
use billing_core::device::{DeviceClient, DeviceDescriptor, DevicePool, FailoverController};
use billing_core::events::{CacheEvent, DomainEvent, EventBus, FailoverEvent};
use billing_core::jobqueue::{self, JobQueue, Priority};
use billing_core::registry::{Component, Registry};
use billing_core::{telemetry, Error, Result};
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

/// Stand-in primary executor: substitutes for a real database driver, which
/// is out of scope for this crate. Always succeeds so the pool's routing,
/// retry, and circuit-breaker logic can be exercised end to end by a caller
/// embedding this binary.
struct LoopbackExecutor;

#[async_trait]
impl QueryExecutor for LoopbackExecutor {
    async fn execute(&self, _sql: &str, _params: &[String]) -> Result<u64> {
        Ok(0)
    }
}

/// Stand-in device client: echoes the command back. A real deployment
/// registers one client per device speaking that device's wire protocol.
struct EchoClient;

#[async_trait]
impl DeviceClient for EchoClient {
    async fn send(&self, device_id: &str, command: &billing_core::device::Command) -> Result<JsonValue> {
        Ok(serde_json::json!({ "device_id": device_id, "command": command.name }))
    }
}

struct CacheComponent {
    manager: Arc<CacheManager>,
}

#[async_trait]
impl Component for CacheComponent {
    fn name(&self) -> &str {
        "cache_manager"
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn health(&self) -> Result<bool> {
        Ok(true)
    }
}

struct DbComponent {
    pool: Arc<DbPool>,
    probe_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait]
impl Component for DbComponent {
    fn name(&self) -> &str {
        "db_pool"
    }

    async fn init(&self) -> Result<()> {
        self.pool.query("SELECT 1", &[], Default::default()).await.map(|_| ())
    }

    async fn health(&self) -> Result<bool> {
        Ok(self.pool.is_healthy())
    }

    async fn shutdown(&self) {
        if let Some(handle) = self.probe_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

struct DeviceComponent {
    pool: Arc<DevicePool>,
    failover: Arc<FailoverController>,
}

#[async_trait]
impl Component for DeviceComponent {
    fn name(&self) -> &str {
        "device_pool"
    }

    async fn init(&self) -> Result<()> {
        let _ = &self.failover;
        let _ = &self.pool;
        Ok(())
    }
}

struct JobQueueComponent {
    queue: Arc<JobQueue>,
    worker_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait]
impl Component for JobQueueComponent {
    fn name(&self) -> &str {
        "job_queue"
    }

    async fn init(&self) -> Result<()> {
        let queue = self.queue.clone();
        let handle = jobqueue::spawn_worker(queue, |job| async move {
            match job.payload.get("kind").and_then(JsonValue::as_str) {
                Some("write_behind") => {
                    info!(job_id = %job.id, "replayed write-behind job against source of truth");
                    Ok(())
                }
                _ => Ok(()),
            }
        });
        *self.worker_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    async fn health(&self) -> Result<bool> {
        Ok(self.queue.in_flight_count() <= self.queue.depth().max(1))
    }

    async fn shutdown(&self) {
        if let Some(handle) = self.worker_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn build_cache_manager(config: &BillingConfig, events: Arc<EventBus<CacheEvent>>, jobs: Arc<JobQueue>) -> CacheManager {
    let mut builder = CacheManagerBuilder::new()
        .with_refresh_threshold(config.cache.refresh_ahead_threshold)
        .with_job_queue(jobs);
    for layer_config in &config.cache.layers {
        let descriptor = LayerDescriptor {
            name: layer_config.name,
            enabled: layer_config.enabled,
            priority: layer_config.priority,
            default_ttl: layer_config.default_ttl,
        };
        let layer: Arc<dyn billing_core::cache::CacheLayer> = match layer_config.name {
            LayerName::L1 => Arc::new(L1Layer::new(config.cache.l1_capacity)),
            LayerName::L2 => Arc::new(InMemorySharedStore::new()),
            LayerName::L3 => continue,
        };
        builder = builder.with_layer(descriptor, layer);
    }
    if config.cache.result_cache.enabled {
        builder = builder.with_result_cache(Arc::new(L3Layer::new()), config.cache.result_cache.default_ttl);
    }
    builder.build(events)
}

async fn run() -> Result<()> {
    telemetry::init();
    let config = BillingConfig::default();

    let cache_events = Arc::new(EventBus::<CacheEvent>::default());
    let failover_events = Arc::new(EventBus::<FailoverEvent>::default());
    let _domain_events = Arc::new(EventBus::<DomainEvent>::default());

    let jobs = Arc::new(JobQueue::new(64, Duration::from_millis(100)));
    let cache_manager = Arc::new(build_cache_manager(&config, cache_events.clone(), jobs.clone()));

    let circuit_config = CircuitBreakerConfig {
        failure_threshold: config.db_pool.circuit_failure_threshold,
        cooldown: config.db_pool.circuit_cooldown,
    };
    let db_pool = Arc::new(DbPool::new(
        Arc::new(LoopbackExecutor),
        Vec::new(),
        circuit_config,
        config.db_pool.retry_base_delay,
        config.db_pool.slow_query_threshold,
    ));
    let probe_pool = db_pool.clone();
    let probe_interval = config.db_pool.health_probe_interval;
    let probe_handle = tokio::spawn(async move { probe_pool.run_health_probe(probe_interval).await });

    let failover = Arc::new(FailoverController::new(config.failover.clone(), failover_events));
    failover.register_device(DeviceDescriptor {
        id: "primary".to_string(),
        group: "default".to_string(),
        priority: 10,
        region: "local".to_string(),
        health_score: 1.0,
        current_connections: 0,
    });
    let device_pool = Arc::new(DevicePool::new(failover.clone(), 16, config.cache.l1_capacity));
    device_pool.register_client("primary", Arc::new(EchoClient));

    let mut registry = Registry::new();
    registry.register(Arc::new(CacheComponent { manager: cache_manager }), vec![], 10, true, "production", true);
    registry.register(
        Arc::new(DbComponent { pool: db_pool, probe_handle: std::sync::Mutex::new(Some(probe_handle)) }),
        vec![],
        20,
        true,
        "production",
        true,
    );
    registry.register(
        Arc::new(DeviceComponent { pool: device_pool, failover }),
        vec!["cache_manager".to_string()],
        5,
        false,
        "production",
        false,
    );
    registry.register(
        Arc::new(JobQueueComponent { queue: jobs, worker_handle: std::sync::Mutex::new(None) }),
        vec!["cache_manager".to_string()],
        5,
        true,
        "production",
        true,
    );

    registry.start_all().await?;
    info!("billing-core substrate started");

    tokio::signal::ctrl_c().await.map_err(Error::from)?;
    info!("shutdown signal received");

    registry.shutdown_all(Duration::from_secs(10)).await;
    let report = registry.health_report().await;
    info!(?report, "final health report");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "billing-core exited with error");
            warn!("attempted graceful shutdown already ran before this error surfaced where applicable");
            ExitCode::FAILURE
        }
    }
}
