// End-to-end check that the registry starts the cache, DB pool, and device
// pool components in dependency order and shuts them down cleanly.

use async_trait::async_trait;
use billing_core::cache::{CacheManager, CacheManagerBuilder, L1Layer, LayerDescriptor, LayerName};
use billing_core::db::{CircuitBreakerConfig, DbPool, Operation, QueryExecutor, QueryOptions};
use billing_core::events::EventBus;
use billing_core::registry::{Component, HealthStatus, Registry};
use billing_core::Result;
use std::sync::Arc;
use std::time::Duration;

struct FakeExecutor;

#[async_trait]
impl QueryExecutor for FakeExecutor {
    async fn execute(&self, _sql: &str, _params: &[String]) -> Result<u64> {
        Ok(1)
    }
}

struct CacheComponent(Arc<CacheManager>);

#[async_trait]
impl Component for CacheComponent {
    fn name(&self) -> &str {
        "cache"
    }
    async fn init(&self) -> Result<()> {
        Ok(())
    }
}

struct DbComponent(Arc<DbPool>);

#[async_trait]
impl Component for DbComponent {
    fn name(&self) -> &str {
        "db"
    }
    async fn init(&self) -> Result<()> {
        self.0.query("SELECT 1", &[], QueryOptions { operation: Operation::Read, ..Default::default() }).await.map(|_| ())
    }
    async fn health(&self) -> Result<bool> {
        Ok(self.0.is_healthy())
    }
}

#[tokio::test]
async fn registry_starts_db_before_dependent_cache_and_reports_health() {
    let l1: Arc<dyn billing_core::cache::CacheLayer> = Arc::new(L1Layer::new(64));
    let cache_manager = Arc::new(
        CacheManagerBuilder::new()
            .with_layer(LayerDescriptor { name: LayerName::L1, enabled: true, priority: 0, default_ttl: Duration::from_secs(30) }, l1)
            .build(Arc::new(EventBus::default())),
    );
    let db_pool = Arc::new(DbPool::new(
        Arc::new(FakeExecutor),
        vec![],
        CircuitBreakerConfig { failure_threshold: 3, cooldown: Duration::from_secs(30) },
        Duration::from_millis(5),
        Duration::from_secs(1),
    ));

    let mut registry = Registry::new();
    registry.register(Arc::new(DbComponent(db_pool)), vec![], 10, true, "test", true);
    registry.register(Arc::new(CacheComponent(cache_manager)), vec!["db".to_string()], 5, true, "test", false);

    registry.start_all().await.expect("both components should start");

    let report = registry.health_report().await;
    assert_eq!(report.get("db"), Some(&HealthStatus::Healthy));
    assert_eq!(report.get("cache"), Some(&HealthStatus::Disabled));

    registry.shutdown_all(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn required_component_failure_aborts_startup() {
    struct AlwaysFails;
    #[async_trait]
    impl Component for AlwaysFails {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn init(&self) -> Result<()> {
            Err(billing_core::Error::fatal("cannot connect"))
        }
    }

    let mut registry = Registry::new();
    registry.register(Arc::new(AlwaysFails), vec![], 0, true, "test", false);
    assert!(registry.start_all().await.is_err());
}
