// Top-level configuration for the billing-core substrate.
//
// Construction is programmatic (`BillingConfig::default()` plus builder-style
// overrides) — CLI flag parsing and config-file loading are out of scope for
// this crate and live in the surrounding service.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::layers::LayerName;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    pub name: LayerName,
    pub enabled: bool,
    pub priority: u8,
    pub default_ttl: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub l1_capacity: usize,
    /// Generic get/set/invalidate layers, L1 and L2 only. L3 is the
    /// dedicated query-result cache and is configured separately via
    /// `result_cache` — it never joins this fan-out.
    pub layers: Vec<LayerConfig>,
    pub result_cache: LayerConfig,
    pub refresh_ahead_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 10_000,
            layers: vec![
                LayerConfig {
                    name: LayerName::L1,
                    enabled: true,
                    priority: 0,
                    default_ttl: Duration::from_secs(60),
                },
                LayerConfig {
                    name: LayerName::L2,
                    enabled: true,
                    priority: 1,
                    default_ttl: Duration::from_secs(300),
                },
            ],
            result_cache: LayerConfig {
                name: LayerName::L3,
                enabled: true,
                priority: 2,
                default_ttl: Duration::from_secs(3600),
            },
            refresh_ahead_threshold: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsThresholds {
    pub hit_rate_warning: f64,
    pub hit_rate_critical: f64,
    pub avg_response_ms_warning: f64,
    pub avg_response_ms_critical: f64,
    pub memory_util_warning: f64,
    pub memory_util_critical: f64,
    pub error_rate_warning: f64,
    pub error_rate_critical: f64,
    pub evictions_per_min_warning: f64,
    pub evictions_per_min_critical: f64,
    pub alert_cooldown: Duration,
}

impl Default for MetricsThresholds {
    fn default() -> Self {
        Self {
            hit_rate_warning: 0.70,
            hit_rate_critical: 0.50,
            avg_response_ms_warning: 100.0,
            avg_response_ms_critical: 500.0,
            memory_util_warning: 0.80,
            memory_util_critical: 0.95,
            error_rate_warning: 0.01,
            error_rate_critical: 0.05,
            evictions_per_min_warning: 10.0,
            evictions_per_min_critical: 50.0,
            alert_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbPoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub idle_timeout: Duration,
    pub statement_timeout: Duration,
    pub slow_query_threshold: Duration,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown: Duration,
    pub retry_base_delay: Duration,
    pub health_probe_interval: Duration,
}

impl Default for DbPoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 20,
            idle_timeout: Duration::from_secs(300),
            statement_timeout: Duration::from_secs(30),
            slow_query_threshold: Duration::from_millis(250),
            circuit_failure_threshold: 5,
            circuit_cooldown: Duration::from_secs(30),
            retry_base_delay: Duration::from_millis(50),
            health_probe_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    pub directory: String,
    pub retention_days: u32,
    pub compress: bool,
    pub encrypt: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directory: "./backups".to_string(),
            retention_days: 30,
            compress: true,
            encrypt: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
    pub recovery_cooldown: Duration,
    pub min_health_score: f64,
    pub history_capacity: usize,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_threshold: 3,
            recovery_cooldown: Duration::from_secs(60),
            min_health_score: 0.5,
            history_capacity: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BillingConfig {
    pub cache: CacheConfig,
    pub metrics: MetricsThresholds,
    pub db_pool: DbPoolConfig,
    pub backup: BackupConfig,
    pub failover: FailoverConfig,
}
