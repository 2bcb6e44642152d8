// Per-device failover state machine: active -> failing_over -> failed ->
// active, with pluggable target-selection strategies, a per-device
// re-entry lock, and a bounded event history with rolling statistics.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::config::FailoverConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, FailoverEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Active,
    FailingOver,
    Failed,
}

#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub id: String,
    pub group: String,
    pub priority: u32,
    pub region: String,
    pub health_score: f64,
    pub current_connections: u32,
}

#[derive(Debug, Clone)]
struct DeviceStatus {
    state: DeviceState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    failed_at: Option<DateTime<Utc>>,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self { state: DeviceState::Active, consecutive_failures: 0, consecutive_successes: 0, failed_at: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    PriorityBased,
    LoadBased,
    Geographic,
    HealthBased,
}

#[derive(Debug, Clone, Default)]
pub struct FailoverStats {
    pub total_failovers: u64,
    pub per_device: HashMap<String, u64>,
    pub avg_duration_ms: f64,
}

pub struct FailoverController {
    config: FailoverConfig,
    devices: DashMap<String, DeviceDescriptor>,
    statuses: DashMap<String, DeviceStatus>,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
    history: Mutex<VecDeque<FailoverEvent>>,
    stats: Mutex<FailoverStats>,
    events: Arc<EventBus<FailoverEvent>>,
}

impl FailoverController {
    pub fn new(config: FailoverConfig, events: Arc<EventBus<FailoverEvent>>) -> Self {
        Self {
            config,
            devices: DashMap::new(),
            statuses: DashMap::new(),
            locks: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            stats: Mutex::new(FailoverStats::default()),
            events,
        }
    }

    pub fn register_device(&self, device: DeviceDescriptor) {
        self.statuses.entry(device.id.clone()).or_default();
        self.devices.insert(device.id.clone(), device);
    }

    pub fn state_of(&self, device_id: &str) -> Option<DeviceState> {
        self.statuses.get(device_id).map(|s| s.state)
    }

    fn lock_for(&self, device_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks.entry(device_id.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Record one health-probe outcome. Accumulates failures toward the
    /// `active -> failing_over` threshold, or successes toward recovery.
    pub async fn record_probe(&self, device_id: &str, success: bool) {
        let should_start_failover = {
            let mut status = self.statuses.entry(device_id.to_string()).or_default();
            if success {
                status.consecutive_failures = 0;
                status.consecutive_successes += 1;
                if status.state == DeviceState::Failed {
                    let cooldown_elapsed = status
                        .failed_at
                        .map(|t| Utc::now() - t >= chrono::Duration::from_std(self.config.recovery_cooldown).unwrap_or_default())
                        .unwrap_or(false);
                    if cooldown_elapsed && status.consecutive_successes >= self.config.recovery_threshold {
                        status.state = DeviceState::Active;
                        status.consecutive_successes = 0;
                        status.failed_at = None;
                        info!(device_id, "device recovered to active");
                        self.emit(FailoverEvent::Transitioned { device_id: device_id.to_string(), from: "failed".into(), to: "active".into() });
                    }
                }
                false
            } else {
                status.consecutive_successes = 0;
                status.consecutive_failures += 1;
                status.state == DeviceState::Active && status.consecutive_failures >= self.config.failure_threshold
            }
        };
        if should_start_failover {
            let _ = self.trigger(device_id, SelectionStrategy::HealthBased, false).await;
        }
    }

    /// Attempt a failover for `device_id`. `manual` bypasses the
    /// consecutive-failure heuristic and the active-state requirement.
    pub async fn trigger(&self, device_id: &str, strategy: SelectionStrategy, manual: bool) -> Result<Option<String>> {
        let lock = self.lock_for(device_id);
        let _guard = lock.lock().await;

        {
            let mut status = self.statuses.entry(device_id.to_string()).or_default();
            if !manual && status.state != DeviceState::Active {
                return Ok(None);
            }
            status.state = DeviceState::FailingOver;
        }
        self.emit(FailoverEvent::Transitioned { device_id: device_id.to_string(), from: "active".into(), to: "failing_over".into() });
        let started = Utc::now();

        let failing = self.devices.get(device_id).map(|d| d.clone()).ok_or_else(|| Error::not_found(format!("unknown device '{device_id}'")))?;
        let target = self.select_target(&failing, strategy);

        let mut status = self.statuses.entry(device_id.to_string()).or_default();
        match &target {
            Some(target_id) => {
                status.state = DeviceState::Failed;
                status.failed_at = Some(Utc::now());
                status.consecutive_successes = 0;
                self.emit(FailoverEvent::TargetSelected { group: failing.group.clone(), device_id: target_id.clone() });
                self.emit(FailoverEvent::Transitioned { device_id: device_id.to_string(), from: "failing_over".into(), to: "failed".into() });
                self.record_history(device_id, started);
            }
            None => {
                status.state = DeviceState::Active;
                warn!(device_id, "no healthy failover target available, reverting to active");
                self.emit(FailoverEvent::Transitioned { device_id: device_id.to_string(), from: "failing_over".into(), to: "active".into() });
            }
        }
        Ok(target)
    }

    fn select_target(&self, failing: &DeviceDescriptor, strategy: SelectionStrategy) -> Option<String> {
        let mut candidates: Vec<DeviceDescriptor> = self
            .devices
            .iter()
            .filter(|e| e.group == failing.group && e.id != failing.id)
            .filter(|e| e.health_score >= self.config.min_health_score)
            .filter(|e| !matches!(self.statuses.get(&e.id).map(|s| s.state), Some(DeviceState::Failed)))
            .map(|e| e.value().clone())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        match strategy {
            SelectionStrategy::PriorityBased => {
                candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
            }
            SelectionStrategy::LoadBased => {
                candidates.sort_by(|a, b| a.current_connections.cmp(&b.current_connections));
            }
            SelectionStrategy::Geographic => {
                candidates.sort_by(|a, b| {
                    let a_local = a.region == failing.region;
                    let b_local = b.region == failing.region;
                    b_local.cmp(&a_local).then(b.health_score.partial_cmp(&a.health_score).unwrap_or(std::cmp::Ordering::Equal))
                });
            }
            SelectionStrategy::HealthBased => {
                candidates.sort_by(|a, b| {
                    b.health_score.partial_cmp(&a.health_score).unwrap_or(std::cmp::Ordering::Equal).then(b.priority.cmp(&a.priority))
                });
            }
        }
        candidates.into_iter().next().map(|c| c.id)
    }

    fn emit(&self, event: FailoverEvent) {
        self.events.publish(event);
    }

    fn record_history(&self, device_id: &str, started: DateTime<Utc>) {
        let duration_ms = (Utc::now() - started).num_milliseconds().max(0) as f64;
        let mut history = self.history.lock();
        history.push_back(FailoverEvent::Transitioned { device_id: device_id.to_string(), from: "failing_over".into(), to: "failed".into() });
        while history.len() > self.config.history_capacity {
            history.pop_front();
        }
        let mut stats = self.stats.lock();
        let n = stats.total_failovers;
        stats.avg_duration_ms = (stats.avg_duration_ms * n as f64 + duration_ms) / (n as f64 + 1.0);
        stats.total_failovers += 1;
        *stats.per_device.entry(device_id.to_string()).or_insert(0) += 1;
    }

    pub fn statistics(&self) -> FailoverStats {
        self.stats.lock().clone()
    }

    pub fn history_depth(&self) -> usize {
        self.history.lock().len()
    }

    /// The device that should currently serve `group`'s traffic: the
    /// originally-assigned device if it's still active, else the first
    /// active peer found in the group.
    pub fn active_in_group(&self, preferred_device_id: &str) -> Option<String> {
        if self.state_of(preferred_device_id) == Some(DeviceState::Active) {
            return Some(preferred_device_id.to_string());
        }
        let group = self.devices.get(preferred_device_id)?.group.clone();
        self.devices
            .iter()
            .filter(|e| e.group == group)
            .find(|e| self.state_of(&e.id) == Some(DeviceState::Active))
            .map(|e| e.id.clone())
    }
}
