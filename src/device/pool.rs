// Per-device connection pool: one authenticated client per device, a
// per-device FIFO command queue dispatched under a global concurrency
// cap, and a short-TTL response cache with write-triggered invalidation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};

use crate::cache::layers::{CacheLayer, L1Layer};
use crate::cache::lru::CacheValue;
use crate::device::failover::{FailoverController, SelectionStrategy};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub payload: JsonValue,
    /// Writes invalidate this device's cached responses after dispatch.
    pub is_write: bool,
}

#[derive(Debug, Clone)]
pub struct CommandOptions {
    pub timeout: Duration,
    pub cache_ttl: Option<Duration>,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(10), cache_ttl: Some(Duration::from_secs(5)) }
    }
}

/// One authenticated client connection to a device. A real implementation
/// drives the device's actual wire protocol; tests supply a fake.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    async fn send(&self, device_id: &str, command: &Command) -> Result<JsonValue>;
}

fn fingerprint(device_id: &str, command: &Command) -> String {
    let raw = format!("{device_id}:{}:{}", command.name, command.payload);
    format!("{:x}", md5::compute(raw.as_bytes()))
}

pub struct DevicePool {
    clients: DashMap<String, Arc<dyn DeviceClient>>,
    queues: DashMap<String, Arc<AsyncMutex<()>>>,
    dispatch_cap: Arc<Semaphore>,
    failover: Arc<FailoverController>,
    response_cache: L1Layer,
}

impl DevicePool {
    pub fn new(failover: Arc<FailoverController>, concurrency_cap: usize, cache_capacity: usize) -> Self {
        Self {
            clients: DashMap::new(),
            queues: DashMap::new(),
            dispatch_cap: Arc::new(Semaphore::new(concurrency_cap)),
            failover,
            response_cache: L1Layer::new(cache_capacity),
        }
    }

    pub fn register_client(&self, device_id: &str, client: Arc<dyn DeviceClient>) {
        self.clients.insert(device_id.to_string(), client);
    }

    fn queue_for(&self, device_id: &str) -> Arc<AsyncMutex<()>> {
        self.queues.entry(device_id.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Resolve the active device for `device_id`'s group, then run
    /// `command` against it: cache hit short-circuits for cacheable reads,
    /// writes dispatch then invalidate this device's cached responses.
    pub async fn execute_command(&self, device_id: &str, command: Command, options: CommandOptions) -> Result<JsonValue> {
        let active_device = self.failover.active_in_group(device_id).ok_or_else(|| Error::unavailable(format!("no active device for group of '{device_id}'")))?;

        let cache_key = fingerprint(&active_device, &command);
        if !command.is_write {
            if let Some(CacheValue::Bytes(bytes)) = self.response_cache.get(&cache_key).await? {
                if let Ok(value) = serde_json::from_slice::<JsonValue>(&bytes) {
                    return Ok(value);
                }
            }
        }

        let client = self.clients.get(&active_device).ok_or_else(|| Error::not_found(format!("no client registered for device '{active_device}'")))?.clone();
        let queue_lock = self.queue_for(&active_device);
        let _fifo_guard = queue_lock.lock().await;
        let _permit = self.dispatch_cap.acquire().await.map_err(|_| Error::fatal("dispatch semaphore closed"))?;

        let response = tokio::time::timeout(options.timeout, client.send(&active_device, &command))
            .await
            .map_err(|_| Error::timeout(format!("command '{}' to '{active_device}' timed out", command.name)))??;

        if command.is_write {
            self.response_cache.delete(&cache_key).await?;
        } else if let Some(ttl) = options.cache_ttl {
            if let Ok(bytes) = serde_json::to_vec(&response) {
                self.response_cache.set(&cache_key, CacheValue::Bytes(bytes), ttl, &[]).await?;
            }
        }
        Ok(response)
    }

    pub async fn trigger_failover(&self, device_id: &str, strategy: SelectionStrategy) -> Result<Option<String>> {
        self.failover.trigger(device_id, strategy, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailoverConfig;
    use crate::device::failover::DeviceDescriptor;
    use crate::events::EventBus;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingClient {
        calls: AtomicU32,
    }
    #[async_trait]
    impl DeviceClient for CountingClient {
        async fn send(&self, device_id: &str, command: &Command) -> Result<JsonValue> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({ "device": device_id, "ack": command.name }))
        }
    }

    fn pool_with_device() -> (DevicePool, Arc<CountingClient>) {
        let failover = Arc::new(FailoverController::new(FailoverConfig::default(), Arc::new(EventBus::default())));
        failover.register_device(DeviceDescriptor { id: "d1".into(), group: "g1".into(), priority: 1, region: "east".into(), health_score: 0.9, current_connections: 0 });
        let pool = DevicePool::new(failover, 4, 64);
        let client = Arc::new(CountingClient { calls: AtomicU32::new(0) });
        pool.register_client("d1", client.clone());
        (pool, client)
    }

    #[tokio::test]
    async fn read_command_populates_cache_and_second_call_hits() {
        let (pool, client) = pool_with_device();
        let cmd = Command { name: "status".into(), payload: serde_json::json!({}), is_write: false };
        pool.execute_command("d1", cmd.clone(), CommandOptions::default()).await.unwrap();
        pool.execute_command("d1", cmd, CommandOptions::default()).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 1, "second call should be served from cache");
    }

    #[tokio::test]
    async fn write_command_invalidates_cached_entry() {
        let (pool, client) = pool_with_device();
        let read_cmd = Command { name: "status".into(), payload: serde_json::json!({}), is_write: false };
        pool.execute_command("d1", read_cmd.clone(), CommandOptions::default()).await.unwrap();
        let write_cmd = Command { name: "status".into(), payload: serde_json::json!({}), is_write: true };
        pool.execute_command("d1", write_cmd, CommandOptions::default()).await.unwrap();
        pool.execute_command("d1", read_cmd, CommandOptions::default()).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 3, "write should invalidate so the final read re-dispatches");
    }

    #[tokio::test]
    async fn unregistered_device_group_fails_unavailable() {
        let failover = Arc::new(FailoverController::new(FailoverConfig::default(), Arc::new(EventBus::default())));
        let pool = DevicePool::new(failover, 4, 64);
        let cmd = Command { name: "status".into(), payload: serde_json::json!({}), is_write: false };
        let result = pool.execute_command("ghost", cmd, CommandOptions::default()).await;
        assert_eq!(result.unwrap_err().kind(), crate::error::ErrorKind::Unavailable);
    }
}
