// Typed publish-subscribe event bus.
//
// Models the "emits event X" language scattered through the cache manager,
// invalidation coordinator, and failover controller as a single channel of
// a closed event enum, with a bounded recursion guard: a subscriber handling
// `CacheEvent::Invalidated` may itself trigger a write that publishes another
// event, so re-entrant publishes are allowed up to a small depth before being
// dropped and logged.

use std::cell::Cell;

use tokio::sync::broadcast;
use tracing::warn;

const MAX_RECURSION_DEPTH: usize = 8;

thread_local! {
    static PUBLISH_DEPTH: Cell<usize> = Cell::new(0);
}

#[derive(Debug, Clone)]
pub enum CacheEvent {
    Hit { key: String, layer: crate::cache::layers::LayerName, latency_us: u64 },
    Miss { key: String },
    Set { key: String },
    Deleted { key: String },
    Invalidated { kind: InvalidationKind, target: String, affected: usize },
    WarmingCandidate { key: String, score: f64 },
    RefreshScheduled { key: String },
    WriteBehindLost { key: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationKind {
    Tag,
    Pattern,
    Keys,
}

#[derive(Debug, Clone)]
pub enum DomainEvent {
    EntityChanged { entity: String, action: String, data: serde_json::Value },
}

#[derive(Debug, Clone)]
pub enum FailoverEvent {
    Transitioned { device_id: String, from: String, to: String },
    TargetSelected { group: String, device_id: String },
}

/// A bounded broadcast bus for one event type, with re-entry protection.
pub struct EventBus<T: Clone + Send + 'static> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Publish an event. Returns `false` (and logs) if the recursion guard
    /// tripped, meaning this publish was itself caused by handling an event
    /// from this same call stack beyond `MAX_RECURSION_DEPTH`.
    pub fn publish(&self, event: T) -> bool {
        let depth = PUBLISH_DEPTH.with(|d| d.get());
        if depth >= MAX_RECURSION_DEPTH {
            warn!("event publish recursion guard tripped at depth {depth}, dropping event");
            return false;
        }
        PUBLISH_DEPTH.with(|d| d.set(depth + 1));
        let _ = self.tx.send(event);
        PUBLISH_DEPTH.with(|d| d.set(depth));
        true
    }
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let bus: EventBus<CacheEvent> = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(CacheEvent::Miss { key: "k".into() });
        let evt = rx.recv().await.unwrap();
        assert!(matches!(evt, CacheEvent::Miss { key } if key == "k"));
    }

    #[test]
    fn recursion_guard_trips_past_depth() {
        let bus: EventBus<CacheEvent> = EventBus::default();
        for _ in 0..MAX_RECURSION_DEPTH {
            PUBLISH_DEPTH.with(|d| d.set(d.get() + 1));
        }
        let delivered = bus.publish(CacheEvent::Miss { key: "k".into() });
        assert!(!delivered);
        PUBLISH_DEPTH.with(|d| d.set(0));
    }
}
