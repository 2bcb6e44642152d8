// Tag-, pattern-, key-, and event-driven invalidation with delayed
// batching and dependency chains.
//
// Four entry points: immediate (domain event -> rule -> manager calls),
// delayed (bounded queue drained by a ticker), scheduled (cron-driven
// pattern sweeps), and dependency chains (a trigger declares further
// invalidations that run atomically with it).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::cache::manager::CacheManager;
use crate::cron::CronSchedule;
use crate::events::DomainEvent;

#[derive(Debug, Clone)]
pub enum InvalidationItem {
    Tag(String),
    Pattern(String),
    Keys(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct InvalidationRule {
    pub event_name: String,
    pub items: Vec<InvalidationTemplate>,
}

#[derive(Debug, Clone)]
pub enum InvalidationTemplate {
    Tag(String),
    /// A pattern with `${field}` placeholders interpolated from the event
    /// payload, e.g. `customer:${id}:*`.
    Pattern(String),
}

impl InvalidationTemplate {
    fn render(&self, data: &JsonValue) -> InvalidationItem {
        match self {
            InvalidationTemplate::Tag(tag) => InvalidationItem::Tag(interpolate(tag, data)),
            InvalidationTemplate::Pattern(pat) => InvalidationItem::Pattern(interpolate(pat, data)),
        }
    }
}

fn interpolate(template: &str, data: &JsonValue) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = template[i + 2..].find('}') {
                let field = &template[i + 2..i + 2 + end];
                let value = data
                    .get(field)
                    .map(|v| match v {
                        JsonValue::String(s) => s.clone(),
                        other => other.to_string().trim_matches('"').to_string(),
                    })
                    .unwrap_or_default();
                out.push_str(&value);
                i += 2 + end + 1;
                continue;
            }
        }
        let ch = template[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// The default rule catalogue from the invalidation component design.
pub fn default_rule_catalogue() -> Vec<InvalidationRule> {
    vec![
        InvalidationRule {
            event_name: "customer:updated".into(),
            items: vec![
                InvalidationTemplate::Tag("customer".into()),
                InvalidationTemplate::Pattern("customer:${id}:*".into()),
            ],
        },
        InvalidationRule {
            event_name: "subscription:updated".into(),
            items: vec![
                InvalidationTemplate::Tag("subscription".into()),
                InvalidationTemplate::Pattern("customer:${customer_id}:subscriptions".into()),
            ],
        },
        InvalidationRule {
            event_name: "payment:completed".into(),
            items: vec![
                InvalidationTemplate::Tag("payment".into()),
                InvalidationTemplate::Pattern("customer:${customer_id}:*".into()),
            ],
        },
        InvalidationRule {
            event_name: "settings:updated".into(),
            items: vec![
                InvalidationTemplate::Tag("settings".into()),
                InvalidationTemplate::Pattern("setting:*".into()),
            ],
        },
    ]
}

/// A trigger that must run a fixed list of further invalidations
/// atomically alongside its own rule-driven items.
#[derive(Debug, Clone, Default)]
pub struct DependencyChain {
    pub chained: Vec<InvalidationItem>,
}

pub struct InvalidationCoordinator {
    manager: Arc<CacheManager>,
    rules: Vec<InvalidationRule>,
    chains: std::collections::HashMap<String, DependencyChain>,
    delayed_queue: Mutex<VecDeque<InvalidationItem>>,
    delayed_capacity: usize,
}

impl InvalidationCoordinator {
    pub fn new(manager: Arc<CacheManager>, rules: Vec<InvalidationRule>, delayed_capacity: usize) -> Self {
        Self {
            manager,
            rules,
            chains: std::collections::HashMap::new(),
            delayed_queue: Mutex::new(VecDeque::new()),
            delayed_capacity,
        }
    }

    pub fn with_dependency_chain(mut self, event_name: impl Into<String>, chain: DependencyChain) -> Self {
        self.chains.insert(event_name.into(), chain);
        self
    }

    async fn execute(&self, item: &InvalidationItem) -> usize {
        match item {
            InvalidationItem::Tag(tag) => self.manager.invalidate_by_tag(tag).await,
            InvalidationItem::Pattern(pat) => self.manager.invalidate_by_pattern(pat).await,
            InvalidationItem::Keys(keys) => {
                let mut total = 0;
                for k in keys {
                    total += self.manager.delete(k).await;
                }
                total
            }
        }
    }

    /// Immediate entry point: resolve `event` against the rule catalogue
    /// and dependency chains, then execute every resolved item.
    pub async fn handle_event(&self, event: &DomainEvent) -> usize {
        let DomainEvent::EntityChanged { entity, action, data } = event;
        let event_name = format!("{entity}:{action}");
        let mut total = 0;
        for rule in self.rules.iter().filter(|r| r.event_name == event_name) {
            for template in &rule.items {
                let item = template.render(data);
                total += self.execute(&item).await;
            }
        }
        if let Some(chain) = self.chains.get(&event_name) {
            for item in &chain.chained {
                total += self.execute(item).await;
            }
        }
        total
    }

    /// Delayed entry point: append to the bounded queue. On overflow, the
    /// oldest 20% is dropped.
    pub fn enqueue_delayed(&self, item: InvalidationItem) {
        let mut queue = self.delayed_queue.lock();
        queue.push_back(item);
        if queue.len() > self.delayed_capacity {
            let drop_count = (self.delayed_capacity / 5).max(1);
            for _ in 0..drop_count {
                queue.pop_front();
            }
            warn!(dropped = drop_count, "delayed invalidation queue overflowed, dropped oldest 20%");
        }
    }

    /// Drain up to `batch_size` items, deduplicated by rendered target
    /// within each kind, and execute them. Intended to be called from a
    /// periodic ticker every T ms.
    pub async fn drain_delayed(&self, batch_size: usize) -> usize {
        let drained: Vec<InvalidationItem> = {
            let mut queue = self.delayed_queue.lock();
            let n = batch_size.min(queue.len());
            queue.drain(..n).collect()
        };
        let mut seen_tags = std::collections::HashSet::new();
        let mut seen_patterns = std::collections::HashSet::new();
        let mut seen_keys = std::collections::HashSet::new();
        let mut total = 0;
        for item in drained {
            let dedup_hit = match &item {
                InvalidationItem::Tag(t) => !seen_tags.insert(t.clone()),
                InvalidationItem::Pattern(p) => !seen_patterns.insert(p.clone()),
                InvalidationItem::Keys(ks) => ks.iter().all(|k| !seen_keys.insert(k.clone())),
            };
            if dedup_hit {
                continue;
            }
            total += self.execute(&item).await;
        }
        total
    }

    /// Scheduled entry point: run `items` whenever `schedule` matches,
    /// checked once per minute.
    pub async fn run_scheduled(&self, schedule: CronSchedule, items: Vec<InvalidationItem>) {
        let mut last_run = None;
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let now = chrono::Utc::now();
            if schedule.matches(now) && last_run != Some(now) {
                last_run = Some(now);
                for item in &items {
                    self.execute(item).await;
                }
            }
        }
    }

    pub fn delayed_depth(&self) -> usize {
        self.delayed_queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::layers::{L1Layer, LayerDescriptor, LayerName};
    use crate::cache::lru::CacheValue;
    use crate::cache::manager::CacheManagerBuilder;
    use crate::events::EventBus;

    fn manager_with_l1() -> Arc<CacheManager> {
        let l1 = Arc::new(L1Layer::new(16));
        let events = Arc::new(EventBus::default());
        Arc::new(
            CacheManagerBuilder::new()
                .with_layer(
                    LayerDescriptor { name: LayerName::L1, enabled: true, priority: 0, default_ttl: Duration::from_secs(30) },
                    l1,
                )
                .build(events),
        )
    }

    #[tokio::test]
    async fn customer_updated_invalidates_tag_and_pattern() {
        let manager = manager_with_l1();
        manager
            .set("customer:42:profile", CacheValue::Bool(true), &["customer".into()])
            .await;
        let coordinator = InvalidationCoordinator::new(manager.clone(), default_rule_catalogue(), 100);
        let event = DomainEvent::EntityChanged {
            entity: "customer".into(),
            action: "updated".into(),
            data: serde_json::json!({ "id": "42" }),
        };
        let affected = coordinator.handle_event(&event).await;
        assert!(affected >= 1);
    }

    #[tokio::test]
    async fn delayed_queue_drops_oldest_twenty_percent_on_overflow() {
        let manager = manager_with_l1();
        let coordinator = InvalidationCoordinator::new(manager, vec![], 10);
        for i in 0..12 {
            coordinator.enqueue_delayed(InvalidationItem::Tag(format!("t{i}")));
        }
        assert!(coordinator.delayed_depth() <= 10);
    }

    #[tokio::test]
    async fn drain_dedupes_identical_tags() {
        let manager = manager_with_l1();
        let coordinator = InvalidationCoordinator::new(manager, vec![], 100);
        coordinator.enqueue_delayed(InvalidationItem::Tag("customer".into()));
        coordinator.enqueue_delayed(InvalidationItem::Tag("customer".into()));
        coordinator.drain_delayed(10).await;
        assert_eq!(coordinator.delayed_depth(), 0);
    }

    #[test]
    fn interpolation_substitutes_fields() {
        let rendered = interpolate("customer:${id}:*", &serde_json::json!({"id": "7"}));
        assert_eq!(rendered, "customer:7:*");
    }
}
