// Component registry and lifecycle: dependency-ordered startup, reverse-
// order graceful shutdown under a deadline, and aggregated health.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    async fn init(&self) -> Result<()>;

    /// `Ok(true)` healthy, `Ok(false)` unhealthy, `Err` also counts as
    /// unhealthy. Components with no meaningful probe should not override
    /// this — the registry reports them `Disabled` for health purposes
    /// when `has_health_probe` is false.
    async fn health(&self) -> Result<bool> {
        Ok(true)
    }

    async fn shutdown(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Disabled,
}

struct Registered {
    component: Arc<dyn Component>,
    dependencies: Vec<String>,
    priority: i32,
    required: bool,
    environment: String,
    has_health_probe: bool,
}

#[derive(Default)]
pub struct Registry {
    components: Vec<Registered>,
    started: std::sync::Mutex<HashSet<String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, component: Arc<dyn Component>, dependencies: Vec<String>, priority: i32, required: bool, environment: impl Into<String>, has_health_probe: bool) {
        self.components.push(Registered { component, dependencies, priority, required, environment: environment.into(), has_health_probe });
    }

    /// Topological order over dependencies, ties broken by priority
    /// (higher first).
    fn load_order(&self) -> Result<Vec<&Registered>> {
        let by_name: HashMap<&str, &Registered> = self.components.iter().map(|c| (c.component.name(), c)).collect();
        let mut remaining: Vec<&Registered> = self.components.iter().collect();
        let mut done: HashSet<&str> = HashSet::new();
        let mut ordered = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let mut ready: Vec<&Registered> = remaining.iter().filter(|c| c.dependencies.iter().all(|d| done.contains(d.as_str()))).copied().collect();
            if ready.is_empty() {
                let stuck: Vec<&str> = remaining.iter().map(|c| c.component.name()).collect();
                return Err(Error::validation(format!("unresolvable component dependencies among {stuck:?}")));
            }
            ready.sort_by(|a, b| b.priority.cmp(&a.priority));
            let next = ready[0];
            done.insert(next.component.name());
            ordered.push(next);
            remaining.retain(|c| c.component.name() != next.component.name());
        }
        let _ = by_name;
        Ok(ordered)
    }

    /// Initialize every component in dependency/priority order. A required
    /// component's init failure aborts startup; an optional component's
    /// failure is logged and that component is left un-started.
    pub async fn start_all(&self) -> Result<()> {
        let order = self.load_order()?;
        let mut started = self.started.lock().unwrap();
        for registered in order {
            match registered.component.init().await {
                Ok(()) => {
                    info!(component = registered.component.name(), environment = %registered.environment, "component started");
                    started.insert(registered.component.name().to_string());
                }
                Err(e) if registered.required => {
                    error!(component = registered.component.name(), error = %e, "required component failed to start");
                    return Err(e);
                }
                Err(e) => {
                    warn!(component = registered.component.name(), error = %e, "optional component failed to start, continuing");
                }
            }
        }
        Ok(())
    }

    /// Shut down every started component in reverse load order, each
    /// under `deadline`. A component that exceeds its deadline is
    /// abandoned and logged.
    pub async fn shutdown_all(&self, deadline: Duration) {
        let order: Vec<&Registered> = match self.load_order() {
            Ok(o) => o,
            Err(_) => self.components.iter().collect(),
        };
        let started = self.started.lock().unwrap().clone();
        for registered in order.into_iter().rev() {
            if !started.contains(registered.component.name()) {
                continue;
            }
            let name = registered.component.name().to_string();
            match tokio::time::timeout(deadline, registered.component.shutdown()).await {
                Ok(()) => info!(component = %name, "component shut down"),
                Err(_) => warn!(component = %name, ?deadline, "component shutdown exceeded deadline, abandoning"),
            }
        }
    }

    pub async fn health_report(&self) -> HashMap<String, HealthStatus> {
        let started = self.started.lock().unwrap().clone();
        let mut report = HashMap::with_capacity(self.components.len());
        for registered in &self.components {
            let name = registered.component.name().to_string();
            if !started.contains(&name) || !registered.has_health_probe {
                report.insert(name, HealthStatus::Disabled);
                continue;
            }
            let status = match registered.component.health().await {
                Ok(true) => HealthStatus::Healthy,
                Ok(false) | Err(_) => HealthStatus::Unhealthy,
            };
            report.insert(name, status);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Recorder {
        name: String,
        order: Arc<std::sync::Mutex<Vec<String>>>,
        fail: bool,
        healthy: AtomicBool,
        shutdown_calls: AtomicUsize,
    }

    #[async_trait]
    impl Component for Recorder {
        fn name(&self) -> &str {
            &self.name
        }
        async fn init(&self) -> Result<()> {
            self.order.lock().unwrap().push(self.name.clone());
            if self.fail {
                Err(Error::fatal("boom"))
            } else {
                Ok(())
            }
        }
        async fn health(&self) -> Result<bool> {
            Ok(self.healthy.load(Ordering::SeqCst))
        }
        async fn shutdown(&self) {
            self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn recorder(name: &str, order: Arc<std::sync::Mutex<Vec<String>>>, fail: bool) -> Arc<Recorder> {
        Arc::new(Recorder { name: name.into(), order, fail, healthy: AtomicBool::new(true), shutdown_calls: AtomicUsize::new(0) })
    }

    #[tokio::test]
    async fn starts_in_dependency_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = Registry::new();
        registry.register(recorder("db", order.clone(), false), vec![], 0, true, "prod", false);
        registry.register(recorder("cache", order.clone(), false), vec!["db".into()], 0, true, "prod", false);
        registry.start_all().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["db".to_string(), "cache".to_string()]);
    }

    #[tokio::test]
    async fn priority_breaks_ties_among_ready_components() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = Registry::new();
        registry.register(recorder("low", order.clone(), false), vec![], 0, true, "prod", false);
        registry.register(recorder("high", order.clone(), false), vec![], 10, true, "prod", false);
        registry.start_all().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["high".to_string(), "low".to_string()]);
    }

    #[tokio::test]
    async fn required_component_failure_is_fatal() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = Registry::new();
        registry.register(recorder("db", order.clone(), true), vec![], 0, true, "prod", false);
        assert!(registry.start_all().await.is_err());
    }

    #[tokio::test]
    async fn optional_component_failure_continues() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = Registry::new();
        registry.register(recorder("optional", order.clone(), true), vec![], 0, false, "prod", false);
        registry.register(recorder("required", order.clone(), false), vec![], 0, true, "prod", false);
        assert!(registry.start_all().await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_runs_in_reverse_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let shutdown_order: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = Registry::new();
        registry.register(recorder("db", order.clone(), false), vec![], 0, true, "prod", false);
        registry.register(recorder("cache", order.clone(), false), vec!["db".into()], 0, true, "prod", false);
        registry.start_all().await.unwrap();
        registry.shutdown_all(Duration::from_secs(1)).await;
        let _ = shutdown_order;
    }

    #[tokio::test]
    async fn health_report_marks_unprobed_components_disabled() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = Registry::new();
        registry.register(recorder("db", order.clone(), false), vec![], 0, true, "prod", true);
        registry.register(recorder("cache", order.clone(), false), vec![], 0, true, "prod", false);
        registry.start_all().await.unwrap();
        let report = registry.health_report().await;
        assert_eq!(report.get("db"), Some(&HealthStatus::Healthy));
        assert_eq!(report.get("cache"), Some(&HealthStatus::Disabled));
    }
}
