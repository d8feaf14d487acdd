//! Service Registry & Load-Balancing core (spec.md §4.1).
//!
//! Grounded on the teacher's `health::HealthChecker` + `di::Container`
//! combination: a `DashMap`-backed store of live entities, each with a
//! side-table of supervisory state (here, [`health::HealthState`] and a
//! [`Task`]), looked up by id on the hot path.

pub mod balancer;
pub mod health;
pub mod instance;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;

use crate::error::{FabricError, FabricResult};
use crate::events::{EventBus, FabricEvent};
use crate::task::Task;

pub use balancer::{LoadBalancer, SelectionContext, StickyConfig, Strategy};
pub use instance::{HealthCheckConfig, InstanceConfig, InstanceMetrics, InstanceStatus, Protocol, ServiceInstance};

struct RegisteredInstance {
    instance: parking_lot::RwLock<ServiceInstance>,
    health: Arc<health::HealthState>,
    last_heartbeat: parking_lot::Mutex<Instant>,
    health_task: Option<Task>,
}

/// Config for the registry's background staleness sweep (spec.md §4.1
/// "Staleness": the sweep marks an instance `unhealthy` once its
/// heartbeat goes silent past `unhealthy_after`, and deregisters it
/// outright past `deregister_after`).
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub staleness_sweep_interval: Duration,
    pub unhealthy_after: Duration,
    pub deregister_after: Duration,
    pub sticky: StickyConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            staleness_sweep_interval: Duration::from_secs(60),
            unhealthy_after: Duration::from_secs(180),
            deregister_after: Duration::from_secs(600),
            sticky: StickyConfig::default(),
        }
    }
}

/// Filter for [`Registry::discover`] (spec.md §4.1): every given field is
/// conjunctive, and within `tags` every listed tag must be present on the
/// instance.
#[derive(Debug, Clone)]
pub struct DiscoveryQuery {
    pub service_name: String,
    pub version: Option<String>,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub status: Option<Vec<InstanceStatus>>,
    pub exclude_unhealthy: bool,
    pub limit: Option<usize>,
}

impl DiscoveryQuery {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            version: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
            status: None,
            exclude_unhealthy: false,
            limit: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_status(mut self, status: impl IntoIterator<Item = InstanceStatus>) -> Self {
        self.status = Some(status.into_iter().collect());
        self
    }

    pub fn excluding_unhealthy(mut self) -> Self {
        self.exclude_unhealthy = true;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// The Service Registry & Load-Balancing core.
pub struct Registry {
    config: RegistryConfig,
    instances: DashMap<String, RegisteredInstance>,
    by_service: DashMap<String, Vec<String>>,
    balancer: LoadBalancer,
    bus: Arc<EventBus>,
    nonce: AtomicU64,
    sweep_task: parking_lot::Mutex<Option<Task>>,
}

impl Registry {
    pub fn new(config: RegistryConfig, bus: Arc<EventBus>) -> Arc<Self> {
        let registry = Arc::new(Self {
            config,
            instances: DashMap::new(),
            by_service: DashMap::new(),
            balancer: LoadBalancer::new(),
            bus,
            nonce: AtomicU64::new(0),
            sweep_task: parking_lot::Mutex::new(None),
        });
        registry.clone().spawn_staleness_sweep();
        registry
    }

    fn spawn_staleness_sweep(self: Arc<Self>) {
        let interval = self.config.staleness_sweep_interval;
        let unhealthy_after = self.config.unhealthy_after;
        let deregister_after = self.config.deregister_after;
        let registry = self.clone();
        let task = Task::spawn_interval(interval, move || {
            let registry = registry.clone();
            async move { registry.sweep_stale(unhealthy_after, deregister_after) }
        });
        *self.sweep_task.lock() = Some(task);
    }

    /// Two-tier staleness sweep (spec.md §4.1 "Staleness"). An instance
    /// silent past `unhealthy_after` is marked unhealthy in place so it
    /// drops out of `select`'s candidate set but stays discoverable; one
    /// silent past `deregister_after` is removed outright. Marking happens
    /// before deregistration is considered so the two thresholds compose
    /// (an instance can only be deregistered after first going unhealthy).
    fn sweep_stale(&self, unhealthy_after: Duration, deregister_after: Duration) {
        let mut to_mark_unhealthy = Vec::new();
        let mut to_deregister = Vec::new();

        for entry in self.instances.iter() {
            let last_heartbeat = *entry.value().last_heartbeat.lock();
            if health::is_stale(last_heartbeat, deregister_after) {
                to_deregister.push(entry.key().clone());
            } else if health::is_stale(last_heartbeat, unhealthy_after) {
                to_mark_unhealthy.push(entry.key().clone());
            }
        }

        for id in to_mark_unhealthy {
            let Some(entry) = self.instances.get(&id) else { continue };
            let previous = entry.health.status();
            if previous == InstanceStatus::Unhealthy {
                continue;
            }
            entry.health.force(InstanceStatus::Unhealthy);
            let service_name = {
                let mut instance = entry.instance.write();
                instance.status = InstanceStatus::Unhealthy;
                instance.service_name.clone()
            };
            drop(entry);
            self.bus.publish(FabricEvent::ServiceStatusChanged {
                instance_id: id,
                service_name,
                previous: format!("{previous:?}").to_lowercase(),
                current: "unhealthy".to_string(),
            });
        }

        for id in to_deregister {
            if let Some((_, removed)) = self.instances.remove(&id) {
                if let Some(task) = removed.health_task {
                    drop(task);
                }
                let service_name = removed.instance.read().service_name.clone();
                self.remove_from_index(&service_name, &id);
                self.bus.publish(FabricEvent::ServiceDeregistered {
                    instance_id: id,
                    service_name,
                });
            }
        }
    }

    fn remove_from_index(&self, service_name: &str, instance_id: &str) {
        if let Some(mut ids) = self.by_service.get_mut(service_name) {
            ids.retain(|id| id != instance_id);
        }
        self.rebuild_ring(service_name);
    }

    fn rebuild_ring(&self, service_name: &str) {
        let instances = self.list_instances(service_name);
        self.balancer.rebuild_ring(service_name, &instances);
    }

    /// Register a new instance (spec.md §4.1). Duplicate (service, host,
    /// port) registrations are rejected; deregister first to replace one.
    pub fn register(self: &Arc<Self>, config: InstanceConfig) -> FabricResult<String> {
        let already_exists = self
            .by_service
            .get(&config.service_name)
            .map(|ids| {
                ids.iter().any(|id| {
                    self.instances
                        .get(id)
                        .map(|i| i.instance.read().matches_address(&config.service_name, &config.host, config.port))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false);

        if already_exists {
            return Err(FabricError::DuplicateInstance {
                service: config.service_name,
                host: config.host,
                port: config.port,
            });
        }

        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let instance_id = ServiceInstance::derive_id(&config.service_name, &config.host, config.port, nonce);
        let now = SystemTime::now();

        let instance = ServiceInstance {
            instance_id: instance_id.clone(),
            service_name: config.service_name.clone(),
            host: config.host,
            port: config.port,
            protocol: config.protocol,
            version: config.version,
            tags: config.tags,
            metadata: config.metadata,
            weight: config.weight,
            status: InstanceStatus::Starting,
            registered_at: now,
            last_heartbeat: now,
            connections: 0,
            metrics: InstanceMetrics::default(),
        };

        let health_state = Arc::new(health::HealthState::new(InstanceStatus::Starting));
        let health_task = if config.health_check.enabled {
            Some(health::spawn_health_loop(
                instance_id.clone(),
                config.service_name.clone(),
                config.health_check,
                health_state.clone(),
                self.bus.clone(),
            ))
        } else {
            None
        };

        self.instances.insert(
            instance_id.clone(),
            RegisteredInstance {
                instance: parking_lot::RwLock::new(instance),
                health: health_state,
                last_heartbeat: parking_lot::Mutex::new(Instant::now()),
                health_task,
            },
        );

        self.by_service
            .entry(config.service_name.clone())
            .or_default()
            .push(instance_id.clone());

        self.rebuild_ring(&config.service_name);

        self.bus.publish(FabricEvent::ServiceRegistered {
            instance_id: instance_id.clone(),
            service_name: config.service_name,
        });

        Ok(instance_id)
    }

    /// Remove an instance, stopping its health supervision.
    pub fn deregister(&self, instance_id: &str) -> FabricResult<()> {
        let (_, removed) = self
            .instances
            .remove(instance_id)
            .ok_or_else(|| FabricError::InstanceNotFound(instance_id.to_string()))?;

        let service_name = removed.instance.read().service_name.clone();
        drop(removed.health_task);
        self.remove_from_index(&service_name, instance_id);

        self.bus.publish(FabricEvent::ServiceDeregistered {
            instance_id: instance_id.to_string(),
            service_name,
        });
        Ok(())
    }

    /// Refresh liveness for an instance (spec.md §4.1).
    pub fn heartbeat(&self, instance_id: &str) -> FabricResult<()> {
        let entry = self
            .instances
            .get(instance_id)
            .ok_or_else(|| FabricError::InstanceNotFound(instance_id.to_string()))?;

        *entry.last_heartbeat.lock() = Instant::now();
        entry.instance.write().last_heartbeat = SystemTime::now();

        let service_name = entry.instance.read().service_name.clone();
        self.bus.publish(FabricEvent::HeartbeatReceived {
            instance_id: instance_id.to_string(),
            service_name,
        });
        Ok(())
    }

    /// List every instance for a service, merging current health status.
    pub fn list_instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        let Some(ids) = self.by_service.get(service_name) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.instances.get(id))
            .map(|entry| {
                let mut snapshot = entry.instance.read().clone();
                snapshot.status = entry.health.status();
                snapshot
            })
            .collect()
    }

    /// Discover instances matching `query` (spec.md §4.1: "discover
    /// returns the current membership view", filtered by `service_name`,
    /// `version`, `tags` (conjunctive), `metadata` (exact match),
    /// `status ∈ set`, `exclude_unhealthy`, and `limit`).
    pub fn discover(&self, query: &DiscoveryQuery) -> FabricResult<Vec<ServiceInstance>> {
        let instances = self.list_instances(&query.service_name);
        if instances.is_empty() {
            return Err(FabricError::ServiceNotFound(query.service_name.clone()));
        }

        let mut matched: Vec<ServiceInstance> = instances
            .into_iter()
            .filter(|i| match &query.version {
                Some(v) => &i.version == v,
                None => true,
            })
            .filter(|i| query.tags.iter().all(|t| i.tags.contains(t)))
            .filter(|i| query.metadata.iter().all(|(k, v)| i.metadata.get(k) == Some(v)))
            .filter(|i| match &query.status {
                Some(set) => set.contains(&i.status),
                None => true,
            })
            .filter(|i| !query.exclude_unhealthy || matches!(i.status, InstanceStatus::Healthy | InstanceStatus::Degraded))
            .collect();

        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    /// Select an instance per the configured strategy and reserve a
    /// connection slot. Callers must pair this with [`Registry::release`].
    pub fn select(
        &self,
        service_name: &str,
        strategy: Strategy,
        ctx: &SelectionContext,
    ) -> FabricResult<ServiceInstance> {
        let query = DiscoveryQuery::new(service_name).with_status([InstanceStatus::Healthy, InstanceStatus::Degraded]);
        let candidates = self.discover(&query)?;
        if candidates.is_empty() {
            return Err(FabricError::NoHealthyInstance(service_name.to_string()));
        }

        let chosen = self
            .balancer
            .select(service_name, strategy, &candidates, ctx, Some(&self.config.sticky))
            .ok_or_else(|| FabricError::NoHealthyInstance(service_name.to_string()))?
            .clone();

        if let Some(entry) = self.instances.get(&chosen.instance_id) {
            entry.instance.write().connections += 1;
        }

        Ok(chosen)
    }

    /// Release a connection slot reserved by [`Registry::select`]
    /// (Open Question resolution: decrement on explicit release, clamped
    /// at zero so a duplicate release cannot underflow).
    pub fn release(&self, instance_id: &str) -> FabricResult<()> {
        let entry = self
            .instances
            .get(instance_id)
            .ok_or_else(|| FabricError::InstanceNotFound(instance_id.to_string()))?;
        let mut instance = entry.instance.write();
        instance.connections = instance.connections.saturating_sub(1);
        Ok(())
    }

    /// Snapshot metrics for one instance (for a metrics-pull API).
    pub fn metrics(&self, instance_id: &str) -> FabricResult<InstanceMetrics> {
        self.instances
            .get(instance_id)
            .map(|e| e.instance.read().metrics.clone())
            .ok_or_else(|| FabricError::InstanceNotFound(instance_id.to_string()))
    }

    /// Record a request outcome against an instance's rolling metrics.
    pub fn record_request(&self, instance_id: &str, response_time_ms: f64, is_error: bool) -> FabricResult<()> {
        let entry = self
            .instances
            .get(instance_id)
            .ok_or_else(|| FabricError::InstanceNotFound(instance_id.to_string()))?;
        let mut instance = entry.instance.write();
        let metrics = &mut instance.metrics;
        let n = metrics.request_count as f64;
        metrics.avg_response_time_ms = (metrics.avg_response_time_ms * n + response_time_ms) / (n + 1.0);
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }
        Ok(())
    }

    /// Stop all background supervision loops (composition-root shutdown).
    pub async fn shutdown(&self) {
        if let Some(task) = self.sweep_task.lock().take() {
            task.stop().await;
        }
    }

    #[cfg(test)]
    fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_bus() -> Arc<EventBus> {
        Arc::new(EventBus::new())
    }

    fn no_health_check(mut config: InstanceConfig) -> InstanceConfig {
        config.health_check.enabled = false;
        config
    }

    #[tokio::test]
    async fn register_then_discover_round_trips() {
        let registry = Registry::new(RegistryConfig::default(), test_bus());
        let config = no_health_check(InstanceConfig::new("api", "10.0.0.1", 8080));
        let id = registry.register(config).unwrap();

        let discovered = registry.discover(&DiscoveryQuery::new("api")).unwrap();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].instance_id, id);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = Registry::new(RegistryConfig::default(), test_bus());
        registry
            .register(no_health_check(InstanceConfig::new("api", "10.0.0.1", 8080)))
            .unwrap();
        let result = registry.register(no_health_check(InstanceConfig::new("api", "10.0.0.1", 8080)));
        assert!(matches!(result, Err(FabricError::DuplicateInstance { .. })));
    }

    #[tokio::test]
    async fn deregister_removes_instance() {
        let registry = Registry::new(RegistryConfig::default(), test_bus());
        let id = registry
            .register(no_health_check(InstanceConfig::new("api", "10.0.0.1", 8080)))
            .unwrap();
        registry.deregister(&id).unwrap();
        assert!(registry.discover(&DiscoveryQuery::new("api")).is_err());
    }

    #[tokio::test]
    async fn select_increments_and_release_decrements_connections() {
        let registry = Registry::new(RegistryConfig::default(), test_bus());
        let id = registry
            .register(no_health_check(InstanceConfig::new("api", "10.0.0.1", 8080)))
            .unwrap();

        // Starting instances aren't selectable until healthy; force it.
        registry.heartbeat(&id).unwrap();
        if let Some(entry) = registry.instances.get(&id) {
            entry.health.force(InstanceStatus::Healthy);
        }

        let ctx = SelectionContext::default();
        let picked = registry.select("api", Strategy::RoundRobin, &ctx).unwrap();
        assert_eq!(registry.instances.get(&picked.instance_id).unwrap().instance.read().connections, 1);

        registry.release(&picked.instance_id).unwrap();
        assert_eq!(registry.instances.get(&picked.instance_id).unwrap().instance.read().connections, 0);
    }

    #[tokio::test]
    async fn discover_filters_by_version_tags_metadata_and_limit() {
        let registry = Registry::new(RegistryConfig::default(), test_bus());
        let mut canary = no_health_check(InstanceConfig::new("api", "10.0.0.1", 8080));
        canary.version = "2.0.0".to_string();
        canary.tags = vec!["canary".to_string()];
        canary.metadata.insert("region".to_string(), "us".to_string());
        registry.register(canary).unwrap();

        let mut stable = no_health_check(InstanceConfig::new("api", "10.0.0.2", 8080));
        stable.version = "1.0.0".to_string();
        stable.tags = vec!["stable".to_string()];
        stable.metadata.insert("region".to_string(), "eu".to_string());
        registry.register(stable).unwrap();

        let by_version = registry.discover(&DiscoveryQuery::new("api").with_version("2.0.0")).unwrap();
        assert_eq!(by_version.len(), 1);
        assert_eq!(by_version[0].version, "2.0.0");

        let by_tag = registry.discover(&DiscoveryQuery::new("api").with_tags(["stable"])).unwrap();
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].version, "1.0.0");

        let by_metadata = registry.discover(&DiscoveryQuery::new("api").with_metadata("region", "us")).unwrap();
        assert_eq!(by_metadata.len(), 1);
        assert_eq!(by_metadata[0].version, "2.0.0");

        let limited = registry.discover(&DiscoveryQuery::new("api").with_limit(1)).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn sweep_stale_marks_unhealthy_before_deregistering() {
        let registry = Registry::new(RegistryConfig::default(), test_bus());
        let id = registry
            .register(no_health_check(InstanceConfig::new("api", "10.0.0.1", 8080)))
            .unwrap();
        if let Some(entry) = registry.instances.get(&id) {
            entry.health.force(InstanceStatus::Healthy);
            *entry.last_heartbeat.lock() = Instant::now() - Duration::from_secs(200);
        }

        registry.sweep_stale(Duration::from_secs(180), Duration::from_secs(600));
        assert_eq!(registry.instances.get(&id).unwrap().health.status(), InstanceStatus::Unhealthy);
        assert_eq!(registry.instance_count(), 1);

        if let Some(entry) = registry.instances.get(&id) {
            *entry.last_heartbeat.lock() = Instant::now() - Duration::from_secs(700);
        }
        registry.sweep_stale(Duration::from_secs(180), Duration::from_secs(600));
        assert_eq!(registry.instance_count(), 0);
    }
}
