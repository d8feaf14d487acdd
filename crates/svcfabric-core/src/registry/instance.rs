//! Service instance entity (spec.md §3.1).

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Wire protocol an instance speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Grpc,
    Tcp,
    Udp,
}

/// Lifecycle state of a registered instance (spec.md §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Healthy,
    Degraded,
    Unhealthy,
    Draining,
    Stopped,
}

/// How an instance's health is supervised (spec.md §4.1.2).
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub kind: ProbeKind,
    /// Delay before the first probe.
    pub grace_period: Duration,
    /// Interval between probes once started.
    pub interval: Duration,
    /// Per-probe timeout.
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
    pub response_time_critical: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: ProbeKind::Tcp,
            grace_period: Duration::from_secs(2),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(3),
            failure_threshold: 3,
            recovery_threshold: 2,
            response_time_critical: Duration::from_secs(1),
        }
    }
}

/// The kind of probe run against an instance.
#[derive(Clone)]
pub enum ProbeKind {
    Tcp,
    Http {
        method: String,
        headers: HashMap<String, String>,
        expected_statuses: Vec<u16>,
        expected_body: Option<String>,
    },
    /// Caller-supplied predicate, run with the configured timeout.
    Script(std::sync::Arc<dyn Fn() -> bool + Send + Sync>),
}

impl std::fmt::Debug for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeKind::Tcp => write!(f, "Tcp"),
            ProbeKind::Http { method, .. } => write!(f, "Http({method})"),
            ProbeKind::Script(_) => write!(f, "Script(..)"),
        }
    }
}

/// Point-in-time metrics snapshot carried on a [`ServiceInstance`]
/// (spec.md §3.1).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct InstanceMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub avg_response_time_ms: f64,
    pub uptime_seconds: u64,
    pub cpu_usage_percent: f32,
    pub memory_usage_bytes: u64,
}

/// Config supplied to [`crate::registry::Registry::register`].
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub version: String,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub weight: u32,
    pub health_check: HealthCheckConfig,
}

impl InstanceConfig {
    pub fn new(service_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            host: host.into(),
            port,
            protocol: Protocol::Http,
            version: "0.0.0".to_string(),
            tags: Vec::new(),
            metadata: HashMap::new(),
            weight: 1,
            health_check: HealthCheckConfig::default(),
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_health_check(mut self, config: HealthCheckConfig) -> Self {
        self.health_check = config;
        self
    }
}

/// One running replica of a logical service (spec.md §3.1).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServiceInstance {
    pub instance_id: String,
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub version: String,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub weight: u32,
    pub status: InstanceStatus,
    pub registered_at: SystemTime,
    pub last_heartbeat: SystemTime,
    pub connections: u32,
    pub metrics: InstanceMetrics,
}

impl ServiceInstance {
    /// Derive a stable id from name+host+port+creation-nonce (spec.md
    /// §3.1). The nonce disambiguates two instances registered at the same
    /// address in quick succession (e.g. a restart racing a stale
    /// deregister).
    pub fn derive_id(service_name: &str, host: &str, port: u16, nonce: u64) -> String {
        format!("{service_name}@{host}:{port}#{nonce}")
    }

    pub fn matches_address(&self, service_name: &str, host: &str, port: u16) -> bool {
        self.service_name == service_name && self.host == host && self.port == port
    }
}
