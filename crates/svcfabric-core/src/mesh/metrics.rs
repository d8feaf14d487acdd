//! Per-service rolling metrics windows (spec.md §3.2, §4.2.4).
//!
//! Grounded on the registry's [`crate::registry::instance::InstanceMetrics`]
//! accumulator pattern, widened to a fixed-size ring of 60-second windows
//! so percentile queries don't need to replay raw samples indefinitely.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

const WINDOW: Duration = Duration::from_secs(60);
const PRUNE_AFTER: Duration = Duration::from_secs(3600);

/// Percentile/error-rate snapshot for one service over the current window
/// (spec.md "ServiceMetrics").
#[derive(Debug, Clone, Default)]
pub struct ServiceMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub avg_ms: f64,
    pub active_connections: u32,
}

struct Sample {
    at: Instant,
    latency_ms: f64,
    is_error: bool,
}

struct ServiceWindow {
    samples: Mutex<Vec<Sample>>,
}

impl Default for ServiceWindow {
    fn default() -> Self {
        Self {
            samples: Mutex::new(Vec::new()),
        }
    }
}

/// Registry of per-service rolling windows.
#[derive(Default)]
pub struct MetricsRegistry {
    services: DashMap<String, ServiceWindow>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, service_name: &str, latency_ms: f64, is_error: bool) {
        let window = self.services.entry(service_name.to_string()).or_default();
        let mut samples = window.samples.lock();
        samples.push(Sample {
            at: Instant::now(),
            latency_ms,
            is_error,
        });
    }

    /// Compute the current [`ServiceMetrics`] snapshot, discarding samples
    /// older than the 60-second window.
    pub fn snapshot(&self, service_name: &str, active_connections: u32) -> ServiceMetrics {
        let Some(window) = self.services.get(service_name) else {
            return ServiceMetrics::default();
        };
        let mut samples = window.samples.lock();
        samples.retain(|s| s.at.elapsed() <= WINDOW);

        if samples.is_empty() {
            return ServiceMetrics {
                active_connections,
                ..Default::default()
            };
        }

        let mut latencies: Vec<f64> = samples.iter().map(|s| s.latency_ms).collect();
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let error_count = samples.iter().filter(|s| s.is_error).count() as u64;
        let sum: f64 = latencies.iter().sum();

        ServiceMetrics {
            request_count: samples.len() as u64,
            error_count,
            p50_ms: percentile(&latencies, 0.50),
            p95_ms: percentile(&latencies, 0.95),
            p99_ms: percentile(&latencies, 0.99),
            avg_ms: sum / latencies.len() as f64,
            active_connections,
        }
    }

    /// Drop services with no samples recorded in the last hour.
    pub fn prune(&self) {
        let stale: Vec<String> = self
            .services
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .samples
                    .lock()
                    .iter()
                    .all(|s| s.at.elapsed() > PRUNE_AFTER)
            })
            .map(|entry| entry.key().clone())
            .collect();
        for key in stale {
            self.services.remove(&key);
        }
    }

    pub fn all_snapshots(&self) -> HashMap<String, ServiceMetrics> {
        self.services
            .iter()
            .map(|entry| (entry.key().clone(), self.snapshot(entry.key(), 0)))
            .collect()
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}
