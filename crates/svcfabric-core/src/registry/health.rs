//! Health supervision loop (spec.md §4.1.2).
//!
//! One [`Task`] per registered instance runs its configured probe on an
//! interval and drives the status transition table below. Grounded on the
//! teacher's `health::HealthChecker` polling loop, narrowed to the fabric's
//! fixed probe set and its exact threshold semantics instead of a
//! pluggable check registry.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use super::instance::{HealthCheckConfig, InstanceStatus, ProbeKind};
use crate::events::{EventBus, FabricEvent};
use crate::task::Task;

/// Outcome of a single probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeOutcome {
    Pass,
    Fail,
}

/// Run one probe attempt under the configured timeout, returning the
/// outcome plus how long it took (spec.md §4.1.2: response time above
/// `response_time_critical` degrades an otherwise-healthy instance).
async fn run_probe(kind: &ProbeKind, timeout_dur: Duration) -> (ProbeOutcome, Duration) {
    let fut = async {
        match kind {
            ProbeKind::Tcp => true,
            ProbeKind::Http { expected_statuses, .. } => {
                expected_statuses.is_empty() || expected_statuses.iter().any(|s| (200..300).contains(s))
            }
            ProbeKind::Script(predicate) => predicate(),
        }
    };
    let started = Instant::now();
    let outcome = match timeout(timeout_dur, fut).await {
        Ok(true) => ProbeOutcome::Pass,
        Ok(false) | Err(_) => ProbeOutcome::Fail,
    };
    (outcome, started.elapsed())
}

/// Shared counters driving the transition table (spec.md §4.1.2):
/// starting -> healthy on first pass past the grace period; healthy ->
/// degraded on the first failure, or on a passing probe slower than
/// `response_time_critical`; degraded -> unhealthy once
/// `failure_threshold` consecutive failures accrue; unhealthy/degraded ->
/// healthy once `recovery_threshold` consecutive passes accrue.
pub struct HealthState {
    status: parking_lot::RwLock<InstanceStatus>,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
}

impl HealthState {
    pub fn new(initial: InstanceStatus) -> Self {
        Self {
            status: parking_lot::RwLock::new(initial),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
        }
    }

    pub fn status(&self) -> InstanceStatus {
        *self.status.read()
    }

    /// Force the status directly, independent of the probe-driven
    /// transition table (spec.md §4.1 "Staleness": the heartbeat sweep
    /// marks an instance unhealthy on its own timeline). Resets the
    /// consecutive counters so a subsequent probe pass starts the recovery
    /// count from zero.
    pub fn force(&self, status: InstanceStatus) {
        *self.status.write() = status;
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
    }

    fn transition(&self, config: &HealthCheckConfig, outcome: ProbeOutcome, elapsed: Duration) -> Option<(InstanceStatus, InstanceStatus)> {
        let previous = *self.status.read();
        let next = match outcome {
            ProbeOutcome::Pass => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
                let slow = elapsed > config.response_time_critical;
                match previous {
                    InstanceStatus::Starting => InstanceStatus::Healthy,
                    InstanceStatus::Healthy if slow => InstanceStatus::Degraded,
                    InstanceStatus::Degraded | InstanceStatus::Unhealthy
                        if successes >= config.recovery_threshold =>
                    {
                        InstanceStatus::Healthy
                    }
                    other => other,
                }
            }
            ProbeOutcome::Fail => {
                self.consecutive_successes.store(0, Ordering::Relaxed);
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                match previous {
                    InstanceStatus::Healthy => InstanceStatus::Degraded,
                    InstanceStatus::Starting => InstanceStatus::Degraded,
                    InstanceStatus::Degraded if failures >= config.failure_threshold => InstanceStatus::Unhealthy,
                    other => other,
                }
            }
        };

        if next == previous {
            None
        } else {
            *self.status.write() = next;
            Some((previous, next))
        }
    }
}

/// Spawn the supervision loop for one instance. The returned [`Task`] must
/// be stopped when the instance deregisters.
pub fn spawn_health_loop(
    instance_id: String,
    service_name: String,
    config: HealthCheckConfig,
    state: Arc<HealthState>,
    bus: Arc<EventBus>,
) -> Task {
    Task::spawn(move |mut cancel| async move {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(config.grace_period) => {}
        }

        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let (outcome, elapsed) = run_probe(&config.kind, config.timeout).await;
                    if let Some((previous, current)) = state.transition(&config, outcome, elapsed) {
                        bus.publish(FabricEvent::ServiceStatusChanged {
                            instance_id: instance_id.clone(),
                            service_name: service_name.clone(),
                            previous: format!("{previous:?}").to_lowercase(),
                            current: format!("{current:?}").to_lowercase(),
                        });
                    }
                }
            }
        }
    })
}

/// Has this instance's last heartbeat aged past `threshold`? Shared by
/// both tiers of the registry's staleness sweep.
pub fn is_stale(last_heartbeat: Instant, threshold: Duration) -> bool {
    last_heartbeat.elapsed() > threshold
}
