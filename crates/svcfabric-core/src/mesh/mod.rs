//! Mesh Control Plane (spec.md §4.2).
//!
//! `MeshController::call` is the six-step pipeline from spec.md §4.2's
//! public contract: trace, policy, select, breaker, invoke+retry, release.
//! Grounded on the teacher's `application::resilience` orchestration layer,
//! which composes retry/circuit-breaker/tracing the same way around a
//! caller-supplied operation.

pub mod circuit_breaker;
pub mod metrics;
pub mod policy;
pub mod retry;
pub mod trace;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::{FabricError, FabricResult};
use crate::events::{EventBus, FabricEvent};
use crate::registry::{Registry, SelectionContext, ServiceInstance, Strategy};

pub use circuit_breaker::CircuitBreaker;
pub use metrics::{MetricsRegistry, ServiceMetrics};
pub use policy::{Match, PathMatch, RequestContext, RouteAction, Rule, TrafficPolicy};
pub use retry::RetryPolicy;
pub use trace::{Span, SpanStatus, TraceStore};

/// A request dispatched through the mesh.
#[derive(Debug, Clone, Default)]
pub struct CallRequest {
    pub path: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// The response returned by an [`Invoker`].
#[derive(Debug, Clone)]
pub struct CallResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Per-call options layered on the mesh's default behavior.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub strategy: Strategy,
    pub selection: SelectionContext,
    pub retry: RetryPolicy,
    pub trace_id: Option<String>,
    pub parent_span_id: Option<String>,
}

/// Performs the actual network call to a selected instance. Left abstract
/// per spec.md §1 (single-process model; transport is a host concern) so
/// hosts can plug in HTTP/gRPC/in-process dispatch.
#[async_trait::async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, instance: &ServiceInstance, request: &CallRequest) -> FabricResult<CallResponse>;
}

/// The Mesh Control Plane.
pub struct MeshController {
    registry: Arc<Registry>,
    policies: RwLock<Vec<TrafficPolicy>>,
    breakers: DashMap<String, CircuitBreaker>,
    metrics: MetricsRegistry,
    traces: TraceStore,
    bus: Arc<EventBus>,
    invoker: Arc<dyn Invoker>,
}

impl MeshController {
    pub fn new(registry: Arc<Registry>, bus: Arc<EventBus>, invoker: Arc<dyn Invoker>) -> Self {
        Self {
            registry,
            policies: RwLock::new(Vec::new()),
            breakers: DashMap::new(),
            metrics: MetricsRegistry::new(),
            traces: TraceStore::new(),
            bus,
            invoker,
        }
    }

    pub fn set_policies(&self, policies: Vec<TrafficPolicy>) {
        *self.policies.write() = policies;
    }

    pub fn metrics_for(&self, service_name: &str, active_connections: u32) -> ServiceMetrics {
        self.metrics.snapshot(service_name, active_connections)
    }

    pub fn prune(&self) {
        self.traces.prune();
        self.metrics.prune();
    }

    /// Execute the mesh pipeline for one logical call (spec.md §4.2).
    pub async fn call(
        &self,
        service_name: &str,
        mut request: CallRequest,
        options: CallOptions,
    ) -> FabricResult<CallResponse> {
        let mut span = self.traces.begin(options.trace_id.clone(), format!("call:{service_name}"), options.parent_span_id.clone());
        request.headers.insert("X-Trace-Id".to_string(), span.trace_id.clone());
        request.headers.insert("X-Span-Id".to_string(), span.span_id.clone());
        if let Some(parent) = &options.parent_span_id {
            request.headers.insert("X-Parent-Span-Id".to_string(), parent.clone());
        }

        let effective_service = self.resolve_destination(service_name, &request);

        let instance = match self.registry.select(&effective_service, options.strategy, &options.selection) {
            Ok(instance) => instance,
            Err(err) => {
                span.log(format!("selection failed: {err}"));
                span.finish(SpanStatus::Error);
                self.traces.finish(span);
                return Err(err);
            }
        };

        let breaker = self.breakers.entry(instance.instance_id.clone()).or_default();
        if let Err(err) = breaker.check(&instance.instance_id) {
            drop(breaker);
            let _ = self.registry.release(&instance.instance_id);
            span.log(format!("circuit open: {err}"));
            span.finish(SpanStatus::Error);
            self.traces.finish(span);
            return Err(err);
        }
        drop(breaker);

        let result = self.invoke_with_retry(&instance, &request, &options.retry, &mut span).await;

        let _ = self.registry.release(&instance.instance_id);

        let breaker = self.breakers.entry(instance.instance_id.clone()).or_default();
        match &result {
            Ok(_) => breaker.record_success(),
            Err(_) => breaker.record_failure(),
        }
        drop(breaker);

        match &result {
            Ok(_) => span.finish(SpanStatus::Ok),
            Err(FabricError::Timeout(_)) => span.finish(SpanStatus::Timeout),
            Err(_) => span.finish(SpanStatus::Error),
        }
        self.traces.finish(span);

        self.bus.publish(FabricEvent::TraceCompleted {
            trace_id: request.headers.get("X-Trace-Id").cloned().unwrap_or_default(),
            status: result.as_ref().map(|_| "ok").unwrap_or("error").to_string(),
        });

        result
    }

    async fn invoke_with_retry(
        &self,
        instance: &ServiceInstance,
        request: &CallRequest,
        retry: &RetryPolicy,
        span: &mut Span,
    ) -> FabricResult<CallResponse> {
        let mut attempt = 1;
        loop {
            let started = std::time::Instant::now();
            let outcome = self.invoker.invoke(instance, request).await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

            match outcome {
                Ok(response) => {
                    self.metrics.record(&instance.service_name, elapsed_ms, false);
                    return Ok(response);
                }
                Err(err) => {
                    self.metrics.record(&instance.service_name, elapsed_ms, true);
                    let status = None;
                    if attempt < retry.max_attempts && retry.is_retryable(&err, status) {
                        span.log(format!("attempt {attempt} failed: {err}, retrying"));
                        tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    span.log(format!("attempt {attempt} failed permanently: {err}"));
                    return Err(err);
                }
            }
        }
    }

    fn resolve_destination(&self, service_name: &str, request: &CallRequest) -> String {
        let policies = self.policies.read();
        if policies.is_empty() {
            return service_name.to_string();
        }
        let ctx = RequestContext {
            path: request.path.clone(),
            method: request.method.clone(),
            headers: request.headers.clone(),
            source_service: None,
            source_labels: HashMap::new(),
        };
        policy::evaluate(&policies, service_name, &ctx)
            .map(|action| action.destination_service.clone())
            .unwrap_or_else(|| service_name.to_string())
    }
}
