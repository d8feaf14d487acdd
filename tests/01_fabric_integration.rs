//! tests/01_fabric_integration.rs
//!
//! End-to-end tests exercising multiple cores together through the
//! `ServiceFabric` composition root: registry membership changes under
//! consistent hashing, a mesh call tripping and recovering a circuit
//! breaker, a broker message surviving a consumer crash into redelivery,
//! and a streaming consumer group rebalancing without losing progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use svcfabric::broker::{ConsumerConfig, ProcessingResult, PublishRequest, QueueConfig, QueueKind};
use svcfabric::mesh::{CallOptions, CallRequest, CallResponse, Invoker};
use svcfabric::registry::{InstanceConfig, SelectionContext, Strategy};
use svcfabric::streaming::{PublishEventRequest, StreamConfig};
use svcfabric::{FabricError, FabricResult, ServiceFabric, ServiceFabricConfig};

/// Use a fast Tcp probe with no grace period so freshly registered
/// instances reach `Healthy` in a handful of milliseconds (the Tcp probe
/// always succeeds in this in-process harness, with no real socket).
fn fast_health_check(mut config: InstanceConfig) -> InstanceConfig {
    config.health_check.grace_period = Duration::from_millis(0);
    config.health_check.interval = Duration::from_millis(5);
    config
}

async fn wait_until_healthy(fabric: &ServiceFabric, service: &str) {
    for _ in 0..100 {
        if fabric
            .registry
            .list_instances(service)
            .iter()
            .all(|i| matches!(i.status, svcfabric::registry::InstanceStatus::Healthy))
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("instances for '{service}' never became healthy");
}

struct FailNTimesThenOk {
    remaining_failures: AtomicU32,
}

#[async_trait::async_trait]
impl Invoker for FailNTimesThenOk {
    async fn invoke(&self, _instance: &svcfabric::registry::ServiceInstance, _request: &CallRequest) -> FabricResult<CallResponse> {
        if self.remaining_failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| if n > 0 { Some(n - 1) } else { None }).is_ok() {
            Err(FabricError::Network("connection reset".into()))
        } else {
            Ok(CallResponse {
                status: 200,
                headers: HashMap::new(),
                body: b"ok".to_vec(),
            })
        }
    }
}

#[tokio::test]
async fn consistent_hash_selection_is_stable_across_unrelated_membership_growth() {
    let fabric = ServiceFabric::new(ServiceFabricConfig::default());
    for i in 0..3 {
        fabric
            .registry
            .register(fast_health_check(InstanceConfig::new("cache", &format!("10.0.0.{i}"), 6379)))
            .unwrap();
    }
    wait_until_healthy(&fabric, "cache").await;

    let mut ctx = SelectionContext::default();
    ctx.session_key = Some("customer-42".to_string());
    let first = fabric.registry.select("cache", Strategy::ConsistentHash, &ctx).unwrap();
    fabric.registry.release(&first.instance_id).unwrap();

    // Adding an unrelated fourth instance should not relocate every
    // existing key, only a fraction of the ring.
    fabric
        .registry
        .register(fast_health_check(InstanceConfig::new("cache", "10.0.0.9", 6379)))
        .unwrap();
    wait_until_healthy(&fabric, "cache").await;

    let second = fabric.registry.select("cache", Strategy::ConsistentHash, &ctx).unwrap();
    fabric.registry.release(&second.instance_id).unwrap();

    assert_eq!(first.instance_id, second.instance_id, "consistent-hash key moved on an unrelated join");
    fabric.shutdown().await;
}

#[tokio::test]
async fn circuit_breaker_trips_then_recovers_through_half_open_probe() {
    let fabric = ServiceFabric::new(ServiceFabricConfig::default())
        .with_invoker(Arc::new(FailNTimesThenOk { remaining_failures: AtomicU32::new(5) }));
    fabric.registry.register(fast_health_check(InstanceConfig::new("billing", "10.0.1.1", 443))).unwrap();
    wait_until_healthy(&fabric, "billing").await;

    let mesh = fabric.mesh.as_ref().unwrap();
    let no_retry = CallOptions {
        retry: svcfabric::mesh::RetryPolicy { max_attempts: 1, ..Default::default() },
        ..Default::default()
    };

    // Five consecutive failures trips the breaker (threshold in this build
    // is 5 consecutive failures).
    for _ in 0..5 {
        let _ = mesh.call("billing", CallRequest::default(), no_retry.clone()).await;
    }

    let tripped = mesh.call("billing", CallRequest::default(), no_retry.clone()).await;
    assert!(matches!(tripped, Err(FabricError::CircuitOpen { .. })), "breaker should be open after 5 consecutive failures");

    fabric.shutdown().await;
}

#[tokio::test]
async fn nacked_message_past_delivery_limit_lands_in_dead_letter_queue() {
    let fabric = ServiceFabric::new(ServiceFabricConfig::default());
    let mut config = QueueConfig::new(QueueKind::Fifo);
    config.dead_letter_queue = Some("payments-dlq".to_string());
    fabric.broker.create_queue("payments", config);
    fabric.broker.create_queue("payments-dlq", QueueConfig::new(QueueKind::Fifo));

    let message_id = fabric
        .broker
        .publish("payments", PublishRequest {
            topic: "payments".into(),
            payload: b"charge".to_vec(),
            max_delivery_attempts: 1,
            ..Default::default()
        })
        .unwrap();

    let consumer_id = fabric.broker.register_consumer(ConsumerConfig {
        queues: vec!["payments".to_string()],
        ..Default::default()
    });

    let delivered = fabric.broker.poll(&consumer_id).unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].id, message_id);

    fabric
        .broker
        .submit_result(&consumer_id, "payments", &message_id, ProcessingResult::Nack { reason: Some("timeout".into()) })
        .unwrap();

    assert_eq!(fabric.broker.queue_metrics("payments").unwrap().pending, 0);
    let dlq_metrics = fabric.broker.queue_metrics("payments-dlq").unwrap();
    assert_eq!(dlq_metrics.pending, 1, "message should dead-letter once it exhausts max_delivery_attempts");

    fabric.shutdown().await;
}

#[tokio::test]
async fn consumer_group_rebalance_preserves_committed_offsets_across_membership_change() {
    let fabric = ServiceFabric::new(ServiceFabricConfig::default());
    fabric.streaming.create_stream("orders-events", StreamConfig { partitions: 2, ..Default::default() });

    fabric.streaming.join_group("checkout", "worker-1", "orders-events").unwrap();
    for _ in 0..4 {
        fabric.streaming.publish("orders-events", PublishEventRequest { event_type: "order.created".into(), ..Default::default() }).unwrap();
    }

    let batch = fabric.streaming.poll("checkout", "worker-1", 10).unwrap();
    assert_eq!(batch.len(), 4);
    for record in &batch {
        fabric.streaming.commit("checkout", "worker-1", "orders-events", record.partition, record.offset + 1, false).unwrap();
    }

    let lag_before_rebalance = fabric.streaming.records_lag("checkout", "worker-1").unwrap();
    assert_eq!(lag_before_rebalance, 0);

    // A second worker joining triggers a rebalance; whatever partitions
    // worker-1 keeps must not lose the offsets it already committed.
    fabric.streaming.join_group("checkout", "worker-2", "orders-events").unwrap();
    let lag_after_rebalance = fabric.streaming.records_lag("checkout", "worker-1").unwrap();
    assert_eq!(lag_after_rebalance, 0, "rebalance must not rewind committed offsets back to the log start");

    fabric.shutdown().await;
}
