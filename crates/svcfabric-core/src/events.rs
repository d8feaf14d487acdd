//! Typed observer/event-emitter for observability (spec.md §6.1, §9).
//!
//! Generalizes the teacher's `cqrs::EventStore` subscriber-channel pattern
//! (a `Vec<mpsc::Sender<E>>` fanned out on append) into a single bus shared
//! across every core, keyed by a typed [`FabricEvent`] enum instead of a
//! generic `Event` type parameter: the fabric has one closed set of event
//! shapes, not an open one per aggregate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// The canonical event set from spec.md §6.1.
#[derive(Debug, Clone, PartialEq)]
pub enum FabricEvent {
    ServiceRegistered { instance_id: String, service_name: String },
    ServiceDeregistered { instance_id: String, service_name: String },
    ServiceStatusChanged {
        instance_id: String,
        service_name: String,
        previous: String,
        current: String,
    },
    HeartbeatReceived { instance_id: String, service_name: String },

    MessageSent { message_id: String, queue: String },
    MessageQueued { message_id: String, queue: String },
    MessageAcknowledged { message_id: String, queue: String },
    MessageNacked { message_id: String, queue: String, reason: Option<String> },
    MessageRejected { message_id: String, queue: String, reason: Option<String> },
    MessageRetried { message_id: String, queue: String, delay_seconds: u64 },
    MessageDeadLettered { message_id: String, queue: String, reason: String },
    MessageExpired { message_id: String, queue: String },

    EventPublished { stream: String, event_id: String, partition: u32, offset: u64 },
    ConsumerGroupRebalanced { group_id: String, generation_id: u64 },
    SnapshotCreated { projection_id: String, snapshot_id: String, version: u64 },
    OffsetsCommitted { group_id: String, stream: String, partition: u32, offset: u64 },

    TraceCompleted { trace_id: String, status: String },
    MetricsRecorded { subject: String },
    MetricsUpdated { subject: String },
}

impl FabricEvent {
    /// Stable discriminant name, used for subscription filtering and for
    /// `tracing` event names.
    pub fn kind(&self) -> &'static str {
        match self {
            FabricEvent::ServiceRegistered { .. } => "service-registered",
            FabricEvent::ServiceDeregistered { .. } => "service-deregistered",
            FabricEvent::ServiceStatusChanged { .. } => "service-status-changed",
            FabricEvent::HeartbeatReceived { .. } => "heartbeat-received",
            FabricEvent::MessageSent { .. } => "message-sent",
            FabricEvent::MessageQueued { .. } => "message-queued",
            FabricEvent::MessageAcknowledged { .. } => "message-acknowledged",
            FabricEvent::MessageNacked { .. } => "message-nacked",
            FabricEvent::MessageRejected { .. } => "message-rejected",
            FabricEvent::MessageRetried { .. } => "message-retried",
            FabricEvent::MessageDeadLettered { .. } => "message-dead-lettered",
            FabricEvent::MessageExpired { .. } => "message-expired",
            FabricEvent::EventPublished { .. } => "event-published",
            FabricEvent::ConsumerGroupRebalanced { .. } => "consumer-group-rebalanced",
            FabricEvent::SnapshotCreated { .. } => "snapshot-created",
            FabricEvent::OffsetsCommitted { .. } => "offsets-committed",
            FabricEvent::TraceCompleted { .. } => "trace-completed",
            FabricEvent::MetricsRecorded { .. } => "metrics-recorded",
            FabricEvent::MetricsUpdated { .. } => "metrics-updated",
        }
    }
}

/// An opaque handle returned by [`EventBus::subscribe`], used to
/// [`EventBus::unsubscribe`] later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

type Handler = Arc<dyn Fn(&FabricEvent) + Send + Sync>;

struct Subscription {
    filter: Option<&'static str>,
    handler: Handler,
}

/// Fan-out event bus. Handlers run synchronously on the emitting task, as
/// documented in spec.md §9 ("Handlers run on the emitter's thread; long
/// work must be offloaded by the subscriber").
#[derive(Default)]
pub struct EventBus {
    subscriptions: RwLock<HashMap<u64, Subscription>>,
    next_token: AtomicU64,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. `kind_filter`, when set, restricts delivery to
    /// events whose [`FabricEvent::kind`] matches exactly; `None` receives
    /// everything.
    pub fn subscribe<F>(&self, kind_filter: Option<&'static str>, handler: F) -> SubscriptionToken
    where
        F: Fn(&FabricEvent) + Send + Sync + 'static,
    {
        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.write().insert(
            id,
            Subscription {
                filter: kind_filter,
                handler: Arc::new(handler),
            },
        );
        SubscriptionToken(id)
    }

    /// Remove a previously registered subscription. No-op if unknown.
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        self.subscriptions.write().remove(&token.0);
    }

    /// Publish an event to every matching subscriber.
    pub fn publish(&self, event: FabricEvent) {
        let kind = event.kind();
        let subs = self.subscriptions.read();
        for sub in subs.values() {
            if sub.filter.is_none_or(|f| f == kind) {
                (sub.handler)(&event);
            }
        }
        tracing::debug!(event = kind, "fabric event published");
    }

    /// Number of active subscriptions (for tests/diagnostics).
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}
