//! Message Broker core (spec.md §4.3).
//!
//! Grounded on the teacher's `cache` module for the bounded/evicting queue
//! store and `health::HealthChecker` for the heartbeat-timeout sweep
//! pattern, combined into one broker that owns queues, consumers, and
//! dead-letter routing.

pub mod consumer;
pub mod message;
pub mod queue;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

pub use consumer::{Consumer, ConsumerConfig, ConsumerStatus};
pub use message::{Message, Payload, ProcessingResult};
pub use queue::{Queue, QueueConfig, QueueKind};

use crate::error::{FabricError, FabricResult};
use crate::events::{EventBus, FabricEvent};
use crate::keyring::KeyRing;
use crate::task::Task;

const CONSUMER_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const RETRY_DELAY: Duration = Duration::from_secs(30);

/// Request shape for [`Broker::publish`].
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Vec<u8>,
    pub headers: std::collections::HashMap<String, String>,
    pub producer: String,
    pub priority: i32,
    pub expiry: Option<SystemTime>,
    pub max_delivery_attempts: u32,
    pub delay_until: Option<SystemTime>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub metadata: std::collections::HashMap<String, String>,
}

impl Default for PublishRequest {
    fn default() -> Self {
        Self {
            topic: String::new(),
            payload: Vec::new(),
            headers: Default::default(),
            producer: String::new(),
            priority: 0,
            expiry: None,
            max_delivery_attempts: 5,
            delay_until: None,
            correlation_id: None,
            reply_to: None,
            metadata: Default::default(),
        }
    }
}

#[derive(Default)]
struct QueueCounters {
    published: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    processing_ms: Mutex<Vec<f64>>,
}

/// Per-queue metrics snapshot (spec.md §4.3.6).
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    pub total: usize,
    pub pending: usize,
    pub processed: u64,
    pub failed: u64,
    pub avg_processing_time_ms: f64,
    pub throughput_per_sec: f64,
}

struct QueueEntry {
    queue: Mutex<Queue>,
    counters: QueueCounters,
}

/// The Message Broker core.
pub struct Broker {
    queues: DashMap<String, QueueEntry>,
    consumers: DashMap<String, Mutex<Consumer>>,
    keyring: Option<Arc<KeyRing>>,
    bus: Arc<EventBus>,
    heartbeat_sweep: Mutex<Option<Task>>,
}

impl Broker {
    pub fn new(bus: Arc<EventBus>, keyring: Option<Arc<KeyRing>>) -> Arc<Self> {
        let broker = Arc::new(Self {
            queues: DashMap::new(),
            consumers: DashMap::new(),
            keyring,
            bus,
            heartbeat_sweep: Mutex::new(None),
        });
        broker.clone().spawn_heartbeat_sweep();
        broker
    }

    fn spawn_heartbeat_sweep(self: Arc<Self>) {
        let broker = self.clone();
        let task = Task::spawn_interval(Duration::from_secs(30), move || {
            let broker = broker.clone();
            async move {
                broker.sweep_stale_consumers();
                broker.sweep_expired_messages();
            }
        });
        *self.heartbeat_sweep.lock() = Some(task);
    }

    fn sweep_expired_messages(&self) {
        let now = SystemTime::now();
        for entry in self.queues.iter() {
            entry.value().queue.lock().gc(now);
        }
    }

    fn sweep_stale_consumers(&self) {
        for entry in self.consumers.iter() {
            let mut consumer = entry.value().lock();
            if consumer.last_heartbeat.elapsed() > CONSUMER_HEARTBEAT_TIMEOUT && consumer.status == ConsumerStatus::Active {
                consumer.status = ConsumerStatus::Stopped;
                let consumer_id = consumer.id.clone();
                let queues: Vec<String> = consumer.config.queues.clone();
                drop(consumer);
                for queue_name in queues {
                    if let Some(queue_entry) = self.queues.get(&queue_name) {
                        queue_entry.queue.lock().reclaim_timed_out(&consumer_id, Duration::ZERO, SystemTime::now());
                    }
                }
            }
        }
    }

    pub fn create_queue(&self, name: impl Into<String>, config: QueueConfig) {
        let name = name.into();
        self.queues.insert(
            name.clone(),
            QueueEntry {
                queue: Mutex::new(Queue::new(name, config)),
                counters: QueueCounters::default(),
            },
        );
    }

    /// Remove a queue. If `purge`, discard pending and in-flight messages
    /// unconditionally; otherwise only the queue's metadata entry is
    /// removed, and only once it's empty — a non-purging delete must not
    /// silently drop messages nobody has acknowledged yet (spec.md
    /// §4.3.5).
    pub fn delete_queue(&self, name: &str, purge: bool) -> FabricResult<()> {
        {
            let entry = self.queues.get(name).ok_or_else(|| FabricError::QueueNotFound(name.to_string()))?;
            if !purge {
                let queue = entry.queue.lock();
                if !queue.is_empty() || queue.in_flight_count() > 0 {
                    return Err(FabricError::QueueNotEmpty(name.to_string()));
                }
            }
        }
        self.queues.remove(name);
        for entry in self.consumers.iter() {
            entry.value().lock().config.queues.retain(|q| q != name);
        }
        Ok(())
    }

    /// Publish a message, sealing the payload if the queue requires
    /// encryption (spec.md §4.3.4).
    pub fn publish(&self, queue_name: &str, request: PublishRequest) -> FabricResult<String> {
        let entry = self
            .queues
            .get(queue_name)
            .ok_or_else(|| FabricError::QueueNotFound(queue_name.to_string()))?;

        let payload_len = request.payload.len();
        let message_id = Uuid::new_v4().to_string();

        {
            let mut queue = entry.queue.lock();
            let payload = if queue.config.encryption {
                let ring = self
                    .keyring
                    .as_ref()
                    .ok_or_else(|| FabricError::Configuration("queue requires encryption but no KeyRing is configured".into()))?;
                Payload::Sealed(ring.seal(&request.payload))
            } else {
                Payload::Plain(request.payload)
            };

            let message = Message {
                id: message_id.clone(),
                topic: request.topic,
                payload,
                headers: request.headers,
                timestamp: SystemTime::now(),
                producer: request.producer,
                priority: request.priority,
                expiry: request.expiry,
                delivery_count: 0,
                max_delivery_attempts: request.max_delivery_attempts,
                delay_until: request.delay_until,
                correlation_id: request.correlation_id,
                reply_to: request.reply_to,
                metadata: request.metadata,
                dead_letter_reason: None,
                original_queue: None,
                dead_letter_timestamp: None,
            };
            queue.enqueue(message, payload_len)?;
        }

        entry.counters.published.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(FabricEvent::MessageQueued {
            message_id: message_id.clone(),
            queue: queue_name.to_string(),
        });
        Ok(message_id)
    }

    pub fn register_consumer(&self, config: ConsumerConfig) -> String {
        let id = Uuid::new_v4().to_string();
        self.consumers.insert(id.clone(), Mutex::new(Consumer::new(id.clone(), config)));
        id
    }

    pub fn heartbeat(&self, consumer_id: &str) -> FabricResult<()> {
        let entry = self
            .consumers
            .get(consumer_id)
            .ok_or_else(|| FabricError::InstanceNotFound(consumer_id.to_string()))?;
        let mut consumer = entry.lock();
        consumer.last_heartbeat = std::time::Instant::now();
        if consumer.status == ConsumerStatus::Stopped {
            consumer.status = ConsumerStatus::Active;
        }
        Ok(())
    }

    /// Deliver up to the consumer's available slots across its subscribed
    /// queues (spec.md §4.3.2).
    pub fn poll(&self, consumer_id: &str) -> FabricResult<Vec<Message>> {
        let consumer_entry = self
            .consumers
            .get(consumer_id)
            .ok_or_else(|| FabricError::InstanceNotFound(consumer_id.to_string()))?;

        let (queues, group_key, filter, mut remaining) = {
            let consumer = consumer_entry.lock();
            let remaining = consumer.available_slots();
            let group_key = consumer.config.group_id.clone().unwrap_or_else(|| consumer.id.clone());
            (consumer.config.queues.clone(), group_key, consumer.config.filter.clone(), remaining)
        };

        let mut batch = Vec::new();
        let now = SystemTime::now();

        for queue_name in &queues {
            if remaining == 0 {
                break;
            }
            let Some(queue_entry) = self.queues.get(queue_name) else {
                continue;
            };
            let mut queue = queue_entry.queue.lock();
            let pred = |m: &Message| filter.as_ref().is_none_or(|f| f(m));
            let dispatched = if queue.config.kind == QueueKind::PubSub {
                queue.dispatch_pubsub(&group_key, remaining, now, pred)
            } else {
                queue.dispatch_competing(consumer_id, remaining, now, pred)
            };
            remaining = remaining.saturating_sub(dispatched.len());
            batch.extend(dispatched);
        }

        for message in &mut batch {
            self.open_payload(message)?;
        }

        {
            let mut consumer = consumer_entry.lock();
            consumer.in_flight_count += batch.len();
            consumer.processed += batch.len() as u64;
        }

        Ok(batch)
    }

    /// Decrypt a sealed payload in place (spec.md §4.3.4: "decryption is
    /// performed on retrieval"). Plain payloads pass through untouched.
    fn open_payload(&self, message: &mut Message) -> FabricResult<()> {
        if let Payload::Sealed(sealed) = &message.payload {
            let ring = self
                .keyring
                .as_ref()
                .ok_or_else(|| FabricError::Configuration("message is sealed but no KeyRing is configured".into()))?;
            message.payload = Payload::Plain(ring.open(sealed)?);
        }
        Ok(())
    }

    /// Apply a consumer's [`ProcessingResult`] for one delivered message
    /// (spec.md §4.3.2, §4.3.3).
    pub fn submit_result(
        &self,
        consumer_id: &str,
        queue_name: &str,
        message_id: &str,
        result: ProcessingResult,
    ) -> FabricResult<()> {
        let queue_entry = self
            .queues
            .get(queue_name)
            .ok_or_else(|| FabricError::QueueNotFound(queue_name.to_string()))?;
        let consumer_entry = self
            .consumers
            .get(consumer_id)
            .ok_or_else(|| FabricError::InstanceNotFound(consumer_id.to_string()))?;

        let mut queue = queue_entry.queue.lock();
        match result {
            ProcessingResult::Ack => {
                queue.remove(message_id);
                queue_entry.counters.processed.fetch_add(1, Ordering::Relaxed);
                let mut consumer = consumer_entry.lock();
                consumer.acked += 1;
                consumer.in_flight_count = consumer.in_flight_count.saturating_sub(1);
                drop(consumer);
                self.bus.publish(FabricEvent::MessageAcknowledged {
                    message_id: message_id.to_string(),
                    queue: queue_name.to_string(),
                });
            }
            ProcessingResult::Nack { reason } => {
                let should_dlq = queue
                    .take_in_flight(message_id)
                    .map(|m| m.delivery_count >= m.max_delivery_attempts)
                    .unwrap_or(false);
                if should_dlq {
                    self.route_to_dlq(&mut queue, queue_name, message_id, reason.clone().unwrap_or_else(|| "max delivery attempts exceeded".into()));
                } else if let Some(message) = queue.take_in_flight(message_id) {
                    message.delay_until = Some(SystemTime::now() + RETRY_DELAY);
                }
                queue_entry.counters.failed.fetch_add(1, Ordering::Relaxed);
                let mut consumer = consumer_entry.lock();
                consumer.in_flight_count = consumer.in_flight_count.saturating_sub(1);
                drop(consumer);
                self.bus.publish(FabricEvent::MessageNacked {
                    message_id: message_id.to_string(),
                    queue: queue_name.to_string(),
                    reason,
                });
            }
            ProcessingResult::Reject { reason } => {
                self.route_to_dlq(&mut queue, queue_name, message_id, reason.clone().unwrap_or_else(|| "rejected".into()));
                queue_entry.counters.failed.fetch_add(1, Ordering::Relaxed);
                let mut consumer = consumer_entry.lock();
                consumer.in_flight_count = consumer.in_flight_count.saturating_sub(1);
                consumer.rejected += 1;
                drop(consumer);
                self.bus.publish(FabricEvent::MessageRejected {
                    message_id: message_id.to_string(),
                    queue: queue_name.to_string(),
                    reason,
                });
            }
            ProcessingResult::Retry { delay_seconds } => {
                if let Some(message) = queue.take_in_flight(message_id) {
                    message.delivery_count = message.delivery_count.saturating_sub(1);
                    message.delay_until = Some(SystemTime::now() + Duration::from_secs(delay_seconds));
                }
                let mut consumer = consumer_entry.lock();
                consumer.in_flight_count = consumer.in_flight_count.saturating_sub(1);
                drop(consumer);
                self.bus.publish(FabricEvent::MessageRetried {
                    message_id: message_id.to_string(),
                    queue: queue_name.to_string(),
                    delay_seconds,
                });
            }
        }
        Ok(())
    }

    /// Move a message to its queue's dead-letter queue, if configured.
    /// The payload is carried over as-is (sealed stays sealed) since the
    /// DLQ is an ordinary queue subject to the same at-rest encryption
    /// rule as its source; decryption still only happens on `poll`.
    fn route_to_dlq(&self, queue: &mut Queue, queue_name: &str, message_id: &str, reason: String) {
        let dlq_name = queue.config.dead_letter_queue.clone();
        let Some(mut message) = queue.take_in_flight(message_id).map(|m| m.clone()) else {
            return;
        };
        queue.remove(message_id);

        message.dead_letter_reason = Some(reason.clone());
        message.original_queue = Some(queue_name.to_string());
        message.dead_letter_timestamp = Some(SystemTime::now());

        if let Some(dlq_name) = dlq_name {
            if let Some(dlq_entry) = self.queues.get(&dlq_name) {
                let payload_len = payload_len(&message.payload);
                let _ = dlq_entry.queue.lock().enqueue(message, payload_len);
            }
        }

        self.bus.publish(FabricEvent::MessageDeadLettered {
            message_id: message_id.to_string(),
            queue: queue_name.to_string(),
            reason,
        });
    }

    pub fn queue_metrics(&self, queue_name: &str) -> FabricResult<QueueMetrics> {
        let entry = self
            .queues
            .get(queue_name)
            .ok_or_else(|| FabricError::QueueNotFound(queue_name.to_string()))?;
        let queue = entry.queue.lock();
        let processing = entry.counters.processing_ms.lock();
        let avg = if processing.is_empty() {
            0.0
        } else {
            processing.iter().sum::<f64>() / processing.len() as f64
        };
        Ok(QueueMetrics {
            total: entry.counters.published.load(Ordering::Relaxed) as usize,
            pending: queue.len(),
            processed: entry.counters.processed.load(Ordering::Relaxed),
            failed: entry.counters.failed.load(Ordering::Relaxed),
            avg_processing_time_ms: avg,
            throughput_per_sec: entry.counters.processed.load(Ordering::Relaxed) as f64 / 60.0,
        })
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.heartbeat_sweep.lock().take() {
            task.stop().await;
        }
    }
}

fn payload_len(payload: &Payload) -> usize {
    match payload {
        Payload::Plain(bytes) => bytes.len(),
        Payload::Sealed(sealed) => sealed.data.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> Arc<EventBus> {
        Arc::new(EventBus::new())
    }

    #[tokio::test]
    async fn publish_then_poll_delivers_message() {
        let broker = Broker::new(bus(), None);
        broker.create_queue("orders", QueueConfig::new(QueueKind::Fifo));
        broker
            .publish("orders", PublishRequest {
                topic: "orders".into(),
                payload: b"hello".to_vec(),
                ..Default::default()
            })
            .unwrap();

        let consumer_id = broker.register_consumer(ConsumerConfig {
            queues: vec!["orders".to_string()],
            ..Default::default()
        });

        let batch = broker.poll(&consumer_id).unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn nack_past_threshold_routes_to_dlq() {
        let broker = Broker::new(bus(), None);
        let mut config = QueueConfig::new(QueueKind::Fifo);
        config.dead_letter_queue = Some("orders-dlq".to_string());
        broker.create_queue("orders", config);
        broker.create_queue("orders-dlq", QueueConfig::new(QueueKind::Fifo));

        let message_id = broker
            .publish("orders", PublishRequest {
                topic: "orders".into(),
                payload: b"x".to_vec(),
                max_delivery_attempts: 1,
                ..Default::default()
            })
            .unwrap();

        let consumer_id = broker.register_consumer(ConsumerConfig {
            queues: vec!["orders".to_string()],
            ..Default::default()
        });
        broker.poll(&consumer_id).unwrap();

        broker
            .submit_result(&consumer_id, "orders", &message_id, ProcessingResult::Nack { reason: None })
            .unwrap();

        let dlq_metrics = broker.queue_metrics("orders-dlq").unwrap();
        assert_eq!(dlq_metrics.pending, 1);
    }

    #[tokio::test]
    async fn reject_routes_to_dlq_immediately() {
        let broker = Broker::new(bus(), None);
        let mut config = QueueConfig::new(QueueKind::Fifo);
        config.dead_letter_queue = Some("orders-dlq".to_string());
        broker.create_queue("orders", config);
        broker.create_queue("orders-dlq", QueueConfig::new(QueueKind::Fifo));

        let message_id = broker
            .publish("orders", PublishRequest {
                topic: "orders".into(),
                payload: b"x".to_vec(),
                max_delivery_attempts: 10,
                ..Default::default()
            })
            .unwrap();

        let consumer_id = broker.register_consumer(ConsumerConfig {
            queues: vec!["orders".to_string()],
            ..Default::default()
        });
        broker.poll(&consumer_id).unwrap();
        broker
            .submit_result(&consumer_id, "orders", &message_id, ProcessingResult::Reject { reason: Some("bad".into()) })
            .unwrap();

        let dlq_metrics = broker.queue_metrics("orders-dlq").unwrap();
        assert_eq!(dlq_metrics.pending, 1);
    }

    #[tokio::test]
    async fn ack_removes_message_from_queue() {
        let broker = Broker::new(bus(), None);
        broker.create_queue("orders", QueueConfig::new(QueueKind::Fifo));
        let message_id = broker
            .publish("orders", PublishRequest {
                topic: "orders".into(),
                payload: b"x".to_vec(),
                ..Default::default()
            })
            .unwrap();
        let consumer_id = broker.register_consumer(ConsumerConfig {
            queues: vec!["orders".to_string()],
            ..Default::default()
        });
        broker.poll(&consumer_id).unwrap();
        broker.submit_result(&consumer_id, "orders", &message_id, ProcessingResult::Ack).unwrap();

        assert_eq!(broker.queue_metrics("orders").unwrap().pending, 0);
    }

    #[tokio::test]
    async fn poll_decrypts_a_sealed_payload_back_to_plaintext() {
        let keyring = Arc::new(crate::keyring::KeyRing::new(crate::keyring::KeyRingConfig::default()));
        let broker = Broker::new(bus(), Some(keyring));
        let mut config = QueueConfig::new(QueueKind::Fifo);
        config.encryption = true;
        broker.create_queue("secrets", config);

        broker
            .publish("secrets", PublishRequest {
                topic: "secrets".into(),
                payload: b"at rest".to_vec(),
                ..Default::default()
            })
            .unwrap();

        let consumer_id = broker.register_consumer(ConsumerConfig {
            queues: vec!["secrets".to_string()],
            ..Default::default()
        });
        let batch = broker.poll(&consumer_id).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(matches!(&batch[0].payload, Payload::Plain(bytes) if bytes == b"at rest"));
    }

    #[tokio::test]
    async fn delete_queue_without_purge_rejects_a_non_empty_queue_but_allows_an_empty_one() {
        let broker = Broker::new(bus(), None);
        broker.create_queue("orders", QueueConfig::new(QueueKind::Fifo));
        broker
            .publish("orders", PublishRequest {
                topic: "orders".into(),
                payload: b"x".to_vec(),
                ..Default::default()
            })
            .unwrap();

        assert!(matches!(broker.delete_queue("orders", false), Err(FabricError::QueueNotEmpty(_))));
        assert!(broker.queue_metrics("orders").is_ok());

        assert!(broker.delete_queue("orders", true).is_ok());
        assert!(matches!(broker.queue_metrics("orders"), Err(FabricError::QueueNotFound(_))));
    }

    #[tokio::test]
    async fn delete_queue_with_purge_discards_a_non_empty_queue_outright() {
        let broker = Broker::new(bus(), None);
        broker.create_queue("orders", QueueConfig::new(QueueKind::Fifo));
        broker
            .publish("orders", PublishRequest {
                topic: "orders".into(),
                payload: b"x".to_vec(),
                ..Default::default()
            })
            .unwrap();

        broker.delete_queue("orders", true).unwrap();
        assert!(matches!(broker.queue_metrics("orders"), Err(FabricError::QueueNotFound(_))));
    }
}
