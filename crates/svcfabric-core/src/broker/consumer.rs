//! Consumer entity (spec.md §3.3).

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::message::Message;

/// Lifecycle state of a [`Consumer`] (spec.md §4.3.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    Active,
    Stopped,
    Error,
}

/// Caller-supplied predicate selecting which messages a consumer accepts.
pub type MessageFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Config supplied when registering a consumer.
#[derive(Clone)]
pub struct ConsumerConfig {
    pub group_id: Option<String>,
    pub queues: Vec<String>,
    pub batch_size: usize,
    pub prefetch: usize,
    pub ack_timeout: Duration,
    pub max_concurrency: usize,
    pub filter: Option<MessageFilter>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: None,
            queues: Vec::new(),
            batch_size: 10,
            prefetch: 10,
            ack_timeout: Duration::from_secs(30),
            max_concurrency: 10,
            filter: None,
        }
    }
}

/// A registered consumer (spec.md §3.3).
pub struct Consumer {
    pub id: String,
    pub config: ConsumerConfig,
    pub status: ConsumerStatus,
    pub last_heartbeat: Instant,
    pub in_flight_count: usize,
    pub processed: u64,
    pub acked: u64,
    pub rejected: u64,
    pub errors: u64,
}

impl Consumer {
    pub fn new(id: impl Into<String>, config: ConsumerConfig) -> Self {
        Self {
            id: id.into(),
            config,
            status: ConsumerStatus::Active,
            last_heartbeat: Instant::now(),
            in_flight_count: 0,
            processed: 0,
            acked: 0,
            rejected: 0,
            errors: 0,
        }
    }

    pub fn matches_filter(&self, message: &Message) -> bool {
        self.config.filter.as_ref().is_none_or(|f| f(message))
    }

    pub fn available_slots(&self) -> usize {
        self.config
            .batch_size
            .min(self.config.max_concurrency.saturating_sub(self.in_flight_count))
    }
}
