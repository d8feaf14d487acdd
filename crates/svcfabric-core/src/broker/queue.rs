//! Queue semantics (spec.md §3.3, §4.3.1).
//!
//! Grounded on the teacher's `cache` module's bounded-collection + eviction
//! pattern (capacity cap, GC sweep) adapted from an LRU cache to an
//! ordered mailbox with four dispatch disciplines.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

use crate::error::{FabricError, FabricResult};

use super::message::Message;

/// The queue's dispatch discipline (spec.md §3.3, §4.3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Fifo,
    Priority,
    Delayed,
    PubSub,
}

/// Static configuration for a [`Queue`] (spec.md §3.3).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub kind: QueueKind,
    pub max_size: usize,
    pub max_message_size: usize,
    pub message_retention: Duration,
    pub dead_letter_queue: Option<String>,
    pub dlq_threshold: u32,
    pub encryption: bool,
}

impl QueueConfig {
    pub fn new(kind: QueueKind) -> Self {
        Self {
            kind,
            max_size: 10_000,
            max_message_size: 1_048_576,
            message_retention: Duration::from_secs(24 * 3600),
            dead_letter_queue: None,
            dlq_threshold: 5,
            encryption: false,
        }
    }
}

struct InFlight {
    consumer_id: String,
    delivered_at: SystemTime,
}

/// A typed mailbox (spec.md §3.3, §4.3.1).
pub struct Queue {
    pub name: String,
    pub config: QueueConfig,
    pending: Vec<Message>,
    in_flight: HashMap<String, InFlight>,
    /// For `pub-sub` queues: which (group, message) pairs have already
    /// been delivered, so every group observes every message exactly
    /// once on the happy path.
    pubsub_delivered: HashMap<String, HashSet<String>>,
}

impl Queue {
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        Self {
            name: name.into(),
            config,
            pending: Vec::new(),
            in_flight: HashMap::new(),
            pubsub_delivered: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Insert a message, enforcing the size invariants (spec.md §4.3.1).
    pub fn enqueue(&mut self, message: Message, payload_len: usize) -> FabricResult<()> {
        if self.pending.len() >= self.config.max_size {
            return Err(FabricError::QueueFull(self.name.clone()));
        }
        if payload_len > self.config.max_message_size {
            return Err(FabricError::MessageTooLarge {
                size: payload_len,
                limit: self.config.max_message_size,
            });
        }
        self.pending.push(message);
        Ok(())
    }

    /// Drop expired messages (`expiry < now`) and anything older than
    /// `message_retention` (applies to every queue kind, including a
    /// dead-letter queue configured like any other — the Open Question on
    /// DLQ retention resolves to reusing this field rather than a
    /// DLQ-specific one). For pub-sub queues this also prunes delivery
    /// bookkeeping for the messages it drops.
    pub fn gc(&mut self, now: SystemTime) {
        self.pending.retain(|m| !m.is_expired(now));

        let retention = self.config.message_retention;
        let cutoff_ids: HashSet<String> = self
            .pending
            .iter()
            .filter(|m| now.duration_since(m.timestamp).unwrap_or_default() > retention)
            .map(|m| m.id.clone())
            .collect();
        if !cutoff_ids.is_empty() {
            self.pending.retain(|m| !cutoff_ids.contains(&m.id));
            for id in &cutoff_ids {
                self.in_flight.remove(id);
            }
        }
        if self.config.kind == QueueKind::PubSub {
            for delivered in self.pubsub_delivered.values_mut() {
                delivered.retain(|id| !cutoff_ids.contains(id));
            }
        }
    }

    /// Select up to `limit` messages for a competing-consumer dispatch
    /// (fifo/priority/delayed), honoring visibility and the filter,
    /// ordered by (priority desc, timestamp asc). Marks chosen messages
    /// in-flight for `consumer_id`.
    pub fn dispatch_competing(
        &mut self,
        consumer_id: &str,
        limit: usize,
        now: SystemTime,
        filter: impl Fn(&Message) -> bool,
    ) -> Vec<Message> {
        let mut candidate_idx: Vec<usize> = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, m)| !self.in_flight.contains_key(&m.id) && m.is_visible(now) && filter(m))
            .map(|(i, _)| i)
            .collect();

        candidate_idx.sort_by(|&a, &b| {
            let ma = &self.pending[a];
            let mb = &self.pending[b];
            mb.priority.cmp(&ma.priority).then(ma.timestamp.cmp(&mb.timestamp))
        });
        candidate_idx.truncate(limit);

        let mut dispatched = Vec::with_capacity(candidate_idx.len());
        for idx in candidate_idx {
            let message = &mut self.pending[idx];
            message.delivery_count += 1;
            self.in_flight.insert(
                message.id.clone(),
                InFlight {
                    consumer_id: consumer_id.to_string(),
                    delivered_at: now,
                },
            );
            dispatched.push(message.clone());
        }
        dispatched
    }

    /// Select up to `limit` undelivered messages for `group_id` on a
    /// pub-sub queue, marking them delivered to that group.
    pub fn dispatch_pubsub(&mut self, group_id: &str, limit: usize, now: SystemTime, filter: impl Fn(&Message) -> bool) -> Vec<Message> {
        let delivered = self.pubsub_delivered.entry(group_id.to_string()).or_default();
        let mut candidates: Vec<&Message> = self
            .pending
            .iter()
            .filter(|m| !delivered.contains(&m.id) && m.is_visible(now) && filter(m))
            .collect();
        candidates.sort_by_key(|m| m.timestamp);
        candidates.truncate(limit);
        let chosen: Vec<Message> = candidates.into_iter().cloned().collect();
        for message in &chosen {
            delivered.insert(message.id.clone());
        }
        chosen
    }

    /// Remove a message permanently (ack).
    pub fn remove(&mut self, message_id: &str) {
        self.pending.retain(|m| m.id != message_id);
        self.in_flight.remove(message_id);
    }

    /// Clear in-flight marking and return the message for requeue/DLQ
    /// routing decisions.
    pub fn take_in_flight(&mut self, message_id: &str) -> Option<&mut Message> {
        self.in_flight.remove(message_id);
        self.pending.iter_mut().find(|m| m.id == message_id)
    }

    /// Messages whose in-flight lease has exceeded `ack_timeout` for a
    /// given consumer (spec.md §4.3.5: heartbeat timeout resets
    /// delivery_count and returns the message to visibility).
    pub fn reclaim_timed_out(&mut self, consumer_id: &str, ack_timeout: Duration, now: SystemTime) -> Vec<String> {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.consumer_id == consumer_id && now.duration_since(f.delivered_at).unwrap_or_default() > ack_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            self.in_flight.remove(id);
            if let Some(message) = self.pending.iter_mut().find(|m| &m.id == id) {
                message.delivery_count = 0;
            }
        }
        expired
    }
}
