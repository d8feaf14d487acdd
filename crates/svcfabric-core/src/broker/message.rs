//! Message entity and delivery outcomes (spec.md §3.3, §4.3.2).

use std::collections::HashMap;
use std::time::SystemTime;

use crate::keyring::SealedPayload;

/// Payload as carried on the wire: plaintext bytes, or sealed under the
/// fabric's [`crate::keyring::KeyRing`] when the owning queue has
/// encryption enabled (spec.md §4.3.4).
#[derive(Debug, Clone)]
pub enum Payload {
    Plain(Vec<u8>),
    Sealed(SealedPayload),
}

/// One unit of work on a [`crate::broker::queue::Queue`] (spec.md §3.3).
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub payload: Payload,
    pub headers: HashMap<String, String>,
    pub timestamp: SystemTime,
    pub producer: String,
    pub priority: i32,
    pub expiry: Option<SystemTime>,
    pub delivery_count: u32,
    pub max_delivery_attempts: u32,
    pub delay_until: Option<SystemTime>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub metadata: HashMap<String, String>,
    pub dead_letter_reason: Option<String>,
    pub original_queue: Option<String>,
    pub dead_letter_timestamp: Option<SystemTime>,
}

impl Message {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expiry.is_some_and(|expiry| expiry < now)
    }

    pub fn is_visible(&self, now: SystemTime) -> bool {
        self.delay_until.is_none_or(|at| at <= now)
    }
}

/// Per-message outcome returned by a consumer after processing a batch
/// (spec.md §4.3.2).
#[derive(Debug, Clone)]
pub enum ProcessingResult {
    Ack,
    Nack { reason: Option<String> },
    Reject { reason: Option<String> },
    Retry { delay_seconds: u64 },
}
