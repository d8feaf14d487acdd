//! Partition log (spec.md §3.4, §4.4.1, §4.4.4).

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use md5::{Digest, Md5};

use crate::error::{FabricError, FabricResult};

/// One entry in a stream's partition log (spec.md §3.4).
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub id: String,
    pub stream_name: String,
    pub event_type: String,
    pub data: Vec<u8>,
    pub metadata: HashMap<String, String>,
    pub timestamp: SystemTime,
    pub version: u32,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub aggregate: Option<AggregateRef>,
    pub partition: u32,
    pub headers: HashMap<String, String>,
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub struct AggregateRef {
    pub id: String,
    pub r#type: String,
    pub version: u32,
}

/// How a published event is assigned to a partition (spec.md §4.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Partitioner {
    #[default]
    RoundRobin,
    HashKey,
}

/// Pick a partition for a new event.
pub fn choose_partition(partitioner: Partitioner, partition_count: u32, key: Option<&str>) -> u32 {
    match partitioner {
        Partitioner::RoundRobin => rand::random::<u32>() % partition_count.max(1),
        Partitioner::HashKey => {
            let key = key.unwrap_or("");
            let digest = Md5::digest(key.as_bytes());
            let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
            hash % partition_count.max(1)
        }
    }
}

/// One ordered, append-only partition log.
pub struct Partition {
    pub index: u32,
    events: Vec<StreamEvent>,
    /// Offset of the oldest retained event (advances as retention trims).
    pub log_start_offset: u64,
    next_offset: u64,
}

impl Partition {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            events: Vec::new(),
            log_start_offset: 0,
            next_offset: 0,
        }
    }

    /// Append an event, assigning it the next monotonic offset.
    pub fn append(&mut self, mut event: StreamEvent) -> u64 {
        let offset = self.next_offset;
        event.offset = offset;
        event.partition = self.index;
        self.events.push(event);
        self.next_offset += 1;
        offset
    }

    pub fn end_offset(&self) -> u64 {
        self.next_offset
    }

    /// Read up to `limit` events starting at `from_offset`.
    pub fn read(&self, from_offset: u64, limit: usize) -> FabricResult<Vec<StreamEvent>> {
        if from_offset < self.log_start_offset || from_offset > self.next_offset {
            return Err(FabricError::OffsetOutOfRange {
                partition: self.index,
                offset: from_offset,
                start: self.log_start_offset,
                end: self.next_offset,
            });
        }
        Ok(self
            .events
            .iter()
            .filter(|e| e.offset >= from_offset)
            .take(limit)
            .cloned()
            .collect())
    }

    /// Drop events older than `retention` (spec.md §4.4.4), then trim from
    /// the front so the remaining bytes fit `retention_bytes`.
    pub fn apply_retention(&mut self, retention: Duration, retention_bytes: u64, now: SystemTime) {
        self.events.retain(|e| now.duration_since(e.timestamp).unwrap_or_default() <= retention);

        let mut total_bytes: u64 = self.events.iter().map(|e| e.data.len() as u64).sum();
        while total_bytes > retention_bytes {
            if self.events.is_empty() {
                break;
            }
            let removed = self.events.remove(0);
            total_bytes = total_bytes.saturating_sub(removed.data.len() as u64);
        }

        self.log_start_offset = self.events.first().map(|e| e.offset).unwrap_or(self.next_offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, data_len: usize, ts: SystemTime) -> StreamEvent {
        StreamEvent {
            id: id.to_string(),
            stream_name: "s".into(),
            event_type: "created".into(),
            data: vec![0u8; data_len],
            metadata: HashMap::new(),
            timestamp: ts,
            version: 1,
            correlation_id: None,
            causation_id: None,
            aggregate: None,
            partition: 0,
            headers: HashMap::new(),
            offset: 0,
        }
    }

    #[test]
    fn append_assigns_monotonic_offsets() {
        let mut partition = Partition::new(0);
        let first = partition.append(event("e1", 10, SystemTime::now()));
        let second = partition.append(event("e2", 10, SystemTime::now()));
        assert_eq!(first, 0);
        assert_eq!(second, 1);
    }

    #[test]
    fn read_out_of_range_offset_errors() {
        let partition = Partition::new(0);
        assert!(matches!(partition.read(5, 10), Err(FabricError::OffsetOutOfRange { .. })));
    }

    #[test]
    fn retention_trims_by_age_then_by_size() {
        let mut partition = Partition::new(0);
        let old = SystemTime::now() - Duration::from_secs(7200);
        partition.append(event("old", 100, old));
        partition.append(event("new", 100, SystemTime::now()));

        partition.apply_retention(Duration::from_secs(3600), 1_000_000, SystemTime::now());
        let remaining = partition.read(partition.log_start_offset, 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "new");
    }

    #[test]
    fn hash_partitioner_is_deterministic() {
        let a = choose_partition(Partitioner::HashKey, 8, Some("user-1"));
        let b = choose_partition(Partitioner::HashKey, 8, Some("user-1"));
        assert_eq!(a, b);
    }
}
