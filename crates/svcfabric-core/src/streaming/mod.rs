//! Event Streaming core (spec.md §4.4).
//!
//! Grounded on the teacher's `cqrs` module for the event/projection shape,
//! with partitioned append logs (`partition.rs`) and group coordination
//! (`consumer_group.rs`) layered on top the way a log-based streaming
//! engine composes them.

pub mod consumer_group;
pub mod partition;
pub mod projection;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

pub use consumer_group::{Assignment, ConsumerGroup, GroupState};
pub use partition::{choose_partition, AggregateRef, Partition, Partitioner, StreamEvent};
pub use projection::{MergeStrategy, Projection, ProjectionFn, ProjectionRegistry, Snapshot};

use crate::error::{FabricError, FabricResult};
use crate::events::{EventBus, FabricEvent};
use crate::task::Task;

/// How a stream drops old data (spec.md §3.4). `Compact` is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupPolicy {
    #[default]
    Delete,
    Compact,
}

/// Static configuration for a [`Stream`] (spec.md §3.4).
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub partitions: u32,
    pub replication_factor: u32,
    pub retention_hours: u64,
    pub retention_bytes: u64,
    pub compression: bool,
    pub cleanup_policy: CleanupPolicy,
    pub segment_size: u64,
    pub index_interval: u64,
    pub partitioner: Partitioner,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            replication_factor: 1,
            retention_hours: 168,
            retention_bytes: 1 << 30,
            compression: false,
            cleanup_policy: CleanupPolicy::Delete,
            segment_size: 1 << 20,
            index_interval: 4096,
            partitioner: Partitioner::RoundRobin,
        }
    }
}

/// A named, partitioned append-only event log (spec.md §3.4, §4.4.1).
pub struct Stream {
    pub name: String,
    pub config: StreamConfig,
    partitions: Vec<Partition>,
}

impl Stream {
    pub fn new(name: impl Into<String>, config: StreamConfig) -> Self {
        let partitions = (0..config.partitions).map(Partition::new).collect();
        Self {
            name: name.into(),
            config,
            partitions,
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }
}

/// Request shape for [`StreamingEngine::publish`].
#[derive(Debug, Clone, Default)]
pub struct PublishEventRequest {
    pub event_type: String,
    pub data: Vec<u8>,
    pub metadata: HashMap<String, String>,
    pub partition_key: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub aggregate: Option<AggregateRef>,
    pub headers: HashMap<String, String>,
}

/// The Event Streaming core.
pub struct StreamingEngine {
    streams: DashMap<String, Mutex<Stream>>,
    groups: DashMap<String, Mutex<ConsumerGroup>>,
    projections: Mutex<ProjectionRegistry>,
    bus: Arc<EventBus>,
    retention_task: Mutex<Option<Task>>,
    checkpoint_task: Mutex<Option<Task>>,
}

impl StreamingEngine {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        let engine = Arc::new(Self {
            streams: DashMap::new(),
            groups: DashMap::new(),
            projections: Mutex::new(ProjectionRegistry::new()),
            bus,
            retention_task: Mutex::new(None),
            checkpoint_task: Mutex::new(None),
        });
        engine.clone().spawn_retention_sweep();
        engine.clone().spawn_checkpoint_sweep();
        engine
    }

    fn spawn_retention_sweep(self: Arc<Self>) {
        let engine = self.clone();
        let task = Task::spawn_interval(Duration::from_secs(300), move || {
            let engine = engine.clone();
            async move { engine.apply_retention_all() }
        });
        *self.retention_task.lock() = Some(task);
    }

    fn spawn_checkpoint_sweep(self: Arc<Self>) {
        let engine = self.clone();
        let task = Task::spawn_interval(Duration::from_millis(500), move || {
            let engine = engine.clone();
            async move { engine.checkpoint_projections() }
        });
        *self.checkpoint_task.lock() = Some(task);
    }

    fn apply_retention_all(&self) {
        let now = SystemTime::now();
        for entry in self.streams.iter() {
            let mut stream = entry.value().lock();
            if stream.config.cleanup_policy != CleanupPolicy::Delete {
                continue;
            }
            let retention = Duration::from_secs(stream.config.retention_hours * 3600);
            let retention_bytes = stream.config.retention_bytes;
            for partition in &mut stream.partitions {
                partition.apply_retention(retention, retention_bytes, now);
            }
        }
    }

    fn checkpoint_projections(&self) {
        let snapshots = self.projections.lock().checkpoint_all(SystemTime::now());
        for (projection_id, snapshot) in snapshots {
            self.bus.publish(FabricEvent::SnapshotCreated {
                projection_id,
                snapshot_id: snapshot.id,
                version: snapshot.version,
            });
        }
    }

    pub fn create_stream(&self, name: impl Into<String>, config: StreamConfig) {
        let name = name.into();
        self.streams.insert(name.clone(), Mutex::new(Stream::new(name, config)));
    }

    /// Publish an event, assigning it a partition via the stream's
    /// configured partitioner (spec.md §4.4.1).
    pub fn publish(&self, stream_name: &str, request: PublishEventRequest) -> FabricResult<(u32, u64)> {
        let entry = self
            .streams
            .get(stream_name)
            .ok_or_else(|| FabricError::StreamNotFound(stream_name.to_string()))?;
        let mut stream = entry.lock();
        let partition_count = stream.partition_count();
        let partition_idx = choose_partition(stream.config.partitioner, partition_count, request.partition_key.as_deref());

        let event_id = Uuid::new_v4().to_string();
        let event = StreamEvent {
            id: event_id.clone(),
            stream_name: stream_name.to_string(),
            event_type: request.event_type,
            data: request.data,
            metadata: request.metadata,
            timestamp: SystemTime::now(),
            version: 1,
            correlation_id: request.correlation_id,
            causation_id: request.causation_id,
            aggregate: request.aggregate,
            partition: partition_idx,
            headers: request.headers,
            offset: 0,
        };

        let offset = stream
            .partitions
            .get_mut(partition_idx as usize)
            .ok_or_else(|| FabricError::PartitionOutOfRange {
                stream: stream_name.to_string(),
                partition: partition_idx,
                count: partition_count,
            })?
            .append(event);

        self.bus.publish(FabricEvent::EventPublished {
            stream: stream_name.to_string(),
            event_id,
            partition: partition_idx,
            offset,
        });

        Ok((partition_idx, offset))
    }

    /// Ensure a group exists, add `member_id` as a subscriber of
    /// `stream_name`, and rebalance (spec.md §4.4.2).
    pub fn join_group(&self, group_id: &str, member_id: &str, stream_name: &str) -> FabricResult<()> {
        if !self.streams.contains_key(stream_name) {
            return Err(FabricError::StreamNotFound(stream_name.to_string()));
        }
        let group_entry = self.groups.entry(group_id.to_string()).or_insert_with(|| Mutex::new(ConsumerGroup::new(group_id)));
        let mut group = group_entry.lock();
        if !group.subscribed_streams.iter().any(|s| s == stream_name) {
            group.subscribed_streams.push(stream_name.to_string());
        }
        group.add_member(member_id);
        self.rebalance_locked(&mut group);
        Ok(())
    }

    pub fn leave_group(&self, group_id: &str, member_id: &str) -> FabricResult<()> {
        let group_entry = self.groups.get(group_id).ok_or_else(|| FabricError::GroupNotFound(group_id.to_string()))?;
        let mut group = group_entry.lock();
        group.remove_member(member_id);
        self.rebalance_locked(&mut group);
        Ok(())
    }

    fn rebalance_locked(&self, group: &mut ConsumerGroup) {
        let counts: HashMap<String, u32> = group
            .subscribed_streams
            .iter()
            .filter_map(|s| self.streams.get(s).map(|e| (s.clone(), e.lock().partition_count())))
            .collect();

        // Seed from whatever offset the (stream, partition) pair already
        // had under any member before this rebalance, falling back to the
        // stream's log_start_offset for a pair no member has ever owned
        // (spec.md §4.4.2 step 4).
        let mut previous_offsets: HashMap<(String, u32), u64> = HashMap::new();
        for assignment in group.assignments.values() {
            for (stream, partitions) in &assignment.partitions {
                for (&partition, &offset) in partitions {
                    previous_offsets.insert((stream.clone(), partition), offset);
                }
            }
        }
        let streams = &self.streams;
        group.rebalance(&counts, move |stream, partition| {
            previous_offsets.get(&(stream.to_string(), partition)).copied().unwrap_or_else(|| {
                streams
                    .get(stream)
                    .and_then(|e| e.lock().partitions.get(partition as usize).map(|p| p.log_start_offset))
                    .unwrap_or(0)
            })
        });

        self.bus.publish(FabricEvent::ConsumerGroupRebalanced {
            group_id: group.id.clone(),
            generation_id: group.generation_id,
        });
    }

    /// Collect up to `max_poll_records` events across `member_id`'s
    /// assigned partitions, without advancing offsets (spec.md §4.4.3
    /// step 1). Callers advance via [`StreamingEngine::commit`].
    pub fn poll(&self, group_id: &str, member_id: &str, max_poll_records: usize) -> FabricResult<Vec<StreamEvent>> {
        let group_entry = self.groups.get(group_id).ok_or_else(|| FabricError::GroupNotFound(group_id.to_string()))?;
        let group = group_entry.lock();
        if group.state != GroupState::Stable {
            return Err(FabricError::GroupRebalancing(group_id.to_string()));
        }
        let assignment = group.assignments.get(member_id).cloned().unwrap_or_default();

        let mut batch = Vec::new();
        for (stream_name, partitions) in &assignment.partitions {
            let Some(stream_entry) = self.streams.get(stream_name) else {
                continue;
            };
            let stream = stream_entry.lock();
            for (&partition_idx, &offset) in partitions {
                if batch.len() >= max_poll_records {
                    break;
                }
                if let Some(partition) = stream.partitions.get(partition_idx as usize) {
                    let remaining = max_poll_records - batch.len();
                    let events = partition.read(offset, remaining).unwrap_or_default();
                    batch.extend(events);
                }
            }
        }
        Ok(batch)
    }

    /// Advance a member's stored offset for one (stream, partition) pair,
    /// optionally emitting `offsets-committed` (spec.md §4.4.3 step 4).
    pub fn commit(&self, group_id: &str, member_id: &str, stream_name: &str, partition: u32, new_offset: u64, enable_auto_commit: bool) -> FabricResult<()> {
        let group_entry = self.groups.get(group_id).ok_or_else(|| FabricError::GroupNotFound(group_id.to_string()))?;
        let mut group = group_entry.lock();
        let assignment = group
            .assignments
            .get_mut(member_id)
            .ok_or_else(|| FabricError::InstanceNotFound(member_id.to_string()))?;
        assignment
            .partitions
            .entry(stream_name.to_string())
            .or_default()
            .insert(partition, new_offset);

        if enable_auto_commit {
            self.bus.publish(FabricEvent::OffsetsCommitted {
                group_id: group_id.to_string(),
                stream: stream_name.to_string(),
                partition,
                offset: new_offset,
            });
        }
        Ok(())
    }

    /// Sum of (partition end offset - consumer offset) across a member's
    /// assignments (spec.md §4.4.3: `records_lag`).
    pub fn records_lag(&self, group_id: &str, member_id: &str) -> FabricResult<u64> {
        let group_entry = self.groups.get(group_id).ok_or_else(|| FabricError::GroupNotFound(group_id.to_string()))?;
        let group = group_entry.lock();
        let Some(assignment) = group.assignments.get(member_id) else {
            return Ok(0);
        };

        let mut lag = 0u64;
        for (stream_name, partitions) in &assignment.partitions {
            let Some(stream_entry) = self.streams.get(stream_name) else {
                continue;
            };
            let stream = stream_entry.lock();
            for (&partition_idx, &offset) in partitions {
                if let Some(partition) = stream.partitions.get(partition_idx as usize) {
                    lag += partition.end_offset().saturating_sub(offset);
                }
            }
        }
        Ok(lag)
    }

    pub fn register_projection(&self, projection: Projection) {
        self.projections.lock().register(projection);
    }

    pub fn projection_state(&self, projection_id: &str) -> FabricResult<serde_json::Value> {
        self.projections.lock().get(projection_id).map(|p| p.state.clone())
    }

    /// Feed every unconsumed event on a projection's stream through it
    /// (spec.md §4.4.5).
    pub fn advance_projection(&self, projection_id: &str) -> FabricResult<()> {
        let mut projections = self.projections.lock();
        let projection = projections.get_mut(projection_id)?;
        let Some(stream_entry) = self.streams.get(&projection.stream) else {
            return Err(FabricError::StreamNotFound(projection.stream.clone()));
        };
        let stream = stream_entry.lock();
        for partition in &stream.partitions {
            let events = partition.read(partition.log_start_offset, usize::MAX).unwrap_or_default();
            for event in &events {
                projection.process(event);
            }
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.retention_task.lock().take() {
            task.stop().await;
        }
        if let Some(task) = self.checkpoint_task.lock().take() {
            task.stop().await;
        }
    }
}
