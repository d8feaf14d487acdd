//! Projections and snapshotting (spec.md §3.4, §4.4.5).
//!
//! Grounded on the teacher's `cqrs::projection_registry` snapshot/rebuild
//! machinery: a named, versioned derived-state store with a checksum-
//! gated recovery path, narrowed to the fabric's exact shallow-merge and
//! last-10-retention rules instead of a pluggable rebuild strategy.

use std::collections::{HashMap, VecDeque};
use std::time::SystemTime;

use md5::{Digest, Md5};
use serde_json::Value;
use uuid::Uuid;

use super::partition::StreamEvent;
use crate::error::{FabricError, FabricResult};

const MAX_SNAPSHOTS: usize = 10;

/// How a projection merges the partial state produced by one `apply` call
/// into its running `state` (spec.md §4.4.5 Open Question resolution):
/// `Shallow` replaces each top-level key the partial touches, leaving
/// others untouched; `Replace` discards the prior state outright. Default
/// is `Shallow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    #[default]
    Shallow,
    Replace,
}

fn apply_merge(strategy: MergeStrategy, base: &mut Value, incoming: &Value) {
    match strategy {
        MergeStrategy::Replace => *base = incoming.clone(),
        MergeStrategy::Shallow => match (base, incoming) {
            (Value::Object(base_map), Value::Object(incoming_map)) => {
                for (k, v) in incoming_map {
                    base_map.insert(k.clone(), v.clone());
                }
            }
            (base_slot, incoming) => {
                *base_slot = incoming.clone();
            }
        },
    }
}

/// A checkpoint of a projection's derived state (spec.md §4.4.5).
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: String,
    pub projection_id: String,
    pub state: Value,
    pub version: u64,
    pub event_timestamp: SystemTime,
    pub timestamp: SystemTime,
    pub checksum: String,
}

fn checksum_of(state: &Value) -> String {
    let bytes = serde_json::to_vec(state).unwrap_or_default();
    let digest = Md5::digest(&bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// The projection function: consumes one event, produces a partial state
/// to be merged in.
pub type ProjectionFn = std::sync::Arc<dyn Fn(&StreamEvent) -> Value + Send + Sync>;

/// A live projection over a stream (spec.md §3.4).
pub struct Projection {
    pub id: String,
    pub stream: String,
    pub event_types: Vec<String>,
    pub apply: ProjectionFn,
    pub state: Value,
    pub last_processed_offset: u64,
    pub last_processed_timestamp: SystemTime,
    pub checkpoint_interval_ms: u64,
    pub merge_strategy: MergeStrategy,
    snapshots: VecDeque<Snapshot>,
    processed_since_snapshot: bool,
    last_snapshot_at: SystemTime,
}

impl Projection {
    pub fn new(id: impl Into<String>, stream: impl Into<String>, event_types: Vec<String>, apply: ProjectionFn, checkpoint_interval_ms: u64) -> Self {
        Self {
            id: id.into(),
            stream: stream.into(),
            event_types,
            apply,
            state: Value::Object(Default::default()),
            last_processed_offset: 0,
            last_processed_timestamp: SystemTime::UNIX_EPOCH,
            checkpoint_interval_ms,
            merge_strategy: MergeStrategy::default(),
            snapshots: VecDeque::new(),
            processed_since_snapshot: false,
            last_snapshot_at: SystemTime::now(),
        }
    }

    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    /// Apply one matching event (spec.md §4.4.5): filters by
    /// `event_types` and `timestamp > last_processed_timestamp`, then
    /// merges the partial state produced by `apply` per `merge_strategy`.
    pub fn process(&mut self, event: &StreamEvent) {
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return;
        }
        if event.timestamp <= self.last_processed_timestamp {
            return;
        }
        let partial = (self.apply)(event);
        apply_merge(self.merge_strategy, &mut self.state, &partial);
        self.last_processed_offset = event.offset;
        self.last_processed_timestamp = event.timestamp;
        self.processed_since_snapshot = true;
    }

    /// Write a snapshot if the checkpoint interval has elapsed and events
    /// were processed since the last one. Retains only the last 10.
    pub fn maybe_checkpoint(&mut self, now: SystemTime) -> Option<Snapshot> {
        if !self.processed_since_snapshot {
            return None;
        }
        let elapsed = now.duration_since(self.last_snapshot_at).unwrap_or_default();
        if elapsed.as_millis() < self.checkpoint_interval_ms as u128 {
            return None;
        }

        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            projection_id: self.id.clone(),
            state: self.state.clone(),
            version: self.last_processed_offset,
            event_timestamp: self.last_processed_timestamp,
            timestamp: now,
            checksum: checksum_of(&self.state),
        };

        self.snapshots.push_back(snapshot.clone());
        while self.snapshots.len() > MAX_SNAPSHOTS {
            self.snapshots.pop_front();
        }
        self.processed_since_snapshot = false;
        self.last_snapshot_at = now;
        Some(snapshot)
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.iter()
    }

    /// Recover from the most recent snapshot with a valid checksum
    /// (spec.md §4.4.5). Restores `last_processed_timestamp` alongside the
    /// offset so `process`'s timestamp gate doesn't reprocess events
    /// already folded into the restored state.
    pub fn recover(&mut self) -> FabricResult<()> {
        let valid = self
            .snapshots
            .iter()
            .rev()
            .find(|s| checksum_of(&s.state) == s.checksum)
            .cloned();

        match valid {
            Some(snapshot) => {
                self.state = snapshot.state;
                self.last_processed_offset = snapshot.version;
                self.last_processed_timestamp = snapshot.event_timestamp;
                Ok(())
            }
            None => Err(FabricError::ChecksumMismatch(self.id.clone())),
        }
    }
}

/// Registry of projections keyed by id.
#[derive(Default)]
pub struct ProjectionRegistry {
    projections: HashMap<String, Projection>,
}

impl ProjectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, projection: Projection) {
        self.projections.insert(projection.id.clone(), projection);
    }

    pub fn get_mut(&mut self, id: &str) -> FabricResult<&mut Projection> {
        self.projections.get_mut(id).ok_or_else(|| FabricError::ProjectionNotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> FabricResult<&Projection> {
        self.projections.get(id).ok_or_else(|| FabricError::ProjectionNotFound(id.to_string()))
    }

    pub fn checkpoint_all(&mut self, now: SystemTime) -> Vec<(String, Snapshot)> {
        self.projections
            .iter_mut()
            .filter_map(|(id, p)| p.maybe_checkpoint(now).map(|s| (id.clone(), s)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use std::time::Duration;

    fn event(event_type: &str, offset: u64, ts: SystemTime, count: i64) -> StreamEvent {
        StreamEvent {
            id: format!("e{offset}"),
            stream_name: "orders".into(),
            event_type: event_type.into(),
            data: Vec::new(),
            metadata: Map::new(),
            timestamp: ts,
            version: 1,
            correlation_id: None,
            causation_id: None,
            aggregate: None,
            partition: 0,
            headers: Map::new(),
            offset,
        }
    }

    fn counting_fn() -> ProjectionFn {
        std::sync::Arc::new(|event: &StreamEvent| {
            serde_json::json!({ "last_event": event.id })
        })
    }

    #[test]
    fn process_merges_state_and_advances_offset() {
        let mut projection = Projection::new("p1", "orders", vec!["created".into()], counting_fn(), 0);
        let t0 = SystemTime::now();
        projection.process(&event("created", 1, t0, 1));
        assert_eq!(projection.last_processed_offset, 1);
        assert_eq!(projection.state["last_event"], "e1");
    }

    #[test]
    fn unmatched_event_type_is_ignored() {
        let mut projection = Projection::new("p1", "orders", vec!["created".into()], counting_fn(), 0);
        projection.process(&event("cancelled", 1, SystemTime::now(), 1));
        assert_eq!(projection.last_processed_offset, 0);
    }

    #[test]
    fn checkpoint_retains_only_last_ten_snapshots() {
        let mut projection = Projection::new("p1", "orders", Vec::new(), counting_fn(), 0);
        let mut t = SystemTime::now();
        for i in 0..15 {
            t += Duration::from_millis(1);
            projection.process(&event("created", i, t, i as i64));
            projection.maybe_checkpoint(t);
        }
        assert_eq!(projection.snapshots().count(), MAX_SNAPSHOTS);
    }

    #[test]
    fn recover_uses_latest_valid_checksum() {
        let mut projection = Projection::new("p1", "orders", Vec::new(), counting_fn(), 0);
        let t = SystemTime::now();
        projection.process(&event("created", 1, t, 1));
        projection.maybe_checkpoint(t + Duration::from_millis(1));

        projection.state = serde_json::json!({ "corrupted": true });
        projection.recover().unwrap();
        assert_eq!(projection.state["last_event"], "e1");
    }

    #[test]
    fn recover_restores_timestamp_so_snapshotted_events_are_not_reprocessed() {
        let mut projection = Projection::new("p1", "orders", Vec::new(), counting_fn(), 0);
        let t0 = SystemTime::now();
        projection.process(&event("created", 1, t0, 1));
        projection.maybe_checkpoint(t0 + Duration::from_millis(1));
        assert_eq!(projection.last_processed_offset, 1);

        // Simulate a restart: a fresh projection only has the snapshot.
        let mut restarted = Projection::new("p1", "orders", Vec::new(), counting_fn(), 0);
        restarted.snapshots = projection.snapshots.clone();
        restarted.recover().unwrap();

        assert_eq!(restarted.last_processed_timestamp, t0);
        restarted.process(&event("created", 1, t0, 1));
        assert_eq!(restarted.last_processed_offset, 1, "already-snapshotted event must not reprocess");
    }

    #[test]
    fn replace_strategy_discards_prior_state_instead_of_merging() {
        let apply: ProjectionFn = std::sync::Arc::new(|event: &StreamEvent| serde_json::json!({ "only": event.id }));
        let mut projection = Projection::new("p1", "orders", Vec::new(), apply, 0).with_merge_strategy(MergeStrategy::Replace);

        let t = SystemTime::now();
        projection.process(&event("created", 1, t, 1));
        projection.state = serde_json::json!({ "only": "e1", "stale": true });
        projection.process(&event("created", 2, t + Duration::from_millis(1), 1));

        assert_eq!(projection.state, serde_json::json!({ "only": "e2" }));
    }
}
