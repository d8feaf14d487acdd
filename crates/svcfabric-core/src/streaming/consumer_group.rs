//! Consumer group membership and partition assignment (spec.md §3.4,
//! §4.4.2).
//!
//! Grounded on the teacher's `cqrs::ProjectionRegistry` bookkeeping style
//! (a registry of named, versioned state machines), adapted to track
//! group generation and per-member partition ownership instead of
//! projection checkpoints.

use std::collections::HashMap;

/// Lifecycle state of a [`ConsumerGroup`] (spec.md §3.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Stable,
    PreparingRebalance,
    CompletingRebalance,
    Dead,
}

/// One partition assignment within a subscribed stream.
#[derive(Debug, Clone, Default)]
pub struct Assignment {
    /// stream name -> (partition -> offset)
    pub partitions: HashMap<String, HashMap<u32, u64>>,
}

/// A consumer group (spec.md §3.4, §4.4.2).
pub struct ConsumerGroup {
    pub id: String,
    pub state: GroupState,
    pub members: Vec<String>,
    pub coordinator: Option<String>,
    pub generation_id: u64,
    pub subscribed_streams: Vec<String>,
    pub assignments: HashMap<String, Assignment>,
}

impl ConsumerGroup {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: GroupState::Stable,
            members: Vec::new(),
            coordinator: None,
            generation_id: 0,
            subscribed_streams: Vec::new(),
            assignments: HashMap::new(),
        }
    }

    pub fn add_member(&mut self, member_id: impl Into<String>) {
        let member_id = member_id.into();
        if !self.members.contains(&member_id) {
            self.members.push(member_id);
        }
        if self.coordinator.is_none() {
            self.coordinator = self.members.first().cloned();
        }
    }

    pub fn remove_member(&mut self, member_id: &str) {
        self.members.retain(|m| m != member_id);
        self.assignments.remove(member_id);
        if self.coordinator.as_deref() == Some(member_id) {
            self.coordinator = self.members.first().cloned();
        }
    }

    /// Rebalance partitions round-robin across members (spec.md §4.4.2).
    /// `stream_partition_counts` maps each subscribed stream to its
    /// partition count; `stream_offsets` supplies the seed offset for a
    /// newly assigned (stream, partition) pair, falling back to 0 (the
    /// stream's `log_start_offset` in the caller).
    pub fn rebalance(
        &mut self,
        stream_partition_counts: &HashMap<String, u32>,
        stream_offsets: impl Fn(&str, u32) -> u64,
    ) {
        self.state = GroupState::PreparingRebalance;
        self.generation_id += 1;

        let mut all_partitions: Vec<(String, u32)> = Vec::new();
        for stream in &self.subscribed_streams {
            if let Some(&count) = stream_partition_counts.get(stream) {
                for p in 0..count {
                    all_partitions.push((stream.clone(), p));
                }
            }
        }

        let mut new_assignments: HashMap<String, Assignment> = self
            .members
            .iter()
            .map(|m| (m.clone(), Assignment::default()))
            .collect();

        if !self.members.is_empty() {
            for (i, (stream, partition)) in all_partitions.into_iter().enumerate() {
                let member = &self.members[i % self.members.len()];
                let offset = stream_offsets(&stream, partition);
                new_assignments
                    .get_mut(member)
                    .expect("member present in map")
                    .partitions
                    .entry(stream)
                    .or_default()
                    .insert(partition, offset);
            }
        }

        self.assignments = new_assignments;
        self.state = GroupState::Stable;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebalance_assigns_every_partition_exactly_once() {
        let mut group = ConsumerGroup::new("g1");
        group.subscribed_streams = vec!["orders".to_string()];
        group.add_member("m1");
        group.add_member("m2");

        let mut counts = HashMap::new();
        counts.insert("orders".to_string(), 4);

        group.rebalance(&counts, |_, _| 0);

        assert_eq!(group.state, GroupState::Stable);
        assert_eq!(group.generation_id, 1);

        let total_assigned: usize = group
            .assignments
            .values()
            .map(|a| a.partitions.get("orders").map(|m| m.len()).unwrap_or(0))
            .sum();
        assert_eq!(total_assigned, 4);
    }

    #[test]
    fn removing_coordinator_promotes_next_member() {
        let mut group = ConsumerGroup::new("g1");
        group.add_member("m1");
        group.add_member("m2");
        assert_eq!(group.coordinator.as_deref(), Some("m1"));

        group.remove_member("m1");
        assert_eq!(group.coordinator.as_deref(), Some("m2"));
    }
}
