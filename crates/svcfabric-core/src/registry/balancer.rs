//! Load-balancing algorithms (spec.md §4.1.1) plus sticky sessions.
//!
//! The consistent-hash ring is rebuilt and swapped in atomically on every
//! membership change (spec.md §5: "The consistent-hash ring is immutable
//! once built; rebuilds swap a new ring in atomically"), grounded on the
//! teacher's use of `arc-swap` for lock-free hot-path reads of
//! infrequently-updated state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use md5::{Digest, Md5};
use rand::Rng;

use super::instance::ServiceInstance;

/// Selection algorithm, as named in spec.md §4.1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastConnections,
    Random,
    Weighted,
    IpHash,
    ConsistentHash,
}

/// Sticky-session configuration layered on top of a base [`Strategy`]
/// (spec.md "Sticky sessions").
#[derive(Debug, Clone)]
pub struct StickyConfig {
    pub enabled: bool,
    pub key_name: String,
    pub ttl: Duration,
}

impl Default for StickyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key_name: "session".to_string(),
            ttl: Duration::from_secs(300),
        }
    }
}

/// The full selection configuration passed to [`LoadBalancer::select`].
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    pub client_ip: Option<String>,
    pub session_key: Option<String>,
    pub hash_key: Option<String>,
}

/// md5 digest truncated to its first 4 bytes, read big-endian, per the
/// `md5(x)[0..8]` convention used throughout spec.md §4.1.1/§4.4.1 (8 hex
/// characters = 4 bytes).
pub(crate) fn hash_prefix_u32(input: &str) -> u32 {
    let digest = Md5::digest(input.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// One position on the consistent-hash ring.
#[derive(Debug, Clone)]
struct RingEntry {
    hash: u32,
    instance_id: String,
}

/// Immutable consistent-hash ring for one service (spec.md §4.1.1,
/// invariant §8.1.1).
#[derive(Debug, Clone, Default)]
pub struct ConsistentHashRing {
    entries: Vec<RingEntry>,
}

const VIRTUAL_NODES_PER_INSTANCE: usize = 150;

impl ConsistentHashRing {
    pub fn build(instances: &[ServiceInstance]) -> Self {
        let mut entries: Vec<RingEntry> = Vec::with_capacity(instances.len() * VIRTUAL_NODES_PER_INSTANCE);
        for instance in instances {
            for i in 0..VIRTUAL_NODES_PER_INSTANCE {
                let hash = hash_prefix_u32(&format!("{}:{}", instance.instance_id, i));
                entries.push(RingEntry {
                    hash,
                    instance_id: instance.instance_id.clone(),
                });
            }
        }
        entries.sort_by_key(|e| e.hash);
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Select the first entry whose hash is >= the lookup hash, wrapping to
    /// the first entry on overflow.
    pub fn lookup(&self, key: &str) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        let hash = hash_prefix_u32(key);
        let idx = self
            .entries
            .partition_point(|e| e.hash < hash);
        let entry = if idx == self.entries.len() {
            &self.entries[0]
        } else {
            &self.entries[idx]
        };
        Some(&entry.instance_id)
    }
}

struct StickyEntry {
    instance_id: String,
    expires_at: Instant,
}

/// Per-service load-balancing state: round-robin cursors, consistent-hash
/// rings, and sticky-session mappings. One `LoadBalancer` serves every
/// service registered with the fabric.
#[derive(Default)]
pub struct LoadBalancer {
    cursors: DashMap<String, AtomicUsize>,
    rings: DashMap<String, ArcSwap<ConsistentHashRing>>,
    sticky: DashMap<String, StickyEntry>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the consistent-hash ring for a service. Call on every
    /// add/remove of an instance of that service (spec.md §4.1.1).
    pub fn rebuild_ring(&self, service_name: &str, instances: &[ServiceInstance]) {
        let ring = ConsistentHashRing::build(instances);
        self.rings
            .entry(service_name.to_string())
            .or_insert_with(|| ArcSwap::from_pointee(ConsistentHashRing::default()))
            .store(std::sync::Arc::new(ring));
    }

    fn ring_for(&self, service_name: &str) -> ConsistentHashRing {
        self.rings
            .get(service_name)
            .map(|r| (**r.load()).clone())
            .unwrap_or_default()
    }

    fn sticky_session_id(session_key: &str, key_name: &str) -> String {
        let digest = Md5::digest(format!("{session_key}:{key_name}").as_bytes());
        hex_encode(&digest)
    }

    /// Select one instance from `candidates` using `strategy`, honoring
    /// sticky sessions when `sticky.enabled`. Returns `None` if
    /// `candidates` is empty.
    pub fn select<'a>(
        &self,
        service_name: &str,
        strategy: Strategy,
        candidates: &'a [ServiceInstance],
        ctx: &SelectionContext,
        sticky: Option<&StickyConfig>,
    ) -> Option<&'a ServiceInstance> {
        if candidates.is_empty() {
            return None;
        }

        if let Some(sticky) = sticky.filter(|s| s.enabled) {
            if let Some(session_key) = &ctx.session_key {
                let session_id = Self::sticky_session_id(session_key, &sticky.key_name);
                if let Some(hit) = self.sticky_lookup(&session_id, candidates) {
                    return Some(hit);
                }
                let chosen = self.select_base(service_name, strategy, candidates, ctx)?;
                self.sticky.insert(
                    session_id,
                    StickyEntry {
                        instance_id: chosen.instance_id.clone(),
                        expires_at: Instant::now() + sticky.ttl,
                    },
                );
                return Some(chosen);
            }
        }

        self.select_base(service_name, strategy, candidates, ctx)
    }

    fn sticky_lookup<'a>(&self, session_id: &str, candidates: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        let entry = self.sticky.get(session_id)?;
        if entry.expires_at < Instant::now() {
            drop(entry);
            self.sticky.remove(session_id);
            return None;
        }
        candidates.iter().find(|c| c.instance_id == entry.instance_id)
    }

    fn select_base<'a>(
        &self,
        service_name: &str,
        strategy: Strategy,
        candidates: &'a [ServiceInstance],
        ctx: &SelectionContext,
    ) -> Option<&'a ServiceInstance> {
        match strategy {
            Strategy::RoundRobin => {
                let cursor = self
                    .cursors
                    .entry(service_name.to_string())
                    .or_insert_with(|| AtomicUsize::new(0));
                let idx = cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates.get(idx)
            }
            Strategy::LeastConnections => candidates
                .iter()
                .min_by_key(|c| c.connections)
                .or_else(|| candidates.first()),
            Strategy::Random => {
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                candidates.get(idx)
            }
            Strategy::Weighted => {
                let total_weight: u32 = candidates.iter().map(|c| c.weight.max(1)).sum();
                if total_weight == 0 {
                    return candidates.first();
                }
                let mut r = rand::thread_rng().gen_range(0..total_weight);
                for c in candidates {
                    let w = c.weight.max(1);
                    if r < w {
                        return Some(c);
                    }
                    r -= w;
                }
                candidates.last()
            }
            Strategy::IpHash => {
                let ip = ctx.client_ip.as_deref().unwrap_or("");
                let idx = (hash_prefix_u32(ip) as usize) % candidates.len();
                candidates.get(idx)
            }
            Strategy::ConsistentHash => {
                let key = ctx.hash_key.as_deref().unwrap_or("");
                let ring = self.ring_for(service_name);
                let instance_id = ring.lookup(key)?;
                candidates
                    .iter()
                    .find(|c| c.instance_id == instance_id)
                    .or_else(|| candidates.first())
            }
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::instance::{InstanceStatus, Protocol};
    use std::collections::HashMap;
    use std::time::SystemTime;

    fn instance(id: &str, weight: u32, connections: u32) -> ServiceInstance {
        ServiceInstance {
            instance_id: id.to_string(),
            service_name: "svc".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            protocol: Protocol::Http,
            version: "1.0.0".to_string(),
            tags: Vec::new(),
            metadata: HashMap::new(),
            weight,
            status: InstanceStatus::Healthy,
            registered_at: SystemTime::now(),
            last_heartbeat: SystemTime::now(),
            connections,
            metrics: Default::default(),
        }
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let lb = LoadBalancer::new();
        let candidates = vec![instance("a", 1, 0), instance("b", 1, 0), instance("c", 1, 0)];
        let ctx = SelectionContext::default();

        let picks: Vec<_> = (0..6)
            .map(|_| lb.select("svc", Strategy::RoundRobin, &candidates, &ctx, None).unwrap().instance_id.clone())
            .collect();

        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn least_connections_picks_minimum() {
        let lb = LoadBalancer::new();
        let candidates = vec![instance("a", 1, 3), instance("b", 1, 1), instance("c", 1, 5)];
        let ctx = SelectionContext::default();

        let pick = lb.select("svc", Strategy::LeastConnections, &candidates, &ctx, None).unwrap();
        assert_eq!(pick.instance_id, "b");
    }

    #[test]
    fn consistent_hash_is_deterministic_given_members_and_key() {
        let lb = LoadBalancer::new();
        let candidates = vec![instance("a", 1, 0), instance("b", 1, 0), instance("c", 1, 0)];
        lb.rebuild_ring("svc", &candidates);

        let ctx = SelectionContext {
            hash_key: Some("user-42".to_string()),
            ..Default::default()
        };

        let first = lb
            .select("svc", Strategy::ConsistentHash, &candidates, &ctx, None)
            .unwrap()
            .instance_id
            .clone();

        for _ in 0..100 {
            let pick = lb.select("svc", Strategy::ConsistentHash, &candidates, &ctx, None).unwrap();
            assert_eq!(pick.instance_id, first);
        }
    }

    #[test]
    fn ring_has_exactly_150_entries_per_instance() {
        let candidates = vec![instance("a", 1, 0), instance("b", 1, 0)];
        let ring = ConsistentHashRing::build(&candidates);
        assert_eq!(ring.len(), 300);
    }

    #[test]
    fn sticky_session_reuses_prior_instance_while_candidate() {
        let lb = LoadBalancer::new();
        let candidates = vec![instance("a", 1, 0), instance("b", 1, 0)];
        let ctx = SelectionContext {
            session_key: Some("session-1".to_string()),
            ..Default::default()
        };
        let sticky = StickyConfig {
            enabled: true,
            key_name: "sid".to_string(),
            ttl: Duration::from_secs(60),
        };

        let first = lb
            .select("svc", Strategy::RoundRobin, &candidates, &ctx, Some(&sticky))
            .unwrap()
            .instance_id
            .clone();

        for _ in 0..5 {
            let pick = lb
                .select("svc", Strategy::RoundRobin, &candidates, &ctx, Some(&sticky))
                .unwrap();
            assert_eq!(pick.instance_id, first);
        }
    }

    #[test]
    fn weighted_never_picks_zero_share_outside_candidates() {
        let lb = LoadBalancer::new();
        let candidates = vec![instance("a", 10, 0), instance("b", 0, 0)];
        let ctx = SelectionContext::default();
        for _ in 0..20 {
            let pick = lb.select("svc", Strategy::Weighted, &candidates, &ctx, None).unwrap();
            assert!(pick.instance_id == "a" || pick.instance_id == "b");
        }
    }
}
