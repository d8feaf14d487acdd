//! # svcfabric
//!
//! **In-process service fabric for Rust systems.**
//!
//! `svcfabric` bundles four tightly related cores behind one dependency:
//! service registry + load balancing + health supervision, a mesh control
//! plane (traffic policy, retry, circuit breaking, tracing), a message
//! broker (queues, consumer groups, dead-lettering), and an event streaming
//! log (partitions, consumer groups, projections).
//!
//! ## Quick start
//!
//! ```toml
//! [dependencies]
//! svcfabric = "0.1"
//! ```
//!
//! ## What's included
//!
//! - **Registry** - instance registration, discovery, health checking
//! - **Load balancer** - round-robin, least-connections, weighted, ip-hash,
//!   consistent-hash with virtual nodes, sticky sessions
//! - **Mesh controller** - traffic policy routing, retry with backoff,
//!   per-instance circuit breaking, distributed tracing
//! - **Broker** - FIFO/priority/delayed/pub-sub queues, consumer groups,
//!   dead-letter routing, at-rest encryption
//! - **Streaming** - partitioned append-only logs, consumer-group
//!   rebalancing, retention, projections with snapshotting
//!
//! See the [`svcfabric_core`] crate for the full API surface.

// Re-export everything from svcfabric-core
pub use svcfabric_core::*;
