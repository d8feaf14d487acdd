//! Error taxonomy shared by every core.
//!
//! Every fallible public operation returns `Result<T, FabricError>`. Variants
//! are grouped the way the spec groups them (NotFound / Capacity / State /
//! Transport / Policy / Data) so callers can match on category without
//! parsing strings.

use std::time::Duration;

/// The crate-wide result alias.
pub type FabricResult<T> = Result<T, FabricError>;

/// Tagged error type for every core. Never collapses into a bare string.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FabricError {
    // --- NotFound ---
    #[error("service '{0}' has no registered instances")]
    ServiceNotFound(String),
    #[error("instance '{0}' is not registered")]
    InstanceNotFound(String),
    #[error("queue '{0}' does not exist")]
    QueueNotFound(String),
    #[error("stream '{0}' does not exist")]
    StreamNotFound(String),
    #[error("projection '{0}' does not exist")]
    ProjectionNotFound(String),
    #[error("consumer group '{0}' does not exist")]
    GroupNotFound(String),

    // --- Capacity ---
    #[error("queue '{0}' is full")]
    QueueFull(String),
    #[error("message payload of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("partition {partition} is out of range for stream '{stream}' ({count} partitions)")]
    PartitionOutOfRange {
        stream: String,
        partition: u32,
        count: u32,
    },

    // --- State ---
    #[error("circuit for '{target}' is open, retry after {retry_after:?}")]
    CircuitOpen { target: String, retry_after: Duration },
    #[error("no healthy instance available for service '{0}'")]
    NoHealthyInstance(String),
    #[error("consumer group '{0}' is rebalancing")]
    GroupRebalancing(String),
    #[error("instance ({service}, {host}, {port}) is already registered")]
    DuplicateInstance {
        service: String,
        host: String,
        port: u16,
    },
    #[error("queue '{0}' still has pending or in-flight messages; purge to discard them")]
    QueueNotEmpty(String),

    // --- Transport ---
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("connection refused by {0}")]
    ConnectionRefused(String),

    // --- Policy ---
    #[error("request denied by traffic policy: {0}")]
    PolicyDenied(String),
    #[error("authentication required")]
    AuthRequired,
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    // --- Data ---
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("checksum mismatch for '{0}'")]
    ChecksumMismatch(String),
    #[error("offset {offset} is out of range for partition {partition} ({start}..{end})")]
    OffsetOutOfRange {
        partition: u32,
        offset: u64,
        start: u64,
        end: u64,
    },

    // --- Fatal / configuration ---
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl FabricError {
    /// The duration a caller should wait before retrying, when meaningful.
    ///
    /// Mirrors spec.md §7: "clients receive a tagged error plus
    /// `retry_after` where meaningful (rate-limit, circuit-open cooldown)".
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FabricError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// A short machine-readable tag for `error.kind` span attributes.
    pub fn kind(&self) -> &'static str {
        match self {
            FabricError::ServiceNotFound(_)
            | FabricError::InstanceNotFound(_)
            | FabricError::QueueNotFound(_)
            | FabricError::StreamNotFound(_)
            | FabricError::ProjectionNotFound(_)
            | FabricError::GroupNotFound(_) => "not_found",
            FabricError::QueueFull(_)
            | FabricError::MessageTooLarge { .. }
            | FabricError::PartitionOutOfRange { .. } => "capacity",
            FabricError::CircuitOpen { .. }
            | FabricError::NoHealthyInstance(_)
            | FabricError::GroupRebalancing(_)
            | FabricError::DuplicateInstance { .. }
            | FabricError::QueueNotEmpty(_) => "state",
            FabricError::Timeout(_) | FabricError::Network(_) | FabricError::ConnectionRefused(_) => {
                "transport"
            }
            FabricError::PolicyDenied(_) | FabricError::AuthRequired | FabricError::AuthFailed(_) => {
                "policy"
            }
            FabricError::SerializationError(_)
            | FabricError::ChecksumMismatch(_)
            | FabricError::OffsetOutOfRange { .. } => "data",
            FabricError::Configuration(_) => "configuration",
        }
    }

    /// Whether a transport-level error denotes timeout/connection/network
    /// failure, per spec.md §4.2.2's retryability rule.
    pub fn is_transient_transport(&self) -> bool {
        matches!(
            self,
            FabricError::Timeout(_) | FabricError::Network(_) | FabricError::ConnectionRefused(_)
        )
    }
}
