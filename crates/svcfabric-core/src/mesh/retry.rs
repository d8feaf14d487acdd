//! Retry policy (spec.md §4.2.2).
//!
//! Grounded on the teacher's `resilience::retry` exponential-backoff
//! helper, narrowed to the fabric's exact delay formula and retryability
//! rule instead of jittered/configurable backoff strategies.

use std::time::Duration;

use crate::error::FabricError;

/// Retry configuration for a [`crate::mesh::MeshController::call`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            retryable_statuses: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `k` (1-indexed): `min(initial * mult^(k-1), max)`.
    pub fn delay_for_attempt(&self, k: u32) -> Duration {
        debug_assert!(k >= 1);
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi((k - 1) as i32);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// An error is retryable when it denotes timeout/connection/network
    /// failure, or carries a status in `retryable_statuses`.
    pub fn is_retryable(&self, error: &FabricError, status: Option<u16>) -> bool {
        if error.is_transient_transport() {
            return true;
        }
        status.is_some_and(|s| self.retryable_statuses.contains(&s))
    }
}
