//! Per-instance circuit breaker (spec.md §4.2.3).
//!
//! A simpler state machine than the teacher's windowed-failure-rate
//! breaker (`resilience::CircuitBreaker`, which trips on failure rate over
//! a sliding window): the fabric's contract is an exact consecutive-
//! failure counter with a fixed threshold and cooldown, so the transition
//! table is reproduced literally rather than generalized.

use std::time::{Duration, Instant};

use crate::error::FabricError;

const FAILURE_THRESHOLD: u32 = 5;
const COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

/// One instance's breaker state (spec.md §4.2.3 table).
pub struct CircuitBreaker {
    state: parking_lot::Mutex<State>,
    consecutive_failures: std::sync::atomic::AtomicU32,
    next_attempt: parking_lot::Mutex<Option<Instant>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            state: parking_lot::Mutex::new(State::Closed),
            consecutive_failures: std::sync::atomic::AtomicU32::new(0),
            next_attempt: parking_lot::Mutex::new(None),
        }
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether a call may proceed. Transitions `open` -> `half-open`
    /// as a side effect once the cooldown has elapsed.
    pub fn check(&self, target: &str) -> Result<(), FabricError> {
        let mut state = self.state.lock();
        match *state {
            State::Closed => Ok(()),
            State::HalfOpen => Ok(()),
            State::Open => {
                let next_attempt = *self.next_attempt.lock();
                match next_attempt {
                    Some(at) if Instant::now() >= at => {
                        *state = State::HalfOpen;
                        Ok(())
                    }
                    Some(at) => Err(FabricError::CircuitOpen {
                        target: target.to_string(),
                        retry_after: at.saturating_duration_since(Instant::now()),
                    }),
                    None => {
                        *state = State::HalfOpen;
                        Ok(())
                    }
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match *state {
            State::HalfOpen => {
                *state = State::Closed;
                self.consecutive_failures.store(0, std::sync::atomic::Ordering::Relaxed);
            }
            State::Closed => {
                self.consecutive_failures.store(0, std::sync::atomic::Ordering::Relaxed);
            }
            State::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        match *state {
            State::HalfOpen => self.trip(&mut state),
            State::Closed => {
                let count = self
                    .consecutive_failures
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                    + 1;
                if count >= FAILURE_THRESHOLD {
                    self.trip(&mut state);
                }
            }
            State::Open => {}
        }
    }

    fn trip(&self, state: &mut State) {
        *state = State::Open;
        *self.next_attempt.lock() = Some(Instant::now() + COOLDOWN);
    }

    pub fn is_open(&self) -> bool {
        *self.state.lock() == State::Open
    }
}
