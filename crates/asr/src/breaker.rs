//! Circuit breaker guarding the primary ASR engine.

use std::time::{Duration, Instant};

/// Breaker states. `HalfOpen` admits a single probe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

/// Tracks consecutive failures. After `failure_threshold` failures the
/// circuit opens for `recovery_timeout`, then transitions to half-open to
/// probe recovery; the first success closes it again.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    failure_count: u32,
    last_failure: Option<Instant>,
    state: CircuitState,
}

impl CircuitBreaker {
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
    pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            failure_count: 0,
            last_failure: None,
            state: CircuitState::Closed,
        }
    }

    /// Current state; an open circuit transitions to half-open on read once
    /// the recovery timeout has elapsed.
    pub fn state(&mut self) -> CircuitState {
        if self.state == CircuitState::Open {
            if let Some(last) = self.last_failure {
                if last.elapsed() >= self.recovery_timeout {
                    self.state = CircuitState::HalfOpen;
                }
            }
        }
        self.state
    }

    /// `true` when the breaker admits requests (closed or half-open).
    pub fn is_available(&mut self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Resets the failure counter and closes the circuit.
    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.state = CircuitState::Closed;
    }

    /// Increments the failure counter; opens the circuit at the threshold.
    /// A half-open probe failing reopens immediately.
    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
        if self.state == CircuitState::HalfOpen || self.failure_count >= self.failure_threshold {
            self.state = CircuitState::Open;
        }
    }

    /// Force-resets to closed with zero failures.
    pub fn reset(&mut self) {
        self.failure_count = 0;
        self.state = CircuitState::Closed;
        self.last_failure = None;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_FAILURE_THRESHOLD,
            Self::DEFAULT_RECOVERY_TIMEOUT,
        )
    }
}
