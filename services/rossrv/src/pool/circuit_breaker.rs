//! Per-device circuit breaker
//!
//! Three-state gate (`Closed`, `Open`, `HalfOpen`) in front of every
//! device. The breaker is the sole arbiter of whether the pool may open a
//! new connection to a device; nothing creates sessions around it.
//!
//! All mutable state lives under a single `RwLock` so transitions are
//! atomic. `HalfOpen` admits exactly one probe at a time; the probe's
//! outcome decides the next state.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Circuit breaker state machine.
///
/// - `Closed` -> `Open`: failure count reaches the threshold
/// - `Open` -> `HalfOpen`: reset timeout expires
/// - `HalfOpen` -> `Closed`: enough consecutive probe successes
/// - `HalfOpen` -> `Open`: a probe fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests are allowed through
    Closed,
    /// Failures exceeded threshold, requests fail fast
    Open,
    /// Recovery mode, probing whether the device came back
    HalfOpen,
}

/// Breaker tuning knobs
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Time to stay open before allowing a probe
    pub reset_timeout: Duration,
    /// Consecutive probe successes required to close again
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    probe_successes: u32,
    last_failure_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Three-state gate guarding connection attempts to one device
pub struct CircuitBreaker {
    inner: Arc<RwLock<BreakerState>>,
    config: CircuitBreakerConfig,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                probe_successes: 0,
                last_failure_at: None,
                probe_in_flight: false,
            })),
            config,
        }
    }

    /// Whether a request may proceed right now.
    ///
    /// `Closed` always passes. `Open` passes only once the reset timeout
    /// has expired, transitioning to `HalfOpen` and claiming the single
    /// probe slot. `HalfOpen` passes only if no probe is already in
    /// flight.
    pub async fn can_execute(&self) -> bool {
        // Fast path with the read lock for the common Closed case
        {
            let inner = self.inner.read().await;
            match inner.state {
                CircuitState::Closed => return true,
                CircuitState::Open => {
                    let expired = inner
                        .last_failure_at
                        .is_some_and(|at| at.elapsed() >= self.config.reset_timeout);
                    if !expired {
                        return false;
                    }
                    // Fall through to transition under the write lock
                },
                CircuitState::HalfOpen => {
                    if inner.probe_in_flight {
                        return false;
                    }
                    // Fall through to claim the probe slot
                },
            }
        }

        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let expired = inner
                    .last_failure_at
                    .is_some_and(|at| at.elapsed() >= self.config.reset_timeout);
                if expired {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_successes = 0;
                    inner.probe_in_flight = true;
                    tracing::warn!("Circuit breaker transitioning to half-open");
                    true
                } else {
                    false
                }
            },
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            },
        }
    }

    /// Record a successful request or probe
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            },
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.last_failure_at = None;
                    tracing::info!("Circuit breaker closed after successful probe");
                }
            },
            CircuitState::Open => {
                // Late success from a request admitted before the trip;
                // does not reopen the gate on its own
                inner.consecutive_failures = 0;
            },
        }
    }

    /// Record a failed request or probe. Returns true if this failure
    /// tripped the breaker open (callers emit the offline event exactly
    /// once per trip).
    pub async fn record_failure(&self) -> bool {
        let mut inner = self.inner.write().await;
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    tracing::warn!(
                        threshold = self.config.failure_threshold,
                        "Circuit breaker opened after reaching failure threshold"
                    );
                    return true;
                }
                false
            },
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.probe_successes = 0;
                inner.state = CircuitState::Open;
                tracing::warn!("Circuit breaker reopened after failed probe");
                true
            },
            CircuitState::Open => false,
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.inner.read().await.consecutive_failures
    }

    /// Force the breaker back to closed (operator action)
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.probe_successes = 0;
        inner.probe_in_flight = false;
        inner.last_failure_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_millis(reset_ms),
            success_threshold: 1,
        })
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let b = breaker(3, 60_000);
        assert!(b.can_execute().await);

        for i in 0..2 {
            assert!(!b.record_failure().await);
            assert_eq!(b.consecutive_failures().await, i + 1);
            assert_eq!(b.state().await, CircuitState::Closed);
        }
        // Third failure trips it, and reports the trip exactly once
        assert!(b.record_failure().await);
        assert_eq!(b.state().await, CircuitState::Open);
        assert!(!b.can_execute().await);
        assert!(!b.record_failure().await);
    }

    #[tokio::test]
    async fn test_half_open_single_probe_then_close() {
        let b = breaker(2, 50);
        b.record_failure().await;
        b.record_failure().await;
        assert_eq!(b.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        // Exactly one probe admitted
        assert!(b.can_execute().await);
        assert_eq!(b.state().await, CircuitState::HalfOpen);
        assert!(!b.can_execute().await);

        b.record_success().await;
        assert_eq!(b.state().await, CircuitState::Closed);
        assert!(b.can_execute().await);
    }

    #[tokio::test]
    async fn test_half_open_probe_failure_reopens() {
        let b = breaker(1, 50);
        b.record_failure().await;
        assert_eq!(b.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(b.can_execute().await);

        assert!(b.record_failure().await);
        assert_eq!(b.state().await, CircuitState::Open);
        assert!(!b.can_execute().await);
    }

    #[tokio::test]
    async fn test_success_threshold_requires_consecutive_probes() {
        let b = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(20),
            success_threshold: 2,
        });
        b.record_failure().await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(b.can_execute().await);
        b.record_success().await;
        // One success is not enough yet
        assert_eq!(b.state().await, CircuitState::HalfOpen);

        assert!(b.can_execute().await);
        b.record_success().await;
        assert_eq!(b.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let b = breaker(3, 60_000);
        b.record_failure().await;
        b.record_failure().await;
        b.record_success().await;
        assert_eq!(b.consecutive_failures().await, 0);
        b.record_failure().await;
        assert_eq!(b.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_manual_reset() {
        let b = breaker(1, 60_000);
        b.record_failure().await;
        assert_eq!(b.state().await, CircuitState::Open);
        b.reset().await;
        assert_eq!(b.state().await, CircuitState::Closed);
        assert!(b.can_execute().await);
    }
}
