//! Circuit breaker implementation
//!
//! One breaker per backend. Only infrastructural failures (connect errors,
//! transport closure, timeouts) count toward opening; peer-raised errors are
//! semantic results and leave the breaker alone.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use telemetry_metrics::counter;
use tracing::{debug, info, warn};

use crate::config::FailsafeConfig;
use crate::{Error, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed (allowing requests)
    Closed,
    /// Circuit is open (blocking requests)
    Open,
    /// Circuit is half-open (one probe at a time)
    HalfOpen,
}

impl CircuitState {
    /// Lowercase label used in status output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Admission token returned by [`CircuitBreaker::admit`].
///
/// Must be handed back to `record_success` / `record_failure` so a
/// half-open probe slot is released exactly once.
#[derive(Debug)]
pub struct Admission {
    probe: bool,
}

/// Snapshot of breaker observability data, cheap to clone.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Current consecutive infrastructural failure count
    pub consecutive_failures: u32,
    /// Configured failure threshold
    pub failure_threshold: u32,
    /// Number of Closed→Open transitions so far
    pub times_opened: u64,
    /// Milliseconds until a probe is admitted (0 unless open)
    pub retry_after_ms: u64,
    /// Summary of the most recent infrastructural failure
    pub last_error: Option<String>,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    next_try_after: Option<Instant>,
    probe_in_flight: bool,
    times_opened: u64,
    last_error: Option<String>,
}

/// Per-backend circuit breaker
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    success_threshold: u32,
    open_cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker in the closed state.
    #[must_use]
    pub fn new(name: &str, config: &FailsafeConfig) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            open_cooldown: config.open_cooldown(),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                next_try_after: None,
                probe_in_flight: false,
                times_opened: 0,
                last_error: None,
            }),
        }
    }

    /// Decide whether a call may proceed.
    ///
    /// In `Open`, the first caller at or past the cooldown deadline moves the
    /// circuit to `HalfOpen` and claims the probe slot. In `HalfOpen`, the
    /// probe slot admits exactly one caller; everyone else gets
    /// [`Error::CircuitOpen`] until the probe resolves.
    pub fn admit(&self) -> Result<Admission> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission { probe: false }),
            CircuitState::Open => {
                let due = inner
                    .next_try_after
                    .is_none_or(|deadline| Instant::now() >= deadline);
                if due {
                    debug!(backend = %self.name, "Cooldown elapsed, admitting half-open probe");
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.probe_in_flight = true;
                    Ok(Admission { probe: true })
                } else {
                    Err(Error::CircuitOpen {
                        backend: self.name.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(Error::CircuitOpen {
                        backend: self.name.clone(),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(Admission { probe: true })
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        if admission.probe {
            inner.probe_in_flight = false;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.next_try_after = None;
                    inner.last_error = None;
                    counter!("goblin_circuit_transitions_total", "backend" => self.name.clone(), "to" => "closed").increment(1);
                    info!(backend = %self.name, "Circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record an infrastructural failure.
    pub fn record_failure(&self, admission: Admission, summary: &str) {
        let mut inner = self.inner.lock();
        if admission.probe {
            inner.probe_in_flight = false;
        }
        inner.last_error = Some(summary.to_string());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                warn!(backend = %self.name, "Probe failed in half-open state, reopening circuit");
                self.trip(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.consecutive_successes = 0;
        inner.next_try_after = Some(Instant::now() + self.open_cooldown);
        inner.times_opened += 1;
        counter!("goblin_circuit_transitions_total", "backend" => self.name.clone(), "to" => "open").increment(1);
        warn!(
            backend = %self.name,
            failures = inner.consecutive_failures,
            cooldown = ?self.open_cooldown,
            "Circuit breaker opened"
        );
    }

    /// Release an admission without recording an outcome.
    ///
    /// Used for cancelled requests: cancellation is caller-initiated and
    /// counts neither for nor against the backend.
    pub fn discard(&self, admission: Admission) {
        if admission.probe {
            self.inner.lock().probe_in_flight = false;
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Observability snapshot.
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        let retry_after_ms = match (inner.state, inner.next_try_after) {
            (CircuitState::Open, Some(deadline)) => {
                deadline
                    .saturating_duration_since(Instant::now())
                    .as_millis()
                    .min(u128::from(u64::MAX)) as u64
            }
            _ => 0,
        };
        CircuitBreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.failure_threshold,
            times_opened: inner.times_opened,
            retry_after_ms,
            last_error: inner.last_error.clone(),
        }
    }
}
