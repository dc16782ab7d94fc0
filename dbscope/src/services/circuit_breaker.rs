//! Three-state circuit breaker guarding calls to an external dependency.
//!
//! A breaker passes calls through while CLOSED, fails fast while OPEN, and
//! probes with bounded concurrency while HALF_OPEN. Every call runs under
//! the configured per-call deadline, so the data path is never blocked for
//! longer than `call_timeout` by a sick dependency, whatever state the
//! breaker is in.
//!
//! State transitions are atomic behind the breaker mutex: observers only
//! ever see CLOSED, OPEN, or HALF_OPEN. The last few transitions are kept
//! in a bounded audit ring for the health report.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::metrics::{METRICS_ID_BREAKER_REJECTED, METRICS_ID_BREAKER_TRANSITIONS};

/// The three breaker states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Failures exceeded the threshold, calls fail fast.
    Open,
    /// Testing whether the dependency recovered.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Tunables of one breaker. Defaults are typical, not sacred.
#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Failure rate over the rolling window that opens the breaker.
    pub failure_rate_threshold: f64,
    /// Calls required before the rate check applies.
    pub min_calls_for_rate: u64,
    /// Consecutive half-open successes that close the breaker.
    pub success_threshold: u32,
    /// Per-call deadline.
    pub call_timeout: Duration,
    /// How long to stay OPEN before probing.
    pub recovery_timeout: Duration,
    /// Concurrency cap while HALF_OPEN.
    pub half_open_max_in_flight: u32,
    /// Rolling stats are zeroed after this long without a failure.
    pub stat_decay_after: Duration,
    /// Capacity of the transition audit ring.
    pub audit_capacity: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            min_calls_for_rate: 10,
            success_threshold: 2,
            call_timeout: Duration::from_secs(5),
            recovery_timeout: Duration::from_secs(15),
            half_open_max_in_flight: 3,
            stat_decay_after: Duration::from_secs(60),
            audit_capacity: 16,
        }
    }
}

impl CircuitBreakerConfig {
    /// The relaxed profile for dev/demo setups: slower to open, quicker to
    /// recover, more generous deadlines.
    pub fn relaxed() -> Self {
        Self {
            failure_threshold: 10,
            failure_rate_threshold: 0.7,
            min_calls_for_rate: 5,
            success_threshold: 2,
            call_timeout: Duration::from_secs(10),
            recovery_timeout: Duration::from_secs(30),
            half_open_max_in_flight: 5,
            stat_decay_after: Duration::from_secs(30),
            audit_capacity: 16,
        }
    }
}

/// Rolling statistics of one breaker.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CircuitBreakerStats {
    /// Calls attempted through the breaker.
    pub total_calls: u64,
    /// Calls that returned successfully.
    pub successful_calls: u64,
    /// Calls that failed, timed out, or were cancelled.
    pub failed_calls: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Successes since the last failure.
    pub consecutive_successes: u32,
    /// When the last failure happened.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// When the last success happened.
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    last_failure_instant: Option<Instant>,
}

impl CircuitBreakerStats {
    /// Current failure rate over the rolling window.
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.failed_calls as f64 / self.total_calls as f64
        }
    }

    fn reset_rolling(&mut self) {
        self.total_calls = 0;
        self.successful_calls = 0;
        self.failed_calls = 0;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
    }
}

/// One recorded state transition.
#[derive(Clone, Debug, Serialize)]
pub struct StateTransition {
    /// State before the transition.
    pub from: CircuitState,
    /// State after the transition.
    pub to: CircuitState,
    /// When the transition happened.
    pub at: DateTime<Utc>,
    /// Why the transition happened.
    pub reason: String,
}

/// Serializable view of one breaker for the health report.
#[derive(Clone, Debug, Serialize)]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Current failure rate.
    pub failure_rate: f64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// When the last failure happened.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// When the last success happened.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Times the breaker has opened since creation.
    pub trips: u64,
    /// The most recent state transitions, oldest first.
    pub recent_transitions: Vec<StateTransition>,
}

/// How a call through the breaker failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// The dependency returned an error.
    Error,
    /// The per-call deadline elapsed.
    Timeout,
    /// The caller dropped the call before it completed.
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Error => "error",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Errors a call through the breaker can fail with.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The breaker is OPEN; the dependency was not called.
    #[error("circuit breaker '{breaker}' is open")]
    Open {
        /// The rejecting breaker.
        breaker: String,
    },
    /// The breaker is HALF_OPEN and probing at capacity; the dependency
    /// was not called.
    #[error("circuit breaker '{breaker}' is half-open and probing at capacity")]
    HalfOpen {
        /// The rejecting breaker.
        breaker: String,
    },
    /// The per-call deadline elapsed.
    #[error("call through circuit breaker '{breaker}' timed out after {after:?}")]
    Timeout {
        /// The enforcing breaker.
        breaker: String,
        /// The enforced deadline.
        after: Duration,
    },
    /// The dependency itself failed; recorded as a breaker failure.
    #[error("dependency call failed")]
    Inner(
        /// The dependency's own error.
        E,
    ),
}

impl<E> BreakerError<E> {
    /// The dependency's own error, when that is what failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Whether the breaker rejected the call without reaching the
    /// dependency.
    pub fn is_rejection(&self) -> bool {
        matches!(self, BreakerError::Open { .. } | BreakerError::HalfOpen { .. })
    }
}

struct Inner {
    state: CircuitState,
    stats: CircuitBreakerStats,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    trips: u64,
    transitions: VecDeque<StateTransition>,
}

/// A named circuit breaker wrapping calls to one external dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// A breaker with the given name and config, starting CLOSED.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        tracing::info!(
            "circuit breaker '{name}' initialized: threshold={}",
            config.failure_threshold
        );
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                stats: CircuitBreakerStats::default(),
                opened_at: None,
                half_open_in_flight: 0,
                trips: 0,
                transitions: VecDeque::new(),
            }),
        }
    }

    /// The breaker's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The breaker's config.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. Also performs the OPEN→HALF_OPEN transition when the
    /// recovery timeout has elapsed, so observers never see a stale OPEN.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_enter_half_open(&mut inner);
        inner.state
    }

    /// A copy of the rolling stats.
    pub fn stats(&self) -> CircuitBreakerStats {
        self.inner.lock().stats.clone()
    }

    /// Times the breaker has opened since creation.
    pub fn trips(&self) -> u64 {
        self.inner.lock().trips
    }

    /// The recorded transitions, oldest first.
    pub fn transitions(&self) -> Vec<StateTransition> {
        self.inner.lock().transitions.iter().cloned().collect()
    }

    /// Serializable view for the health report.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        self.maybe_enter_half_open(&mut inner);
        BreakerSnapshot {
            state: inner.state,
            failure_rate: inner.stats.failure_rate(),
            consecutive_failures: inner.stats.consecutive_failures,
            last_failure_at: inner.stats.last_failure_at,
            last_success_at: inner.stats.last_success_at,
            trips: inner.trips,
            recent_transitions: inner.transitions.iter().cloned().collect(),
        }
    }

    /// Executes `op` through the breaker.
    ///
    /// The call runs under [`CircuitBreakerConfig::call_timeout`]; a
    /// deadline overrun counts as a failure of kind `timeout`. Dropping the
    /// returned future before it resolves counts as a failure of kind
    /// `cancelled` — the bookkeeping runs on the drop path, so the
    /// half-open in-flight slot is always returned.
    pub async fn call<T, E, F>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        E: fmt::Display,
        F: Future<Output = Result<T, E>>,
    {
        let half_open_entry = {
            let mut inner = self.inner.lock();
            self.maybe_enter_half_open(&mut inner);
            match inner.state {
                CircuitState::Open => {
                    ::metrics::counter!(METRICS_ID_BREAKER_REJECTED).increment(1);
                    return Err(BreakerError::Open {
                        breaker: self.name.clone(),
                    });
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight >= self.config.half_open_max_in_flight {
                        ::metrics::counter!(METRICS_ID_BREAKER_REJECTED).increment(1);
                        return Err(BreakerError::HalfOpen {
                            breaker: self.name.clone(),
                        });
                    }
                    inner.half_open_in_flight += 1;
                    true
                }
                CircuitState::Closed => false,
            }
        };

        let mut guard = InFlightGuard {
            breaker: self,
            half_open_entry,
            outcome_recorded: false,
        };
        match tokio::time::timeout(self.config.call_timeout, op).await {
            Ok(Ok(value)) => {
                guard.success();
                Ok(value)
            }
            Ok(Err(err)) => {
                guard.failure(FailureKind::Error, err.to_string());
                Err(BreakerError::Inner(err))
            }
            Err(_) => {
                let after = self.config.call_timeout;
                guard.failure(FailureKind::Timeout, format!("deadline {after:?} elapsed"));
                Err(BreakerError::Timeout {
                    breaker: self.name.clone(),
                    after,
                })
            }
        }
    }

    /// Manually resets the breaker to CLOSED with zeroed counters.
    /// Idempotent.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            let from = inner.state;
            inner.state = CircuitState::Closed;
            self.push_transition(&mut inner, from, CircuitState::Closed, "manual reset");
        }
        inner.stats.reset_rolling();
        inner.opened_at = None;
        inner.half_open_in_flight = 0;
        tracing::info!("circuit breaker '{}' manually reset to closed", self.name);
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.stats.total_calls += 1;
        inner.stats.successful_calls += 1;
        inner.stats.consecutive_successes += 1;
        inner.stats.consecutive_failures = 0;
        inner.stats.last_success_at = Some(Utc::now());

        if inner.state == CircuitState::HalfOpen
            && inner.stats.consecutive_successes >= self.config.success_threshold
        {
            self.to_closed(&mut inner);
        }

        // a long quiet period since the last failure retires the old stats
        if let Some(last_failure) = inner.stats.last_failure_instant
            && last_failure.elapsed() > self.config.stat_decay_after
        {
            inner.stats.reset_rolling();
            inner.stats.last_failure_instant = None;
        }
    }

    fn on_failure(&self, kind: FailureKind, detail: String) {
        let mut inner = self.inner.lock();
        inner.stats.total_calls += 1;
        inner.stats.failed_calls += 1;
        inner.stats.consecutive_failures += 1;
        inner.stats.consecutive_successes = 0;
        inner.stats.last_failure_at = Some(Utc::now());
        inner.stats.last_failure_instant = Some(Instant::now());

        tracing::warn!(
            "circuit breaker '{}' failure #{} ({kind}): {detail}",
            self.name,
            inner.stats.consecutive_failures
        );

        let should_open = inner.stats.consecutive_failures >= self.config.failure_threshold
            || (inner.stats.total_calls >= self.config.min_calls_for_rate
                && inner.stats.failure_rate() >= self.config.failure_rate_threshold);

        if should_open && inner.state != CircuitState::Open {
            self.to_open(&mut inner);
        } else if inner.state == CircuitState::HalfOpen {
            // a single failed probe sends us back to open
            self.to_open(&mut inner);
        }
    }

    fn maybe_enter_half_open(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.config.recovery_timeout
        {
            let from = inner.state;
            inner.state = CircuitState::HalfOpen;
            inner.half_open_in_flight = 0;
            inner.stats.consecutive_failures = 0;
            inner.stats.consecutive_successes = 0;
            self.push_transition(inner, from, CircuitState::HalfOpen, "testing recovery");
            tracing::info!("circuit breaker '{}' half-open: testing recovery", self.name);
        }
    }

    fn to_open(&self, inner: &mut Inner) {
        let from = inner.state;
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_in_flight = 0;
        inner.trips += 1;
        let reason = format!(
            "failures: {}, rate: {:.2}",
            inner.stats.consecutive_failures,
            inner.stats.failure_rate()
        );
        self.push_transition(inner, from, CircuitState::Open, &reason);
        tracing::error!(
            "circuit breaker '{}' opened: consecutive_failures={}, failure_rate={:.2}",
            self.name,
            inner.stats.consecutive_failures,
            inner.stats.failure_rate()
        );
    }

    fn to_closed(&self, inner: &mut Inner) {
        let from = inner.state;
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.half_open_in_flight = 0;
        inner.stats.reset_rolling();
        self.push_transition(inner, from, CircuitState::Closed, "service recovered");
        tracing::info!("circuit breaker '{}' closed: service recovered", self.name);
    }

    fn push_transition(&self, inner: &mut Inner, from: CircuitState, to: CircuitState, reason: &str) {
        if inner.transitions.len() >= self.config.audit_capacity {
            inner.transitions.pop_front();
        }
        inner.transitions.push_back(StateTransition {
            from,
            to,
            at: Utc::now(),
            reason: reason.to_owned(),
        });
        ::metrics::counter!(METRICS_ID_BREAKER_TRANSITIONS).increment(1);
    }
}

/// Bookkeeping guard for one in-flight call.
///
/// Completion is recorded explicitly; if the guard drops without a recorded
/// outcome the call was cancelled by the caller and counts as a failure.
/// The half-open slot is always given back on the drop path.
struct InFlightGuard<'a> {
    breaker: &'a CircuitBreaker,
    half_open_entry: bool,
    outcome_recorded: bool,
}

impl InFlightGuard<'_> {
    fn success(&mut self) {
        self.outcome_recorded = true;
        self.breaker.on_success();
    }

    fn failure(&mut self, kind: FailureKind, detail: String) {
        self.outcome_recorded = true;
        self.breaker.on_failure(kind, detail);
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.outcome_recorded {
            self.breaker.on_failure(
                FailureKind::Cancelled,
                "caller cancelled the call".to_owned(),
            );
        }
        if self.half_open_entry {
            let mut inner = self.breaker.inner.lock();
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }
}
