//! Per-session and per-factory lifecycle records.
//!
//! [`SessionMetrics`] is the single authoritative schema for per-session
//! bookkeeping in the whole system; every error path that logs session
//! state goes through the field names defined here and nothing else. The
//! serialized field set is pinned by a test below so renames cannot slip
//! in under an alias (`last_activity` instead of `last_activity_at`,
//! `errors` instead of `error_count`, ...).
//!
//! [`PoolMetrics`] aggregates over all sessions a factory ever issued.

use chrono::{DateTime, Utc};
use dbscope_types::{Identity, RequestId, SessionKey, UserId};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle states of one issued session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Registered but not yet handed to the caller.
    Created,
    /// Handed to the caller and usable.
    Active,
    /// Scope exited normally.
    Committed,
    /// Scope exited after an explicit rollback.
    RolledBack,
    /// Underlying connection returned; terminal.
    Closed,
    /// A fatal failure was recorded; terminal except for the forced-cleanup
    /// close.
    Error,
}

impl SessionState {
    /// Whether no further transitions are allowed from this state (the
    /// forced-cleanup `Error -> Closed` step excepted).
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Active => "active",
            SessionState::Committed => "committed",
            SessionState::RolledBack => "rolled_back",
            SessionState::Closed => "closed",
            SessionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Lifecycle counters and timestamps of one issued session.
///
/// Wall-clock fields are what gets serialized into reports and logs;
/// age and idle-time arithmetic runs on the tokio clock so the paused
/// test clock drives it.
#[derive(Clone, Debug, Serialize)]
pub struct SessionMetrics {
    session_id: SessionKey,
    request_id: RequestId,
    user_id: UserId,
    state: SessionState,
    created_at: DateTime<Utc>,
    last_activity_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    query_count: u64,
    transaction_count: u64,
    error_count: u64,
    last_error: Option<String>,
    total_time_ms: Option<f64>,
    #[serde(skip)]
    created_instant: Instant,
    #[serde(skip)]
    last_activity_instant: Option<Instant>,
}

impl SessionMetrics {
    /// A fresh record in state [`SessionState::Created`].
    pub fn new(session_id: SessionKey, identity: &Identity) -> Self {
        Self {
            session_id,
            request_id: identity.request_id().clone(),
            user_id: identity.user_id().clone(),
            state: SessionState::Created,
            created_at: Utc::now(),
            last_activity_at: None,
            closed_at: None,
            query_count: 0,
            transaction_count: 0,
            error_count: 0,
            last_error: None,
            total_time_ms: None,
            created_instant: Instant::now(),
            last_activity_instant: None,
        }
    }

    /// The session this record tracks.
    pub fn session_id(&self) -> &SessionKey {
        &self.session_id
    }

    /// The request the session was issued for.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// The user the session was issued for.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of statements executed through the session.
    pub fn query_count(&self) -> u64 {
        self.query_count
    }

    /// Number of transactions opened on the session.
    pub fn transaction_count(&self) -> u64 {
        self.transaction_count
    }

    /// Number of errors recorded on the session.
    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    /// The most recent recorded error, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// When the session was issued.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the session was last used, if ever.
    pub fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        self.last_activity_at
    }

    /// When the session was closed, if it was.
    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closed_at
    }

    /// Total lifetime in milliseconds, set exactly once at close.
    pub fn total_time_ms(&self) -> Option<f64> {
        self.total_time_ms
    }

    /// Time since the session was issued, on the tokio clock.
    pub fn age(&self) -> Duration {
        self.created_instant.elapsed()
    }

    /// Time since the last recorded activity, on the tokio clock. Falls
    /// back to [`SessionMetrics::age`] when the session was never used.
    pub fn idle_for(&self) -> Duration {
        self.last_activity_instant
            .map(|at| at.elapsed())
            .unwrap_or_else(|| self.age())
    }

    /// Marks recent session activity.
    pub fn mark_activity(&mut self) {
        self.last_activity_at = Some(Utc::now());
        self.last_activity_instant = Some(Instant::now());
    }

    /// Moves the record to [`SessionState::Active`]. No-op once terminal.
    pub fn mark_active(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Active;
            self.mark_activity();
        }
    }

    /// Counts one executed statement and marks activity.
    pub fn record_query(&mut self) {
        self.query_count += 1;
        self.mark_activity();
    }

    /// Counts one opened transaction and marks activity.
    pub fn record_transaction(&mut self) {
        self.transaction_count += 1;
        self.mark_activity();
    }

    /// Marks the scope as exited normally. No-op once terminal.
    pub fn mark_committed(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Committed;
            self.mark_activity();
        }
    }

    /// Marks the scope as exited after rollback. No-op once terminal.
    pub fn mark_rolled_back(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::RolledBack;
            self.mark_activity();
        }
    }

    /// Records a fatal failure: bumps `error_count`, remembers the message,
    /// moves to [`SessionState::Error`], marks activity. Allowed from any
    /// non-closed state.
    pub fn record_error(&mut self, error: impl Into<String>) {
        if self.state == SessionState::Closed {
            return;
        }
        self.error_count += 1;
        self.last_error = Some(error.into());
        self.state = SessionState::Error;
        self.mark_activity();
    }

    /// Closes the record: sets `closed_at`, moves to
    /// [`SessionState::Closed`], and computes `total_time_ms` exactly once.
    /// Idempotent.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let closed_at = Utc::now();
        self.closed_at = Some(closed_at);
        self.state = SessionState::Closed;
        if self.total_time_ms.is_none() {
            let elapsed = closed_at.signed_duration_since(self.created_at);
            let elapsed_ms = elapsed.num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000.0;
            self.total_time_ms = Some(elapsed_ms.max(0.0));
        }
    }
}

/// Aggregate counters over all sessions ever issued by one factory.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PoolMetrics {
    /// Current live-set size.
    pub active_sessions: u64,
    /// Sessions issued since the factory was created.
    pub total_sessions_created: u64,
    /// Sessions closed, including reaped leaks.
    pub sessions_closed: u64,
    /// Sessions the leak detector forcibly closed.
    pub leaked_sessions: u64,
    /// Acquisitions that failed because the pool was exhausted.
    pub pool_exhaustion_events: u64,
    /// Transitions to OPEN observed on breakers registered with the core.
    pub circuit_breaker_trips: u64,
    /// Highest observed `active_sessions`.
    pub peak_concurrent_sessions: u64,
    /// Streaming mean lifetime over `sessions_closed`.
    pub avg_session_lifetime_ms: f64,
    /// When the pool was last observed exhausted.
    pub last_pool_exhaustion: Option<DateTime<Utc>>,
    /// When the leak detector last reaped a session.
    pub last_leak_detection: Option<DateTime<Utc>>,
}

impl PoolMetrics {
    /// Raises the peak if the current live count exceeds it.
    pub fn update_peak_concurrent(&mut self, current: u64) {
        if current > self.peak_concurrent_sessions {
            self.peak_concurrent_sessions = current;
        }
    }

    /// Records one pool-exhaustion event.
    pub fn record_pool_exhaustion(&mut self) {
        self.pool_exhaustion_events += 1;
        self.last_pool_exhaustion = Some(Utc::now());
    }

    /// Records one reaped leak.
    pub fn record_leak(&mut self) {
        self.leaked_sessions += 1;
        self.last_leak_detection = Some(Utc::now());
    }

    /// Folds one closed session's lifetime into the streaming mean. Call
    /// after `sessions_closed` has been incremented for it.
    pub fn fold_lifetime(&mut self, lifetime_ms: f64) {
        debug_assert!(self.sessions_closed > 0);
        let closed = self.sessions_closed as f64;
        self.avg_session_lifetime_ms =
            (self.avg_session_lifetime_ms * (closed - 1.0) + lifetime_ms) / closed;
    }
}
