//! Request-scoped session factory with leak detection.
//!
//! The factory is the only way to obtain a database session. Every issued
//! session is tagged with the identity it was created for, registered in an
//! in-memory live-set, and handed out as an owned [`ScopedSession`] guard
//! that is valid for exactly one scope. On scope exit the factory
//! deregisters the session, returns the underlying connection to the
//! provider, and folds the lifetime into the pool metrics.
//!
//! A background leak detector periodically scans the live-set and forcibly
//! closes sessions that outlived their configured maximum lifetime. A
//! reaped session stays memory-safe for the scope that still holds it: any
//! further use fails with a lifecycle error instead of touching a
//! connection that was already returned.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dbscope_types::ident::PrefixAllowlist;
use dbscope_types::{Identity, SessionKey};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::SessionError;
use crate::metrics::{
    METRICS_ID_POOL_EXHAUSTION, METRICS_ID_SESSION_LIFETIME, METRICS_ID_SESSIONS_ACTIVE,
    METRICS_ID_SESSIONS_CLOSED, METRICS_ID_SESSIONS_CREATED, METRICS_ID_SESSIONS_LEAKED,
};
use crate::provider::{ConnectionProviderService, PoolStatus, PooledConn};
use crate::services::scope_validator::{self, SessionTag};
use crate::services::session_metrics::{PoolMetrics, SessionMetrics, SessionState};

/// Factory tunables.
#[derive(Clone, Debug)]
pub struct FactoryConfig {
    /// How long an ACTIVE session may live before the leak detector reaps
    /// it.
    pub max_session_lifetime: Duration,
    /// Cadence of the leak detector.
    pub leak_detection_interval: Duration,
    /// Master switch for the leak detector.
    pub leak_detection_enabled: bool,
    /// Accepted prefixes for persisted thread identifiers.
    pub thread_id_prefixes: PrefixAllowlist,
    /// How long `close` waits for the leak detector before abandoning it.
    pub shutdown_grace: Duration,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            max_session_lifetime: Duration::from_secs(30),
            leak_detection_interval: Duration::from_secs(60),
            leak_detection_enabled: true,
            thread_id_prefixes: PrefixAllowlist::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Per-scope options.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScopeOptions {
    /// Overall deadline for acquiring the underlying connection, on top of
    /// whatever deadline the provider enforces itself.
    pub acquire_timeout: Option<Duration>,
    /// Per-session override of the factory's maximum lifetime.
    pub max_lifetime: Option<Duration>,
}

/// Health view of one factory, rendered by
/// [`RequestScopedSessionFactory::health_check`].
#[derive(Clone, Debug, Serialize)]
pub struct FactoryHealth {
    /// `"healthy"` or `"unhealthy"`.
    pub status: String,
    /// The probe failure, when unhealthy.
    pub error: Option<String>,
    /// Aggregate counters of this factory.
    pub factory: PoolMetrics,
    /// The provider's pool usage.
    pub pool: PoolStatus,
    /// Whether the leak detector is configured to run.
    pub leak_detection_enabled: bool,
}

/// State shared between a scope guard, the live-set, and the leak detector.
struct SessionShared {
    /// The connection slot. Empty once the session was closed (orderly or
    /// forced). Held across awaits only for the duration of one statement.
    conn: tokio::sync::Mutex<Option<Box<dyn PooledConn>>>,
    /// Set on forced close; checked before every use of the handle.
    invalidated: AtomicBool,
}

struct LiveEntry {
    metrics: Arc<Mutex<SessionMetrics>>,
    shared: Arc<SessionShared>,
    max_lifetime: Duration,
}

struct FactoryState {
    live: HashMap<SessionKey, LiveEntry>,
    pool: PoolMetrics,
}

struct FactoryInner {
    provider: ConnectionProviderService,
    config: FactoryConfig,
    state: Mutex<FactoryState>,
    cancellation: CancellationToken,
    detector: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Factory issuing request-scoped database sessions with strict isolation.
///
/// Cheap to clone; all clones share the same live-set and counters.
#[derive(Clone)]
pub struct RequestScopedSessionFactory(Arc<FactoryInner>);

struct LeakDetectorTaskArgs {
    factory: RequestScopedSessionFactory,
    interval: Duration,
    cancellation_token: CancellationToken,
}

/// Background task that periodically reaps sessions exceeding their
/// lifetime bound.
///
/// Its own failures are swallowed and logged so a bad pass never kills the
/// loop; only cancellation stops it.
async fn leak_detector_task(args: LeakDetectorTaskArgs) {
    let LeakDetectorTaskArgs {
        factory,
        interval,
        cancellation_token,
    } = args;
    let mut interval = tokio::time::interval(interval);
    // first tick triggers instantly
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(err) = factory.detect_and_reap().await {
                    tracing::error!("error in leak detection pass: {err:?}");
                }
            }
            _ = cancellation_token.cancelled() => {
                tracing::debug!("leak detector cancelled");
                break;
            }
        }
    }
}

impl RequestScopedSessionFactory {
    /// Creates a factory over the given provider and starts the leak
    /// detector (unless disabled).
    ///
    /// The detector stops when `cancellation_token` is cancelled or the
    /// factory is closed, whichever happens first.
    pub fn new(
        provider: ConnectionProviderService,
        config: FactoryConfig,
        cancellation_token: CancellationToken,
    ) -> Self {
        let cancellation = cancellation_token.child_token();
        let factory = Self(Arc::new(FactoryInner {
            provider,
            config,
            state: Mutex::new(FactoryState {
                live: HashMap::new(),
                pool: PoolMetrics::default(),
            }),
            cancellation: cancellation.clone(),
            detector: Mutex::new(None),
            closed: AtomicBool::new(false),
        }));
        if factory.0.config.leak_detection_enabled {
            let handle = tokio::spawn(leak_detector_task(LeakDetectorTaskArgs {
                factory: factory.clone(),
                interval: factory.0.config.leak_detection_interval,
                cancellation_token: cancellation,
            }));
            *factory.0.detector.lock() = Some(handle);
        }
        tracing::info!(
            "initialized session factory (leak detection {})",
            if factory.0.config.leak_detection_enabled {
                "on"
            } else {
                "off"
            }
        );
        factory
    }

    /// Issues a session scoped to `identity`.
    ///
    /// Validates the identity's thread id against the prefix allowlist
    /// before anything touches the provider, acquires a connection, tags
    /// it, registers it in the live-set, and hands back the owned scope
    /// guard. Registration is the commit point: a failed acquisition moves
    /// no counter except the exhaustion event.
    #[instrument(level = "debug", skip_all, fields(user_id = %identity.user_id(), request_id = %identity.request_id()))]
    pub async fn scoped_session(
        &self,
        identity: &Identity,
        options: ScopeOptions,
    ) -> Result<ScopedSession, SessionError> {
        if self.0.closed.load(Ordering::Acquire) {
            return Err(SessionError::FactoryClosed);
        }
        if let Some(thread_id) = identity.thread_id() {
            self.0.config.thread_id_prefixes.check_thread_id(thread_id)?;
        }

        let session_id = identity.derive_session_key();
        let conn = match self.acquire(options.acquire_timeout).await {
            Ok(conn) => conn,
            Err(err) => {
                if err.is_exhaustion() {
                    self.0.state.lock().pool.record_pool_exhaustion();
                    ::metrics::counter!(METRICS_ID_POOL_EXHAUSTION).increment(1);
                }
                return Err(SessionError::Acquire {
                    user_id: identity.user_id().clone(),
                    source: err,
                });
            }
        };

        let tag = scope_validator::tag(identity, &session_id);
        // ownership and scoping are checked on every yield, including the
        // first one
        scope_validator::validate_ownership(&tag, identity.user_id())?;
        scope_validator::validate_request_scoped(&tag)?;
        scope_validator::validate_factory_managed(&tag)?;

        let metrics = Arc::new(Mutex::new(SessionMetrics::new(session_id.clone(), identity)));
        let shared = Arc::new(SessionShared {
            conn: tokio::sync::Mutex::new(Some(conn)),
            invalidated: AtomicBool::new(false),
        });

        {
            let mut state = self.0.state.lock();
            if self.0.closed.load(Ordering::Acquire) {
                drop(state);
                // lost the race against close(); give the connection back
                let conn = shared.conn.lock().await.take();
                if let Some(conn) = conn {
                    let _ = conn.close().await;
                }
                return Err(SessionError::FactoryClosed);
            }
            state.live.insert(
                session_id.clone(),
                LiveEntry {
                    metrics: Arc::clone(&metrics),
                    shared: Arc::clone(&shared),
                    max_lifetime: options
                        .max_lifetime
                        .unwrap_or(self.0.config.max_session_lifetime),
                },
            );
            state.pool.active_sessions += 1;
            state.pool.total_sessions_created += 1;
            let active = state.pool.active_sessions;
            state.pool.update_peak_concurrent(active);
        }
        metrics.lock().mark_active();
        ::metrics::gauge!(METRICS_ID_SESSIONS_ACTIVE).increment(1);
        ::metrics::counter!(METRICS_ID_SESSIONS_CREATED).increment(1);
        tracing::debug!("created request-scoped session {session_id}");

        Ok(ScopedSession {
            tag,
            metrics,
            shared,
            factory: self.clone(),
            rolled_back: false,
            finished: false,
        })
    }

    async fn acquire(
        &self,
        acquire_timeout: Option<Duration>,
    ) -> Result<Box<dyn PooledConn>, crate::provider::AcquireError> {
        match acquire_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, self.0.provider.acquire()).await
            {
                Ok(result) => result,
                Err(_) => Err(crate::provider::AcquireError::Timeout(deadline)),
            },
            None => self.0.provider.acquire().await,
        }
    }

    /// Aggregate counters of this factory.
    pub fn pool_metrics(&self) -> PoolMetrics {
        self.0.state.lock().pool.clone()
    }

    /// Snapshots of all currently live sessions.
    pub fn session_metrics(&self) -> Vec<SessionMetrics> {
        self.0
            .state
            .lock()
            .live
            .values()
            .map(|entry| entry.metrics.lock().clone())
            .collect()
    }

    /// Number of currently live sessions.
    pub fn live_count(&self) -> usize {
        self.0.state.lock().live.len()
    }

    /// Whether [`RequestScopedSessionFactory::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    /// The provider's current pool usage.
    pub fn pool_status(&self) -> PoolStatus {
        self.0.provider.pool_status()
    }

    /// One leak-detection pass: reaps every ACTIVE session over its
    /// lifetime bound (oldest first) and logs long-idle sessions as
    /// suspect.
    async fn detect_and_reap(&self) -> eyre::Result<()> {
        struct Candidate {
            session_id: SessionKey,
            metrics: Arc<Mutex<SessionMetrics>>,
            shared: Arc<SessionShared>,
            created_at: DateTime<Utc>,
            age: Duration,
        }

        let mut candidates = Vec::new();
        let mut suspects = Vec::new();
        {
            let state = self.0.state.lock();
            for (session_id, entry) in &state.live {
                let m = entry.metrics.lock();
                if m.state() != SessionState::Active {
                    continue;
                }
                let age = m.age();
                if age > entry.max_lifetime {
                    candidates.push(Candidate {
                        session_id: session_id.clone(),
                        metrics: Arc::clone(&entry.metrics),
                        shared: Arc::clone(&entry.shared),
                        created_at: m.created_at(),
                        age,
                    });
                } else if m.idle_for() > entry.max_lifetime / 2 {
                    suspects.push((session_id.clone(), m.idle_for()));
                }
            }
        }
        for (session_id, idle) in suspects {
            tracing::warn!("session {session_id} inactive for {idle:?}");
        }
        if candidates.is_empty() {
            return Ok(());
        }
        // oldest first, so the longest-leaked connection is freed first
        candidates.sort_by_key(|c| c.created_at);
        let reaped = candidates.len();
        for candidate in candidates {
            tracing::warn!(
                "detected leaked session {} (age {:?})",
                candidate.session_id,
                candidate.age
            );
            self.force_close(
                &candidate.session_id,
                &candidate.metrics,
                &candidate.shared,
                "session leaked - forced cleanup",
                true,
            )
            .await;
        }
        tracing::error!("cleaned up {reaped} leaked sessions");
        Ok(())
    }

    /// Forcibly closes one live session: invalidates the handle, returns
    /// the connection, finalizes the metrics, and removes the entry.
    async fn force_close(
        &self,
        session_id: &SessionKey,
        metrics: &Arc<Mutex<SessionMetrics>>,
        shared: &Arc<SessionShared>,
        reason: &str,
        leaked: bool,
    ) {
        shared.invalidated.store(true, Ordering::Release);
        // waits for a statement that is mid-flight on this connection
        let conn = shared.conn.lock().await.take();
        if let Some(conn) = conn {
            if let Err(err) = conn.close().await {
                tracing::warn!("error closing session {session_id}: {err:?}");
            }
        }
        let lifetime_ms = {
            let mut m = metrics.lock();
            m.record_error(reason);
            m.close();
            m.total_time_ms().unwrap_or(0.0)
        };
        let removed = {
            let mut state = self.0.state.lock();
            if state.live.remove(session_id).is_some() {
                state.pool.active_sessions = state.pool.active_sessions.saturating_sub(1);
                state.pool.sessions_closed += 1;
                if leaked {
                    state.pool.record_leak();
                }
                state.pool.fold_lifetime(lifetime_ms);
                true
            } else {
                false
            }
        };
        if removed {
            ::metrics::gauge!(METRICS_ID_SESSIONS_ACTIVE).decrement(1);
            ::metrics::counter!(METRICS_ID_SESSIONS_CLOSED).increment(1);
            ::metrics::histogram!(METRICS_ID_SESSION_LIFETIME).record(lifetime_ms);
            if leaked {
                ::metrics::counter!(METRICS_ID_SESSIONS_LEAKED).increment(1);
            }
        }
    }

    /// Removes a session from the live-set after an orderly close and
    /// updates the counters. No-op when the entry was already reaped.
    fn deregister(&self, session_id: &SessionKey, metrics: &Arc<Mutex<SessionMetrics>>) {
        let lifetime_ms = {
            let mut m = metrics.lock();
            m.close();
            m.total_time_ms().unwrap_or(0.0)
        };
        let removed = {
            let mut state = self.0.state.lock();
            if state.live.remove(session_id).is_some() {
                state.pool.active_sessions = state.pool.active_sessions.saturating_sub(1);
                state.pool.sessions_closed += 1;
                state.pool.fold_lifetime(lifetime_ms);
                Some(state.pool.active_sessions)
            } else {
                None
            }
        };
        if let Some(active) = removed {
            ::metrics::gauge!(METRICS_ID_SESSIONS_ACTIVE).decrement(1);
            ::metrics::counter!(METRICS_ID_SESSIONS_CLOSED).increment(1);
            ::metrics::histogram!(METRICS_ID_SESSION_LIFETIME).record(lifetime_ms);
            tracing::debug!("unregistered session {session_id}, active: {active}");
        }
    }

    /// Opens a probe scope, runs `SELECT 1`, and renders a health view.
    /// Probe failures render an unhealthy report instead of propagating.
    pub async fn health_check(&self) -> FactoryHealth {
        let probe: eyre::Result<()> = async {
            let identity = Identity::builder("health_check").build()?;
            let mut scope = self.scoped_session(&identity, ScopeOptions::default()).await?;
            scope.execute("SELECT 1").await?;
            scope.finish().await?;
            Ok(())
        }
        .await;
        let factory = self.pool_metrics();
        let pool = self.0.provider.pool_status();
        match probe {
            Ok(()) => FactoryHealth {
                status: "healthy".to_owned(),
                error: None,
                factory,
                pool,
                leak_detection_enabled: self.0.config.leak_detection_enabled,
            },
            Err(err) => {
                tracing::error!("session factory health check failed: {err:?}");
                FactoryHealth {
                    status: "unhealthy".to_owned(),
                    error: Some(format!("{err:#}")),
                    factory,
                    pool,
                    leak_detection_enabled: self.0.config.leak_detection_enabled,
                }
            }
        }
    }

    /// Closes the factory: stops the leak detector (bounded join), then
    /// force-closes every remaining live session with reason
    /// "factory shutdown - forced cleanup". Idempotent.
    #[instrument(level = "info", skip_all)]
    pub async fn close(&self) {
        if self.0.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("closing session factory");
        self.0.cancellation.cancel();
        let handle = self.0.detector.lock().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(self.0.config.shutdown_grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!("leak detector ended abnormally: {err:?}"),
                Err(_) => tracing::warn!(
                    "leak detector did not stop within {:?}, abandoning it",
                    self.0.config.shutdown_grace
                ),
            }
        }

        let drained: Vec<(SessionKey, LiveEntry)> =
            { self.0.state.lock().live.drain().collect() };
        if !drained.is_empty() {
            tracing::warn!("force closing {} active sessions", drained.len());
        }
        for (session_id, entry) in drained {
            entry.shared.invalidated.store(true, Ordering::Release);
            let conn = entry.shared.conn.lock().await.take();
            if let Some(conn) = conn
                && let Err(err) = conn.close().await
            {
                tracing::warn!("error closing session {session_id} during shutdown: {err:?}");
            }
            let lifetime_ms = {
                let mut m = entry.metrics.lock();
                m.record_error("factory shutdown - forced cleanup");
                m.close();
                m.total_time_ms().unwrap_or(0.0)
            };
            let mut state = self.0.state.lock();
            state.pool.active_sessions = state.pool.active_sessions.saturating_sub(1);
            state.pool.sessions_closed += 1;
            state.pool.fold_lifetime(lifetime_ms);
            drop(state);
            ::metrics::gauge!(METRICS_ID_SESSIONS_ACTIVE).decrement(1);
            ::metrics::counter!(METRICS_ID_SESSIONS_CLOSED).increment(1);
        }
        tracing::info!("session factory closed");
    }
}

/// An issued database session, valid for exactly one scope.
///
/// The guard owns the session: it is not `Clone`, so a consumer cannot
/// stash a copy beyond the scope it was issued for.
///
/// ```compile_fail
/// // session handles cannot be duplicated and stored away
/// fn stash(session: &dbscope::services::session_factory::ScopedSession)
///     -> dbscope::services::session_factory::ScopedSession {
///     session.clone()
/// }
/// ```
///
/// End a scope with [`ScopedSession::finish`] (normal exit) or
/// [`ScopedSession::abort`] (error exit, rolls back an open transaction).
/// Dropping the guard without either runs the error path synchronously:
/// the session is invalidated, deregistered, and the connection released.
pub struct ScopedSession {
    tag: SessionTag,
    metrics: Arc<Mutex<SessionMetrics>>,
    shared: Arc<SessionShared>,
    factory: RequestScopedSessionFactory,
    rolled_back: bool,
    finished: bool,
}

impl std::fmt::Debug for ScopedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedSession")
            .field("tag", &self.tag)
            .field("rolled_back", &self.rolled_back)
            .field("finished", &self.finished)
            .finish()
    }
}

impl ScopedSession {
    /// The identity tag attached at issue time.
    pub fn tag(&self) -> &SessionTag {
        &self.tag
    }

    /// The session's key.
    pub fn session_id(&self) -> &SessionKey {
        &self.tag.session_id
    }

    /// A snapshot of the session's metrics record.
    pub fn metrics(&self) -> SessionMetrics {
        self.metrics.lock().clone()
    }

    fn ensure_usable(&self) -> Result<(), SessionError> {
        if self.shared.invalidated.load(Ordering::Acquire) {
            Err(SessionError::Lifecycle {
                session_id: self.tag.session_id.clone(),
                reason: "session was forcibly closed".to_owned(),
            })
        } else {
            Ok(())
        }
    }

    /// Executes a statement on the session.
    ///
    /// A backend failure surfaces without ending the session; the scope
    /// decides whether to continue or [`ScopedSession::abort`].
    pub async fn execute(&mut self, sql: &str) -> Result<u64, SessionError> {
        self.ensure_usable()?;
        let mut slot = self.shared.conn.lock().await;
        let conn = slot.as_mut().ok_or_else(|| SessionError::Lifecycle {
            session_id: self.tag.session_id.clone(),
            reason: "session is closed".to_owned(),
        })?;
        match conn.execute(sql).await {
            Ok(rows) => {
                self.metrics.lock().record_query();
                Ok(rows)
            }
            Err(err) => Err(SessionError::Backend {
                session_id: self.tag.session_id.clone(),
                cause: err,
            }),
        }
    }

    /// Opens a transaction on the session.
    pub async fn begin(&mut self) -> Result<(), SessionError> {
        self.ensure_usable()?;
        let mut slot = self.shared.conn.lock().await;
        let conn = slot.as_mut().ok_or_else(|| SessionError::Lifecycle {
            session_id: self.tag.session_id.clone(),
            reason: "session is closed".to_owned(),
        })?;
        conn.begin().await.map_err(|err| SessionError::Backend {
            session_id: self.tag.session_id.clone(),
            cause: err,
        })?;
        self.metrics.lock().record_transaction();
        Ok(())
    }

    /// Commits the open transaction.
    pub async fn commit(&mut self) -> Result<(), SessionError> {
        self.ensure_usable()?;
        let mut slot = self.shared.conn.lock().await;
        let conn = slot.as_mut().ok_or_else(|| SessionError::Lifecycle {
            session_id: self.tag.session_id.clone(),
            reason: "session is closed".to_owned(),
        })?;
        conn.commit().await.map_err(|err| SessionError::Backend {
            session_id: self.tag.session_id.clone(),
            cause: err,
        })
    }

    /// Rolls back the open transaction.
    pub async fn rollback(&mut self) -> Result<(), SessionError> {
        self.ensure_usable()?;
        let mut slot = self.shared.conn.lock().await;
        let conn = slot.as_mut().ok_or_else(|| SessionError::Lifecycle {
            session_id: self.tag.session_id.clone(),
            reason: "session is closed".to_owned(),
        })?;
        conn.rollback().await.map_err(|err| SessionError::Backend {
            session_id: self.tag.session_id.clone(),
            cause: err,
        })
    }

    /// Whether a transaction is currently open.
    pub async fn in_transaction(&self) -> bool {
        self.shared
            .conn
            .lock()
            .await
            .as_ref()
            .map(|conn| conn.in_transaction())
            .unwrap_or(false)
    }

    /// Marks the scope's outcome as rolled back; the record will end in
    /// `rolled_back` instead of `committed` when the scope finishes.
    pub fn mark_rolled_back(&mut self) {
        self.rolled_back = true;
    }

    /// Ends the scope normally: records the outcome, returns the
    /// connection to the provider, and deregisters the session.
    ///
    /// Closing is exactly-once; finishing a session the leak detector
    /// already reaped is a no-op apart from the outcome record.
    pub async fn finish(mut self) -> Result<(), SessionError> {
        self.finished = true;
        {
            let mut m = self.metrics.lock();
            if self.rolled_back {
                m.mark_rolled_back();
            } else {
                m.mark_committed();
            }
        }
        let conn = self.shared.conn.lock().await.take();
        self.shared.invalidated.store(true, Ordering::Release);
        let close_result = match conn {
            Some(conn) => conn.close().await,
            None => Ok(()),
        };
        if let Err(err) = &close_result {
            tracing::error!(
                "failed to close session {}: {err:?}",
                self.tag.session_id
            );
            self.metrics.lock().record_error(format!("close failed: {err}"));
        }
        self.factory.deregister(&self.tag.session_id, &self.metrics);
        close_result.map_err(|err| SessionError::Backend {
            session_id: self.tag.session_id.clone(),
            cause: err,
        })
    }

    /// Ends the scope on the error path: records the error, rolls back an
    /// open transaction, closes, and deregisters. The caller keeps its own
    /// error; a close failure here is logged, not returned.
    pub async fn abort(mut self, reason: &str) -> Result<(), SessionError> {
        self.finished = true;
        self.metrics.lock().record_error(reason);
        tracing::error!("error in request-scoped session {}: {reason}", self.tag.session_id);
        {
            let mut slot = self.shared.conn.lock().await;
            if let Some(conn) = slot.as_mut()
                && conn.in_transaction()
                && let Err(err) = conn.rollback().await
            {
                tracing::error!(
                    "failed to roll back session {}: {err:?}",
                    self.tag.session_id
                );
            }
        }
        let conn = self.shared.conn.lock().await.take();
        self.shared.invalidated.store(true, Ordering::Release);
        if let Some(conn) = conn
            && let Err(err) = conn.close().await
        {
            tracing::error!("failed to close session {}: {err:?}", self.tag.session_id);
        }
        self.factory.deregister(&self.tag.session_id, &self.metrics);
        Ok(())
    }
}

impl Drop for ScopedSession {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // dropped without finish/abort: the enclosing task was cancelled or
        // the scope forgot its teardown
        self.shared.invalidated.store(true, Ordering::Release);
        {
            let mut m = self.metrics.lock();
            if !m.state().is_terminal() {
                m.record_error("scope cancelled before teardown");
            }
        }
        // the provider treats a dropped handle like a close
        if let Ok(mut slot) = self.shared.conn.try_lock() {
            drop(slot.take());
        }
        self.factory.deregister(&self.tag.session_id, &self.metrics);
    }
}
