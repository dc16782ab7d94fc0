#![deny(missing_docs)]
//! Per-request database session isolation and auth resilience core.
//!
//! This crate sits between application request handlers and a relational
//! database. Every unit of work (an HTTP request, a WebSocket message, an
//! agent invocation) obtains a freshly scoped database session bound to a
//! single user/request identity through [`SessionCore::with_session`]; no
//! session outlives its request, and failures of the remote authentication
//! dependency degrade gracefully instead of cascading into the data path.
//!
//! Three services carry the guarantees (see the [`services`] module):
//! the request-scoped session factory issues, tags, tracks, and reaps
//! sessions; the scope validator enforces identity invariants on every
//! handle; and a named circuit breaker bounds every call to the auth
//! service by a per-call deadline, serving cached verdicts while the
//! dependency is down.
//!
//! The main entry point for hosting applications is [`SessionCoreCell`]:
//! it lazily builds the single [`SessionCore`] instance of the process and
//! swaps it out on shutdown, so a post-shutdown `get_or_init` yields a
//! fresh instance. The cell is handed the two external collaborators the
//! core builds on: a [`provider::ConnectionProvider`] owning the real
//! connection pool, and an [`dbscope_types::auth::AuthApi`] client for the
//! authentication service.
//!
//! Cancelling the provided `CancellationToken` stops the background leak
//! detector; for a graceful shutdown call [`SessionCore::shutdown`] (or
//! [`SessionCoreCell::shutdown`]), which also force-closes any session
//! still live and clears the token cache.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dbscope_types::Identity;
use dbscope_types::auth::{AuthApiService, AuthGrant, AuthVerdict};
use parking_lot::Mutex;
use secrecy::SecretString;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::CoreSettings;
use crate::error::{AuthError, SessionError};
use crate::metrics::{
    METRICS_ID_AUTH_DEGRADED, METRICS_ID_SESSIONS_ACTIVE, METRICS_ID_TOKEN_CACHE_HITS,
    METRICS_ID_TOKEN_CACHE_MISSES,
};
use crate::provider::{ConnectionProviderService, PoolStatus};
use crate::services::circuit_breaker::{BreakerError, BreakerSnapshot, CircuitBreaker};
use crate::services::session_factory::{
    FactoryHealth, RequestScopedSessionFactory, ScopeOptions, ScopedSession,
};
use crate::services::session_metrics::PoolMetrics;
use crate::services::token_cache::TokenCache;

pub mod config;
pub mod error;
pub mod metrics;
pub mod provider;
pub mod services;

/// Name of the breaker guarding the authentication service.
pub const AUTH_BREAKER_NAME: &str = "auth_service";

/// The process-wide facade over the session factory and the breaker
/// registry.
///
/// One instance per process; obtain it through a [`SessionCoreCell`].
pub struct SessionCore {
    factory: RequestScopedSessionFactory,
    auth: AuthApiService,
    token_cache: TokenCache,
    breaker_config: crate::services::circuit_breaker::CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

/// Aggregated health view emitted by [`SessionCore::health`].
#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    /// `"healthy"` or `"unhealthy"`.
    pub status: String,
    /// Factory counters.
    pub factory: FactorySummary,
    /// The provider's pool usage.
    pub pool: PoolStatus,
    /// Per-breaker state and statistics.
    pub breakers: BTreeMap<String, BreakerSnapshot>,
}

/// The factory counters of the health report.
#[derive(Clone, Debug, Serialize)]
pub struct FactorySummary {
    /// Currently live sessions.
    pub active: u64,
    /// Sessions issued since the factory was created.
    pub total_created: u64,
    /// Sessions closed, reaped leaks included.
    pub total_closed: u64,
    /// Sessions the leak detector forcibly closed.
    pub leaked: u64,
    /// Highest observed live count.
    pub peak: u64,
    /// Streaming mean lifetime of closed sessions.
    pub avg_lifetime_ms: f64,
}

impl From<&PoolMetrics> for FactorySummary {
    fn from(pool: &PoolMetrics) -> Self {
        Self {
            active: pool.active_sessions,
            total_created: pool.total_sessions_created,
            total_closed: pool.sessions_closed,
            leaked: pool.leaked_sessions,
            peak: pool.peak_concurrent_sessions,
            avg_lifetime_ms: pool.avg_session_lifetime_ms,
        }
    }
}

impl SessionCore {
    /// Initializes the core: starts the session factory (and its leak
    /// detector) over `provider` and registers the auth breaker.
    ///
    /// Must be called from within a tokio runtime; the leak detector is
    /// spawned onto it.
    pub fn init(
        settings: CoreSettings,
        provider: ConnectionProviderService,
        auth: AuthApiService,
        cancellation_token: CancellationToken,
    ) -> Self {
        ::metrics::gauge!(METRICS_ID_SESSIONS_ACTIVE).set(0);
        let factory =
            RequestScopedSessionFactory::new(provider, settings.factory, cancellation_token);
        let mut breakers = HashMap::new();
        breakers.insert(
            AUTH_BREAKER_NAME.to_owned(),
            Arc::new(CircuitBreaker::new(
                AUTH_BREAKER_NAME,
                settings.auth_breaker.clone(),
            )),
        );
        tracing::info!("session core initialized");
        Self {
            factory,
            auth,
            token_cache: TokenCache::new(settings.token_cache_ttl),
            breaker_config: settings.auth_breaker,
            breakers: Mutex::new(breakers),
        }
    }

    /// The session factory.
    pub fn factory(&self) -> &RequestScopedSessionFactory {
        &self.factory
    }

    /// Issues a session scoped to `identity` with default options.
    pub async fn with_session(&self, identity: &Identity) -> Result<ScopedSession, SessionError> {
        self.factory
            .scoped_session(identity, ScopeOptions::default())
            .await
    }

    /// Issues a session scoped to `identity` with explicit options.
    pub async fn with_session_opts(
        &self,
        identity: &Identity,
        options: ScopeOptions,
    ) -> Result<ScopedSession, SessionError> {
        self.factory.scoped_session(identity, options).await
    }

    /// The named breaker, created on demand with this core's breaker
    /// config.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        if let Some(breaker) = breakers.get(name) {
            return Arc::clone(breaker);
        }
        let breaker = Arc::new(CircuitBreaker::new(name, self.breaker_config.clone()));
        breakers.insert(name.to_owned(), Arc::clone(&breaker));
        breaker
    }

    /// Manually resets the named breaker to CLOSED. Returns whether a
    /// breaker with that name exists.
    pub fn reset_breaker(&self, name: &str) -> bool {
        let breaker = { self.breakers.lock().get(name).cloned() };
        match breaker {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Validates a token through the auth breaker.
    ///
    /// Positive verdicts are cached by token fingerprint. While the breaker
    /// rejects calls (OPEN, or HALF_OPEN at probe capacity), a cached
    /// verdict is served with `degraded: true`; without one the call fails
    /// with [`AuthError::Unavailable`]. Negative verdicts are never cached.
    #[instrument(level = "debug", skip_all)]
    pub async fn authenticate(&self, token: &SecretString) -> Result<AuthVerdict, AuthError> {
        let breaker = self.breaker(AUTH_BREAKER_NAME);
        match breaker.call(self.auth.validate(token)).await {
            Ok(verdict) => {
                if verdict.valid {
                    self.token_cache.insert(token, &verdict);
                }
                Ok(verdict)
            }
            Err(BreakerError::Open { .. }) | Err(BreakerError::HalfOpen { .. }) => {
                match self.token_cache.lookup(token) {
                    Some(mut cached) => {
                        cached.degraded = true;
                        ::metrics::counter!(METRICS_ID_TOKEN_CACHE_HITS).increment(1);
                        ::metrics::counter!(METRICS_ID_AUTH_DEGRADED).increment(1);
                        tracing::warn!(
                            "auth breaker rejected the call, serving degraded verdict from cache"
                        );
                        Ok(cached)
                    }
                    None => {
                        ::metrics::counter!(METRICS_ID_TOKEN_CACHE_MISSES).increment(1);
                        Err(AuthError::Unavailable {
                            breaker: AUTH_BREAKER_NAME.to_owned(),
                        })
                    }
                }
            }
            Err(BreakerError::Timeout { breaker, after }) => {
                Err(AuthError::Timeout { breaker, after })
            }
            Err(BreakerError::Inner(report)) => Err(AuthError::Service(report)),
        }
    }

    /// Exchanges a refresh token through the auth breaker. No cache
    /// fallback; a rejected call surfaces as [`AuthError::Unavailable`].
    pub async fn refresh(&self, refresh_token: &SecretString) -> Result<AuthGrant, AuthError> {
        let breaker = self.breaker(AUTH_BREAKER_NAME);
        match breaker.call(self.auth.refresh(refresh_token)).await {
            Ok(grant) => Ok(grant),
            Err(BreakerError::Open { .. }) | Err(BreakerError::HalfOpen { .. }) => {
                Err(AuthError::Unavailable {
                    breaker: AUTH_BREAKER_NAME.to_owned(),
                })
            }
            Err(BreakerError::Timeout { breaker, after }) => {
                Err(AuthError::Timeout { breaker, after })
            }
            Err(BreakerError::Inner(report)) => Err(AuthError::Service(report)),
        }
    }

    /// Logs a token out through the auth breaker.
    ///
    /// The token-cache entry is purged up front, whatever the service
    /// answers: after a logout request no degraded verdict may be served
    /// for that token.
    pub async fn logout(&self, token: &SecretString) -> Result<bool, AuthError> {
        self.token_cache.purge(token);
        let breaker = self.breaker(AUTH_BREAKER_NAME);
        match breaker.call(self.auth.logout(token)).await {
            Ok(confirmed) => Ok(confirmed),
            Err(BreakerError::Open { .. }) | Err(BreakerError::HalfOpen { .. }) => {
                Err(AuthError::Unavailable {
                    breaker: AUTH_BREAKER_NAME.to_owned(),
                })
            }
            Err(BreakerError::Timeout { breaker, after }) => {
                Err(AuthError::Timeout { breaker, after })
            }
            Err(BreakerError::Inner(report)) => Err(AuthError::Service(report)),
        }
    }

    /// Aggregate counters of the factory, with breaker trips folded in.
    pub fn pool_metrics(&self) -> PoolMetrics {
        let mut pool = self.factory.pool_metrics();
        pool.circuit_breaker_trips = self
            .breakers
            .lock()
            .values()
            .map(|breaker| breaker.trips())
            .sum();
        pool
    }

    /// Aggregated health: factory probe, provider pool status, and every
    /// registered breaker.
    pub async fn health(&self) -> HealthReport {
        let factory_health: FactoryHealth = self.factory.health_check().await;
        let pool_metrics = self.pool_metrics();
        let breakers = {
            self.breakers
                .lock()
                .iter()
                .map(|(name, breaker)| (name.clone(), breaker.snapshot()))
                .collect()
        };
        HealthReport {
            status: factory_health.status,
            factory: FactorySummary::from(&pool_metrics),
            pool: factory_health.pool,
            breakers,
        }
    }

    /// Shuts the core down: closes the factory (force-closing any live
    /// session) and clears the token cache. Idempotent.
    #[instrument(level = "info", skip_all)]
    pub async fn shutdown(&self) {
        self.factory.close().await;
        self.token_cache.clear();
        tracing::info!("session core shutdown complete");
    }
}

/// Owner of the single [`SessionCore`] instance of a process.
///
/// `get_or_init` memoizes the instance and is safe under concurrent first
/// use; `shutdown` swaps the instance out before closing it, so a later
/// `get_or_init` builds a fresh core over the same collaborators.
pub struct SessionCoreCell {
    settings: CoreSettings,
    provider: ConnectionProviderService,
    auth: AuthApiService,
    cancellation_token: CancellationToken,
    slot: tokio::sync::Mutex<Option<Arc<SessionCore>>>,
}

impl SessionCoreCell {
    /// A cell that will build cores from the given collaborators.
    pub fn new(
        settings: CoreSettings,
        provider: ConnectionProviderService,
        auth: AuthApiService,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            settings,
            provider,
            auth,
            cancellation_token,
            slot: tokio::sync::Mutex::new(None),
        }
    }

    /// The current core instance, built on first use.
    pub async fn get_or_init(&self) -> Arc<SessionCore> {
        let mut slot = self.slot.lock().await;
        if let Some(core) = slot.as_ref() {
            return Arc::clone(core);
        }
        let core = Arc::new(SessionCore::init(
            self.settings.clone(),
            Arc::clone(&self.provider),
            Arc::clone(&self.auth),
            self.cancellation_token.clone(),
        ));
        *slot = Some(Arc::clone(&core));
        tracing::info!("created session core instance");
        core
    }

    /// Shuts the current instance down and empties the cell. Idempotent;
    /// a later [`SessionCoreCell::get_or_init`] builds a fresh instance.
    pub async fn shutdown(&self) {
        let core = { self.slot.lock().await.take() };
        if let Some(core) = core {
            core.shutdown().await;
        }
    }
}
