//! Metrics definitions for the session isolation core.
//!
//! This module defines all metrics keys used by the core and provides a
//! helper [`describe_metrics`] to set metadata for each metric using the
//! `metrics` crate.

/// Metrics key for the number of currently live request-scoped sessions.
pub const METRICS_ID_SESSIONS_ACTIVE: &str = "dbscope.sessions.active";
/// Metrics key for counting issued sessions.
pub const METRICS_ID_SESSIONS_CREATED: &str = "dbscope.sessions.created";
/// Metrics key for counting closed sessions (leaked included once reaped).
pub const METRICS_ID_SESSIONS_CLOSED: &str = "dbscope.sessions.closed";
/// Metrics key for sessions the leak detector had to reap.
pub const METRICS_ID_SESSIONS_LEAKED: &str = "dbscope.sessions.leaked";
/// Metrics key for the lifetime of closed sessions.
pub const METRICS_ID_SESSION_LIFETIME: &str = "dbscope.sessions.lifetime";
/// Metrics key for connection-provider exhaustion events.
pub const METRICS_ID_POOL_EXHAUSTION: &str = "dbscope.pool.exhaustion";
/// Metrics key for circuit breaker state transitions.
pub const METRICS_ID_BREAKER_TRANSITIONS: &str = "dbscope.breaker.transitions";
/// Metrics key for calls rejected by an open or saturated breaker.
pub const METRICS_ID_BREAKER_REJECTED: &str = "dbscope.breaker.rejected";
/// Metrics key for auth verdicts served from the token cache while the
/// auth dependency was unreachable.
pub const METRICS_ID_AUTH_DEGRADED: &str = "dbscope.auth.degraded";
/// Metrics key for token-cache hits.
pub const METRICS_ID_TOKEN_CACHE_HITS: &str = "dbscope.token_cache.hits";
/// Metrics key for token-cache misses.
pub const METRICS_ID_TOKEN_CACHE_MISSES: &str = "dbscope.token_cache.misses";

/// Describe all metrics used by the core.
///
/// This calls the `describe_*` functions from the `metrics` crate to set
/// metadata on the different metrics.
pub fn describe_metrics() {
    metrics::describe_gauge!(
        METRICS_ID_SESSIONS_ACTIVE,
        metrics::Unit::Count,
        "Number of currently live request-scoped sessions"
    );

    metrics::describe_counter!(
        METRICS_ID_SESSIONS_CREATED,
        metrics::Unit::Count,
        "Number of sessions issued by the factory"
    );

    metrics::describe_counter!(
        METRICS_ID_SESSIONS_CLOSED,
        metrics::Unit::Count,
        "Number of sessions closed (leaked sessions count once reaped)"
    );

    metrics::describe_counter!(
        METRICS_ID_SESSIONS_LEAKED,
        metrics::Unit::Count,
        "Number of sessions the leak detector forcibly closed"
    );

    metrics::describe_histogram!(
        METRICS_ID_SESSION_LIFETIME,
        metrics::Unit::Milliseconds,
        "Lifetime of closed sessions"
    );

    metrics::describe_counter!(
        METRICS_ID_POOL_EXHAUSTION,
        metrics::Unit::Count,
        "Number of connection acquisitions that failed due to pool exhaustion"
    );

    metrics::describe_counter!(
        METRICS_ID_BREAKER_TRANSITIONS,
        metrics::Unit::Count,
        "Number of circuit breaker state transitions"
    );

    metrics::describe_counter!(
        METRICS_ID_BREAKER_REJECTED,
        metrics::Unit::Count,
        "Number of calls rejected without reaching the dependency"
    );

    metrics::describe_counter!(
        METRICS_ID_AUTH_DEGRADED,
        metrics::Unit::Count,
        "Number of degraded auth verdicts served from the token cache"
    );

    metrics::describe_counter!(
        METRICS_ID_TOKEN_CACHE_HITS,
        metrics::Unit::Count,
        "Number of token-cache hits"
    );

    metrics::describe_counter!(
        METRICS_ID_TOKEN_CACHE_MISSES,
        metrics::Unit::Count,
        "Number of token-cache misses"
    )
}
