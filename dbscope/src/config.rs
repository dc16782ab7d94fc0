//! Configuration types and CLI/environment parsing for the session core.
//!
//! [`SessionCoreConfig`] is the boundary parser: hosting applications can
//! use it directly or flatten it into a larger config with
//! `#[clap(flatten)]`. [`CoreSettings`] is the distilled, plain form the
//! core itself consumes.
//!
//! Additionally this module defines the [`Environment`] to assert dev-only
//! code.

use std::time::Duration;

use clap::{Parser, ValueEnum};
use dbscope_types::ident::PrefixAllowlist;

use crate::services::circuit_breaker::CircuitBreakerConfig;
use crate::services::session_factory::FactoryConfig;

/// The environment the service is running in.
///
/// Main usage for the `Environment` is to call
/// [`Environment::assert_is_dev`]. Code paths intended for `dev` only
/// (relaxed breaker thresholds, stub providers, ...) shall assert that
/// they are called from the `dev` environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Environment {
    /// Production environment.
    Prod,
    /// Development environment.
    Dev,
}

impl Environment {
    /// Asserts that `Environment` is `dev`. Panics if not the case.
    pub fn assert_is_dev(&self) {
        assert!(matches!(self, Environment::Dev), "Is not dev environment")
    }
}

/// The configuration of the session isolation core.
///
/// It can be configured via environment variables or command line
/// arguments using `clap`.
#[derive(Parser, Debug)]
pub struct SessionCoreConfig {
    /// The environment of the core (either `prod` or `dev`).
    #[clap(long, env = "DBSCOPE_ENVIRONMENT", default_value = "prod")]
    pub environment: Environment,

    /// Max time an ACTIVE session may live before the leak detector
    /// forcibly closes it.
    #[clap(
        long,
        env = "DBSCOPE_MAX_SESSION_LIFETIME",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub max_session_lifetime: Duration,

    /// Cadence of the leak detector.
    #[clap(
        long,
        env = "DBSCOPE_LEAK_DETECTION_INTERVAL",
        default_value = "1min",
        value_parser = humantime::parse_duration
    )]
    pub leak_detection_interval: Duration,

    /// Master switch for the leak detector.
    #[clap(
        long,
        env = "DBSCOPE_LEAK_DETECTION_ENABLED",
        default_value = "true",
        action = clap::ArgAction::Set
    )]
    pub leak_detection_enabled: bool,

    /// Comma-separated identifier prefixes accepted when persisting thread
    /// identifiers.
    #[clap(
        long,
        env = "DBSCOPE_THREAD_ID_PREFIXES",
        default_value = "thread",
        value_delimiter = ','
    )]
    pub thread_id_prefixes: Vec<String>,

    /// How long `shutdown` waits for the leak detector before abandoning
    /// it.
    #[clap(
        long,
        env = "DBSCOPE_SHUTDOWN_GRACE",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub shutdown_grace: Duration,

    /// TTL of cached positive auth verdicts.
    #[clap(
        long,
        env = "DBSCOPE_TOKEN_CACHE_TTL",
        default_value = "5min",
        value_parser = humantime::parse_duration
    )]
    pub token_cache_ttl: Duration,

    /// Consecutive auth failures that open the auth breaker.
    #[clap(long, env = "DBSCOPE_AUTH_BREAKER_FAILURE_THRESHOLD", default_value = "5")]
    pub auth_breaker_failure_threshold: u32,

    /// Failure rate over the rolling window that opens the auth breaker.
    #[clap(
        long,
        env = "DBSCOPE_AUTH_BREAKER_FAILURE_RATE_THRESHOLD",
        default_value = "0.5"
    )]
    pub auth_breaker_failure_rate_threshold: f64,

    /// Calls required before the rate check applies.
    #[clap(long, env = "DBSCOPE_AUTH_BREAKER_MIN_CALLS_FOR_RATE", default_value = "10")]
    pub auth_breaker_min_calls_for_rate: u64,

    /// Consecutive half-open successes that close the auth breaker.
    #[clap(long, env = "DBSCOPE_AUTH_BREAKER_SUCCESS_THRESHOLD", default_value = "2")]
    pub auth_breaker_success_threshold: u32,

    /// Per-call deadline for auth calls.
    #[clap(
        long,
        env = "DBSCOPE_AUTH_BREAKER_CALL_TIMEOUT",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub auth_breaker_call_timeout: Duration,

    /// How long the auth breaker stays OPEN before probing.
    #[clap(
        long,
        env = "DBSCOPE_AUTH_BREAKER_RECOVERY_TIMEOUT",
        default_value = "15s",
        value_parser = humantime::parse_duration
    )]
    pub auth_breaker_recovery_timeout: Duration,

    /// Concurrency cap while the auth breaker is HALF_OPEN.
    #[clap(
        long,
        env = "DBSCOPE_AUTH_BREAKER_HALF_OPEN_MAX_IN_FLIGHT",
        default_value = "3"
    )]
    pub auth_breaker_half_open_max_in_flight: u32,

    /// Rolling breaker stats are zeroed after this long without a failure.
    #[clap(
        long,
        env = "DBSCOPE_AUTH_BREAKER_STAT_DECAY_AFTER",
        default_value = "1min",
        value_parser = humantime::parse_duration
    )]
    pub auth_breaker_stat_decay_after: Duration,

    /// The connection string for the Postgres DB.
    #[cfg(feature = "postgres")]
    #[clap(long, env = "DBSCOPE_DB_CONNECTION_STRING")]
    pub db_connection_string: secrecy::SecretString,

    /// Max connections of the Postgres pool.
    #[cfg(feature = "postgres")]
    #[clap(long, env = "DBSCOPE_DB_MAX_CONNECTIONS", default_value = "5")]
    pub db_max_connections: std::num::NonZeroU32,

    /// Acquire deadline of the Postgres pool.
    #[cfg(feature = "postgres")]
    #[clap(
        long,
        env = "DBSCOPE_DB_ACQUIRE_TIMEOUT",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub db_acquire_timeout: Duration,
}

impl SessionCoreConfig {
    /// Distills the parsed config into the plain settings the core
    /// consumes.
    pub fn settings(&self) -> CoreSettings {
        CoreSettings {
            factory: FactoryConfig {
                max_session_lifetime: self.max_session_lifetime,
                leak_detection_interval: self.leak_detection_interval,
                leak_detection_enabled: self.leak_detection_enabled,
                thread_id_prefixes: PrefixAllowlist::new(self.thread_id_prefixes.clone()),
                shutdown_grace: self.shutdown_grace,
            },
            auth_breaker: self.auth_breaker_config(),
            token_cache_ttl: self.token_cache_ttl,
        }
    }

    /// The auth breaker config for this environment.
    ///
    /// In `dev` the relaxed profile is used wholesale, mirroring how demo
    /// deployments run with forgiving thresholds; in `prod` the individual
    /// knobs apply.
    pub fn auth_breaker_config(&self) -> CircuitBreakerConfig {
        match self.environment {
            Environment::Dev => CircuitBreakerConfig::relaxed(),
            Environment::Prod => CircuitBreakerConfig {
                failure_threshold: self.auth_breaker_failure_threshold,
                failure_rate_threshold: self.auth_breaker_failure_rate_threshold,
                min_calls_for_rate: self.auth_breaker_min_calls_for_rate,
                success_threshold: self.auth_breaker_success_threshold,
                call_timeout: self.auth_breaker_call_timeout,
                recovery_timeout: self.auth_breaker_recovery_timeout,
                half_open_max_in_flight: self.auth_breaker_half_open_max_in_flight,
                stat_decay_after: self.auth_breaker_stat_decay_after,
                ..CircuitBreakerConfig::default()
            },
        }
    }
}

/// Plain, clonable settings of one core instance.
#[derive(Clone, Debug)]
pub struct CoreSettings {
    /// Session factory tunables.
    pub factory: FactoryConfig,
    /// Auth breaker tunables.
    pub auth_breaker: CircuitBreakerConfig,
    /// TTL of cached positive auth verdicts.
    pub token_cache_ttl: Duration,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            factory: FactoryConfig::default(),
            auth_breaker: CircuitBreakerConfig::default(),
            token_cache_ttl: Duration::from_secs(300),
        }
    }
}

// with the postgres feature on, parsing requires a connection string, so
// these exercise the default feature set only
#[cfg(all(test, not(feature = "postgres")))]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_without_arguments() {
        let config = SessionCoreConfig::parse_from(["dbscope"]);
        assert_eq!(config.max_session_lifetime, Duration::from_secs(30));
        assert_eq!(config.leak_detection_interval, Duration::from_secs(60));
        assert!(config.leak_detection_enabled);
        assert_eq!(config.thread_id_prefixes, vec!["thread".to_owned()]);
        assert_eq!(config.token_cache_ttl, Duration::from_secs(300));
        assert_eq!(config.auth_breaker_failure_threshold, 5);
    }

    #[test]
    fn dev_environment_selects_relaxed_breaker_profile() {
        let config =
            SessionCoreConfig::parse_from(["dbscope", "--environment", "dev"]);
        let breaker = config.auth_breaker_config();
        assert_eq!(breaker.failure_threshold, 10);
        assert!((breaker.failure_rate_threshold - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn allowlist_comes_from_the_prefix_knob() {
        let config = SessionCoreConfig::parse_from([
            "dbscope",
            "--thread-id-prefixes",
            "thread,ws",
        ]);
        let settings = config.settings();
        assert_eq!(
            settings.factory.thread_id_prefixes.prefixes(),
            ["thread".to_owned(), "ws".to_owned()]
        );
    }
}
