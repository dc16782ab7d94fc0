use std::sync::Arc;
use std::time::Duration;

use dbscope::config::CoreSettings;
use dbscope::error::{AuthError, SessionError};
use dbscope::services::circuit_breaker::{CircuitBreakerConfig, CircuitState};
use dbscope::{AUTH_BREAKER_NAME, SessionCore, SessionCoreCell};
use dbscope_test_utils::{AuthScript, MemoryProvider, ScriptedAuthApi, test_identity};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

fn settings() -> CoreSettings {
    CoreSettings {
        auth_breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            call_timeout: Duration::from_millis(100),
            recovery_timeout: Duration::from_secs(1),
            ..CircuitBreakerConfig::default()
        },
        ..CoreSettings::default()
    }
}

fn core_over(provider: &MemoryProvider, auth: &ScriptedAuthApi) -> SessionCore {
    SessionCore::init(
        settings(),
        provider.service(),
        auth.service(),
        CancellationToken::new(),
    )
}

fn token(s: &str) -> SecretString {
    SecretString::from(s.to_owned())
}

async fn open_auth_breaker(core: &SessionCore, auth: &ScriptedAuthApi) {
    auth.push_repeated(3, AuthScript::Error("auth down".to_owned()));
    for _ in 0..3 {
        let err = core
            .authenticate(&token("any"))
            .await
            .expect_err("scripted failure");
        assert!(matches!(err, AuthError::Service(_)), "{err}");
    }
    assert_eq!(
        core.breaker(AUTH_BREAKER_NAME).state(),
        CircuitState::Open
    );
}

#[tokio::test]
async fn cached_verdict_is_served_degraded_while_the_breaker_is_open() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let auth = ScriptedAuthApi::new();
    let core = core_over(&provider, &auth);

    auth.push(AuthScript::Valid("user-1".to_owned()));
    let verdict = core.authenticate(&token("tok-1")).await?;
    assert!(verdict.valid);
    assert!(!verdict.degraded);

    open_auth_breaker(&core, &auth).await;
    let calls_before = auth.validate_calls();

    let verdict = core.authenticate(&token("tok-1")).await?;
    assert!(verdict.valid);
    assert!(verdict.degraded, "verdict came from the cache");
    assert_eq!(
        verdict.user_id.as_ref().map(|u| u.as_str()),
        Some("user-1")
    );
    assert_eq!(
        auth.validate_calls(),
        calls_before,
        "no auth-service call occurred"
    );
    Ok(())
}

#[tokio::test]
async fn unknown_tokens_fail_with_unavailable_while_open() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let auth = ScriptedAuthApi::new();
    let core = core_over(&provider, &auth);

    open_auth_breaker(&core, &auth).await;
    let err = core
        .authenticate(&token("never-seen"))
        .await
        .expect_err("nothing cached for this token");
    match err {
        AuthError::Unavailable { breaker } => assert_eq!(breaker, AUTH_BREAKER_NAME),
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn negative_verdicts_are_not_cached() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let auth = ScriptedAuthApi::new();
    let core = core_over(&provider, &auth);

    auth.push(AuthScript::Invalid("expired".to_owned()));
    let verdict = core.authenticate(&token("tok-bad")).await?;
    assert!(!verdict.valid);

    open_auth_breaker(&core, &auth).await;
    let err = core
        .authenticate(&token("tok-bad"))
        .await
        .expect_err("invalid verdicts never reach the cache");
    assert!(matches!(err, AuthError::Unavailable { .. }));
    Ok(())
}

#[tokio::test]
async fn logout_purges_the_cached_verdict() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let auth = ScriptedAuthApi::new();
    let core = core_over(&provider, &auth);

    auth.push(AuthScript::Valid("user-1".to_owned()));
    core.authenticate(&token("tok-1")).await?;
    assert!(core.logout(&token("tok-1")).await?);
    assert_eq!(auth.logout_calls(), 1);

    open_auth_breaker(&core, &auth).await;
    let err = core
        .authenticate(&token("tok-1"))
        .await
        .expect_err("the cached verdict was purged on logout");
    assert!(matches!(err, AuthError::Unavailable { .. }));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn slow_auth_calls_surface_as_timeouts() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let auth = ScriptedAuthApi::new();
    let core = core_over(&provider, &auth);

    auth.push(AuthScript::Hang(Duration::from_secs(10)));
    let err = core
        .authenticate(&token("tok-slow"))
        .await
        .expect_err("deadline must fire");
    match err {
        AuthError::Timeout { breaker, after } => {
            assert_eq!(breaker, AUTH_BREAKER_NAME);
            assert_eq!(after, Duration::from_millis(100));
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn refresh_passes_through_the_breaker() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let auth = ScriptedAuthApi::new();
    let core = core_over(&provider, &auth);

    let grant = core.refresh(&token("refresh-1")).await?;
    assert_eq!(grant.expires_in, 3600);
    assert_eq!(auth.refresh_calls(), 1);

    open_auth_breaker(&core, &auth).await;
    let err = core
        .refresh(&token("refresh-1"))
        .await
        .expect_err("no fallback for refresh");
    assert!(matches!(err, AuthError::Unavailable { .. }));
    assert_eq!(auth.refresh_calls(), 1, "the dependency was not called");
    Ok(())
}

#[tokio::test]
async fn breakers_are_created_on_demand_and_resettable() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let auth = ScriptedAuthApi::new();
    let core = core_over(&provider, &auth);

    let db_breaker = core.breaker("db");
    assert_eq!(db_breaker.state(), CircuitState::Closed);
    assert!(core.reset_breaker("db"));
    assert!(core.reset_breaker(AUTH_BREAKER_NAME));
    assert!(!core.reset_breaker("no-such-breaker"));
    Ok(())
}

#[tokio::test]
async fn health_report_carries_factory_pool_and_breakers() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let auth = ScriptedAuthApi::new();
    let core = core_over(&provider, &auth);

    core.with_session(&test_identity("alice"))
        .await?
        .finish()
        .await?;

    let report = core.health().await;
    assert_eq!(report.status, "healthy");
    assert!(report.factory.total_created >= 1);
    assert_eq!(report.factory.active, 0);
    assert!(report.breakers.contains_key(AUTH_BREAKER_NAME));

    let json = serde_json::to_value(&report)?;
    let object = json.as_object().unwrap();
    for key in ["status", "factory", "pool", "breakers"] {
        assert!(object.contains_key(key), "missing {key}");
    }
    let breaker = &json["breakers"][AUTH_BREAKER_NAME];
    assert_eq!(breaker["state"], "closed");
    assert!(breaker["recent_transitions"].is_array());
    Ok(())
}

#[tokio::test]
async fn breaker_trips_show_up_in_pool_metrics() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let auth = ScriptedAuthApi::new();
    let core = core_over(&provider, &auth);

    assert_eq!(core.pool_metrics().circuit_breaker_trips, 0);
    open_auth_breaker(&core, &auth).await;
    assert_eq!(core.pool_metrics().circuit_breaker_trips, 1);
    Ok(())
}

#[tokio::test]
async fn shutdown_resets_the_singleton_instance() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let auth = ScriptedAuthApi::new();
    let cell = SessionCoreCell::new(
        settings(),
        provider.service(),
        auth.service(),
        CancellationToken::new(),
    );

    let first = cell.get_or_init().await;
    let again = cell.get_or_init().await;
    assert!(Arc::ptr_eq(&first, &again), "get_or_init memoizes");

    let held = first.with_session(&test_identity("alice")).await?;
    cell.shutdown().await;

    // the old instance is closed, a fresh one replaces it
    let err = first
        .with_session(&test_identity("alice"))
        .await
        .expect_err("old instance is shut down");
    assert!(matches!(err, SessionError::FactoryClosed));
    drop(held);

    let fresh = cell.get_or_init().await;
    assert!(!Arc::ptr_eq(&first, &fresh), "shutdown resets the instance");
    fresh
        .with_session(&test_identity("alice"))
        .await?
        .finish()
        .await?;

    // shutting down twice is a no-op
    cell.shutdown().await;
    cell.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_first_use_yields_one_instance() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let auth = ScriptedAuthApi::new();
    let cell = Arc::new(SessionCoreCell::new(
        settings(),
        provider.service(),
        auth.service(),
        CancellationToken::new(),
    ));

    let (a, b) = tokio::join!(cell.get_or_init(), cell.get_or_init());
    assert!(Arc::ptr_eq(&a, &b));
    Ok(())
}
