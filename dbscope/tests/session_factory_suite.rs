use std::collections::HashSet;
use std::time::Duration;

use dbscope::error::SessionError;
use dbscope::services::scope_validator;
use dbscope::services::session_factory::{
    FactoryConfig, RequestScopedSessionFactory, ScopeOptions,
};
use dbscope::services::session_metrics::SessionState;
use dbscope_test_utils::{MemoryProvider, test_identity};
use dbscope_types::ident::MalformedIdentifier;
use dbscope_types::{Identity, UserId};
use tokio_util::sync::CancellationToken;

fn factory_over(provider: &MemoryProvider, config: FactoryConfig) -> RequestScopedSessionFactory {
    RequestScopedSessionFactory::new(provider.service(), config, CancellationToken::new())
}

#[tokio::test]
async fn five_concurrent_users_get_isolated_sessions() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let factory = factory_over(&provider, FactoryConfig::default());

    let mut handles = Vec::new();
    for n in 0..5 {
        let factory = factory.clone();
        handles.push(tokio::spawn(async move {
            let identity = test_identity(&format!("user_{n}"));
            let mut scope = factory
                .scoped_session(&identity, ScopeOptions::default())
                .await?;
            scope.execute(&format!("SELECT {n}")).await?;
            let session_id = scope.session_id().clone();
            let owner = scope.tag().user_id.clone();
            scope.finish().await?;
            Ok::<_, SessionError>((session_id, owner))
        }));
    }

    let mut session_ids = HashSet::new();
    for (n, handle) in handles.into_iter().enumerate() {
        let (session_id, owner) = handle.await??;
        assert_eq!(owner.as_str(), format!("user_{n}"));
        session_ids.insert(session_id);
    }
    assert_eq!(session_ids.len(), 5, "five distinct session ids");

    let pool = factory.pool_metrics();
    assert_eq!(pool.active_sessions, 0);
    assert_eq!(pool.total_sessions_created, 5);
    assert_eq!(pool.sessions_closed, 5);
    assert!(pool.peak_concurrent_sessions >= 1);

    let executed = provider.executed_statements();
    for n in 0..5 {
        assert!(executed.contains(&format!("SELECT {n}")));
    }
    Ok(())
}

#[tokio::test]
async fn cross_user_ownership_is_rejected_without_ending_the_scope() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let factory = factory_over(&provider, FactoryConfig::default());

    let identity = test_identity("user_a");
    let mut scope = factory
        .scoped_session(&identity, ScopeOptions::default())
        .await?;

    let err = scope_validator::validate_ownership(scope.tag(), &UserId::new("user_b"))
        .expect_err("wrong owner must be rejected");
    assert!(
        err.to_string().contains("session isolation violated"),
        "{err}"
    );

    // the session stays usable for its real owner
    scope.execute("SELECT 1").await?;
    scope.finish().await?;
    assert_eq!(factory.pool_metrics().active_sessions, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn leak_detector_reaps_overrunning_sessions() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let config = FactoryConfig {
        max_session_lifetime: Duration::from_secs(1),
        leak_detection_interval: Duration::from_millis(200),
        ..FactoryConfig::default()
    };
    let factory = factory_over(&provider, config);

    let identity = test_identity("sleepy");
    let mut scope = factory
        .scoped_session(&identity, ScopeOptions::default())
        .await?;

    // the scope sits on the session well past its lifetime bound
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let err = scope
        .execute("SELECT 1")
        .await
        .expect_err("reaped session must refuse further use");
    assert!(matches!(err, SessionError::Lifecycle { .. }), "{err}");

    let metrics = scope.metrics();
    assert_eq!(metrics.state(), SessionState::Closed);
    assert_eq!(metrics.error_count(), 1);
    assert_eq!(metrics.last_error(), Some("session leaked - forced cleanup"));

    let pool = factory.pool_metrics();
    assert_eq!(pool.leaked_sessions, 1);
    assert_eq!(pool.active_sessions, 0);
    assert_eq!(pool.sessions_closed, 1, "a reaped leak counts as closed");
    assert!(pool.last_leak_detection.is_some());
    assert_eq!(provider.in_use(), 0, "the connection went back to the pool");

    drop(scope);
    let pool = factory.pool_metrics();
    assert_eq!(pool.sessions_closed, 1, "dropping the stale guard changes nothing");
    Ok(())
}

#[tokio::test]
async fn adhoc_thread_prefix_is_rejected_before_any_session_exists() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let factory = factory_over(&provider, FactoryConfig::default());

    let identity = Identity::builder("ws-user")
        .request_id("req_ws_1")
        .thread_id("websocket_factory_1757361062151")
        .build()?;
    let err = factory
        .scoped_session(&identity, ScopeOptions::default())
        .await
        .expect_err("ad-hoc prefix must be rejected");
    match err {
        SessionError::Identifier(MalformedIdentifier::PrefixNotAllowed(prefix)) => {
            assert_eq!(prefix, "websocket");
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(factory.pool_metrics().total_sessions_created, 0);
    assert_eq!(provider.total_acquired(), 0, "the provider was never asked");
    Ok(())
}

#[tokio::test]
async fn shutdown_forces_cleanup_of_live_sessions() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let factory = factory_over(&provider, FactoryConfig::default());

    let mut scopes = Vec::new();
    for n in 0..3 {
        let identity = test_identity(&format!("held_{n}"));
        scopes.push(
            factory
                .scoped_session(&identity, ScopeOptions::default())
                .await?,
        );
    }
    assert_eq!(factory.live_count(), 3);

    factory.close().await;

    assert_eq!(factory.live_count(), 0);
    assert_eq!(provider.in_use(), 0);
    for scope in &scopes {
        let metrics = scope.metrics();
        assert_eq!(metrics.state(), SessionState::Closed);
        assert_eq!(
            metrics.last_error(),
            Some("factory shutdown - forced cleanup")
        );
        assert_eq!(metrics.error_count(), 1);
    }

    // held guards refuse further use and new sessions cannot be issued
    let mut first = scopes.remove(0);
    let err = first.execute("SELECT 1").await.expect_err("must fail");
    assert!(matches!(err, SessionError::Lifecycle { .. }));
    let err = factory
        .scoped_session(&test_identity("late"), ScopeOptions::default())
        .await
        .expect_err("factory is closed");
    assert!(matches!(err, SessionError::FactoryClosed));

    // closing again is a no-op
    factory.close().await;
    let pool = factory.pool_metrics();
    assert_eq!(pool.active_sessions, 0);
    assert_eq!(pool.sessions_closed, 3);
    Ok(())
}

#[tokio::test]
async fn open_close_round_trip_restores_counters() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let factory = factory_over(&provider, FactoryConfig::default());

    let before = factory.pool_metrics();
    let scope = factory
        .scoped_session(&test_identity("alice"), ScopeOptions::default())
        .await?;
    assert_eq!(factory.pool_metrics().active_sessions, before.active_sessions + 1);
    scope.finish().await?;

    let after = factory.pool_metrics();
    assert_eq!(after.active_sessions, before.active_sessions);
    assert_eq!(after.sessions_closed, before.sessions_closed + 1);
    assert_eq!(after.total_sessions_created, before.total_sessions_created + 1);
    Ok(())
}

#[tokio::test]
async fn pool_exhaustion_is_counted_and_surfaced() -> eyre::Result<()> {
    let provider = MemoryProvider::with_pool_size(1);
    let factory = factory_over(&provider, FactoryConfig::default());

    let held = factory
        .scoped_session(&test_identity("holder"), ScopeOptions::default())
        .await?;
    let err = factory
        .scoped_session(&test_identity("waiter"), ScopeOptions::default())
        .await
        .expect_err("pool of one is exhausted");
    match &err {
        SessionError::Acquire { user_id, source } => {
            assert_eq!(user_id.as_str(), "waiter");
            assert!(source.is_exhaustion());
        }
        other => panic!("unexpected error: {other}"),
    }
    let pool = factory.pool_metrics();
    assert_eq!(pool.pool_exhaustion_events, 1);
    assert!(pool.last_pool_exhaustion.is_some());

    held.finish().await?;
    factory
        .scoped_session(&test_identity("waiter"), ScopeOptions::default())
        .await?
        .finish()
        .await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn acquire_deadline_bounds_a_slow_pool() -> eyre::Result<()> {
    let provider = MemoryProvider::with_acquire_delay(4, Duration::from_secs(10));
    let factory = factory_over(&provider, FactoryConfig::default());

    let options = ScopeOptions {
        acquire_timeout: Some(Duration::from_millis(100)),
        ..ScopeOptions::default()
    };
    let err = factory
        .scoped_session(&test_identity("hurried"), options)
        .await
        .expect_err("acquire must hit the deadline");
    match err {
        SessionError::Acquire { source, .. } => assert!(source.is_exhaustion()),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(factory.pool_metrics().pool_exhaustion_events, 1);
    Ok(())
}

#[tokio::test]
async fn dropping_a_scope_runs_the_error_path() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let factory = factory_over(&provider, FactoryConfig::default());

    let scope = factory
        .scoped_session(&test_identity("dropper"), ScopeOptions::default())
        .await?;
    drop(scope);

    let pool = factory.pool_metrics();
    assert_eq!(pool.active_sessions, 0);
    assert_eq!(pool.sessions_closed, 1);
    assert_eq!(provider.in_use(), 0);
    Ok(())
}

#[tokio::test]
async fn transactions_and_queries_are_counted() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let factory = factory_over(&provider, FactoryConfig::default());

    let mut scope = factory
        .scoped_session(&test_identity("worker"), ScopeOptions::default())
        .await?;
    scope.begin().await?;
    assert!(scope.in_transaction().await);
    scope.execute("INSERT INTO jobs VALUES (1)").await?;
    scope.commit().await?;
    assert!(!scope.in_transaction().await);

    let metrics = scope.metrics();
    assert_eq!(metrics.transaction_count(), 1);
    assert_eq!(metrics.query_count(), 1);
    scope.finish().await?;

    let executed = provider.executed_statements();
    assert_eq!(executed, vec!["BEGIN", "INSERT INTO jobs VALUES (1)", "COMMIT"]);
    Ok(())
}

#[tokio::test]
async fn abort_rolls_back_an_open_transaction() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let factory = factory_over(&provider, FactoryConfig::default());

    let mut scope = factory
        .scoped_session(&test_identity("worker"), ScopeOptions::default())
        .await?;
    scope.begin().await?;
    scope.execute("UPDATE jobs SET state = 'running'").await?;
    let metrics_handle = scope.metrics();
    assert_eq!(metrics_handle.state(), SessionState::Active);
    scope.abort("handler failed").await?;

    let executed = provider.executed_statements();
    assert_eq!(executed.last().map(String::as_str), Some("ROLLBACK"));

    let pool = factory.pool_metrics();
    assert_eq!(pool.active_sessions, 0);
    assert_eq!(pool.sessions_closed, 1);
    Ok(())
}

#[tokio::test]
async fn counter_consistency_holds_across_mixed_outcomes() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let factory = factory_over(&provider, FactoryConfig::default());

    let finished = factory
        .scoped_session(&test_identity("a"), ScopeOptions::default())
        .await?;
    finished.finish().await?;
    let aborted = factory
        .scoped_session(&test_identity("b"), ScopeOptions::default())
        .await?;
    aborted.abort("boom").await?;
    let _held = factory
        .scoped_session(&test_identity("c"), ScopeOptions::default())
        .await?;

    let pool = factory.pool_metrics();
    assert!(
        pool.total_sessions_created
            >= pool.sessions_closed + pool.active_sessions - pool.leaked_sessions
    );
    assert!(pool.peak_concurrent_sessions >= pool.active_sessions);
    assert_eq!(pool.active_sessions, 1);
    assert_eq!(pool.total_sessions_created, 3);
    Ok(())
}

#[tokio::test]
async fn health_check_probes_the_data_path() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let factory = factory_over(&provider, FactoryConfig::default());

    let health = factory.health_check().await;
    assert_eq!(health.status, "healthy");
    assert!(health.error.is_none());
    assert!(provider.executed_statements().contains(&"SELECT 1".to_owned()));

    let sick = MemoryProvider::new();
    let sick_factory = factory_over(&sick, FactoryConfig::default());
    sick.fail_next_acquire();
    let health = sick_factory.health_check().await;
    assert_eq!(health.status, "unhealthy");
    assert!(health.error.is_some());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn per_scope_lifetime_override_wins_over_the_factory_default() -> eyre::Result<()> {
    let provider = MemoryProvider::new();
    let config = FactoryConfig {
        max_session_lifetime: Duration::from_secs(600),
        leak_detection_interval: Duration::from_millis(200),
        ..FactoryConfig::default()
    };
    let factory = factory_over(&provider, config);

    let options = ScopeOptions {
        max_lifetime: Some(Duration::from_secs(1)),
        ..ScopeOptions::default()
    };
    let scope = factory
        .scoped_session(&test_identity("short"), options)
        .await?;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(factory.pool_metrics().leaked_sessions, 1);
    drop(scope);
    Ok(())
}
