use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dbscope::services::circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
use tokio::sync::oneshot;

fn quick_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 5,
        call_timeout: Duration::from_millis(100),
        recovery_timeout: Duration::from_secs(1),
        ..CircuitBreakerConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn five_timeouts_open_the_breaker_and_reject_the_sixth_call() {
    let breaker = CircuitBreaker::new("auth_service", quick_config());

    for n in 1..=5u32 {
        let err = breaker
            .call(std::future::pending::<Result<(), String>>())
            .await
            .expect_err("pending call must time out");
        assert!(matches!(err, BreakerError::Timeout { .. }), "call {n}: {err}");
        if n < 5 {
            assert_eq!(breaker.state(), CircuitState::Closed, "after call {n}");
        }
    }
    assert_eq!(breaker.state(), CircuitState::Open, "opens on the 5th failure");

    // the sixth call fails fast without ever polling the operation
    let touched = Arc::new(AtomicBool::new(false));
    let probe = {
        let touched = Arc::clone(&touched);
        async move {
            touched.store(true, Ordering::SeqCst);
            Ok::<(), String>(())
        }
    };
    let err = breaker.call(probe).await.expect_err("breaker is open");
    assert!(matches!(err, BreakerError::Open { .. }), "{err}");
    assert!(!touched.load(Ordering::SeqCst), "no dependency I/O happened");

    let transitions = breaker.transitions();
    assert!(
        transitions
            .iter()
            .any(|t| t.from == CircuitState::Closed && t.to == CircuitState::Open),
        "audit ring records closed -> open"
    );
}

#[tokio::test(start_paused = true)]
async fn half_open_probes_close_the_breaker_after_enough_successes() {
    let breaker = CircuitBreaker::new("auth_service", quick_config());
    for _ in 0..5 {
        let _ = breaker
            .call(std::future::pending::<Result<(), String>>())
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_millis(1100)).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    breaker
        .call(async { Ok::<_, String>(()) })
        .await
        .expect("first probe succeeds");
    assert_eq!(breaker.state(), CircuitState::HalfOpen, "one success is not enough");
    breaker
        .call(async { Ok::<_, String>(()) })
        .await
        .expect("second probe succeeds");

    assert_eq!(breaker.state(), CircuitState::Closed);
    let stats = breaker.stats();
    assert_eq!(stats.total_calls, 0, "counters reset on recovery");
    assert_eq!(stats.consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn a_failed_probe_reopens_the_breaker() {
    let breaker = CircuitBreaker::new("auth_service", quick_config());
    for _ in 0..5 {
        let _ = breaker
            .call(std::future::pending::<Result<(), String>>())
            .await;
    }
    tokio::time::advance(Duration::from_millis(1100)).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    let _ = breaker
        .call(async { Err::<(), _>("still broken".to_owned()) })
        .await;
    assert_eq!(breaker.state(), CircuitState::Open, "one failed probe reopens");

    // the recovery timer restarted; the breaker stays open until it runs out
    tokio::time::advance(Duration::from_millis(500)).await;
    assert_eq!(breaker.state(), CircuitState::Open);
    tokio::time::advance(Duration::from_millis(700)).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
}

#[tokio::test(start_paused = true)]
async fn the_probe_over_the_in_flight_cap_fails_fast() {
    let config = CircuitBreakerConfig {
        failure_threshold: 1,
        recovery_timeout: Duration::from_secs(1),
        half_open_max_in_flight: 2,
        // keep successes from closing the breaker mid-test
        success_threshold: 10,
        call_timeout: Duration::from_secs(60),
        ..CircuitBreakerConfig::default()
    };
    let breaker = Arc::new(CircuitBreaker::new("auth_service", config));
    let _ = breaker
        .call(async { Err::<(), _>("boom".to_owned()) })
        .await;
    tokio::time::advance(Duration::from_millis(1100)).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    // park two probes in flight
    let mut releases = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..2 {
        let (entered_tx, entered_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        releases.push(release_tx);
        let breaker = Arc::clone(&breaker);
        handles.push(tokio::spawn(async move {
            breaker
                .call(async move {
                    let _ = entered_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, String>(())
                })
                .await
        }));
        entered_rx.await.expect("probe entered");
    }

    let err = breaker
        .call(async { Ok::<_, String>(()) })
        .await
        .expect_err("third concurrent probe exceeds the cap");
    assert!(matches!(err, BreakerError::HalfOpen { .. }), "{err}");

    for release in releases {
        let _ = release.send(());
    }
    for handle in handles {
        handle.await.expect("probe task").expect("probe result");
    }
    // both slots were handed back, a new probe may proceed
    breaker
        .call(async { Ok::<_, String>(()) })
        .await
        .expect("slots were returned");
}

#[tokio::test(start_paused = true)]
async fn transitions_follow_the_allowed_edges_only() {
    let config = CircuitBreakerConfig {
        failure_threshold: 2,
        recovery_timeout: Duration::from_millis(100),
        success_threshold: 1,
        call_timeout: Duration::from_millis(100),
        ..CircuitBreakerConfig::default()
    };
    let breaker = CircuitBreaker::new("auth_service", config);

    // closed -> open -> half_open -> open -> half_open -> closed
    for _ in 0..2 {
        let _ = breaker
            .call(async { Err::<(), _>("x".to_owned()) })
            .await;
    }
    tokio::time::advance(Duration::from_millis(150)).await;
    let _ = breaker
        .call(async { Err::<(), _>("x".to_owned()) })
        .await;
    tokio::time::advance(Duration::from_millis(150)).await;
    breaker.call(async { Ok::<_, String>(()) }).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);

    let allowed = [
        (CircuitState::Closed, CircuitState::Open),
        (CircuitState::Open, CircuitState::HalfOpen),
        (CircuitState::HalfOpen, CircuitState::Open),
        (CircuitState::HalfOpen, CircuitState::Closed),
    ];
    for transition in breaker.transitions() {
        assert!(
            allowed.contains(&(transition.from, transition.to)),
            "illegal transition {:?} -> {:?}",
            transition.from,
            transition.to
        );
    }
}

#[tokio::test]
async fn reset_returns_to_closed_with_zeroed_counters() {
    let breaker = CircuitBreaker::new("auth_service", quick_config());
    for _ in 0..5 {
        let _ = breaker
            .call(async { Err::<(), _>("x".to_owned()) })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    breaker.reset();
    assert_eq!(breaker.state(), CircuitState::Closed);
    let stats = breaker.stats();
    assert_eq!(stats.total_calls, 0);
    assert_eq!(stats.failed_calls, 0);
    assert_eq!(stats.consecutive_failures, 0);

    breaker.reset();
    assert_eq!(breaker.state(), CircuitState::Closed, "reset is idempotent");
}
