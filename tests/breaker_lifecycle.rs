//! End-to-end breaker lifecycle: trip on threshold, recover through
//! half-open trials.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nightwatch::{BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitState, ServiceError};

fn trip_fast_config() -> BreakerConfig {
    BreakerConfig {
        failure_threshold: 3,
        success_threshold: 2,
        recovery_timeout: Duration::from_millis(200),
        half_open_max_calls: 3,
        ..BreakerConfig::default()
    }
}

#[tokio::test]
async fn breaker_opens_on_threshold_then_recovers() {
    let breaker = CircuitBreaker::new("detector", trip_fast_config());
    let invocations = Arc::new(AtomicUsize::new(0));

    // Five consecutive failing calls: the first three run the operation and
    // trip the circuit, the last two are rejected at the door.
    for _ in 0..5 {
        let invocations = invocations.clone();
        let result = breaker
            .call(|| async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ServiceError::ConnectRefused)
            })
            .await;
        assert!(result.is_err());
    }

    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    let metrics = breaker.snapshot();
    assert_eq!(metrics.state, CircuitState::Open);
    assert_eq!(metrics.failure_count, 3);
    assert_eq!(metrics.rejected_calls, 2);

    // Wait out the recovery timeout, then succeed twice: the first call
    // transitions to half-open, the second closes the circuit.
    tokio::time::sleep(Duration::from_millis(250)).await;

    breaker.call(|| async { Ok::<_, ServiceError>(()) }).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert_eq!(breaker.snapshot().success_count, 1);

    breaker.call(|| async { Ok::<_, ServiceError>(()) }).await.unwrap();
    let metrics = breaker.snapshot();
    assert_eq!(metrics.state, CircuitState::Closed);
    assert_eq!(metrics.failure_count, 0);
    assert_eq!(metrics.success_count, 0);
}

#[tokio::test]
async fn registry_shares_breakers_across_call_sites() {
    let registry = Arc::new(BreakerRegistry::new());

    let from_client = registry.get_or_create("risk_llm", trip_fast_config());
    for _ in 0..3 {
        let _ = from_client.call(|| async { Err::<(), _>(ServiceError::Server(503)) }).await;
    }

    // Another component looking up the same name observes the open circuit.
    let from_status_page = registry.get("risk_llm").unwrap();
    assert_eq!(from_status_page.state(), CircuitState::Open);
    assert!(!from_status_page.allow());
}

#[tokio::test]
async fn client_errors_pass_through_without_tripping() {
    let breaker = CircuitBreaker::new("detector", trip_fast_config());

    for _ in 0..10 {
        let result = breaker
            .call(|| async { Err::<(), _>(ServiceError::Client(404)) })
            .await;
        assert_eq!(result.unwrap_err(), ServiceError::Client(404));
    }

    assert_eq!(breaker.state(), CircuitState::Closed);
    breaker.call(|| async { Ok::<_, ServiceError>(()) }).await.unwrap();
}
