//! Integration tests for `ResilientStore`
//!
//! Retry, circuit breaking and read coalescing against an in-memory store with
//! injected faults.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use mall_core::store::{KeyValueStore, StoreError, StoreOp};
use mall_runtime::{CircuitBreakerConfig, InstrumentedStore, ResilientStore, RetryPolicy, State};
use mall_testing::InMemoryStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Fixtures
// ============================================================================

fn timeout_error() -> StoreError {
    StoreError::Timeout("get stock:sku:101: i/o timeout".to_string())
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::builder()
        .initial_delay(Duration::from_millis(1))
        .build()
}

fn resilient(backend: &InMemoryStore) -> ResilientStore<InMemoryStore> {
    ResilientStore::builder(backend.clone())
        .retry_policy(fast_retry())
        .build()
}

// ============================================================================
// Retry
// ============================================================================

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let backend = InMemoryStore::new();
    backend.insert("stock:sku:101", "5");
    backend.fail_next(StoreOp::Get, 2, timeout_error());
    let store = resilient(&backend);

    assert_eq!(store.get("stock:sku:101").await, Ok(Some("5".to_string())));
    assert_eq!(backend.calls(StoreOp::Get), 3);
}

#[tokio::test]
async fn persistent_failure_gives_up_after_three_attempts() {
    let backend = InMemoryStore::new();
    backend.fail_always(StoreOp::Get, timeout_error());
    let store = resilient(&backend);

    let err = store.get("stock:sku:101").await.unwrap_err();

    assert_eq!(
        err,
        StoreError::MaxRetriesExceeded {
            attempts: 3,
            last: Box::new(timeout_error()),
        }
    );
    assert!(err.to_string().contains("max retries exceeded"));
    assert_eq!(backend.calls(StoreOp::Get), 3);
}

#[tokio::test]
async fn default_backoff_is_ten_then_twenty_milliseconds() {
    let backend = InMemoryStore::new();
    backend.fail_always(StoreOp::Get, timeout_error());
    let store = ResilientStore::new(backend.clone());

    let started = Instant::now();
    assert!(store.get("stock:sku:101").await.is_err());

    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(backend.calls(StoreOp::Get), 3);
}

#[tokio::test]
async fn absent_key_is_not_an_error() {
    let backend = InMemoryStore::new();
    let store = resilient(&backend);

    assert_eq!(store.get("stock:sku:404").await, Ok(None));
    assert_eq!(backend.calls(StoreOp::Get), 1);
}

#[tokio::test]
async fn cancellation_is_never_retried_and_does_not_trip_the_breaker() {
    let backend = InMemoryStore::new();
    backend.fail_always(StoreOp::Get, StoreError::Cancelled);
    let store = resilient(&backend);

    for _ in 0..15 {
        assert_eq!(store.get("stock:sku:101").await, Err(StoreError::Cancelled));
    }

    assert_eq!(backend.calls(StoreOp::Get), 15);
    assert_eq!(store.breaker().state().await, State::Closed);
}

#[tokio::test]
async fn incr_by_is_attempted_once() {
    let backend = InMemoryStore::new();
    backend.insert("stock:sku:101", "5");
    backend.fail_next(StoreOp::IncrBy, 1, timeout_error());
    let store = resilient(&backend);

    assert_eq!(store.incr_by("stock:sku:101", 3).await, Err(timeout_error()));
    assert_eq!(backend.calls(StoreOp::IncrBy), 1);
    assert_eq!(backend.peek("stock:sku:101"), Some("5".to_string()));
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn shutdown_aborts_a_retry_backoff() {
    let backend = InMemoryStore::new();
    backend.fail_always(StoreOp::Get, timeout_error());
    let shutdown = CancellationToken::new();
    let store = Arc::new(
        ResilientStore::builder(backend.clone())
            .retry_policy(
                RetryPolicy::builder()
                    .initial_delay(Duration::from_secs(30))
                    .max_delay(Duration::from_secs(30))
                    .build(),
            )
            .shutdown_token(shutdown.clone())
            .build(),
    );

    let pending = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.get("stock:sku:101").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("shutdown should end the backoff promptly")
        .unwrap();
    assert_eq!(result, Err(StoreError::Cancelled));
    assert_eq!(backend.calls(StoreOp::Get), 1);
}

#[tokio::test]
async fn caller_deadline_bounds_a_hung_store() {
    let backend = InMemoryStore::new();
    backend.set_latency(Duration::from_secs(30));
    let store = resilient(&backend);

    let outcome =
        tokio::time::timeout(Duration::from_millis(50), store.get("stock:sku:101")).await;

    assert!(outcome.is_err());
}

// ============================================================================
// Circuit Breaker
// ============================================================================

#[tokio::test]
async fn circuit_opens_after_ten_failed_requests_and_rejects_without_calling() {
    let backend = InMemoryStore::new();
    backend.fail_always(StoreOp::Get, timeout_error());
    let store = resilient(&backend);

    for _ in 0..10 {
        assert!(matches!(
            store.get("stock:sku:101").await,
            Err(StoreError::MaxRetriesExceeded { .. })
        ));
    }
    assert_eq!(store.breaker().state().await, State::Open);
    let calls_when_opened = backend.calls(StoreOp::Get);
    assert_eq!(calls_when_opened, 30);

    let started = Instant::now();
    assert_eq!(store.get("stock:sku:101").await, Err(StoreError::CircuitOpen));
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(backend.calls(StoreOp::Get), calls_when_opened);
}

#[tokio::test]
async fn circuit_stays_closed_below_the_minimum_request_count() {
    let backend = InMemoryStore::new();
    backend.fail_always(StoreOp::Get, timeout_error());
    let store = resilient(&backend);

    for _ in 0..9 {
        assert!(store.get("stock:sku:101").await.is_err());
    }

    assert_eq!(store.breaker().state().await, State::Closed);
}

#[tokio::test]
async fn half_open_trial_success_closes_the_circuit() {
    let backend = InMemoryStore::new();
    backend.insert("stock:sku:101", "5");
    backend.fail_always(StoreOp::Get, timeout_error());
    let store = ResilientStore::builder(backend.clone())
        .retry_policy(fast_retry())
        .circuit_breaker(
            CircuitBreakerConfig::builder()
                .timeout(Duration::from_millis(50))
                .build(),
        )
        .build();

    for _ in 0..10 {
        assert!(store.get("stock:sku:101").await.is_err());
    }
    assert_eq!(store.breaker().state().await, State::Open);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(store.breaker().state().await, State::HalfOpen);

    backend.clear_faults();
    assert_eq!(store.get("stock:sku:101").await, Ok(Some("5".to_string())));
    assert_eq!(store.breaker().state().await, State::Closed);
}

#[tokio::test]
async fn half_open_trial_failure_reopens_the_circuit() {
    let backend = InMemoryStore::new();
    backend.fail_always(StoreOp::Get, timeout_error());
    let store = ResilientStore::builder(backend.clone())
        .retry_policy(fast_retry())
        .circuit_breaker(
            CircuitBreakerConfig::builder()
                .timeout(Duration::from_millis(50))
                .build(),
        )
        .build();

    for _ in 0..10 {
        assert!(store.get("stock:sku:101").await.is_err());
    }
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert!(matches!(
        store.get("stock:sku:101").await,
        Err(StoreError::MaxRetriesExceeded { .. })
    ));
    assert_eq!(store.breaker().state().await, State::Open);
}

#[tokio::test]
async fn abandoned_half_open_trial_frees_the_slot() {
    let backend = InMemoryStore::new();
    backend.fail_always(StoreOp::Set, timeout_error());
    let store = ResilientStore::builder(backend.clone())
        .retry_policy(fast_retry())
        .circuit_breaker(
            CircuitBreakerConfig::builder()
                .timeout(Duration::from_millis(50))
                .build(),
        )
        .build();

    for _ in 0..10 {
        assert!(store.set("stock:sku:101", "5", None).await.is_err());
    }
    assert_eq!(store.breaker().state().await, State::Open);
    tokio::time::sleep(Duration::from_millis(60)).await;

    // The caller gives up on the trial while it is still in flight.
    backend.clear_faults();
    backend.set_latency(Duration::from_millis(200));
    let abandoned = tokio::time::timeout(
        Duration::from_millis(20),
        store.set("stock:sku:101", "5", None),
    )
    .await;
    assert!(abandoned.is_err());
    backend.set_latency(Duration::ZERO);

    let calls_before = backend.calls(StoreOp::Set);
    assert_eq!(store.set("stock:sku:101", "4", None).await, Ok(()));
    assert_eq!(backend.calls(StoreOp::Set), calls_before + 1);
    assert_eq!(store.breaker().state().await, State::Closed);
    assert_eq!(backend.peek("stock:sku:101").as_deref(), Some("4"));
}

// ============================================================================
// Coalescing
// ============================================================================

#[tokio::test]
async fn concurrent_reads_of_one_key_share_a_single_fetch() {
    let backend = InMemoryStore::new();
    backend.insert("stock:sku:101", "5");
    backend.set_latency(Duration::from_millis(50));
    let store = Arc::new(resilient(&backend));

    let mut readers = Vec::new();
    for _ in 0..25 {
        let store = Arc::clone(&store);
        readers.push(tokio::spawn(
            async move { store.get("stock:sku:101").await },
        ));
    }

    for reader in readers {
        assert_eq!(reader.await.unwrap(), Ok(Some("5".to_string())));
    }
    assert_eq!(backend.calls(StoreOp::Get), 1);
}

#[tokio::test]
async fn coalesced_readers_share_failures_too() {
    let backend = InMemoryStore::new();
    backend.set_latency(Duration::from_millis(20));
    backend.fail_always(StoreOp::Get, timeout_error());
    let store = Arc::new(resilient(&backend));

    let (a, b) = tokio::join!(store.get("stock:sku:101"), store.get("stock:sku:101"));

    assert!(matches!(a, Err(StoreError::MaxRetriesExceeded { .. })));
    assert_eq!(a, b);
    assert_eq!(backend.calls(StoreOp::Get), 3);
}

#[tokio::test]
async fn abandoned_read_is_not_resumed_by_the_next_reader() {
    let backend = InMemoryStore::new();
    backend.insert("stock:sku:101", "5");
    backend.set_latency(Duration::from_millis(300));
    let store = resilient(&backend);

    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), store.get("stock:sku:101")).await;
    assert!(abandoned.is_err());

    backend.set_latency(Duration::ZERO);
    backend.insert("stock:sku:101", "4");
    let started = Instant::now();
    assert_eq!(store.get("stock:sku:101").await, Ok(Some("4".to_string())));
    assert!(started.elapsed() < Duration::from_millis(150));
}

// ============================================================================
// Layering
// ============================================================================

#[tokio::test]
async fn instrumented_backend_sees_every_physical_attempt() {
    let backend = InMemoryStore::new();
    backend.insert("stock:sku:101", "5");
    backend.fail_next(StoreOp::Get, 1, timeout_error());
    let store = ResilientStore::builder(InstrumentedStore::new(backend.clone()))
        .retry_policy(fast_retry())
        .build();

    assert_eq!(store.get("stock:sku:101").await, Ok(Some("5".to_string())));
    assert_eq!(store.inner().inner().calls(StoreOp::Get), 2);
}
