//! Integration tests for `DistributedLock`
//!
//! Mutual exclusion, lease renewal and ownership checks against an in-memory store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use mall_core::store::{KeyValueStore, StoreError, StoreOp};
use mall_runtime::{DistributedLock, LeaseStatus, LockError};
use mall_testing::{InMemoryStore, eventually};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const RESOURCE: &str = "lock:sku:101";

// ============================================================================
// Test Fixtures
// ============================================================================

fn shared(backend: &InMemoryStore) -> Arc<dyn KeyValueStore> {
    Arc::new(backend.clone())
}

fn lock_on(backend: &InMemoryStore) -> DistributedLock {
    DistributedLock::new(shared(backend), RESOURCE).with_retry_interval(Duration::from_millis(5))
}

// ============================================================================
// Acquire / Release
// ============================================================================

#[tokio::test]
async fn acquire_writes_a_token_and_release_removes_it() {
    let backend = InMemoryStore::new();
    let lock = lock_on(&backend);

    assert!(lock.acquire(Duration::from_secs(5), Duration::ZERO).await.unwrap());
    assert!(backend.peek(RESOURCE).is_some());
    assert_eq!(lock.lease_status(), LeaseStatus::Held);

    lock.release().await.unwrap();
    assert_eq!(backend.peek(RESOURCE), None);
    assert_eq!(lock.lease_status(), LeaseStatus::Released);
}

#[tokio::test]
async fn each_acquisition_uses_a_fresh_token() {
    let backend = InMemoryStore::new();
    let lock = lock_on(&backend);

    lock.acquire(Duration::from_secs(5), Duration::ZERO).await.unwrap();
    let first = backend.peek(RESOURCE).unwrap();
    lock.release().await.unwrap();

    lock.acquire(Duration::from_secs(5), Duration::ZERO).await.unwrap();
    let second = backend.peek(RESOURCE).unwrap();
    lock.release().await.unwrap();

    assert_ne!(first, second);
}

#[tokio::test]
async fn contended_lock_times_out_after_the_wait() {
    let backend = InMemoryStore::new();
    let holder = lock_on(&backend);
    let waiter = lock_on(&backend);
    holder.acquire(Duration::from_secs(5), Duration::ZERO).await.unwrap();

    let started = Instant::now();
    let acquired = waiter
        .acquire(Duration::from_secs(5), Duration::from_millis(100))
        .await
        .unwrap();

    assert!(!acquired);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(started.elapsed() < Duration::from_secs(1));
    holder.release().await.unwrap();
}

#[tokio::test]
async fn waiter_acquires_once_the_holder_releases() {
    let backend = InMemoryStore::new();
    let holder = lock_on(&backend);
    let waiter = lock_on(&backend);
    holder.acquire(Duration::from_secs(5), Duration::ZERO).await.unwrap();

    let (acquired, released) = tokio::join!(
        waiter.acquire(Duration::from_secs(5), Duration::from_secs(2)),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            holder.release().await
        }
    );

    assert!(acquired.unwrap());
    released.unwrap();
    waiter.release().await.unwrap();
}

#[tokio::test]
async fn release_without_acquire_is_not_held() {
    let backend = InMemoryStore::new();
    let lock = lock_on(&backend);

    assert_eq!(
        lock.release().await,
        Err(LockError::NotHeld {
            resource: RESOURCE.to_string()
        })
    );
}

#[tokio::test]
async fn second_acquire_on_the_same_handle_is_rejected() {
    let backend = InMemoryStore::new();
    let lock = lock_on(&backend);
    lock.acquire(Duration::from_secs(5), Duration::ZERO).await.unwrap();

    assert!(matches!(
        lock.acquire(Duration::from_secs(5), Duration::ZERO).await,
        Err(LockError::AlreadyHeld { .. })
    ));
    lock.release().await.unwrap();
}

#[tokio::test]
async fn store_failure_during_acquire_is_reported() {
    let backend = InMemoryStore::new();
    backend.fail_next(
        StoreOp::SetIfAbsent,
        1,
        StoreError::Unavailable("connection refused".to_string()),
    );
    let lock = lock_on(&backend);

    assert!(matches!(
        lock.acquire(Duration::from_secs(5), Duration::from_secs(1)).await,
        Err(LockError::Store { .. })
    ));
    assert_eq!(lock.lease_status(), LeaseStatus::Released);
}

#[tokio::test]
async fn cancelled_acquire_stops_waiting() {
    let backend = InMemoryStore::new();
    let holder = lock_on(&backend);
    holder.acquire(Duration::from_secs(5), Duration::ZERO).await.unwrap();
    let waiter = lock_on(&backend);
    let cancel = CancellationToken::new();

    let started = Instant::now();
    let (outcome, ()) = tokio::join!(
        waiter.acquire_with_cancel(Duration::from_secs(5), Duration::from_secs(10), &cancel),
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        }
    );

    assert!(matches!(outcome, Err(LockError::Cancelled { .. })));
    assert!(started.elapsed() < Duration::from_secs(1));
    holder.release().await.unwrap();
}

// ============================================================================
// Mutual Exclusion
// ============================================================================

#[tokio::test]
async fn at_most_one_holder_at_any_instant() {
    let backend = InMemoryStore::new();
    let holders = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for _ in 0..8 {
        let lock = lock_on(&backend);
        let holders = Arc::clone(&holders);
        let max_seen = Arc::clone(&max_seen);
        let completed = Arc::clone(&completed);
        workers.push(tokio::spawn(async move {
            for _ in 0..3 {
                let acquired = lock
                    .acquire(Duration::from_secs(2), Duration::from_secs(10))
                    .await
                    .unwrap();
                assert!(acquired);

                let now_holding = holders.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now_holding, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                holders.fetch_sub(1, Ordering::SeqCst);

                lock.release().await.unwrap();
                completed.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    for worker in workers {
        worker.await.unwrap();
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert_eq!(completed.load(Ordering::SeqCst), 24);
}

// ============================================================================
// Lease Renewal
// ============================================================================

#[tokio::test]
async fn watchdog_keeps_the_lease_alive_past_its_ttl() {
    let backend = InMemoryStore::new();
    let lock = lock_on(&backend);
    let rival = lock_on(&backend);
    lock.acquire(Duration::from_millis(150), Duration::ZERO).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(lock.lease_status(), LeaseStatus::Held);
    assert!(!rival.acquire(Duration::from_secs(1), Duration::ZERO).await.unwrap());
    assert!(backend.calls(StoreOp::CompareAndExpire) >= 3);

    lock.release().await.unwrap();
    assert!(rival.acquire(Duration::from_secs(1), Duration::ZERO).await.unwrap());
    rival.release().await.unwrap();
}

#[tokio::test]
async fn dropping_the_handle_lets_the_lease_expire() {
    let backend = InMemoryStore::new();
    let lock = lock_on(&backend);
    let rival = lock_on(&backend);
    lock.acquire(Duration::from_millis(150), Duration::ZERO).await.unwrap();

    drop(lock);

    assert!(!rival.acquire(Duration::from_secs(1), Duration::ZERO).await.unwrap());
    assert!(
        rival
            .acquire(Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap()
    );
    rival.release().await.unwrap();
}

#[tokio::test]
async fn takeover_is_detected_and_release_leaves_the_new_owner_alone() {
    let backend = InMemoryStore::new();
    let lock = lock_on(&backend);
    let rival = lock_on(&backend);
    lock.acquire(Duration::from_millis(300), Duration::ZERO).await.unwrap();

    // Simulate the lease expiring during a pause, then another owner taking it.
    backend.remove(RESOURCE);
    assert!(rival.acquire(Duration::from_secs(5), Duration::ZERO).await.unwrap());
    let rival_token = backend.peek(RESOURCE).unwrap();

    assert!(eventually(Duration::from_secs(1), || lock.lease_status() == LeaseStatus::Lost).await);
    assert!(matches!(lock.release().await, Err(LockError::NotHeld { .. })));
    assert_eq!(backend.peek(RESOURCE), Some(rival_token));

    rival.release().await.unwrap();
}

#[tokio::test]
async fn renewal_error_marks_the_lease_uncertain() {
    let backend = InMemoryStore::new();
    let lock = lock_on(&backend);
    lock.acquire(Duration::from_millis(150), Duration::ZERO).await.unwrap();

    backend.fail_always(
        StoreOp::CompareAndExpire,
        StoreError::Unavailable("connection reset".to_string()),
    );

    assert!(
        eventually(Duration::from_secs(1), || lock.lease_status() == LeaseStatus::Uncertain).await
    );
    assert!(!lock.is_held());
}

#[tokio::test]
async fn lost_lease_can_be_reacquired_on_the_same_handle() {
    let backend = InMemoryStore::new();
    let lock = lock_on(&backend);
    lock.acquire(Duration::from_millis(150), Duration::ZERO).await.unwrap();

    backend.remove(RESOURCE);
    assert!(eventually(Duration::from_secs(1), || lock.lease_status() == LeaseStatus::Lost).await);

    assert!(lock.acquire(Duration::from_secs(5), Duration::ZERO).await.unwrap());
    assert_eq!(lock.lease_status(), LeaseStatus::Held);
    lock.release().await.unwrap();
}
