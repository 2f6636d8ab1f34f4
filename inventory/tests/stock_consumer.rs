//! Integration tests for `StockConsumer`
//!
//! Idempotency markers, settlement outcomes and compensation against an in-memory
//! store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use futures::future::BoxFuture;
use mall_core::event::OrderCreated;
use mall_core::store::{KeyValueStore, StoreError, StoreOp};
use mall_inventory::config::LockConfig;
use mall_inventory::{
    CompensationHook, ConsumeError, InventoryError, InventoryService, Outcome, StockConsumer,
    processed_key, stock_key,
};
use mall_runtime::MessageHandler;
use mall_testing::InMemoryStore;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Default)]
struct RecordingCompensation {
    rejected: Mutex<Vec<(u64, u64)>>,
}

impl CompensationHook for RecordingCompensation {
    fn insufficient_stock<'a>(
        &'a self,
        order: &'a OrderCreated,
        error: &'a InventoryError,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let available = match error {
                InventoryError::InsufficientStock { available, .. } => *available,
                other => panic!("unexpected compensation for {other}"),
            };
            self.rejected
                .lock()
                .unwrap()
                .push((order.order_id, available));
        })
    }
}

fn consumer_on(backend: &InMemoryStore) -> StockConsumer {
    let store: Arc<dyn KeyValueStore> = Arc::new(backend.clone());
    let inventory = InventoryService::new(
        Arc::clone(&store),
        Arc::clone(&store),
        LockConfig::default(),
    );
    StockConsumer::new(store, inventory)
}

fn order(order_id: u64, sku_id: u64, quantity: u32) -> Vec<u8> {
    OrderCreated::new(order_id, sku_id, quantity).to_json().unwrap()
}

// ============================================================================
// Happy Path and Duplicates
// ============================================================================

#[tokio::test]
async fn first_delivery_deducts_and_marks_the_order() {
    let backend = InMemoryStore::new();
    backend.insert(&stock_key(101), "5");
    let consumer = consumer_on(&backend);

    let outcome = consumer.process(&order(1, 101, 3)).await.unwrap();

    assert_eq!(outcome, Outcome::Deducted { remaining: 2 });
    assert_eq!(backend.peek(&stock_key(101)).as_deref(), Some("2"));
    assert!(backend.peek(&processed_key(1)).is_some());
    let ttl = backend.ttl(&processed_key(1)).unwrap();
    assert!(ttl > Duration::from_secs(23 * 60 * 60));
}

#[tokio::test]
async fn redelivery_is_acknowledged_without_a_second_deduction() {
    let backend = InMemoryStore::new();
    backend.insert(&stock_key(101), "5");
    let consumer = consumer_on(&backend);

    consumer.process(&order(1, 101, 3)).await.unwrap();
    let outcome = consumer.process(&order(1, 101, 3)).await.unwrap();

    assert_eq!(outcome, Outcome::Duplicate);
    assert_eq!(backend.peek(&stock_key(101)).as_deref(), Some("2"));
}

#[tokio::test]
async fn marker_ttl_can_be_overridden() {
    let backend = InMemoryStore::new();
    backend.insert(&stock_key(2), "1");
    let consumer = consumer_on(&backend).with_marker_ttl(Duration::from_secs(60));

    consumer.process(&order(9, 2, 1)).await.unwrap();

    assert!(backend.ttl(&processed_key(9)).unwrap() <= Duration::from_secs(60));
}

// ============================================================================
// Poison Messages
// ============================================================================

#[tokio::test]
async fn undecodable_payload_is_poison() {
    let backend = InMemoryStore::new();
    let consumer = consumer_on(&backend);

    assert_eq!(consumer.process(b"not json").await.unwrap(), Outcome::Poison);
    assert_eq!(
        consumer
            .process(br#"{"order_id":1,"sku_id":2}"#)
            .await
            .unwrap(),
        Outcome::Poison
    );
    assert!(backend.is_empty());
    assert_eq!(backend.total_calls(), 0);
}

#[tokio::test]
async fn zero_quantity_is_poison() {
    let backend = InMemoryStore::new();
    let consumer = consumer_on(&backend);

    let outcome = consumer
        .process(br#"{"order_id":1,"sku_id":2,"quantity":0}"#)
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Poison);
    assert!(backend.is_empty());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn marker_failure_rejects_without_deducting() {
    let backend = InMemoryStore::new();
    backend.insert(&stock_key(101), "5");
    backend.fail_matching(
        StoreOp::SetIfAbsent,
        "processed:",
        Some(1),
        StoreError::Unavailable("connection reset".to_string()),
    );
    let consumer = consumer_on(&backend);

    let err = consumer.process(&order(1, 101, 3)).await.unwrap_err();

    assert!(matches!(err, ConsumeError::Marker { order_id: 1, .. }));
    assert_eq!(backend.peek(&stock_key(101)).as_deref(), Some("5"));
    assert_eq!(backend.peek(&processed_key(1)), None);

    // The redelivery goes through.
    assert_eq!(
        consumer.process(&order(1, 101, 3)).await.unwrap(),
        Outcome::Deducted { remaining: 2 }
    );
}

#[tokio::test]
async fn insufficient_stock_keeps_the_marker_and_compensates() {
    let backend = InMemoryStore::new();
    backend.insert(&stock_key(101), "1");
    let compensation = Arc::new(RecordingCompensation::default());
    let consumer = consumer_on(&backend).with_compensation(compensation.clone());

    let outcome = consumer.process(&order(4, 101, 3)).await.unwrap();

    assert_eq!(outcome, Outcome::InsufficientStock);
    assert!(backend.peek(&processed_key(4)).is_some());
    assert_eq!(backend.peek(&stock_key(101)).as_deref(), Some("1"));
    assert_eq!(*compensation.rejected.lock().unwrap(), vec![(4, 1)]);

    // Restocking does not resurrect a rejected order.
    backend.insert(&stock_key(101), "10");
    assert_eq!(
        consumer.process(&order(4, 101, 3)).await.unwrap(),
        Outcome::Duplicate
    );
    assert_eq!(compensation.rejected.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn transient_failure_releases_the_marker_for_retry() {
    let backend = InMemoryStore::new();
    backend.insert(&stock_key(101), "5");
    backend.fail_matching(
        StoreOp::Get,
        "stock:",
        None,
        StoreError::Timeout("no reply".to_string()),
    );
    let consumer = consumer_on(&backend);

    let err = consumer.process(&order(2, 101, 1)).await.unwrap_err();

    assert!(matches!(
        err,
        ConsumeError::Deduction {
            order_id: 2,
            source: InventoryError::Store { .. }
        }
    ));
    assert_eq!(backend.peek(&processed_key(2)), None);

    backend.clear_faults();
    assert_eq!(
        consumer.process(&order(2, 101, 1)).await.unwrap(),
        Outcome::Deducted { remaining: 4 }
    );
}

#[tokio::test]
async fn corrupt_stock_releases_the_marker() {
    let backend = InMemoryStore::new();
    backend.insert(&stock_key(6), "NaN");
    let consumer = consumer_on(&backend);

    let err = consumer.process(&order(3, 6, 1)).await.unwrap_err();

    assert!(matches!(
        err,
        ConsumeError::Deduction {
            source: InventoryError::CorruptStock { .. },
            ..
        }
    ));
    assert_eq!(backend.peek(&processed_key(3)), None);
}

#[tokio::test]
async fn marker_rollback_failure_still_rejects() {
    let backend = InMemoryStore::new();
    backend.insert(&stock_key(101), "5");
    backend.fail_matching(
        StoreOp::Get,
        "stock:",
        None,
        StoreError::Unavailable("down".to_string()),
    );
    backend.fail_always(StoreOp::Delete, StoreError::Unavailable("down".to_string()));
    let consumer = consumer_on(&backend);

    let err = consumer.process(&order(8, 101, 1)).await.unwrap_err();

    assert!(matches!(err, ConsumeError::Deduction { order_id: 8, .. }));
    // The stale marker makes the redelivery a duplicate until it expires.
    assert!(backend.peek(&processed_key(8)).is_some());
}

// ============================================================================
// Message Handler Contract
// ============================================================================

#[tokio::test]
async fn handler_acks_outcomes_and_rejects_errors() {
    let backend = InMemoryStore::new();
    backend.insert(&stock_key(101), "5");
    let consumer = consumer_on(&backend);

    assert!(consumer.handle(&order(1, 101, 1)).await.is_ok());
    assert!(consumer.handle(&order(1, 101, 1)).await.is_ok());
    assert!(consumer.handle(b"{").await.is_ok());

    backend.fail_matching(
        StoreOp::SetIfAbsent,
        "processed:",
        None,
        StoreError::Backend("READONLY".to_string()),
    );
    let err = consumer.handle(&order(2, 101, 1)).await.unwrap_err();
    assert!(err.downcast_ref::<ConsumeError>().is_some());
}
