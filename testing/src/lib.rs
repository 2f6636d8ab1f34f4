//! # Mall Testing
//!
//! Test doubles for the mall inventory subsystem.
//!
//! This crate provides:
//! - [`InMemoryStore`]: a `KeyValueStore` with TTLs, call counters and fault injection
//! - [`InMemoryBroker`]: a `BrokerTransport` with acks, prefetch, dead letters and
//!   connection-drop simulation
//! - Helpers for polling asynchronous outcomes and wiring test logging
//!
//! ## Example
//!
//! ```ignore
//! use mall_testing::{InMemoryBroker, InMemoryStore, eventually};
//!
//! #[tokio::test]
//! async fn test_order_is_processed() {
//!     let store = InMemoryStore::new();
//!     let broker = InMemoryBroker::new();
//!     // ... start a worker, publish an order ...
//!     assert!(eventually(Duration::from_secs(2), || broker.is_drained("orders.created")).await);
//! }
//! ```

/// In-memory key-value store
pub mod store_mocks;

/// In-memory message broker
pub mod broker_mocks;

/// Test helpers and utilities.
pub mod helpers {
    use std::time::Duration;

    /// Poll `condition` every 5ms until it holds or `timeout` elapses.
    ///
    /// Returns whether the condition was met.
    pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Route `tracing` output to the test harness, honouring `RUST_LOG`.
    ///
    /// Safe to call from every test; only the first call installs the subscriber.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }
}

// Re-export commonly used items
pub use broker_mocks::{InMemoryBroker, PublishedMessage};
pub use helpers::{eventually, init_test_tracing};
pub use store_mocks::InMemoryStore;
