//! # Mall Inventory
//!
//! Stock deduction for the mall order pipeline.
//!
//! An `OrderCreated` event arrives on the `orders.created` queue, the
//! [`StockConsumer`] checks its idempotency marker, and [`InventoryService::deduct`]
//! removes the ordered units under the SKU lock. Everything underneath is pluggable:
//! stock and markers sit behind `mall_core::KeyValueStore`, the queue behind
//! `mall_core::BrokerTransport`.
//!
//! ## Example
//!
//! ```ignore
//! use mall_inventory::{InventoryService, OrderWorker, StockConsumer};
//!
//! let inventory = InventoryService::new(store.clone(), lock_store, config.lock.clone());
//! let consumer = Arc::new(StockConsumer::new(store, inventory));
//! OrderWorker::new(channel, consumer).start().await?;
//! ```

/// Worker configuration
pub mod config;

/// Stock levels and locked deduction
pub mod inventory;

/// Idempotent `OrderCreated` consumer
pub mod consumer;

/// Order event publishing
pub mod publisher;

/// Queue binding for the consumer
pub mod worker;

pub use config::{ConfigError, Environment, WorkerConfig};
pub use consumer::{
    CompensationHook, ConsumeError, LogCompensation, Outcome, StockConsumer, processed_key,
};
pub use inventory::{InventoryError, InventoryService, lock_key, stock_key};
pub use publisher::{ORDER_CREATED_ROUTING_KEY, ORDERS_EXCHANGE, OrderEventPublisher, PublishError};
pub use worker::{ORDER_CREATED_QUEUE, OrderWorker};

use metrics::{describe_counter, describe_histogram};

/// Register descriptions for the metrics this crate records.
///
/// Call after the recorder is installed.
pub fn describe_metrics() {
    describe_counter!("inventory_deductions_total", "Successful stock deductions");
    describe_counter!("inventory_restocks_total", "Successful restocks");
    describe_counter!(
        "stock_consumer_messages_total",
        "Order deliveries handled, by outcome"
    );
    describe_histogram!(
        "stock_consumer_duration_seconds",
        "Time to handle one order delivery"
    );
    describe_counter!(
        "stock_compensations_total",
        "Orders rejected for insufficient stock"
    );
}
