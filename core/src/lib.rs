//! # Mall Core
//!
//! Core traits and types shared by every crate of the mall inventory subsystem.
//!
//! This crate provides the seams the rest of the workspace plugs into:
//!
//! - [`store::KeyValueStore`]: the shared key-value store (Redis in production)
//! - [`broker::BrokerTransport`] / [`broker::BrokerSession`]: a message broker connection
//! - [`event::OrderCreated`]: the stock-deduction event payload
//!
//! ## Architecture
//!
//! ```text
//! producer ──publish──▶ ReliableChannel ──deliver──▶ StockConsumer
//!                                                     │
//!                                   idempotency marker│  DistributedLock(sku)
//!                                                     ▼
//!                                               ResilientStore ──▶ KeyValueStore
//! ```
//!
//! Everything here is a trait or plain data. Implementations live in
//! `mall-redis`, `mall-redpanda` and (for tests) `mall-testing`; the resilience
//! machinery that composes them lives in `mall-runtime`.
//!
//! ## Dyn Compatibility
//!
//! The traits return `BoxFuture`s instead of using `async fn` so they can be used as
//! `Arc<dyn KeyValueStore>` and `Arc<dyn BrokerTransport>`. Components are wired by
//! explicit injection; nothing in the workspace keeps process-wide state.

pub mod broker;
pub mod event;
pub mod store;

pub use broker::{
    Acknowledger, BrokerSession, BrokerTransport, ChannelError, Confirmation, Delivery,
    DeliveryStream, PendingConfirm,
};
pub use event::{EventError, OrderCreated};
pub use store::{KeyValueStore, StoreError, StoreOp};
