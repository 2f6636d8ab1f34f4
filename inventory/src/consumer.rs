//! Idempotent stock consumer.
//!
//! Handles `OrderCreated` deliveries under at-least-once delivery. The outcome of each
//! delivery decides how the broker settles it:
//!
//! | Situation | Marker | Settlement |
//! |-----------|--------|------------|
//! | Payload does not decode or has zero quantity | untouched | ack (poison) |
//! | `processed:order:{id}` already present | untouched | ack (duplicate) |
//! | Marker write fails | none | nack |
//! | Stock deducted | kept | ack |
//! | Insufficient stock | kept | ack, compensation runs |
//! | Any other deduction failure | deleted | nack |
//!
//! Deleting the marker on a transient failure lets a redelivery try again; keeping it on
//! insufficient stock stops a redelivery from retrying a business rejection.

use crate::inventory::{InventoryError, InventoryService};
use futures::future::BoxFuture;
use mall_core::event::OrderCreated;
use mall_core::store::{KeyValueStore, StoreError};
use mall_runtime::MessageHandler;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::Instrument;

/// How long an order stays marked as processed.
pub const PROCESSED_MARKER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Store key of the idempotency marker for `order_id`.
#[must_use]
pub fn processed_key(order_id: u64) -> String {
    format!("processed:order:{order_id}")
}

/// What happened to a delivery that was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Stock was deducted.
    Deducted {
        /// Units left after the deduction
        remaining: u64,
    },
    /// The order was already processed (or is being processed).
    Duplicate,
    /// The payload could not be decoded.
    Poison,
    /// Not enough stock; the order was handed to compensation.
    InsufficientStock,
}

impl Outcome {
    /// Lowercase label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deducted { .. } => "deducted",
            Self::Duplicate => "duplicate",
            Self::Poison => "poison",
            Self::InsufficientStock => "insufficient_stock",
        }
    }
}

/// Failures that reject the delivery so it can be redelivered or dead-lettered.
#[derive(Error, Debug)]
pub enum ConsumeError {
    /// The idempotency marker could not be written.
    #[error("Idempotency check failed for order {order_id}: {source}")]
    Marker {
        /// Order being processed
        order_id: u64,
        /// Underlying store error
        #[source]
        source: StoreError,
    },

    /// Deduction failed for a reason other than insufficient stock.
    #[error("Stock deduction failed for order {order_id}: {source}")]
    Deduction {
        /// Order being processed
        order_id: u64,
        /// Underlying inventory error
        #[source]
        source: InventoryError,
    },
}

/// Reacts to orders that cannot be fulfilled.
///
/// Runs after the delivery is known to be acknowledged; it cannot change that.
pub trait CompensationHook: Send + Sync {
    /// `order` was rejected with `error` (always [`InventoryError::InsufficientStock`]).
    fn insufficient_stock<'a>(
        &'a self,
        order: &'a OrderCreated,
        error: &'a InventoryError,
    ) -> BoxFuture<'a, ()>;
}

/// Logs and counts rejected orders.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogCompensation;

impl CompensationHook for LogCompensation {
    fn insufficient_stock<'a>(
        &'a self,
        order: &'a OrderCreated,
        error: &'a InventoryError,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::error!(
                order_id = order.order_id,
                sku = order.sku_id,
                quantity = order.quantity,
                error = %error,
                "Order cannot be fulfilled; compensation required"
            );
            metrics::counter!("stock_compensations_total").increment(1);
        })
    }
}

/// Deducts stock for `OrderCreated` deliveries, at most once per order.
pub struct StockConsumer {
    store: Arc<dyn KeyValueStore>,
    inventory: InventoryService,
    compensation: Arc<dyn CompensationHook>,
    marker_ttl: Duration,
}

impl StockConsumer {
    /// Create a consumer. Markers are written to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, inventory: InventoryService) -> Self {
        Self {
            store,
            inventory,
            compensation: Arc::new(LogCompensation),
            marker_ttl: PROCESSED_MARKER_TTL,
        }
    }

    /// Replace the default [`LogCompensation`].
    #[must_use]
    pub fn with_compensation(mut self, hook: Arc<dyn CompensationHook>) -> Self {
        self.compensation = hook;
        self
    }

    /// Override how long processed markers live.
    #[must_use]
    pub const fn with_marker_ttl(mut self, ttl: Duration) -> Self {
        self.marker_ttl = ttl;
        self
    }

    /// Process one payload.
    ///
    /// `Ok` means acknowledge; `Err` means reject.
    ///
    /// # Errors
    ///
    /// - [`ConsumeError::Marker`] if the idempotency marker cannot be written
    /// - [`ConsumeError::Deduction`] for a transient deduction failure; the marker has
    ///   been removed by then
    pub async fn process(&self, payload: &[u8]) -> Result<Outcome, ConsumeError> {
        let started = Instant::now();
        let result = self.process_inner(payload).await;

        metrics::histogram!("stock_consumer_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        match &result {
            Ok(outcome) => {
                metrics::counter!("stock_consumer_messages_total", "outcome" => outcome.as_str())
                    .increment(1);
            }
            Err(ConsumeError::Marker { .. }) => {
                metrics::counter!("stock_consumer_messages_total", "outcome" => "marker_error")
                    .increment(1);
            }
            Err(ConsumeError::Deduction { source, .. }) => {
                metrics::counter!("stock_consumer_messages_total", "outcome" => source.kind())
                    .increment(1);
            }
        }
        result
    }

    async fn process_inner(&self, payload: &[u8]) -> Result<Outcome, ConsumeError> {
        let order = match OrderCreated::from_json(payload) {
            Ok(order) => order,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    body = %String::from_utf8_lossy(payload),
                    "Poison message dropped"
                );
                return Ok(Outcome::Poison);
            }
        };

        let span = tracing::info_span!("stock_deduction", order_id = order.order_id, sku = order.sku_id);
        self.handle_order(order).instrument(span).await
    }

    async fn handle_order(&self, order: OrderCreated) -> Result<Outcome, ConsumeError> {
        let marker = processed_key(order.order_id);
        let first_time = self
            .store
            .set_if_absent(&marker, "1", self.marker_ttl)
            .await
            .map_err(|source| {
                tracing::error!(error = %source, "Idempotency check failed");
                ConsumeError::Marker {
                    order_id: order.order_id,
                    source,
                }
            })?;
        if !first_time {
            tracing::info!("Duplicate order ignored");
            return Ok(Outcome::Duplicate);
        }

        tracing::info!(quantity = order.quantity, "Processing order");
        match self.inventory.deduct(order.sku_id, order.quantity).await {
            Ok(remaining) => {
                tracing::info!(remaining, "Order processed");
                Ok(Outcome::Deducted { remaining })
            }
            Err(e) if e.is_terminal() => {
                tracing::warn!(error = %e, "Order rejected: insufficient stock");
                self.compensation.insufficient_stock(&order, &e).await;
                Ok(Outcome::InsufficientStock)
            }
            Err(e) => {
                tracing::error!(error = %e, kind = e.kind(), "Deduction failed; releasing marker for retry");
                if let Err(rollback) = self.store.delete(&[marker]).await {
                    tracing::error!(error = %rollback, "Failed to roll back idempotency marker");
                }
                Err(ConsumeError::Deduction {
                    order_id: order.order_id,
                    source: e,
                })
            }
        }
    }
}

impl MessageHandler for StockConsumer {
    fn handle<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.process(payload).await?;
            Ok(())
        })
    }
}

impl std::fmt::Debug for StockConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StockConsumer")
            .field("inventory", &self.inventory)
            .field("marker_ttl", &self.marker_ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_key_and_ttl() {
        assert_eq!(processed_key(42), "processed:order:42");
        assert_eq!(PROCESSED_MARKER_TTL, Duration::from_secs(86_400));
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(Outcome::Deducted { remaining: 2 }.as_str(), "deducted");
        assert_eq!(Outcome::Duplicate.as_str(), "duplicate");
        assert_eq!(Outcome::Poison.as_str(), "poison");
        assert_eq!(Outcome::InsufficientStock.as_str(), "insufficient_stock");
    }
}
