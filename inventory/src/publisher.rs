//! Publishes order events.

use mall_core::broker::ChannelError;
use mall_core::event::{EventError, OrderCreated};
use mall_runtime::ReliableChannel;
use thiserror::Error;

/// Exchange order events are published to.
pub const ORDERS_EXCHANGE: &str = "orders";

/// Routing key of `OrderCreated` events.
pub const ORDER_CREATED_ROUTING_KEY: &str = "orders.created";

/// Errors from publishing an order event.
#[derive(Error, Debug)]
pub enum PublishError {
    /// The event could not be encoded.
    #[error(transparent)]
    Encode(#[from] EventError),

    /// The channel refused the message.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Serialises order events onto a [`ReliableChannel`].
#[derive(Clone)]
pub struct OrderEventPublisher {
    channel: ReliableChannel,
}

impl OrderEventPublisher {
    /// Publish through `channel`.
    #[must_use]
    pub const fn new(channel: ReliableChannel) -> Self {
        Self { channel }
    }

    /// Publish `event` to [`ORDERS_EXCHANGE`] with [`ORDER_CREATED_ROUTING_KEY`].
    ///
    /// Returns once the message is handed to the broker client.
    ///
    /// # Errors
    ///
    /// - [`PublishError::Encode`] for a zero-quantity event
    /// - [`PublishError::Channel`] while disconnected or after close
    pub async fn publish_order_created(&self, event: &OrderCreated) -> Result<(), PublishError> {
        let payload = event.to_json()?;
        self.channel
            .publish(ORDERS_EXCHANGE, ORDER_CREATED_ROUTING_KEY, &payload)
            .await?;
        tracing::debug!(
            order_id = event.order_id,
            sku = event.sku_id,
            "Order created event published"
        );
        Ok(())
    }
}

impl std::fmt::Debug for OrderEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderEventPublisher")
            .field("exchange", &ORDERS_EXCHANGE)
            .field("routing_key", &ORDER_CREATED_ROUTING_KEY)
            .finish_non_exhaustive()
    }
}
