//! Binds the stock consumer to the order queue.

use crate::consumer::StockConsumer;
use mall_core::broker::ChannelError;
use mall_runtime::{MessageHandler, ReliableChannel};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Queue the order worker consumes by default.
pub const ORDER_CREATED_QUEUE: &str = "orders.created";

/// Consumes order events and deducts stock.
pub struct OrderWorker {
    channel: ReliableChannel,
    consumer: Arc<StockConsumer>,
    queue: String,
}

impl OrderWorker {
    /// Create a worker on [`ORDER_CREATED_QUEUE`].
    #[must_use]
    pub fn new(channel: ReliableChannel, consumer: Arc<StockConsumer>) -> Self {
        Self {
            channel,
            consumer,
            queue: ORDER_CREATED_QUEUE.to_string(),
        }
    }

    /// Consume `queue` instead of the default.
    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Queue this worker consumes.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Register the consumer with the channel.
    ///
    /// If the channel is reconnecting the registration is kept and consumption starts
    /// with the next session, so that case is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the channel was closed, or the session's
    /// error if it refuses the subscription.
    pub async fn start(&self) -> Result<(), ChannelError> {
        let handler: Arc<dyn MessageHandler> = self.consumer.clone();
        match self.channel.consume(&self.queue, handler).await {
            Ok(()) => {
                tracing::info!(queue = %self.queue, "Order worker started");
                Ok(())
            }
            Err(ChannelError::NotConnected) => {
                tracing::warn!(
                    queue = %self.queue,
                    "Broker not connected; order worker starts after reconnect"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stop consuming and let the order in flight finish before the store goes away.
    ///
    /// The channel is drained and closed first; only then is `store_shutdown`
    /// cancelled. Cancelling the store first would fail the in-flight deduction and
    /// its marker rollback, dead-lettering an order that was never applied.
    ///
    /// # Errors
    ///
    /// Returns the session's error if the channel cannot be closed cleanly. The store
    /// token is cancelled either way.
    pub async fn shutdown(&self, store_shutdown: &CancellationToken) -> Result<(), ChannelError> {
        let closed = self.channel.close().await;
        store_shutdown.cancel();
        tracing::info!(queue = %self.queue, "Order worker stopped");
        closed
    }
}

impl std::fmt::Debug for OrderWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderWorker")
            .field("queue", &self.queue)
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}
