//! Message broker abstraction.
//!
//! The broker is modelled as two layers:
//!
//! - [`BrokerTransport`]: knows how to open a connection. It is long-lived and can be
//!   asked to connect again after the broker drops us.
//! - [`BrokerSession`]: one live connection + channel. It publishes, starts consumers,
//!   and resolves its [`BrokerSession::closed`] future when the connection goes away.
//!
//! The reconnecting client in `mall-runtime` sits on top of these two traits; it never
//! needs to know which broker is underneath.
//!
//! # Delivery Semantics
//!
//! **At-least-once** with manual acknowledgement:
//! - A [`Delivery`] stays unacknowledged until [`Delivery::ack`] or [`Delivery::nack`]
//! - Unacknowledged deliveries are redelivered when a consumer re-registers
//! - Consumers MUST be idempotent
//!
//! # Publisher Confirms
//!
//! [`BrokerSession::publish`] returns as soon as the message is handed to the client
//! library. The broker's verdict arrives later through the returned [`PendingConfirm`].

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur on a broker connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// There is no live connection right now.
    #[error("Broker not connected")]
    NotConnected,

    /// Opening a connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker closed an established connection.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Failed to hand a message to the broker.
    #[error("Publish failed for '{exchange}/{routing_key}': {reason}")]
    PublishFailed {
        /// Target exchange
        exchange: String,
        /// Routing key used
        routing_key: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to start a consumer.
    #[error("Consume failed for queue '{queue}': {reason}")]
    ConsumeFailed {
        /// Queue that could not be consumed
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// An ack or nack could not be delivered to the broker.
    #[error("Acknowledgement failed for delivery {delivery_tag}: {reason}")]
    AcknowledgeFailed {
        /// Delivery tag of the message
        delivery_tag: u64,
        /// The reason for failure
        reason: String,
    },

    /// The client was closed explicitly and will not reconnect.
    #[error("Channel closed")]
    Closed,
}

/// Broker verdict for a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// The broker took responsibility for the message.
    Ack,
    /// The broker refused or lost the message.
    Nack {
        /// Why the broker refused it
        reason: String,
    },
}

/// Future resolving to the broker's verdict on one publish.
pub type PendingConfirm = BoxFuture<'static, Confirmation>;

/// Stream of deliveries for one consumer. Ends when the session closes.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Settles one delivery with the broker.
pub trait Acknowledger: Send + Sync {
    /// Acknowledge: the message is done and removed from the queue.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::AcknowledgeFailed`] if the broker cannot be told.
    fn ack(&self) -> BoxFuture<'_, Result<(), ChannelError>>;

    /// Negative acknowledge. With `requeue == false` the message is dropped (or
    /// dead-lettered, depending on the broker).
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::AcknowledgeFailed`] if the broker cannot be told.
    fn nack(&self, requeue: bool) -> BoxFuture<'_, Result<(), ChannelError>>;
}

/// One message handed to a consumer.
pub struct Delivery {
    /// Broker-assigned tag, unique per session.
    pub delivery_tag: u64,
    /// Message body.
    pub payload: Vec<u8>,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Create a delivery settled through `acker`.
    #[must_use]
    pub fn new(
        delivery_tag: u64,
        payload: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            payload,
            redelivered,
            acker,
        }
    }

    /// Acknowledge this delivery.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::AcknowledgeFailed`] if the broker cannot be told.
    pub async fn ack(self) -> Result<(), ChannelError> {
        self.acker.ack().await
    }

    /// Negatively acknowledge this delivery.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::AcknowledgeFailed`] if the broker cannot be told.
    pub async fn nack(self, requeue: bool) -> Result<(), ChannelError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// One live broker connection with an open channel.
///
/// # Dyn Compatibility
///
/// Explicit `BoxFuture` returns keep the trait usable as `Arc<dyn BrokerSession>`.
pub trait BrokerSession: Send + Sync {
    /// Publish a persistent message.
    ///
    /// Returns once the message is handed to the client; the broker's confirmation
    /// arrives through the returned [`PendingConfirm`].
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PublishFailed`] if the message cannot be handed over.
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<PendingConfirm, ChannelError>>;

    /// Start a manual-ack consumer on `queue` with at most `prefetch` unacknowledged
    /// deliveries outstanding.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ConsumeFailed`] if the subscription cannot be created.
    fn consume<'a>(
        &'a self,
        queue: &'a str,
        prefetch: u16,
    ) -> BoxFuture<'a, Result<DeliveryStream, ChannelError>>;

    /// Resolves when the connection closes.
    ///
    /// `None` means the close was requested through [`BrokerSession::close`];
    /// `Some(error)` means the broker or the network closed it.
    fn closed(&self) -> BoxFuture<'static, Option<ChannelError>>;

    /// Close the connection. Deliveries not yet acknowledged go back to the broker.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] if the connection cannot be shut down cleanly.
    fn close(&self) -> BoxFuture<'_, Result<(), ChannelError>>;
}

/// Opens broker sessions.
pub trait BrokerTransport: Send + Sync {
    /// Open a new connection and channel with publisher confirms enabled.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ConnectionFailed`] if the broker is unreachable.
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn BrokerSession>, ChannelError>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingAcker {
        outcome: Arc<Mutex<Option<String>>>,
    }

    impl Acknowledger for RecordingAcker {
        #[allow(clippy::unwrap_used)] // Test helper: mutex poisoning is a test failure
        fn ack(&self) -> BoxFuture<'_, Result<(), ChannelError>> {
            Box::pin(async move {
                *self.outcome.lock().unwrap() = Some("ack".to_string());
                Ok(())
            })
        }

        #[allow(clippy::unwrap_used)] // Test helper: mutex poisoning is a test failure
        fn nack(&self, requeue: bool) -> BoxFuture<'_, Result<(), ChannelError>> {
            Box::pin(async move {
                *self.outcome.lock().unwrap() = Some(format!("nack:{requeue}"));
                Ok(())
            })
        }
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn delivery_routes_settlement_to_its_acknowledger() {
        let outcome = Arc::new(Mutex::new(None));

        let delivery = Delivery::new(
            7,
            b"{}".to_vec(),
            false,
            Box::new(RecordingAcker {
                outcome: Arc::clone(&outcome),
            }),
        );
        delivery.nack(false).await.unwrap();
        assert_eq!(outcome.lock().unwrap().as_deref(), Some("nack:false"));

        let delivery = Delivery::new(
            8,
            b"{}".to_vec(),
            true,
            Box::new(RecordingAcker {
                outcome: Arc::clone(&outcome),
            }),
        );
        assert!(format!("{delivery:?}").contains("delivery_tag: 8"));
        delivery.ack().await.unwrap();
        assert_eq!(outcome.lock().unwrap().as_deref(), Some("ack"));
    }
}
