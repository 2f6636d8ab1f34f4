//! Redpanda broker transport for the mall inventory subsystem.
//!
//! This crate implements [`BrokerTransport`] and [`BrokerSession`] from `mall-core` on
//! top of rdkafka, so the reconnecting channel in `mall-runtime` can run against
//! Redpanda (or any Kafka-compatible broker).
//!
//! # Topic Mapping
//!
//! The broker traits speak in exchanges, routing keys and queues. On Redpanda:
//!
//! - A publish to `(exchange, routing_key)` produces to the topic named by the routing
//!   key; a non-empty exchange becomes the record key
//! - Consuming `queue` subscribes to the topic of the same name with a consumer group
//!   (explicit, or `mall-{queue}`)
//! - `nack` forwards the record to `{queue}.dead-letter` and then commits it
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Offsets are committed only when a delivery is acked or dead-lettered
//! - If the session drops before that, the record is redelivered from the last commit
//! - `prefetch` bounds the number of unsettled deliveries per consumer
//!
//! # Session Lifetime
//!
//! A session ends when [`BrokerSession::close`] is called or when librdkafka reports
//! that every broker is down. Either way the delivery streams end and
//! [`BrokerSession::closed`] resolves.
//!
//! # Example
//!
//! ```no_run
//! use mall_core::broker::BrokerTransport;
//! use mall_redpanda::RedpandaTransport;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = RedpandaTransport::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("mall-inventory")
//!     .build()?;
//!
//! let session = transport.connect().await?;
//! let confirm = session
//!     .publish("orders", "orders.created", br#"{"order_id":1,"sku_id":101,"quantity":3}"#)
//!     .await?;
//! let _verdict = confirm.await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use futures::future::BoxFuture;
use mall_core::broker::{
    Acknowledger, BrokerSession, BrokerTransport, ChannelError, Confirmation, Delivery,
    DeliveryStream, PendingConfirm,
};
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Message, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio_util::sync::CancellationToken;

/// Suffix of the topic that receives rejected deliveries.
pub const DEAD_LETTER_SUFFIX: &str = ".dead-letter";

/// Topic that receives deliveries rejected from `queue`.
#[must_use]
pub fn dead_letter_topic(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_SUFFIX}")
}

/// Kafka-compatible [`BrokerTransport`].
///
/// Each [`connect`](BrokerTransport::connect) builds a fresh producer, checks that the
/// cluster answers a metadata request, and returns a [`BrokerSession`] that owns it.
/// Consumers are created per `consume` call and belong to that session.
///
/// # Example
///
/// ```no_run
/// use mall_redpanda::RedpandaTransport;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = RedpandaTransport::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedpandaTransport {
    settings: Arc<Settings>,
}

#[derive(Debug)]
struct Settings {
    brokers: String,
    producer_acks: String,
    compression: String,
    timeout: Duration,
    consumer_group: Option<String>,
    auto_offset_reset: String,
    session_timeout: Duration,
}

impl RedpandaTransport {
    /// Create a transport for `brokers` with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ConnectionFailed`] if `brokers` is empty.
    pub fn new(brokers: &str) -> Result<Self, ChannelError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the transport.
    #[must_use]
    pub fn builder() -> RedpandaTransportBuilder {
        RedpandaTransportBuilder::default()
    }

    /// Bootstrap servers this transport connects to.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.settings.brokers
    }

    fn producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.settings.brokers)
            .set(
                "message.timeout.ms",
                self.settings.timeout.as_millis().to_string(),
            )
            .set("acks", &self.settings.producer_acks)
            .set("compression.type", &self.settings.compression)
            .set("enable.idempotence", "true");
        config
    }
}

impl fmt::Debug for RedpandaTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedpandaTransport")
            .field("brokers", &self.settings.brokers)
            .field("consumer_group", &self.settings.consumer_group)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`RedpandaTransport`].
#[derive(Default)]
pub struct RedpandaTransportBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
    session_timeout: Option<Duration>,
}

impl RedpandaTransportBuilder {
    /// Comma-separated bootstrap servers (e.g. `"localhost:9092"`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`. Messages are persistent, so the default waits for every replica.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Bound on metadata requests, delivery reports and dead-letter forwarding.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Consumer group shared by every queue consumed through this transport.
    ///
    /// If not set, each queue gets its own group named `mall-{queue}`.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Where a new consumer group starts reading: `"earliest"` or `"latest"`.
    ///
    /// Default: `"earliest"`, so orders published before the first worker started are
    /// not skipped.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Consumer group session timeout.
    ///
    /// Default: 6 seconds
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Build the [`RedpandaTransport`]. No connection is made until
    /// [`connect`](BrokerTransport::connect).
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ConnectionFailed`] if brokers are not configured.
    pub fn build(self) -> Result<RedpandaTransport, ChannelError> {
        let brokers = self
            .brokers
            .filter(|brokers| !brokers.trim().is_empty())
            .ok_or_else(|| ChannelError::ConnectionFailed("Brokers not configured".to_string()))?;

        let settings = Settings {
            brokers,
            producer_acks: self.producer_acks.unwrap_or_else(|| "all".to_string()),
            compression: self.compression.unwrap_or_else(|| "none".to_string()),
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            consumer_group: self.consumer_group,
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
            session_timeout: self.session_timeout.unwrap_or(Duration::from_secs(6)),
        };

        tracing::info!(
            brokers = %settings.brokers,
            acks = %settings.producer_acks,
            compression = %settings.compression,
            auto_offset_reset = %settings.auto_offset_reset,
            "RedpandaTransport configured"
        );

        Ok(RedpandaTransport {
            settings: Arc::new(settings),
        })
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionStatus {
    Open,
    Closed(Option<ChannelError>),
}

/// Shared by the producer and every consumer of one session. librdkafka calls
/// [`ClientContext::error`] from its own threads, which is where a dead cluster
/// is noticed.
#[derive(Clone)]
struct SessionContext {
    status: Arc<watch::Sender<SessionStatus>>,
    shutdown: CancellationToken,
}

impl SessionContext {
    fn new() -> Self {
        let (status, _) = watch::channel(SessionStatus::Open);
        Self {
            status: Arc::new(status),
            shutdown: CancellationToken::new(),
        }
    }

    /// First close wins; later reasons are ignored.
    fn close_with(&self, reason: Option<ChannelError>) {
        self.status.send_if_modified(|status| {
            if *status == SessionStatus::Open {
                *status = SessionStatus::Closed(reason);
                true
            } else {
                false
            }
        });
        self.shutdown.cancel();
    }

    fn is_open(&self) -> bool {
        *self.status.borrow() == SessionStatus::Open
    }
}

impl ClientContext for SessionContext {
    fn error(&self, error: KafkaError, reason: &str) {
        if error.rdkafka_error_code() == Some(RDKafkaErrorCode::AllBrokersDown) {
            tracing::warn!(error = %error, reason, "All brokers down, closing session");
            self.close_with(Some(ChannelError::ConnectionLost(format!(
                "all brokers down: {reason}"
            ))));
        } else {
            tracing::warn!(error = %error, reason, "librdkafka error");
        }
    }
}

impl ConsumerContext for SessionContext {}

struct RedpandaSession {
    settings: Arc<Settings>,
    producer: FutureProducer<SessionContext>,
    context: SessionContext,
}

impl BrokerTransport for RedpandaTransport {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn BrokerSession>, ChannelError>> {
        Box::pin(async move {
            let context = SessionContext::new();
            let producer: FutureProducer<SessionContext> = self
                .producer_config()
                .create_with_context(context.clone())
                .map_err(|e| {
                    ChannelError::ConnectionFailed(format!("Failed to create producer: {e}"))
                })?;

            // Producer creation never touches the network; a metadata round-trip does.
            let probe = producer.clone();
            let timeout = self.settings.timeout;
            tokio::task::spawn_blocking(move || {
                probe.client().fetch_metadata(None, timeout).map(|_| ())
            })
                .await
                .map_err(|e| ChannelError::ConnectionFailed(format!("Metadata probe aborted: {e}")))?
                .map_err(|e| {
                    ChannelError::ConnectionFailed(format!(
                        "Brokers {} unreachable: {e}",
                        self.settings.brokers
                    ))
                })?;

            tracing::info!(brokers = %self.settings.brokers, "Redpanda session opened");

            Ok(Arc::new(RedpandaSession {
                settings: Arc::clone(&self.settings),
                producer,
                context,
            }) as Arc<dyn BrokerSession>)
        })
    }
}

impl RedpandaSession {
    fn group_for(&self, queue: &str) -> String {
        self.settings
            .consumer_group
            .clone()
            .unwrap_or_else(|| format!("mall-{queue}"))
    }

    fn create_consumer(&self, queue: &str) -> Result<StreamConsumer<SessionContext>, ChannelError> {
        let group = self.group_for(queue);
        let consumer: StreamConsumer<SessionContext> = ClientConfig::new()
            .set("bootstrap.servers", &self.settings.brokers)
            .set("group.id", &group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.settings.auto_offset_reset)
            .set(
                "session.timeout.ms",
                self.settings.session_timeout.as_millis().to_string(),
            )
            .set("enable.partition.eof", "false")
            .create_with_context(self.context.clone())
            .map_err(|e| ChannelError::ConsumeFailed {
                queue: queue.to_string(),
                reason: format!("Failed to create consumer: {e}"),
            })?;

        consumer
            .subscribe(&[queue])
            .map_err(|e| ChannelError::ConsumeFailed {
                queue: queue.to_string(),
                reason: format!("Failed to subscribe: {e}"),
            })?;

        tracing::info!(queue, consumer_group = %group, "Subscribed to topic");
        Ok(consumer)
    }
}

impl BrokerSession for RedpandaSession {
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<PendingConfirm, ChannelError>> {
        Box::pin(async move {
            if !self.context.is_open() {
                return Err(ChannelError::NotConnected);
            }

            let mut record = FutureRecord::<str, [u8]>::to(routing_key).payload(payload);
            if !exchange.is_empty() {
                record = record.key(exchange);
            }

            let delivery = self.producer.send_result(record).map_err(|(e, _)| {
                ChannelError::PublishFailed {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    reason: e.to_string(),
                }
            })?;

            tracing::trace!(exchange, topic = routing_key, "Record enqueued");

            let confirm: PendingConfirm = Box::pin(async move {
                match delivery.await {
                    Ok(Ok(_)) => Confirmation::Ack,
                    Ok(Err((e, _))) => Confirmation::Nack {
                        reason: e.to_string(),
                    },
                    Err(_) => Confirmation::Nack {
                        reason: "delivery report dropped".to_string(),
                    },
                }
            });
            Ok(confirm)
        })
    }

    fn consume<'a>(
        &'a self,
        queue: &'a str,
        prefetch: u16,
    ) -> BoxFuture<'a, Result<DeliveryStream, ChannelError>> {
        Box::pin(async move {
            if !self.context.is_open() {
                return Err(ChannelError::NotConnected);
            }

            let consumer = Arc::new(self.create_consumer(queue)?);
            let unsettled = Arc::new(Semaphore::new(usize::from(prefetch.max(1))));
            let shutdown = self.context.shutdown.clone();
            let producer = self.producer.clone();
            let timeout = self.settings.timeout;
            let queue = queue.to_string();

            let stream = async_stream::stream! {
                let mut delivery_tag = 0u64;
                loop {
                    let permit = tokio::select! {
                        () = shutdown.cancelled() => break,
                        permit = Arc::clone(&unsettled).acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };

                    let received = tokio::select! {
                        () = shutdown.cancelled() => break,
                        received = consumer.recv() => received.map(|message| message.detach()),
                    };

                    match received {
                        Ok(message) => {
                            delivery_tag += 1;
                            tracing::trace!(
                                queue = %queue,
                                partition = message.partition(),
                                offset = message.offset(),
                                "Received record"
                            );
                            let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
                            let acker = RecordAcker {
                                consumer: Arc::clone(&consumer),
                                producer: producer.clone(),
                                queue: queue.clone(),
                                message,
                                timeout,
                                _permit: permit,
                            };
                            yield Delivery::new(delivery_tag, payload, false, Box::new(acker));
                        }
                        Err(e) => {
                            tracing::warn!(queue = %queue, error = %e, "Failed to receive record");
                        }
                    }
                }
                tracing::debug!(queue = %queue, "Delivery stream ended");
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }

    fn closed(&self) -> BoxFuture<'static, Option<ChannelError>> {
        let mut status = self.context.status.subscribe();
        Box::pin(async move {
            loop {
                let current = status.borrow_and_update().clone();
                if let SessionStatus::Closed(reason) = current {
                    return reason;
                }
                if status.changed().await.is_err() {
                    return Some(ChannelError::ConnectionLost("session dropped".to_string()));
                }
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move {
            self.context.close_with(None);

            let producer = self.producer.clone();
            let timeout = self.settings.timeout;
            tokio::task::spawn_blocking(move || producer.flush(timeout))
                .await
                .map_err(|e| ChannelError::ConnectionLost(format!("Flush aborted: {e}")))?
                .map_err(|e| ChannelError::ConnectionLost(format!("Flush failed: {e}")))?;

            tracing::info!(brokers = %self.settings.brokers, "Redpanda session closed");
            Ok(())
        })
    }
}

// ============================================================================
// Acknowledgement
// ============================================================================

/// Settles one record. Holding the permit keeps the record counted against prefetch.
struct RecordAcker {
    consumer: Arc<StreamConsumer<SessionContext>>,
    producer: FutureProducer<SessionContext>,
    queue: String,
    message: OwnedMessage,
    timeout: Duration,
    _permit: OwnedSemaphorePermit,
}

impl RecordAcker {
    fn ack_failed(&self, reason: impl fmt::Display) -> ChannelError {
        ChannelError::AcknowledgeFailed {
            delivery_tag: u64::try_from(self.message.offset()).unwrap_or_default(),
            reason: reason.to_string(),
        }
    }

    fn commit(&self) -> Result<(), ChannelError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                self.message.topic(),
                self.message.partition(),
                Offset::Offset(self.message.offset() + 1),
            )
            .map_err(|e| self.ack_failed(e))?;
        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| self.ack_failed(e))
    }
}

impl Acknowledger for RecordAcker {
    fn ack(&self) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move { self.commit() })
    }

    fn nack(&self, requeue: bool) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move {
            if requeue {
                // Rewind so the same consumer reads the record again.
                return self
                    .consumer
                    .seek(
                        self.message.topic(),
                        self.message.partition(),
                        Offset::Offset(self.message.offset()),
                        Timeout::After(self.timeout),
                    )
                    .map_err(|e| self.ack_failed(e));
            }

            let topic = dead_letter_topic(&self.queue);
            let mut record =
                FutureRecord::<[u8], [u8]>::to(&topic).payload(self.message.payload().unwrap_or_default());
            if let Some(key) = self.message.key() {
                record = record.key(key);
            }
            self.producer
                .send(record, Timeout::After(self.timeout))
                .await
                .map_err(|(e, _)| self.ack_failed(format!("dead-letter to {topic}: {e}")))?;

            tracing::warn!(
                queue = %self.queue,
                dead_letter = %topic,
                offset = self.message.offset(),
                "Record dead-lettered"
            );
            self.commit()
        })
    }
}
