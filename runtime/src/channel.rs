//! Self-healing broker client.
//!
//! [`ReliableChannel`] owns one live [`BrokerSession`] at a time and a supervisor task
//! that watches it. When the broker drops the connection the supervisor reconnects
//! with exponential backoff (1s doubling to a 30s cap, unbounded attempts) and then
//! restarts every consumer registered through [`ReliableChannel::consume`].
//!
//! # Delivery Contract
//!
//! Consumers run with manual acknowledgement and prefetch 1:
//!
//! - handler returns `Ok(())` → the delivery is acked
//! - handler returns `Err(_)` → the delivery is nacked without requeue
//!
//! Only one message per consumer is in flight, and a delivery is settled only after
//! its handler returns. If the connection drops mid-handler the settle fails and the
//! broker redelivers.
//!
//! # Shutdown
//!
//! [`ReliableChannel::close`] stops intake first, then waits (up to
//! [`ChannelConfig::drain_timeout`]) for in-flight handlers to settle before the session
//! is closed. A handler that outlives the drain is aborted and its delivery is left
//! unsettled for the broker to redeliver.
//!
//! # Publishing
//!
//! [`ReliableChannel::publish`] is fire-and-forget: it returns once the message is
//! handed over. The broker's confirmation is observed in the background; a negative
//! confirmation is logged and counted, never returned.
//!
//! # Example
//!
//! ```rust,ignore
//! let channel = ReliableChannel::connect(transport, ChannelConfig::default()).await?;
//! channel.consume("orders.created", handler).await?;
//! channel.publish("orders", "orders.created", &payload).await?;
//! ```

use crate::retry::RetryPolicy;
use futures::StreamExt;
use futures::future::BoxFuture;
use mall_core::broker::{
    BrokerSession, BrokerTransport, ChannelError, Confirmation, Delivery, DeliveryStream,
    PendingConfirm,
};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Processes one message payload.
///
/// `Ok(())` acknowledges the delivery; `Err(_)` rejects it without requeue.
pub trait MessageHandler: Send + Sync {
    /// Handle one payload.
    ///
    /// # Errors
    ///
    /// Any error rejects the delivery.
    fn handle<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, anyhow::Result<()>>;
}

struct FnHandler<F>(F);

impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin((self.0)(payload.to_vec()))
    }
}

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Connection lifecycle as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live session; the supervisor is waiting to reconnect.
    Disconnected,
    /// A reconnect attempt is in progress.
    Connecting,
    /// A session is live.
    Connected,
    /// [`ReliableChannel::close`] was called. Terminal.
    Closed,
}

impl ConnectionState {
    /// Lowercase label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
        }
    }
}

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Maximum unacknowledged deliveries per consumer.
    pub prefetch: u16,
    /// Backoff between reconnect attempts.
    pub reconnect: RetryPolicy,
    /// How long [`ReliableChannel::close`] waits for in-flight handlers.
    pub drain_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch: 1,
            reconnect: RetryPolicy::reconnect(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
struct Registration {
    queue: String,
    handler: Arc<dyn MessageHandler>,
}

#[derive(Clone)]
struct Live {
    session: Arc<dyn BrokerSession>,
    /// Cancelled when this session dies; stops its consumer loops.
    consumers: CancellationToken,
}

struct Inner {
    transport: Arc<dyn BrokerTransport>,
    config: ChannelConfig,
    live: RwLock<Option<Live>>,
    state: watch::Sender<ConnectionState>,
    registrations: Mutex<Vec<Registration>>,
    /// Held while registering a consumer and while replaying registrations onto a new
    /// session, so a registration is started on each session exactly once.
    consumer_gate: tokio::sync::Mutex<()>,
    /// Consumer loop tasks, joined on close.
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// A broker client that survives connection loss.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct ReliableChannel {
    inner: Arc<Inner>,
}

impl ReliableChannel {
    /// Open the first connection and start the reconnect supervisor.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the initial connection fails. Reconnection
    /// only applies to connections that were once established.
    pub async fn connect(
        transport: Arc<dyn BrokerTransport>,
        config: ChannelConfig,
    ) -> Result<Self, ChannelError> {
        let session = transport.connect().await?;

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(Inner {
            transport,
            config,
            live: RwLock::new(None),
            state,
            registrations: Mutex::new(Vec::new()),
            consumer_gate: tokio::sync::Mutex::new(()),
            workers: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            supervisor: Mutex::new(None),
        });
        inner.install(session);
        tracing::info!("Broker connected");

        let supervisor = tokio::spawn(supervise(Arc::clone(&inner)));
        *inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(supervisor);

        Ok(Self { inner })
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Publish a persistent message to `exchange` with `routing_key`.
    ///
    /// Returns once the message is handed to the broker client. The confirmation is
    /// awaited in the background.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Closed`] after [`close`](Self::close)
    /// - [`ChannelError::NotConnected`] while reconnecting
    /// - [`ChannelError::PublishFailed`] if the session refuses the message
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), ChannelError> {
        let live = self.inner.live()?;
        let confirm = live.session.publish(exchange, routing_key, payload).await?;
        metrics::counter!("channel_published_total", "exchange" => exchange.to_string())
            .increment(1);

        tokio::spawn(observe_confirm(
            exchange.to_string(),
            routing_key.to_string(),
            confirm,
        ));
        Ok(())
    }

    /// Register `handler` on `queue` and start consuming.
    ///
    /// The registration is remembered and replayed after every reconnect.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Closed`] after [`close`](Self::close)
    /// - [`ChannelError::NotConnected`] while reconnecting; the registration is kept and
    ///   starts with the next session
    /// - [`ChannelError::ConsumeFailed`] if the session refuses the subscription
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), ChannelError> {
        let _gate = self.inner.consumer_gate.lock().await;
        if self.inner.shutdown.is_cancelled() {
            return Err(ChannelError::Closed);
        }

        let registration = Registration {
            queue: queue.to_string(),
            handler,
        };
        self.inner
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(registration.clone());

        self.inner.start_consumer(&registration).await
    }

    /// Stop reconnecting, drain the consumers and close the session.
    ///
    /// Consumers stop taking deliveries at once; a delivery already being handled is
    /// settled before the session closes.
    ///
    /// # Errors
    ///
    /// Returns the session's error if it cannot be closed cleanly.
    pub async fn close(&self) -> Result<(), ChannelError> {
        self.inner.shutdown.cancel();
        self.inner.state.send_replace(ConnectionState::Closed);

        let supervisor = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(supervisor) = supervisor {
            if let Err(err) = supervisor.await {
                tracing::warn!(error = %err, "Broker supervisor task failed");
            }
        }

        // Let a consume() already past its shutdown check finish registering.
        let _gate = self.inner.consumer_gate.lock().await;
        self.inner.drain_workers().await;

        let live = self
            .inner
            .live
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match live {
            Some(live) => {
                live.session.close().await?;
                tracing::info!("Broker channel closed");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ReliableChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableChannel")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn live(&self) -> Result<Live, ChannelError> {
        if self.shutdown.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ChannelError::NotConnected)
    }

    fn install(&self, session: Arc<dyn BrokerSession>) {
        let live = Live {
            session,
            consumers: self.shutdown.child_token(),
        };
        *self.live.write().unwrap_or_else(PoisonError::into_inner) = Some(live);
        self.set_state(ConnectionState::Connected);
    }

    fn disconnect(&self) {
        let dead = self
            .live
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dead) = dead {
            dead.consumers.cancel();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&self, next: ConnectionState) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let previous = self.state.send_replace(next);
        if previous != next {
            metrics::counter!("channel_state_transitions_total", "to" => next.as_str())
                .increment(1);
        }
    }

    async fn start_consumer(&self, registration: &Registration) -> Result<(), ChannelError> {
        let live = self.live()?;
        let deliveries = live
            .session
            .consume(&registration.queue, self.config.prefetch)
            .await?;

        let worker = tokio::spawn(consume_loop(
            registration.clone(),
            deliveries,
            live.consumers.clone(),
        ));
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.retain(|worker| !worker.is_finished());
        workers.push(worker);
        drop(workers);

        tracing::info!(queue = %registration.queue, "Consumer started");
        Ok(())
    }

    /// Wait for every consumer loop to finish its current delivery and exit.
    async fn drain_workers(&self) {
        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if workers.is_empty() {
            return;
        }

        let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
        let drained = tokio::time::timeout(
            self.config.drain_timeout,
            futures::future::join_all(workers),
        )
        .await;
        match drained {
            Ok(results) => {
                for err in results.into_iter().filter_map(Result::err) {
                    tracing::warn!(error = %err, "Consumer task failed");
                }
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.drain_timeout.as_millis(),
                    "Consumers did not drain in time; aborting in-flight handlers"
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }
    }

    async fn recover_consumers(&self) {
        let registrations = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for registration in &registrations {
            if let Err(err) = self.start_consumer(registration).await {
                tracing::error!(
                    queue = %registration.queue,
                    error = %err,
                    "Failed to recover consumer"
                );
            }
        }
    }
}

/// Watch the live session; on loss, reconnect and replay consumers. Exits on shutdown.
async fn supervise(inner: Arc<Inner>) {
    loop {
        let Ok(live) = inner.live() else {
            return;
        };

        let reason = tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => return,
            reason = live.session.closed() => reason,
        };

        let Some(reason) = reason else {
            tracing::debug!("Broker session closed on request");
            return;
        };

        tracing::error!(error = %reason, "Broker connection lost, reconnecting...");
        inner.disconnect();

        let Some(session) = reconnect(&inner).await else {
            return;
        };
        let _gate = inner.consumer_gate.lock().await;
        inner.install(session);
        inner.recover_consumers().await;
    }
}

/// Reconnect with backoff until it yields a session, or `None` once shutdown fires.
async fn reconnect(inner: &Inner) -> Option<Arc<dyn BrokerSession>> {
    let mut attempt = 0;
    loop {
        let delay = inner.config.reconnect.delay_for_attempt(attempt);
        tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => return None,
            () = tokio::time::sleep(delay) => {}
        }

        inner.set_state(ConnectionState::Connecting);
        let connected = tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => return None,
            connected = inner.transport.connect() => connected,
        };

        match connected {
            Ok(session) => {
                metrics::counter!("channel_reconnects_total").increment(1);
                tracing::info!(attempts = attempt + 1, "Broker reconnected");
                return Some(session);
            }
            Err(err) => {
                inner.set_state(ConnectionState::Disconnected);
                attempt = attempt.saturating_add(1);
                tracing::info!(
                    error = %err,
                    next_delay_ms = inner.config.reconnect.delay_for_attempt(attempt).as_millis(),
                    "Retrying broker connection..."
                );
            }
        }
    }
}

async fn consume_loop(
    registration: Registration,
    mut deliveries: DeliveryStream,
    stop: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            delivery = deliveries.next() => delivery,
        };
        let Some(delivery) = delivery else {
            break;
        };
        settle(&registration, delivery).await;
    }
    tracing::info!(queue = %registration.queue, "Consumer stopped (channel closed)");
}

async fn settle(registration: &Registration, delivery: Delivery) {
    let tag = delivery.delivery_tag;
    let queue = registration.queue.as_str();

    match registration.handler.handle(&delivery.payload).await {
        Ok(()) => {
            metrics::counter!("channel_deliveries_total", "queue" => queue.to_string(), "outcome" => "ack")
                .increment(1);
            if let Err(err) = delivery.ack().await {
                tracing::warn!(queue, delivery_tag = tag, error = %err, "Failed to ack message");
            }
        }
        Err(err) => {
            metrics::counter!("channel_deliveries_total", "queue" => queue.to_string(), "outcome" => "nack")
                .increment(1);
            tracing::error!(queue, delivery_tag = tag, error = %err, "Failed to process message");
            if let Err(err) = delivery.nack(false).await {
                tracing::warn!(queue, delivery_tag = tag, error = %err, "Failed to nack message");
            }
        }
    }
}

async fn observe_confirm(exchange: String, routing_key: String, confirm: PendingConfirm) {
    match confirm.await {
        Confirmation::Ack => {
            metrics::counter!("channel_publish_confirms_total", "result" => "ack").increment(1);
        }
        Confirmation::Nack { reason } => {
            metrics::counter!("channel_publish_confirms_total", "result" => "nack").increment(1);
            tracing::error!(
                exchange = %exchange,
                routing_key = %routing_key,
                reason = %reason,
                "Message failed to publish (Nack)"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_prefetch_one_and_capped_backoff() {
        let config = ChannelConfig::default();
        assert_eq!(config.prefetch, 1);
        assert_eq!(
            config.reconnect.delay_for_attempt(0),
            std::time::Duration::from_secs(1)
        );
        assert_eq!(
            config.reconnect.delay_for_attempt(10),
            std::time::Duration::from_secs(30)
        );
    }

    #[tokio::test]
    async fn handler_fn_adapts_closures() {
        let handler = handler_fn(|payload: Vec<u8>| async move {
            anyhow::ensure!(!payload.is_empty(), "empty payload");
            Ok::<(), anyhow::Error>(())
        });

        assert!(handler.handle(b"{}").await.is_ok());
        assert!(handler.handle(b"").await.is_err());
    }
}
