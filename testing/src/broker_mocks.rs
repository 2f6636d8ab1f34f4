//! In-memory message broker for channel and consumer tests.
//!
//! [`InMemoryBroker`] implements [`BrokerTransport`] with AMQP-like semantics:
//!
//! - direct exchanges: a message goes to every queue bound with the exact routing key;
//!   the default exchange `""` routes to the queue named by the routing key
//! - manual acknowledgement with a per-consumer prefetch limit
//! - deliveries unacknowledged when their session closes go back to the head of the
//!   queue, flagged `redelivered`
//! - `nack(requeue = false)` moves the message to the queue's dead letters
//!
//! Tests drive failures from outside: [`InMemoryBroker::drop_connections`] kills every
//! live session, [`InMemoryBroker::set_refuse_connections`] makes `connect` fail and
//! [`InMemoryBroker::set_nack_publishes`] turns publisher confirms negative.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use futures::future::BoxFuture;
use mall_core::broker::{
    Acknowledger, BrokerSession, BrokerTransport, ChannelError, Confirmation, Delivery,
    DeliveryStream, PendingConfirm,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// A message as it was handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Target exchange
    pub exchange: String,
    /// Routing key
    pub routing_key: String,
    /// Message body
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    tag: u64,
    session: u64,
    consumer: u64,
    message: Message,
}

#[derive(Debug, Default)]
struct Queue {
    ready: VecDeque<Message>,
    unacked: Vec<Unacked>,
    dead_letters: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionStatus {
    Open,
    Closed(Option<ChannelError>),
}

#[derive(Debug, Clone)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, Queue>,
    bindings: Vec<Binding>,
    published: Vec<PublishedMessage>,
    sessions: HashMap<u64, watch::Sender<SessionStatus>>,
    /// Live delivery streams: consumer id to (session, queue).
    subscriptions: HashMap<u64, (u64, String)>,
    refuse_connections: bool,
    nack_publishes: bool,
    connects: usize,
    next_id: u64,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_open(&self, session: u64) -> bool {
        self.sessions
            .get(&session)
            .is_some_and(|status| *status.borrow() == SessionStatus::Open)
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect();
        }
        self.bindings
            .iter()
            .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect()
    }

    fn close_session(&mut self, session: u64, reason: Option<ChannelError>) {
        if let Some(status) = self.sessions.get(&session) {
            status.send_replace(SessionStatus::Closed(reason));
        }
        for queue in self.queues.values_mut() {
            let (orphaned, kept): (Vec<_>, Vec<_>) = queue
                .unacked
                .drain(..)
                .partition(|unacked| unacked.session == session);
            queue.unacked = kept;
            for unacked in orphaned.into_iter().rev() {
                queue.ready.push_front(Message {
                    payload: unacked.message.payload,
                    redelivered: true,
                });
            }
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BrokerState>,
    changes: watch::Sender<u64>,
}

impl Shared {
    fn notify(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }
}

enum Next {
    Delivery(Delivery),
    Wait,
    Closed,
}

/// In-memory [`BrokerTransport`].
///
/// # Example
///
/// ```
/// use mall_testing::InMemoryBroker;
///
/// let broker = InMemoryBroker::new();
/// broker.bind("orders", "orders.created", "orders.created");
/// broker.enqueue("orders.created", b"{}".to_vec());
/// assert_eq!(broker.ready("orders.created"), 1);
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create a broker with no queues.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                changes,
            }),
        }
    }

    /// Declare `queue` if it does not exist.
    pub fn declare_queue(&self, queue: &str) {
        self.shared
            .state
            .lock()
            .unwrap()
            .queues
            .entry(queue.to_string())
            .or_default();
    }

    /// Bind `queue` to `exchange` with `routing_key`, declaring the queue.
    pub fn bind(&self, exchange: &str, routing_key: &str, queue: &str) {
        let mut state = self.shared.state.lock().unwrap();
        state.queues.entry(queue.to_string()).or_default();
        state.bindings.push(Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        });
    }

    /// Put a message straight onto `queue`, declaring it.
    pub fn enqueue(&self, queue: &str, payload: Vec<u8>) {
        self.shared
            .state
            .lock()
            .unwrap()
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(Message {
                payload,
                redelivered: false,
            });
        self.shared.notify();
    }

    /// Messages waiting for a consumer.
    #[must_use]
    pub fn ready(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.ready.len())
    }

    /// Messages delivered but not yet settled.
    #[must_use]
    pub fn unacked(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.unacked.len())
    }

    /// Whether `queue` has nothing ready and nothing in flight.
    #[must_use]
    pub fn is_drained(&self, queue: &str) -> bool {
        self.ready(queue) == 0 && self.unacked(queue) == 0
    }

    /// Payloads rejected from `queue` without requeue.
    #[must_use]
    pub fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        self.with_queue(queue, |q| q.dead_letters.clone())
    }

    /// Every message handed to the broker, routed or not.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.state.lock().unwrap().published.clone()
    }

    /// Successful `connect` calls so far.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.shared.state.lock().unwrap().connects
    }

    /// Delivery streams on `queue` that are still attached to an open session.
    #[must_use]
    pub fn consumers(&self, queue: &str) -> usize {
        let state = self.shared.state.lock().unwrap();
        state
            .subscriptions
            .values()
            .filter(|(session, name)| name == queue && state.is_open(*session))
            .count()
    }

    /// Sessions currently open.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        state
            .sessions
            .values()
            .filter(|status| *status.borrow() == SessionStatus::Open)
            .count()
    }

    /// Kill every open session as if the network dropped.
    pub fn drop_connections(&self) {
        let mut state = self.shared.state.lock().unwrap();
        let open: Vec<u64> = state
            .sessions
            .iter()
            .filter(|(_, status)| *status.borrow() == SessionStatus::Open)
            .map(|(id, _)| *id)
            .collect();
        for session in open {
            state.close_session(
                session,
                Some(ChannelError::ConnectionLost(
                    "connection reset by broker".to_string(),
                )),
            );
        }
        drop(state);
        self.shared.notify();
    }

    /// Make `connect` fail while `refuse` is true.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.shared.state.lock().unwrap().refuse_connections = refuse;
    }

    /// Answer publishes with a negative confirmation while `nack` is true.
    pub fn set_nack_publishes(&self, nack: bool) {
        self.shared.state.lock().unwrap().nack_publishes = nack;
    }

    fn with_queue<T: Default>(&self, queue: &str, f: impl FnOnce(&Queue) -> T) -> T {
        self.shared
            .state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(f)
            .unwrap_or_default()
    }
}

impl BrokerTransport for InMemoryBroker {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn BrokerSession>, ChannelError>> {
        Box::pin(async move {
            let mut state = self.shared.state.lock().unwrap();
            if state.refuse_connections {
                return Err(ChannelError::ConnectionFailed(
                    "connection refused".to_string(),
                ));
            }
            state.connects += 1;
            let id = state.next_id();
            let (status, _) = watch::channel(SessionStatus::Open);
            let receiver = status.subscribe();
            state.sessions.insert(id, status);

            let session: Arc<dyn BrokerSession> = Arc::new(MemorySession {
                shared: Arc::clone(&self.shared),
                id,
                status: receiver,
            });
            Ok(session)
        })
    }
}

struct MemorySession {
    shared: Arc<Shared>,
    id: u64,
    status: watch::Receiver<SessionStatus>,
}

impl BrokerSession for MemorySession {
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<PendingConfirm, ChannelError>> {
        Box::pin(async move {
            let mut state = self.shared.state.lock().unwrap();
            if !state.is_open(self.id) {
                return Err(ChannelError::PublishFailed {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    reason: "channel closed".to_string(),
                });
            }

            state.published.push(PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload: payload.to_vec(),
            });
            let confirmation = if state.nack_publishes {
                Confirmation::Nack {
                    reason: "broker refused message".to_string(),
                }
            } else {
                for queue in state.route(exchange, routing_key) {
                    if let Some(queue) = state.queues.get_mut(&queue) {
                        queue.ready.push_back(Message {
                            payload: payload.to_vec(),
                            redelivered: false,
                        });
                    }
                }
                Confirmation::Ack
            };
            drop(state);
            self.shared.notify();

            let confirm: PendingConfirm = Box::pin(futures::future::ready(confirmation));
            Ok(confirm)
        })
    }

    fn consume<'a>(
        &'a self,
        queue: &'a str,
        prefetch: u16,
    ) -> BoxFuture<'a, Result<DeliveryStream, ChannelError>> {
        Box::pin(async move {
            let consumer = {
                let mut state = self.shared.state.lock().unwrap();
                if !state.is_open(self.id) {
                    return Err(ChannelError::ConsumeFailed {
                        queue: queue.to_string(),
                        reason: "channel closed".to_string(),
                    });
                }
                state.queues.entry(queue.to_string()).or_default();
                let consumer = state.next_id();
                state
                    .subscriptions
                    .insert(consumer, (self.id, queue.to_string()));
                consumer
            };
            Ok(deliveries(
                Arc::clone(&self.shared),
                self.id,
                consumer,
                queue.to_string(),
                prefetch,
            ))
        })
    }

    fn closed(&self) -> BoxFuture<'static, Option<ChannelError>> {
        let mut status = self.status.clone();
        Box::pin(async move {
            let outcome = status
                .wait_for(|s| *s != SessionStatus::Open)
                .await
                .map(|s| s.clone());
            match outcome {
                Ok(SessionStatus::Closed(reason)) => reason,
                Ok(SessionStatus::Open) | Err(_) => Some(ChannelError::ConnectionLost(
                    "broker went away".to_string(),
                )),
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move {
            self.shared
                .state
                .lock()
                .unwrap()
                .close_session(self.id, None);
            self.shared.notify();
            Ok(())
        })
    }
}

fn deliveries(
    shared: Arc<Shared>,
    session: u64,
    consumer: u64,
    queue: String,
    prefetch: u16,
) -> DeliveryStream {
    let subscription = Subscription {
        shared: Arc::clone(&shared),
        consumer,
    };
    Box::pin(async_stream::stream! {
        let _subscription = subscription;
        let mut changes = shared.changes.subscribe();
        loop {
            drop(changes.borrow_and_update());
            match next_delivery(&shared, session, consumer, &queue, prefetch) {
                Next::Delivery(delivery) => yield delivery,
                Next::Closed => break,
                Next::Wait => {
                    if changes.changed().await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Forgets a consumer when its delivery stream is dropped.
struct Subscription {
    shared: Arc<Shared>,
    consumer: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.subscriptions.remove(&self.consumer);
        }
    }
}

fn next_delivery(
    shared: &Arc<Shared>,
    session: u64,
    consumer: u64,
    queue_name: &str,
    prefetch: u16,
) -> Next {
    let mut state = shared.state.lock().unwrap();
    if !state.is_open(session) {
        return Next::Closed;
    }
    let tag = state.next_id();
    let Some(queue) = state.queues.get_mut(queue_name) else {
        return Next::Closed;
    };

    let in_flight = queue
        .unacked
        .iter()
        .filter(|unacked| unacked.consumer == consumer)
        .count();
    if prefetch != 0 && in_flight >= usize::from(prefetch) {
        return Next::Wait;
    }
    let Some(message) = queue.ready.pop_front() else {
        return Next::Wait;
    };

    queue.unacked.push(Unacked {
        tag,
        session,
        consumer,
        message: message.clone(),
    });
    Next::Delivery(Delivery::new(
        tag,
        message.payload,
        message.redelivered,
        Box::new(MemoryAcker {
            shared: Arc::clone(shared),
            session,
            queue: queue_name.to_string(),
            tag,
        }),
    ))
}

struct MemoryAcker {
    shared: Arc<Shared>,
    session: u64,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, settle: impl FnOnce(&mut Queue, Message)) -> Result<(), ChannelError> {
        let mut state = self.shared.state.lock().unwrap();
        if !state.is_open(self.session) {
            return Err(self.failed("channel closed"));
        }
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| self.failed("unknown queue"))?;
        let index = queue
            .unacked
            .iter()
            .position(|unacked| unacked.tag == self.tag)
            .ok_or_else(|| self.failed("unknown delivery tag"))?;
        let unacked = queue.unacked.remove(index);
        settle(queue, unacked.message);
        drop(state);
        self.shared.notify();
        Ok(())
    }

    fn failed(&self, reason: &str) -> ChannelError {
        ChannelError::AcknowledgeFailed {
            delivery_tag: self.tag,
            reason: reason.to_string(),
        }
    }
}

impl Acknowledger for MemoryAcker {
    fn ack(&self) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move { self.settle(|_, _| {}) })
    }

    fn nack(&self, requeue: bool) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move {
            self.settle(|queue, message| {
                if requeue {
                    queue.ready.push_front(Message {
                        payload: message.payload,
                        redelivered: true,
                    });
                } else {
                    queue.dead_letters.push(message.payload);
                }
            })
        })
    }
}
