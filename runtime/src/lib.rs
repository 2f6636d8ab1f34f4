//! # Mall Runtime
//!
//! Resilience runtime for the inventory subsystem.
//!
//! ## Core Components
//!
//! - **`ResilientStore`**: store decorator with read coalescing, circuit breaker and retry
//! - **`InstrumentedStore`**: store decorator recording latency, errors and hit ratio
//! - **`DistributedLock`**: owner-token lease with a renewal watchdog
//! - **`ReliableChannel`**: broker client that reconnects and replays its consumers
//!
//! ## Layering
//!
//! ```text
//! ResilientStore ──▶ InstrumentedStore ──▶ RedisStore
//!        ▲
//! DistributedLock / InventoryService
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use mall_runtime::{InstrumentedStore, ResilientStore};
//!
//! let store = ResilientStore::new(InstrumentedStore::new(redis));
//! let lock = DistributedLock::new(Arc::new(store), "lock:sku:101");
//! ```

/// Retry logic with exponential backoff
pub mod retry;

/// Circuit breaker pattern for preventing cascading failures
pub mod circuit_breaker;

/// Request coalescing for concurrent identical reads
pub mod coalesce;

/// Fault-tolerant store decorator
pub mod resilient_store;

/// Metrics and tracing store decorator
pub mod instrumented;

/// Distributed lock with lease renewal
pub mod lock;

/// Self-healing broker client
pub mod channel;

/// Prometheus metrics for observability
pub mod metrics;

pub use channel::{ChannelConfig, ConnectionState, MessageHandler, ReliableChannel, handler_fn};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, State};
pub use coalesce::Coalescer;
pub use instrumented::InstrumentedStore;
pub use lock::{DistributedLock, LeaseStatus, LockError};
pub use resilient_store::{ResilientStore, ResilientStoreBuilder};
pub use retry::{RetryError, RetryPolicy, retry};
