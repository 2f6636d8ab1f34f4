//! Key-value store abstraction.
//!
//! [`KeyValueStore`] is the narrow surface the inventory subsystem needs from a shared
//! store: plain reads and writes, a conditional set-if-absent with expiry (lock
//! acquisition, idempotency markers), owner-checked delete/expire (lock release and
//! lease renewal), multi-get and an atomic delta.
//!
//! # Semantics every implementation must honour
//!
//! - A missing key is `Ok(None)`, never an error.
//! - `set_if_absent`, `compare_and_delete` and `compare_and_expire` are atomic on the
//!   store side. The distributed lock relies on this and nothing else.
//! - Errors carry the operation and key in their message.
//!
//! # Implementations
//!
//! - `RedisStore` (`mall-redis`) - production
//! - `ResilientStore` / `InstrumentedStore` (`mall-runtime`) - decorators
//! - `InMemoryStore` (`mall-testing`) - tests, with fault injection

use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by key-value store operations.
///
/// The variants split into three groups callers care about:
///
/// - **Transient** (`Unavailable`, `Timeout`, `Backend`): worth retrying.
/// - **Caller-driven** (`Cancelled`): never retried.
/// - **Resilience outcomes** (`CircuitOpen`, `MaxRetriesExceeded`): produced by the
///   resilient decorator so callers can tell "store rejected fast" from "store failed".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached (connection refused, dropped, I/O error).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer in time.
    #[error("Store timeout: {0}")]
    Timeout(String),

    /// The store answered with an error.
    #[error("Store error: {0}")]
    Backend(String),

    /// The caller cancelled the operation or its deadline passed.
    #[error("Store operation cancelled")]
    Cancelled,

    /// The circuit breaker rejected the call without touching the store.
    #[error("Circuit breaker is open")]
    CircuitOpen,

    /// Every retry attempt failed.
    #[error("max retries exceeded after {attempts} attempts: {last}")]
    MaxRetriesExceeded {
        /// Number of attempts made
        attempts: usize,
        /// Error from the final attempt
        last: Box<StoreError>,
    },
}

impl StoreError {
    /// Whether a retry could plausibly succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_) | Self::Backend(_))
    }

    /// Whether this is a circuit-open rejection.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen)
    }
}

/// Store operation names, used for metrics labels, spans and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// `GET`
    Get,
    /// `SET` (optionally with expiry)
    Set,
    /// `SET NX PX`
    SetIfAbsent,
    /// Owner-checked `DEL`
    CompareAndDelete,
    /// Owner-checked `PEXPIRE`
    CompareAndExpire,
    /// `DEL`
    Delete,
    /// `MGET`
    MGet,
    /// `INCRBY`
    IncrBy,
}

impl StoreOp {
    /// Lowercase label for this operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::SetIfAbsent => "set_if_absent",
            Self::CompareAndDelete => "compare_and_delete",
            Self::CompareAndExpire => "compare_and_expire",
            Self::Delete => "delete",
            Self::MGet => "mget",
            Self::IncrBy => "incr_by",
        }
    }
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A shared key-value store.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; a single instance is shared by every
/// consumer task, lock and watchdog in the process.
///
/// # Cancellation
///
/// Every returned future may be dropped at any await point. Dropping is how a caller
/// enforces its deadline (`tokio::time::timeout`), so implementations must not leave
/// partial state behind on drop.
pub trait KeyValueStore: Send + Sync {
    /// Read a value. A missing key is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store cannot answer.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>>;

    /// Write a value, with an optional expiry.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the write fails.
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Write a value with expiry only if the key does not exist.
    ///
    /// Returns `Ok(true)` if this call created the key, `Ok(false)` if it was present.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store cannot answer.
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Delete `key` only if it currently holds `expected`.
    ///
    /// Returns `Ok(true)` if the key was deleted.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store cannot answer.
    fn compare_and_delete<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Reset the expiry of `key` to `ttl` only if it currently holds `expected`.
    ///
    /// Returns `Ok(true)` if the expiry was updated.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store cannot answer.
    fn compare_and_expire<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Delete keys, returning how many existed.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the delete fails.
    fn delete<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, Result<u64, StoreError>>;

    /// Read several keys at once. The result is positional; missing keys are `None`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store cannot answer.
    fn mget<'a>(
        &'a self,
        keys: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Option<String>>, StoreError>>;

    /// Atomically add `delta` to an integer value (missing keys count as 0).
    ///
    /// Returns the new value.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store cannot answer or the value is not an integer.
    fn incr_by<'a>(&'a self, key: &'a str, delta: i64) -> BoxFuture<'a, Result<i64, StoreError>>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>> {
        (**self).get(key)
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        (**self).set(key, value, ttl)
    }

    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        (**self).set_if_absent(key, value, ttl)
    }

    fn compare_and_delete<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        (**self).compare_and_delete(key, expected)
    }

    fn compare_and_expire<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        (**self).compare_and_expire(key, expected, ttl)
    }

    fn delete<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, Result<u64, StoreError>> {
        (**self).delete(keys)
    }

    fn mget<'a>(
        &'a self,
        keys: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Option<String>>, StoreError>> {
        (**self).mget(keys)
    }

    fn incr_by<'a>(&'a self, key: &'a str, delta: i64) -> BoxFuture<'a, Result<i64, StoreError>> {
        (**self).incr_by(key, delta)
    }
}
