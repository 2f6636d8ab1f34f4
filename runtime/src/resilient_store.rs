//! Fault-tolerant decorator for a [`KeyValueStore`].
//!
//! [`ResilientStore`] wraps any store and adds, from the outside in:
//!
//! 1. **Read coalescing** - concurrent `get`s of one key share one fetch
//! 2. **Circuit breaker** - fail fast while the store is unhealthy
//! 3. **Bounded retry** - 3 attempts, 10ms backoff doubling per attempt
//!
//! ```text
//! get(key) ──▶ Coalescer ──▶ CircuitBreaker ──▶ retry ──▶ inner.get(key)
//! ```
//!
//! A retried operation is one breaker request: three failed attempts count as one
//! failure, and an open circuit rejects before any attempt is made.
//!
//! # Error Mapping
//!
//! | Situation                      | Result                               |
//! |--------------------------------|--------------------------------------|
//! | key absent                     | `Ok(None)`, no retry                 |
//! | all attempts failed            | `StoreError::MaxRetriesExceeded`     |
//! | circuit open                   | `StoreError::CircuitOpen`, 0 calls   |
//! | cancelled (inner or shutdown)  | `StoreError::Cancelled`, no retry    |
//!
//! # Example
//!
//! ```rust,ignore
//! let store = ResilientStore::new(RedisStore::new(&url, "mall").await?);
//! let stock = store.get("stock:sku:101").await?;
//! ```

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use crate::coalesce::Coalescer;
use crate::retry::{RetryError, RetryPolicy, retry};
use futures::future::BoxFuture;
use mall_core::store::{KeyValueStore, StoreError, StoreOp};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type ReadResult = Result<Option<String>, StoreError>;

struct Core<S> {
    inner: S,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl<S: KeyValueStore> Core<S> {
    async fn execute<T, F, Fut>(&self, op: StoreOp, key: &str, operation: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let outcome = self
            .breaker
            .call_classified(
                || retry(&self.retry, &self.shutdown, operation, StoreError::is_retryable),
                counts_as_failure,
            )
            .await;

        match outcome {
            Ok(value) => Ok(value),
            Err(CircuitBreakerError::Open) => Err(StoreError::CircuitOpen),
            Err(CircuitBreakerError::Inner(RetryError::Cancelled)) => Err(StoreError::Cancelled),
            Err(CircuitBreakerError::Inner(RetryError::NotRetryable(err))) => Err(err),
            Err(CircuitBreakerError::Inner(RetryError::Exhausted { attempts, last })) => {
                metrics::counter!("store_retries_exhausted_total", "op" => op.as_str())
                    .increment(1);
                tracing::warn!(
                    op = op.as_str(),
                    key,
                    attempts,
                    error = %last,
                    "Store operation gave up after retries"
                );
                Err(StoreError::MaxRetriesExceeded {
                    attempts,
                    last: Box::new(last),
                })
            }
        }
    }
}

/// Whether a failed retry loop should count against the store's health.
const fn counts_as_failure(err: &RetryError<StoreError>) -> bool {
    !matches!(
        err,
        RetryError::Cancelled | RetryError::NotRetryable(StoreError::Cancelled)
    )
}

/// A [`KeyValueStore`] decorated with read coalescing, a circuit breaker and retry.
pub struct ResilientStore<S> {
    core: Arc<Core<S>>,
    reads: Coalescer<ReadResult>,
}

impl<S: KeyValueStore + 'static> ResilientStore<S> {
    /// Wrap `inner` with the default policies (3 attempts from 10ms; trip at ≥10
    /// requests with ≥50% failures; 30s cooldown).
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self::builder(inner).build()
    }

    /// Start configuring a resilient store around `inner`.
    #[must_use]
    pub fn builder(inner: S) -> ResilientStoreBuilder<S> {
        ResilientStoreBuilder {
            inner,
            name: "kv-store".to_string(),
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            shutdown: None,
        }
    }

    /// The circuit breaker guarding the inner store.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.core.breaker
    }

    /// The wrapped store.
    #[must_use]
    pub fn inner(&self) -> &S {
        &self.core.inner
    }

    /// Abort every in-flight retry loop and refuse new operations.
    pub fn shutdown(&self) {
        self.core.shutdown.cancel();
    }
}

/// Builder for [`ResilientStore`].
pub struct ResilientStoreBuilder<S> {
    inner: S,
    name: String,
    retry: RetryPolicy,
    breaker: CircuitBreakerConfig,
    shutdown: Option<CancellationToken>,
}

impl<S: KeyValueStore + 'static> ResilientStoreBuilder<S> {
    /// Name of the circuit breaker in logs and metrics.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Override the retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Override the circuit breaker configuration.
    #[must_use]
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    /// Tie the store's retry loops to an external shutdown token.
    #[must_use]
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Build the [`ResilientStore`].
    #[must_use]
    pub fn build(self) -> ResilientStore<S> {
        ResilientStore {
            core: Arc::new(Core {
                inner: self.inner,
                breaker: CircuitBreaker::new(&self.name, self.breaker),
                retry: self.retry,
                shutdown: self.shutdown.unwrap_or_default(),
            }),
            reads: Coalescer::new(),
        }
    }
}

impl<S: KeyValueStore + 'static> KeyValueStore for ResilientStore<S> {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>> {
        Box::pin(async move {
            let core = Arc::clone(&self.core);
            let owned_key = key.to_string();
            self.reads
                .run(key, move || {
                    Box::pin(async move {
                        core.execute(StoreOp::Get, &owned_key, || core.inner.get(&owned_key))
                            .await
                    })
                })
                .await
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.core
                .execute(StoreOp::Set, key, || self.core.inner.set(key, value, ttl))
                .await
        })
    }

    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            self.core
                .execute(StoreOp::SetIfAbsent, key, || {
                    self.core.inner.set_if_absent(key, value, ttl)
                })
                .await
        })
    }

    fn compare_and_delete<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            self.core
                .execute(StoreOp::CompareAndDelete, key, || {
                    self.core.inner.compare_and_delete(key, expected)
                })
                .await
        })
    }

    fn compare_and_expire<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            self.core
                .execute(StoreOp::CompareAndExpire, key, || {
                    self.core.inner.compare_and_expire(key, expected, ttl)
                })
                .await
        })
    }

    fn delete<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let label = keys.join(",");
            self.core
                .execute(StoreOp::Delete, &label, || self.core.inner.delete(keys))
                .await
        })
    }

    fn mget<'a>(
        &'a self,
        keys: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Option<String>>, StoreError>> {
        Box::pin(async move {
            let label = keys.join(",");
            self.core
                .execute(StoreOp::MGet, &label, || self.core.inner.mget(keys))
                .await
        })
    }

    fn incr_by<'a>(&'a self, key: &'a str, delta: i64) -> BoxFuture<'a, Result<i64, StoreError>> {
        // INCRBY is not idempotent: a timeout after the server applied it must not
        // be replayed, so it gets the breaker but a single attempt.
        Box::pin(async move {
            let outcome = self
                .core
                .breaker
                .call_classified(
                    || self.core.inner.incr_by(key, delta),
                    |err: &StoreError| !matches!(err, StoreError::Cancelled),
                )
                .await;
            match outcome {
                Ok(value) => Ok(value),
                Err(CircuitBreakerError::Open) => Err(StoreError::CircuitOpen),
                Err(CircuitBreakerError::Inner(err)) => Err(err),
            }
        })
    }
}
