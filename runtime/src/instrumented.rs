//! Metrics and tracing for a [`KeyValueStore`].
//!
//! [`InstrumentedStore`] sits directly on top of the raw backend, under the
//! [`ResilientStore`](crate::resilient_store::ResilientStore), so every physical attempt
//! (including retries) is timed and counted:
//!
//! - `store_request_duration_seconds{op}` - histogram of attempt latency
//! - `store_errors_total{op, kind}` - failed attempts
//! - `store_cache_results_total{result}` - `hit` / `miss` for `get`

use futures::future::BoxFuture;
use mall_core::store::{KeyValueStore, StoreError, StoreOp};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::Instrument;

/// Records latency, errors and hit ratio for every call on the wrapped store.
#[derive(Debug, Clone)]
pub struct InstrumentedStore<S> {
    inner: S,
}

impl<S: KeyValueStore> InstrumentedStore<S> {
    /// Wrap `inner`.
    #[must_use]
    pub const fn new(inner: S) -> Self {
        Self { inner }
    }

    /// The wrapped store.
    #[must_use]
    pub const fn inner(&self) -> &S {
        &self.inner
    }
}

async fn observe<T, Fut>(op: StoreOp, key: &str, call: Fut) -> Result<T, StoreError>
where
    Fut: Future<Output = Result<T, StoreError>>,
{
    let span = tracing::debug_span!("store", op = op.as_str(), key);
    let start = Instant::now();
    let result = call.instrument(span).await;
    metrics::histogram!("store_request_duration_seconds", "op" => op.as_str())
        .record(start.elapsed().as_secs_f64());

    if let Err(err) = &result {
        metrics::counter!(
            "store_errors_total",
            "op" => op.as_str(),
            "kind" => error_kind(err),
        )
        .increment(1);
        tracing::debug!(op = op.as_str(), key, error = %err, "Store call failed");
    }
    result
}

const fn error_kind(err: &StoreError) -> &'static str {
    match err {
        StoreError::Unavailable(_) => "unavailable",
        StoreError::Timeout(_) => "timeout",
        StoreError::Backend(_) => "backend",
        StoreError::Cancelled => "cancelled",
        StoreError::CircuitOpen => "circuit_open",
        StoreError::MaxRetriesExceeded { .. } => "max_retries",
    }
}

impl<S: KeyValueStore> KeyValueStore for InstrumentedStore<S> {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>> {
        Box::pin(async move {
            let result = observe(StoreOp::Get, key, self.inner.get(key)).await;
            if let Ok(value) = &result {
                let outcome = if value.is_some() { "hit" } else { "miss" };
                metrics::counter!("store_cache_results_total", "result" => outcome).increment(1);
            }
            result
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(observe(StoreOp::Set, key, self.inner.set(key, value, ttl)))
    }

    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(observe(
            StoreOp::SetIfAbsent,
            key,
            self.inner.set_if_absent(key, value, ttl),
        ))
    }

    fn compare_and_delete<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(observe(
            StoreOp::CompareAndDelete,
            key,
            self.inner.compare_and_delete(key, expected),
        ))
    }

    fn compare_and_expire<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(observe(
            StoreOp::CompareAndExpire,
            key,
            self.inner.compare_and_expire(key, expected, ttl),
        ))
    }

    fn delete<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let label = keys.join(",");
            observe(StoreOp::Delete, &label, self.inner.delete(keys)).await
        })
    }

    fn mget<'a>(
        &'a self,
        keys: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Option<String>>, StoreError>> {
        Box::pin(async move {
            let label = keys.join(",");
            observe(StoreOp::MGet, &label, self.inner.mget(keys)).await
        })
    }

    fn incr_by<'a>(&'a self, key: &'a str, delta: i64) -> BoxFuture<'a, Result<i64, StoreError>> {
        Box::pin(observe(StoreOp::IncrBy, key, self.inner.incr_by(key, delta)))
    }
}
