//! Request coalescing ("single flight").
//!
//! Concurrent requests for the same key share one in-flight future; every caller
//! receives a clone of the same result. This keeps a burst of reads for one hot key
//! (a cache stampede) down to a single round trip.
//!
//! The shared future is driven by whichever callers are still waiting. When the last
//! waiter goes away the future is dropped with it and the key leaves the table.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

type InFlight<V> = Shared<BoxFuture<'static, V>>;

/// Collapses concurrent requests for the same key into one.
pub struct Coalescer<V>
where
    V: Clone + Send + Sync + 'static,
{
    in_flight: Mutex<HashMap<String, Entry<V>>>,
    next_id: AtomicU64,
}

struct Entry<V>
where
    V: Clone + Send + Sync + 'static,
{
    id: u64,
    waiters: usize,
    shared: InFlight<V>,
}

impl<V> Coalescer<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty coalescer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `make()` for `key`, or join an identical request already in flight.
    ///
    /// `make` is only invoked when no request for `key` is running.
    pub async fn run<F>(&self, key: &str, make: F) -> V
    where
        F: FnOnce() -> BoxFuture<'static, V>,
    {
        let (shared, mut waiter) = {
            let mut in_flight = self.lock();
            let (id, shared) = if let Some(entry) = in_flight.get_mut(key) {
                metrics::counter!("store_coalesced_requests_total").increment(1);
                tracing::trace!(key, "Joining in-flight request");
                entry.waiters += 1;
                (entry.id, entry.shared.clone())
            } else {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let shared = make().shared();
                in_flight.insert(
                    key.to_string(),
                    Entry {
                        id,
                        waiters: 1,
                        shared: shared.clone(),
                    },
                );
                (id, shared)
            };
            (
                shared,
                Waiter {
                    coalescer: self,
                    key,
                    id,
                    finished: false,
                },
            )
        };

        let value = shared.await;
        waiter.finish();
        value
    }

    /// Number of keys with a request in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry<V>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One caller's interest in an in-flight entry.
struct Waiter<'a, V>
where
    V: Clone + Send + Sync + 'static,
{
    coalescer: &'a Coalescer<V>,
    key: &'a str,
    id: u64,
    finished: bool,
}

impl<V> Waiter<'_, V>
where
    V: Clone + Send + Sync + 'static,
{
    /// The result is in; later callers must start a fresh request.
    fn finish(&mut self) {
        self.finished = true;
        let mut in_flight = self.coalescer.lock();
        if in_flight.get(self.key).is_some_and(|entry| entry.id == self.id) {
            in_flight.remove(self.key);
        }
    }
}

impl<V> Drop for Waiter<'_, V>
where
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut in_flight = self.coalescer.lock();
        let abandoned = match in_flight.get_mut(self.key) {
            Some(entry) if entry.id == self.id => {
                entry.waiters = entry.waiters.saturating_sub(1);
                entry.waiters == 0
            }
            _ => false,
        };
        if abandoned {
            tracing::trace!(key = self.key, "Last waiter left; dropping in-flight request");
            in_flight.remove(self.key);
        }
    }
}

impl<V> Default for Coalescer<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
