//! Distributed mutual exclusion over a shared [`KeyValueStore`].
//!
//! A [`DistributedLock`] names one resource (`lock:sku:101`). Acquisition writes a
//! fresh random owner token with set-if-absent and an expiry; release and renewal
//! only act when the stored token is still ours, so a lease that expired and was
//! taken by another holder is never deleted or extended by mistake.
//!
//! While held, a watchdog task extends the lease every `max(ttl / 3, 50ms)`. It stops
//! on release, on loss of ownership, or on a renewal error, and publishes what
//! happened as a [`LeaseStatus`]. Callers doing work under the lock check
//! [`DistributedLock::lease_status`] before committing a write.
//!
//! # Example
//!
//! ```rust,ignore
//! let lock = DistributedLock::new(store.clone(), "lock:sku:101");
//! if lock.acquire(Duration::from_secs(5), Duration::from_secs(3)).await? {
//!     // ... critical section ...
//!     lock.release().await?;
//! }
//! ```

use mall_core::store::{KeyValueStore, StoreError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Pause between acquisition attempts while the lock is taken.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Lower bound for the renewal period.
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound for a single renewal round trip.
const RENEW_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors from lock operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Release found the lock absent or owned by someone else.
    #[error("Lock not held: {resource}")]
    NotHeld {
        /// Lock key
        resource: String,
    },

    /// This instance already holds the lock.
    #[error("Lock already held by this instance: {resource}")]
    AlreadyHeld {
        /// Lock key
        resource: String,
    },

    /// Acquisition was cancelled before it completed.
    #[error("Lock acquisition cancelled: {resource}")]
    Cancelled {
        /// Lock key
        resource: String,
    },

    /// The store failed.
    #[error("Lock store error on {resource}: {source}")]
    Store {
        /// Lock key
        resource: String,
        /// Underlying error
        #[source]
        source: StoreError,
    },
}

/// Ownership of the current lease as far as this instance knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// Acquired, and every renewal so far succeeded.
    Held,
    /// A renewal found the token gone or replaced.
    Lost,
    /// A renewal failed or timed out; the lease may or may not still be ours.
    Uncertain,
    /// Not held by this instance (never acquired, or released).
    Released,
}

impl LeaseStatus {
    /// Lowercase label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::Lost => "lost",
            Self::Uncertain => "uncertain",
            Self::Released => "released",
        }
    }
}

struct Lease {
    token: String,
    watchdog: CancellationToken,
    status: watch::Receiver<LeaseStatus>,
    task: JoinHandle<()>,
}

/// A named lease on a shared store, renewed in the background while held.
pub struct DistributedLock {
    store: Arc<dyn KeyValueStore>,
    resource: String,
    retry_interval: Duration,
    lease: Mutex<Option<Lease>>,
}

impl DistributedLock {
    /// Create a lock handle for `resource`. Nothing is written until [`acquire`](Self::acquire).
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, resource: impl Into<String>) -> Self {
        Self {
            store,
            resource: resource.into(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            lease: Mutex::new(None),
        }
    }

    /// Override the pause between acquisition attempts.
    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// The lock key.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Current ownership status.
    #[must_use]
    pub fn lease_status(&self) -> LeaseStatus {
        self.lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(LeaseStatus::Released, |lease| *lease.status.borrow())
    }

    /// Whether this instance believes it holds the lock.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.lease_status() == LeaseStatus::Held
    }

    /// Try to take the lock with lease `ttl`, polling until `wait` has elapsed.
    ///
    /// Returns `Ok(true)` once acquired (the watchdog is running) and `Ok(false)` if
    /// the lock stayed taken for the whole wait.
    ///
    /// # Errors
    ///
    /// - [`LockError::AlreadyHeld`] if this instance holds it already
    /// - [`LockError::Store`] if the store fails
    pub async fn acquire(&self, ttl: Duration, wait: Duration) -> Result<bool, LockError> {
        self.acquire_with_cancel(ttl, wait, &CancellationToken::new())
            .await
    }

    /// [`acquire`](Self::acquire), abandoning the attempt when `cancel` fires.
    ///
    /// # Errors
    ///
    /// As [`acquire`](Self::acquire), plus [`LockError::Cancelled`].
    pub async fn acquire_with_cancel(
        &self,
        ttl: Duration,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool, LockError> {
        {
            let mut lease = self.lease.lock().unwrap_or_else(PoisonError::into_inner);
            if lease
                .as_ref()
                .is_some_and(|lease| *lease.status.borrow() == LeaseStatus::Held)
            {
                return Err(LockError::AlreadyHeld {
                    resource: self.resource.clone(),
                });
            }
            // A lost or uncertain lease from an earlier acquisition is abandoned.
            if let Some(stale) = lease.take() {
                stale.watchdog.cancel();
            }
        }

        let token = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = started + wait;

        loop {
            let attempt = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(self.cancelled()),
                attempt = self.store.set_if_absent(&self.resource, &token, ttl) => attempt,
            };

            match attempt {
                Ok(true) => {
                    self.start_watchdog(token, ttl);
                    metrics::counter!("lock_acquisitions_total", "result" => "acquired")
                        .increment(1);
                    metrics::histogram!("lock_wait_seconds")
                        .record(started.elapsed().as_secs_f64());
                    tracing::debug!(resource = %self.resource, ttl_ms = ttl.as_millis(), "Lock acquired");
                    return Ok(true);
                }
                Ok(false) => {}
                Err(source) => {
                    metrics::counter!("lock_acquisitions_total", "result" => "error").increment(1);
                    return Err(LockError::Store {
                        resource: self.resource.clone(),
                        source,
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                metrics::counter!("lock_acquisitions_total", "result" => "timeout").increment(1);
                tracing::debug!(resource = %self.resource, wait_ms = wait.as_millis(), "Lock wait elapsed");
                return Ok(false);
            }

            let pause = self.retry_interval.min(deadline - now);
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(self.cancelled()),
                () = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Stop the watchdog and delete the lock if it is still ours.
    ///
    /// # Errors
    ///
    /// - [`LockError::NotHeld`] if this instance never acquired it, or the stored
    ///   token is gone or belongs to someone else
    /// - [`LockError::Store`] if the delete fails
    pub async fn release(&self) -> Result<(), LockError> {
        let lease = self
            .lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(lease) = lease else {
            return Err(self.not_held());
        };

        lease.watchdog.cancel();
        if let Err(err) = lease.task.await {
            tracing::warn!(resource = %self.resource, error = %err, "Lock watchdog task failed");
        }

        match self
            .store
            .compare_and_delete(&self.resource, &lease.token)
            .await
        {
            Ok(true) => {
                tracing::debug!(resource = %self.resource, "Lock released");
                Ok(())
            }
            Ok(false) => {
                metrics::counter!("lock_release_not_held_total").increment(1);
                Err(self.not_held())
            }
            Err(source) => Err(LockError::Store {
                resource: self.resource.clone(),
                source,
            }),
        }
    }

    fn start_watchdog(&self, token: String, ttl: Duration) {
        let (status_tx, status_rx) = watch::channel(LeaseStatus::Held);
        let watchdog = CancellationToken::new();
        let task = tokio::spawn(renew_lease(
            Arc::clone(&self.store),
            self.resource.clone(),
            token.clone(),
            ttl,
            watchdog.clone(),
            status_tx,
        ));

        *self.lease.lock().unwrap_or_else(PoisonError::into_inner) = Some(Lease {
            token,
            watchdog,
            status: status_rx,
            task,
        });
    }

    fn not_held(&self) -> LockError {
        LockError::NotHeld {
            resource: self.resource.clone(),
        }
    }

    fn cancelled(&self) -> LockError {
        LockError::Cancelled {
            resource: self.resource.clone(),
        }
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        // Stop renewing; the lease then expires on its own.
        if let Some(lease) = self
            .lease
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            lease.watchdog.cancel();
        }
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("resource", &self.resource)
            .field("status", &self.lease_status())
            .finish_non_exhaustive()
    }
}

/// Renewal period for a lease of `ttl`.
#[must_use]
pub fn renew_interval(ttl: Duration) -> Duration {
    (ttl / 3).max(MIN_RENEW_INTERVAL)
}

async fn renew_lease(
    store: Arc<dyn KeyValueStore>,
    resource: String,
    token: String,
    ttl: Duration,
    cancel: CancellationToken,
    status: watch::Sender<LeaseStatus>,
) {
    let period = renew_interval(ttl);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let renewal = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            renewal = tokio::time::timeout(
                RENEW_TIMEOUT,
                store.compare_and_expire(&resource, &token, ttl),
            ) => renewal,
        };

        match renewal {
            Ok(Ok(true)) => {
                metrics::counter!("lock_renewals_total", "result" => "renewed").increment(1);
                tracing::trace!(resource = %resource, "Lease renewed");
            }
            Ok(Ok(false)) => {
                metrics::counter!("lock_renewals_total", "result" => "lost").increment(1);
                tracing::warn!(resource = %resource, "Lease lost to another owner, watchdog stopping");
                status.send_replace(LeaseStatus::Lost);
                return;
            }
            Ok(Err(err)) => {
                metrics::counter!("lock_renewals_total", "result" => "error").increment(1);
                tracing::warn!(resource = %resource, error = %err, "Lease renewal failed, watchdog stopping");
                status.send_replace(LeaseStatus::Uncertain);
                return;
            }
            Err(_) => {
                metrics::counter!("lock_renewals_total", "result" => "timeout").increment(1);
                tracing::warn!(
                    resource = %resource,
                    timeout_ms = RENEW_TIMEOUT.as_millis(),
                    "Lease renewal timed out, watchdog stopping"
                );
                status.send_replace(LeaseStatus::Uncertain);
                return;
            }
        }
    }

    status.send_replace(LeaseStatus::Released);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renew_interval_is_a_third_of_ttl() {
        assert_eq!(renew_interval(Duration::from_secs(3)), Duration::from_secs(1));
        assert_eq!(renew_interval(Duration::from_secs(5)), Duration::from_nanos(1_666_666_666));
    }

    #[test]
    fn renew_interval_has_a_floor() {
        assert_eq!(renew_interval(Duration::from_millis(90)), MIN_RENEW_INTERVAL);
        assert_eq!(renew_interval(Duration::ZERO), MIN_RENEW_INTERVAL);
    }

    #[test]
    fn lease_status_labels() {
        assert_eq!(LeaseStatus::Uncertain.as_str(), "uncertain");
        assert_eq!(LeaseStatus::Released.as_str(), "released");
    }
}
