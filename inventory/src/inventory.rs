//! Stock levels per SKU.
//!
//! Stock lives at `stock:sku:{sku}` as a non-negative decimal string. It changes in two
//! ways only:
//!
//! - [`InventoryService::deduct`] and [`InventoryService::set_stock`] run a
//!   read-check-write under the SKU lock `lock:sku:{sku}`
//! - [`InventoryService::restock`] applies an atomic store-side delta
//!
//! A missing stock key reads as zero.

use crate::config::LockConfig;
use mall_core::store::{KeyValueStore, StoreError};
use mall_runtime::{DistributedLock, LeaseStatus, LockError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Store key holding the stock level of `sku`.
#[must_use]
pub fn stock_key(sku: u64) -> String {
    format!("stock:sku:{sku}")
}

/// Store key of the lock guarding `sku`.
#[must_use]
pub fn lock_key(sku: u64) -> String {
    format!("lock:sku:{sku}")
}

/// Errors from stock operations.
#[derive(Error, Debug)]
pub enum InventoryError {
    /// Not enough units. Terminal: retrying cannot help.
    #[error("Insufficient stock for sku {sku}: requested {requested}, available {available}")]
    InsufficientStock {
        /// SKU being deducted
        sku: u64,
        /// Units requested
        requested: u32,
        /// Units on hand
        available: u64,
    },

    /// Another holder kept the SKU lock for the whole wait budget.
    #[error("Timed out after {waited:?} waiting for the lock on sku {sku}")]
    LockTimeout {
        /// SKU whose lock was contended
        sku: u64,
        /// How long we waited
        waited: Duration,
    },

    /// The lease stopped being provably ours before the write.
    #[error("Lease on sku {sku} is {status}; write skipped")]
    LeaseLost {
        /// SKU whose lease was lost
        sku: u64,
        /// Lease status observed just before the write
        status: &'static str,
    },

    /// The lock itself failed.
    #[error("Lock failed for sku {sku}: {source}")]
    Lock {
        /// SKU being locked
        sku: u64,
        /// Underlying lock error
        #[source]
        source: LockError,
    },

    /// A stock read or write failed.
    #[error("Store failed for sku {sku}: {source}")]
    Store {
        /// SKU being read or written
        sku: u64,
        /// Underlying store error
        #[source]
        source: StoreError,
    },

    /// The stored value is not a non-negative integer.
    #[error("Invalid stock value {value:?} for sku {sku}")]
    CorruptStock {
        /// SKU with the bad value
        sku: u64,
        /// Raw stored value
        value: String,
    },
}

impl InventoryError {
    /// Business failure that must not be retried.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::InsufficientStock { .. })
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::LeaseLost { .. } => "lease_lost",
            Self::Lock { .. } => "lock",
            Self::Store { .. } => "store",
            Self::CorruptStock { .. } => "corrupt_stock",
        }
    }
}

/// Reads and changes stock levels.
///
/// Stock reads and writes go through `store` (normally a `ResilientStore`). Locks go
/// through `lock_store`, which should be the plain backend: a retried `SET NX` whose
/// first reply was lost would otherwise look like contention.
#[derive(Clone)]
pub struct InventoryService {
    store: Arc<dyn KeyValueStore>,
    lock_store: Arc<dyn KeyValueStore>,
    lock: LockConfig,
}

impl InventoryService {
    /// Create a service.
    #[must_use]
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        lock_store: Arc<dyn KeyValueStore>,
        lock: LockConfig,
    ) -> Self {
        Self {
            store,
            lock_store,
            lock,
        }
    }

    /// Remove `quantity` units of `sku` and return what is left.
    ///
    /// Lock, read, check, write, unlock. A release that fails after the write is
    /// logged; the deduction still stands.
    ///
    /// # Errors
    ///
    /// - [`InventoryError::InsufficientStock`] if fewer than `quantity` units are on hand
    /// - [`InventoryError::LockTimeout`] if the lock stays contended for the wait budget
    /// - [`InventoryError::LeaseLost`] if the lease was lost before the write
    /// - [`InventoryError::Store`], [`InventoryError::Lock`],
    ///   [`InventoryError::CorruptStock`] for infrastructure and data failures
    pub async fn deduct(&self, sku: u64, quantity: u32) -> Result<u64, InventoryError> {
        let lock = self.acquire_sku_lock(sku).await?;
        let outcome = self.deduct_locked(&lock, sku, quantity).await;
        self.release(&lock, sku).await;
        outcome
    }

    /// Overwrite the stock level of `sku` under its lock.
    ///
    /// # Errors
    ///
    /// Same infrastructure errors as [`deduct`](Self::deduct).
    pub async fn set_stock(&self, sku: u64, level: u64) -> Result<(), InventoryError> {
        let lock = self.acquire_sku_lock(sku).await?;
        let outcome = self.write_level(&lock, sku, level).await;
        self.release(&lock, sku).await;
        outcome?;
        tracing::info!(sku, level, "Stock set");
        Ok(())
    }

    /// Add `quantity` units of `sku` with an atomic delta and return the new level.
    ///
    /// Needs no lock: the delta cannot take stock below zero.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Store`] if the increment fails (it is not retried) and
    /// [`InventoryError::CorruptStock`] if the result is negative.
    pub async fn restock(&self, sku: u64, quantity: u32) -> Result<u64, InventoryError> {
        let level = self
            .store
            .incr_by(&stock_key(sku), i64::from(quantity))
            .await
            .map_err(|source| InventoryError::Store { sku, source })?;
        let level = u64::try_from(level).map_err(|_| InventoryError::CorruptStock {
            sku,
            value: level.to_string(),
        })?;

        tracing::info!(sku, quantity, level, "Stock replenished");
        metrics::counter!("inventory_restocks_total").increment(1);
        Ok(level)
    }

    /// Current stock of `sku`. Missing means zero.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Store`] or [`InventoryError::CorruptStock`].
    pub async fn stock_level(&self, sku: u64) -> Result<u64, InventoryError> {
        self.read_level(sku).await
    }

    /// Current stock of several SKUs in one round-trip, in the order given.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Store`] (reported against the first SKU) or
    /// [`InventoryError::CorruptStock`] for the first bad value.
    pub async fn stock_levels(&self, skus: &[u64]) -> Result<Vec<u64>, InventoryError> {
        let Some(&first) = skus.first() else {
            return Ok(Vec::new());
        };
        let keys: Vec<String> = skus.iter().map(|&sku| stock_key(sku)).collect();
        let values = self
            .store
            .mget(&keys)
            .await
            .map_err(|source| InventoryError::Store { sku: first, source })?;

        skus.iter()
            .zip(values)
            .map(|(&sku, value)| parse_level(sku, value))
            .collect()
    }

    async fn read_level(&self, sku: u64) -> Result<u64, InventoryError> {
        let value = self
            .store
            .get(&stock_key(sku))
            .await
            .map_err(|source| InventoryError::Store { sku, source })?;
        parse_level(sku, value)
    }

    async fn write_level(
        &self,
        lock: &DistributedLock,
        sku: u64,
        level: u64,
    ) -> Result<(), InventoryError> {
        let status = lock.lease_status();
        if status != LeaseStatus::Held {
            return Err(InventoryError::LeaseLost {
                sku,
                status: status.as_str(),
            });
        }
        self.store
            .set(&stock_key(sku), &level.to_string(), None)
            .await
            .map_err(|source| InventoryError::Store { sku, source })
    }

    async fn deduct_locked(
        &self,
        lock: &DistributedLock,
        sku: u64,
        quantity: u32,
    ) -> Result<u64, InventoryError> {
        let available = self.read_level(sku).await?;
        if available < u64::from(quantity) {
            return Err(InventoryError::InsufficientStock {
                sku,
                requested: quantity,
                available,
            });
        }

        let remaining = available - u64::from(quantity);
        self.write_level(lock, sku, remaining).await?;
        tracing::info!(sku, quantity, remaining, "Stock deducted");
        metrics::counter!("inventory_deductions_total").increment(1);
        Ok(remaining)
    }

    async fn acquire_sku_lock(&self, sku: u64) -> Result<DistributedLock, InventoryError> {
        let lock = DistributedLock::new(Arc::clone(&self.lock_store), lock_key(sku));
        let started = Instant::now();
        let acquired = lock
            .acquire(self.lock.ttl(), self.lock.wait())
            .await
            .map_err(|source| InventoryError::Lock { sku, source })?;
        if !acquired {
            tracing::warn!(sku, waited_ms = started.elapsed().as_millis(), "SKU lock contended");
            return Err(InventoryError::LockTimeout {
                sku,
                waited: started.elapsed(),
            });
        }
        Ok(lock)
    }

    async fn release(&self, lock: &DistributedLock, sku: u64) {
        match tokio::time::timeout(self.lock.release_timeout(), lock.release()).await {
            Ok(Ok(())) => {}
            Ok(Err(LockError::NotHeld { .. })) => {
                tracing::warn!(sku, "Lock expired or was taken over before release");
            }
            Ok(Err(e)) => {
                tracing::error!(sku, error = %e, "Failed to release lock; lease will expire");
            }
            Err(_) => {
                tracing::error!(
                    sku,
                    timeout_ms = self.lock.release_timeout().as_millis(),
                    "Lock release timed out; lease will expire"
                );
            }
        }
    }
}

fn parse_level(sku: u64, value: Option<String>) -> Result<u64, InventoryError> {
    match value {
        None => Ok(0),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| InventoryError::CorruptStock { sku, value: raw }),
    }
}

impl std::fmt::Debug for InventoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryService")
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}
