//! In-memory key-value store with expiry and fault injection.
//!
//! [`InMemoryStore`] implements [`KeyValueStore`] over a `HashMap`, honouring TTLs
//! against the Tokio clock (so `tokio::time::pause` / `advance` drive expiry).
//!
//! Faults are injected per operation, optionally narrowed to keys with a given prefix,
//! for a number of calls or forever. Every call is counted per operation, including
//! calls that fail.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use futures::future::BoxFuture;
use mall_core::store::{KeyValueStore, StoreError, StoreOp};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Clone)]
struct Fault {
    op: StoreOp,
    key_prefix: Option<String>,
    remaining: Option<usize>,
    error: StoreError,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    faults: Vec<Fault>,
    calls: HashMap<StoreOp, usize>,
    latency: Duration,
}

impl State {
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        if self.entries.get(key).is_some_and(|e| !e.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    /// Count the call and return the injected error, if any.
    fn intercept(&mut self, op: StoreOp, keys: &[&str]) -> Result<(), StoreError> {
        *self.calls.entry(op).or_default() += 1;

        let position = self.faults.iter().position(|fault| {
            fault.op == op
                && fault
                    .key_prefix
                    .as_deref()
                    .is_none_or(|prefix| keys.iter().any(|key| key.starts_with(prefix)))
        });
        let Some(index) = position else {
            return Ok(());
        };

        let fault = &mut self.faults[index];
        let error = fault.error.clone();
        if let Some(remaining) = fault.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.faults.remove(index);
            }
        }
        Err(error)
    }
}

/// In-memory [`KeyValueStore`] for tests.
///
/// # Example
///
/// ```
/// use mall_testing::InMemoryStore;
/// use mall_core::store::{KeyValueStore, StoreError, StoreOp};
///
/// # async fn example() {
/// let store = InMemoryStore::new();
/// store.insert("stock:sku:101", "5");
/// store.fail_next(StoreOp::Get, 1, StoreError::Timeout("injected".into()));
///
/// assert!(store.get("stock:sku:101").await.is_err());
/// assert_eq!(store.get("stock:sku:101").await, Ok(Some("5".into())));
/// assert_eq!(store.calls(StoreOp::Get), 2);
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `value` under `key` without expiry, bypassing faults and call counts.
    pub fn insert(&self, key: &str, value: &str) {
        self.state.lock().unwrap().entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
    }

    /// Read `key`, bypassing faults and call counts.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.state
            .lock()
            .unwrap()
            .live(key, now)
            .map(|entry| entry.value.clone())
    }

    /// Remaining time to live of `key`; `None` if absent or without expiry.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.state
            .lock()
            .unwrap()
            .live(key, now)
            .and_then(|entry| entry.expires_at)
            .map(|at| at - now)
    }

    /// Remove `key`, bypassing faults and call counts. Simulates expiry or a
    /// third party deleting it.
    pub fn remove(&self, key: &str) {
        self.state.lock().unwrap().entries.remove(key);
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .unwrap()
            .entries
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    /// Whether no live keys exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls made for `op`, including failed ones.
    #[must_use]
    pub fn calls(&self, op: StoreOp) -> usize {
        self.state.lock().unwrap().calls.get(&op).copied().unwrap_or(0)
    }

    /// Calls made across every operation.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.state.lock().unwrap().calls.values().sum()
    }

    /// Zero all call counters.
    pub fn reset_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Fail the next `times` calls of `op` with `error`.
    pub fn fail_next(&self, op: StoreOp, times: usize, error: StoreError) {
        self.push_fault(op, None, Some(times), error);
    }

    /// Fail every call of `op` with `error` until [`clear_faults`](Self::clear_faults).
    pub fn fail_always(&self, op: StoreOp, error: StoreError) {
        self.push_fault(op, None, None, error);
    }

    /// Fail calls of `op` touching a key that starts with `prefix`.
    ///
    /// `times == None` fails forever.
    pub fn fail_matching(
        &self,
        op: StoreOp,
        prefix: &str,
        times: Option<usize>,
        error: StoreError,
    ) {
        self.push_fault(op, Some(prefix.to_string()), times, error);
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        self.state.lock().unwrap().faults.clear();
    }

    /// Delay every call by `latency` before it touches the map.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = latency;
    }

    fn push_fault(&self, op: StoreOp, key_prefix: Option<String>, times: Option<usize>, error: StoreError) {
        if times == Some(0) {
            return;
        }
        self.state.lock().unwrap().faults.push(Fault {
            op,
            key_prefix,
            remaining: times,
            error,
        });
    }

    async fn enter(&self, op: StoreOp, keys: &[&str]) -> Result<(), StoreError> {
        let latency = self.state.lock().unwrap().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.state.lock().unwrap().intercept(op, keys)
    }
}

fn expiry(ttl: Duration) -> Instant {
    Instant::now() + ttl
}

impl KeyValueStore for InMemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>> {
        Box::pin(async move {
            self.enter(StoreOp::Get, &[key]).await?;
            Ok(self.peek(key))
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.enter(StoreOp::Set, &[key]).await?;
            self.state.lock().unwrap().entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: ttl.map(expiry),
                },
            );
            Ok(())
        })
    }

    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            self.enter(StoreOp::SetIfAbsent, &[key]).await?;
            let now = Instant::now();
            let mut state = self.state.lock().unwrap();
            if state.live(key, now).is_some() {
                return Ok(false);
            }
            state.entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Some(expiry(ttl)),
                },
            );
            Ok(true)
        })
    }

    fn compare_and_delete<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            self.enter(StoreOp::CompareAndDelete, &[key]).await?;
            let now = Instant::now();
            let mut state = self.state.lock().unwrap();
            if state.live(key, now).is_some_and(|entry| entry.value == expected) {
                state.entries.remove(key);
                return Ok(true);
            }
            Ok(false)
        })
    }

    fn compare_and_expire<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            self.enter(StoreOp::CompareAndExpire, &[key]).await?;
            let now = Instant::now();
            let mut state = self.state.lock().unwrap();
            match state.live(key, now) {
                Some(entry) if entry.value == expected => {
                    entry.expires_at = Some(expiry(ttl));
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn delete<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
            self.enter(StoreOp::Delete, &refs).await?;
            let now = Instant::now();
            let mut state = self.state.lock().unwrap();
            let mut removed = 0;
            for key in keys {
                if state.live(key, now).is_some() {
                    state.entries.remove(key);
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    fn mget<'a>(
        &'a self,
        keys: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Option<String>>, StoreError>> {
        Box::pin(async move {
            let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
            self.enter(StoreOp::MGet, &refs).await?;
            let now = Instant::now();
            let mut state = self.state.lock().unwrap();
            Ok(keys
                .iter()
                .map(|key| state.live(key, now).map(|entry| entry.value.clone()))
                .collect())
        })
    }

    fn incr_by<'a>(&'a self, key: &'a str, delta: i64) -> BoxFuture<'a, Result<i64, StoreError>> {
        Box::pin(async move {
            self.enter(StoreOp::IncrBy, &[key]).await?;
            let now = Instant::now();
            let mut state = self.state.lock().unwrap();
            let (current, expires_at) = match state.live(key, now) {
                Some(entry) => {
                    let current = entry.value.parse::<i64>().map_err(|_| {
                        StoreError::Backend(format!(
                            "incr_by {key}: value is not an integer or out of range"
                        ))
                    })?;
                    (current, entry.expires_at)
                }
                None => (0, None),
            };
            let next = current.checked_add(delta).ok_or_else(|| {
                StoreError::Backend(format!("incr_by {key}: increment would overflow"))
            })?;
            state.entries.insert(
                key.to_string(),
                Entry {
                    value: next.to_string(),
                    expires_at,
                },
            );
            Ok(next)
        })
    }
}
