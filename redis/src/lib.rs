//! # Mall Redis
//!
//! Redis implementation of [`KeyValueStore`].
//!
//! # Architecture
//!
//! - Connection pooling and automatic reconnection via `ConnectionManager`
//! - Every key is namespaced as `{prefix}:{key}` (e.g. `mall:stock:sku:101`)
//! - `set_if_absent` is `SET key value NX PX ttl`
//! - Owner-checked delete and expire run as Lua scripts, so the read-compare-write is
//!   atomic on the server
//! - Each command is bounded by an operation timeout (default 2s)
//!
//! # Example
//!
//! ```no_run
//! use mall_redis::RedisStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisStore::new("redis://127.0.0.1:6379", "mall").await?;
//! # Ok(())
//! # }
//! ```

use futures::future::BoxFuture;
use mall_core::store::{KeyValueStore, StoreError, StoreOp};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use std::future::Future;
use std::time::Duration;

/// Default bound on a single Redis command.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

const COMPARE_AND_DELETE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

const COMPARE_AND_EXPIRE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

/// Redis-backed [`KeyValueStore`].
///
/// Cheap to clone; clones share the connection manager.
#[derive(Clone)]
pub struct RedisStore {
    conn_manager: ConnectionManager,
    prefix: String,
    operation_timeout: Duration,
    compare_and_delete: Script,
    compare_and_expire: Script,
}

impl RedisStore {
    /// Connect to Redis and namespace every key under `prefix`.
    ///
    /// An empty prefix disables namespacing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the URL is invalid or the first
    /// connection fails.
    pub async fn new(redis_url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(|e| {
            StoreError::Unavailable(format!("Failed to create Redis client: {e}"))
        })?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            StoreError::Unavailable(format!("Failed to create Redis connection manager: {e}"))
        })?;

        tracing::info!(prefix, "Connected to Redis");

        Ok(Self {
            conn_manager,
            prefix: prefix.to_string(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            compare_and_expire: Script::new(COMPARE_AND_EXPIRE),
        })
    }

    /// Override the per-command timeout.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Round-trip a `PING`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if Redis does not answer.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        let _: String = self
            .bounded(StoreOp::Get, "PING", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    /// The namespaced Redis key for `key`.
    #[must_use]
    pub fn key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{key}", self.prefix)
        }
    }

    async fn bounded<T, F>(&self, op: StoreOp, key: &str, command: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, RedisError>>,
    {
        match tokio::time::timeout(self.operation_timeout, command).await {
            Ok(result) => result.map_err(|e| map_redis_error(op, key, &e)),
            Err(_) => Err(StoreError::Timeout(format!(
                "{op} {key}: no reply within {}ms",
                self.operation_timeout.as_millis()
            ))),
        }
    }
}

/// Classify a Redis error. Connection-level failures are `Unavailable`, timeouts are
/// `Timeout`, and anything the server answered with is `Backend`.
fn map_redis_error(op: StoreOp, key: &str, e: &RedisError) -> StoreError {
    let message = format!("{op} {key}: {e}");
    if e.is_timeout() {
        StoreError::Timeout(message)
    } else if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        StoreError::Unavailable(message)
    } else {
        StoreError::Backend(message)
    }
}

/// Milliseconds for `PX` / `PEXPIRE`. Redis rejects 0, so the floor is 1ms.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl KeyValueStore for RedisStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let full = self.key(key);
            self.bounded(StoreOp::Get, &full, conn.get(&full)).await
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let full = self.key(key);
            let mut cmd = redis::cmd("SET");
            cmd.arg(&full).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl_millis(ttl));
            }
            let _: () = self
                .bounded(StoreOp::Set, &full, cmd.query_async(&mut conn))
                .await?;
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
            let mut conn = self.conn_manager.clone();
            let full = self.key(key);
            let reply: Option<String> = self
                .bounded(
                    StoreOp::SetIfAbsent,
                    &full,
                    redis::cmd("SET")
                        .arg(&full)
                        .arg(value)
                        .arg("NX")
                        .arg("PX")
                        .arg(ttl_millis(ttl))
                        .query_async(&mut conn),
                )
                .await?;
            Ok(reply.is_some())
        })
    }

    fn compare_and_delete<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let full = self.key(key);
            let deleted: i64 = self
                .bounded(
                    StoreOp::CompareAndDelete,
                    &full,
                    self.compare_and_delete
                        .key(&full)
                        .arg(expected)
                        .invoke_async(&mut conn),
                )
                .await?;
            Ok(deleted == 1)
        })
    }

    fn compare_and_expire<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let full = self.key(key);
            let extended: i64 = self
                .bounded(
                    StoreOp::CompareAndExpire,
                    &full,
                    self.compare_and_expire
                        .key(&full)
                        .arg(expected)
                        .arg(ttl_millis(ttl))
                        .invoke_async(&mut conn),
                )
                .await?;
            Ok(extended == 1)
        })
    }

    fn delete<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(0);
            }
            let mut conn = self.conn_manager.clone();
            let full: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
            let label = full.join(",");
            self.bounded(StoreOp::Delete, &label, conn.del(&full)).await
        })
    }

    fn mget<'a>(
        &'a self,
        keys: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Option<String>>, StoreError>> {
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(Vec::new());
            }
            let mut conn = self.conn_manager.clone();
            let full: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
            let label = full.join(",");
            self.bounded(
                StoreOp::MGet,
                &label,
                redis::cmd("MGET").arg(&full).query_async(&mut conn),
            )
            .await
        })
    }

    fn incr_by<'a>(&'a self, key: &'a str, delta: i64) -> BoxFuture<'a, Result<i64, StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let full = self.key(key);
            self.bounded(StoreOp::IncrBy, &full, conn.incr(&full, delta))
                .await
        })
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_sent_in_milliseconds_with_a_floor() {
        assert_eq!(ttl_millis(Duration::from_secs(24 * 60 * 60)), 86_400_000);
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
    }

    #[test]
    fn scripts_compare_before_acting() {
        assert!(COMPARE_AND_DELETE.contains("== ARGV[1]"));
        assert!(COMPARE_AND_EXPIRE.contains("PEXPIRE"));
    }

    #[test]
    fn server_errors_are_backend_errors() {
        let e = RedisError::from((redis::ErrorKind::TypeError, "WRONGTYPE"));
        assert!(matches!(
            map_redis_error(StoreOp::IncrBy, "mall:stock:sku:1", &e),
            StoreError::Backend(message) if message.starts_with("incr_by mall:stock:sku:1")
        ));
    }

    #[test]
    fn io_errors_are_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let e = RedisError::from(io);
        assert!(matches!(
            map_redis_error(StoreOp::Get, "mall:stock:sku:1", &e),
            StoreError::Unavailable(_)
        ));
    }
}
