//! Worker configuration.
//!
//! Environment-based configuration with per-deployment defaults and validation.
//!
//! # Example
//!
//! ```no_run
//! use mall_inventory::config::{Environment, WorkerConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variable CONFIG_ENV (defaults to development)
//! let config = WorkerConfig::from_env()?;
//!
//! // Or load defaults for an environment explicitly
//! let config = WorkerConfig::load(Environment::Staging)?;
//! println!("Lock TTL: {:?}", config.lock.ttl());
//! # Ok(())
//! # }
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Section | Default |
//! |----------|---------|---------|
//! | `CONFIG_ENV` | environment | `development` |
//! | `REDIS_URL` | redis | `redis://127.0.0.1:6379` (required outside development) |
//! | `REDIS_KEY_PREFIX` | redis | `mall` |
//! | `REDIS_OPERATION_TIMEOUT_MS` | redis | `2000` |
//! | `REDPANDA_BROKERS` | broker | `localhost:9092` (required outside development) |
//! | `CONSUMER_GROUP` | broker | `mall-inventory` |
//! | `ORDER_QUEUE` | broker | `orders.created` |
//! | `LOCK_TTL_SECS` / `LOCK_WAIT_SECS` | lock | `10` / `5` |
//! | `CONSUMER_PREFETCH` | consumer | `1` |
//! | `CONSUMER_DRAIN_TIMEOUT_SECS` | consumer | `30` |
//! | `LOG_FORMAT` (`json` or `pretty`) | observability | per environment |
//! | `METRICS_ADDR` | observability | `0.0.0.0:9090` |

use mall_runtime::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Environment variable not set
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),
    /// Invalid environment value
    #[error("Invalid environment: {0}")]
    InvalidEnvironment(String),
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Development environment (local)
    Development,
    /// Staging environment (pre-production)
    Staging,
    /// Production environment
    Production,
}

impl Environment {
    /// Check if this is production environment
    #[must_use]
    pub const fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }

    /// Check if this is development environment
    #[must_use]
    pub const fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Development),
            "staging" | "stage" => Ok(Self::Staging),
            "prod" | "production" => Ok(Self::Production),
            _ => Err(ConfigError::InvalidEnvironment(s.to_string())),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Staging => write!(f, "staging"),
            Self::Production => write!(f, "production"),
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL (from environment variable)
    pub url: String,
    /// Namespace prepended to every key
    pub key_prefix: String,
    /// Bound on a single Redis command in milliseconds
    pub operation_timeout_ms: u64,
}

impl RedisConfig {
    /// Validate Redis configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.url.starts_with("redis://") && !self.url.starts_with("rediss://") {
            return Err(ConfigError::ValidationError(format!(
                "redis url must start with redis:// or rediss://, got {}",
                self.url
            )));
        }
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "operation_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Get operation timeout as Duration
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "mall".to_string(),
            operation_timeout_ms: 2000,
        }
    }
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Bootstrap servers (comma-separated)
    pub brokers: String,
    /// Consumer group shared by every worker instance
    pub consumer_group: String,
    /// Queue the order worker consumes
    pub queue: String,
    /// Producer acknowledgment mode
    pub producer_acks: String,
    /// First reconnect delay in milliseconds
    pub reconnect_initial_ms: u64,
    /// Reconnect delay cap in milliseconds
    pub reconnect_max_ms: u64,
}

impl BrokerConfig {
    /// Validate broker configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.trim().is_empty() {
            return Err(ConfigError::ValidationError("brokers cannot be empty".to_string()));
        }
        if self.queue.is_empty() {
            return Err(ConfigError::ValidationError("queue cannot be empty".to_string()));
        }
        if self.reconnect_initial_ms == 0 || self.reconnect_max_ms < self.reconnect_initial_ms {
            return Err(ConfigError::ValidationError(
                "reconnect delays must satisfy 0 < initial <= max".to_string(),
            ));
        }
        Ok(())
    }

    /// Reconnect backoff: unbounded attempts between the configured delays.
    #[must_use]
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(usize::MAX)
            .initial_delay(Duration::from_millis(self.reconnect_initial_ms))
            .max_delay(Duration::from_millis(self.reconnect_max_ms))
            .build()
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            consumer_group: "mall-inventory".to_string(),
            queue: crate::worker::ORDER_CREATED_QUEUE.to_string(),
            producer_acks: "all".to_string(),
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
        }
    }
}

/// SKU lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease TTL in seconds; the watchdog renews it while held
    pub ttl_secs: u64,
    /// How long a deduction waits for the lock, in seconds
    pub wait_secs: u64,
    /// Bound on the release call, in seconds
    pub release_timeout_secs: u64,
}

impl LockConfig {
    /// Validate lock configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_secs == 0 {
            return Err(ConfigError::ValidationError("lock ttl_secs must be > 0".to_string()));
        }
        if self.release_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "lock release_timeout_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Get lease TTL as Duration
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Get acquisition wait as Duration
    #[must_use]
    pub const fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    /// Get release timeout as Duration
    #[must_use]
    pub const fn release_timeout(&self) -> Duration {
        Duration::from_secs(self.release_timeout_secs)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 10,
            wait_secs: 5,
            release_timeout_secs: 2,
        }
    }
}

/// Stock consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Maximum unacknowledged deliveries
    pub prefetch: u16,
    /// How long an order stays marked as processed, in seconds
    pub processed_ttl_secs: u64,
    /// How long shutdown waits for in-flight orders, in seconds
    pub drain_timeout_secs: u64,
}

impl ConsumerConfig {
    /// Validate consumer configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefetch == 0 {
            return Err(ConfigError::ValidationError("prefetch must be > 0".to_string()));
        }
        if self.processed_ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "processed_ttl_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Get idempotency marker TTL as Duration
    #[must_use]
    pub const fn processed_ttl(&self) -> Duration {
        Duration::from_secs(self.processed_ttl_secs)
    }

    /// Get shutdown drain budget as Duration
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch: 1,
            processed_ttl_secs: 24 * 60 * 60,
            drain_timeout_secs: 30,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Emit JSON log lines instead of the human-readable format
    pub json_logs: bool,
    /// Prometheus scrape address
    pub metrics_addr: String,
}

impl ObservabilityConfig {
    /// Validate observability configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "invalid log_level: {}. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }
        self.metrics_addr()?;
        Ok(())
    }

    /// Parse the metrics address
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] if the address is not `host:port`
    pub fn metrics_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.metrics_addr
            .parse()
            .map_err(|e| ConfigError::ParseError(format!("metrics_addr {}: {e}", self.metrics_addr)))
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_addr: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Inventory worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Deployment environment
    pub environment: Environment,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Broker configuration
    pub broker: BrokerConfig,
    /// SKU lock configuration
    pub lock: LockConfig,
    /// Stock consumer configuration
    pub consumer: ConsumerConfig,
    /// Observability configuration
    pub observability: ObservabilityConfig,
}

impl WorkerConfig {
    /// Load configuration from the process environment
    ///
    /// Reads `CONFIG_ENV` (defaults to "development") and the overrides listed in the
    /// module documentation.
    ///
    /// # Errors
    ///
    /// Returns error if configuration cannot be loaded or is invalid
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration defaults for a specific environment, without overrides
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn load(environment: Environment) -> Result<Self, ConfigError> {
        let config = Self::defaults_for(environment);
        config.validate()?;
        Ok(config)
    }

    /// Load configuration reading variables through `lookup`
    ///
    /// # Errors
    ///
    /// Returns error if a variable does not parse, a required one is missing, or the
    /// result is invalid
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = lookup("CONFIG_ENV")
            .as_deref()
            .unwrap_or("development")
            .parse()?;
        let mut config = Self::defaults_for(environment);
        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn defaults_for(environment: Environment) -> Self {
        let mut config = Self {
            environment,
            ..Self::default()
        };

        // Environment-specific overrides
        match environment {
            Environment::Development => {
                config.observability.log_level = "debug".to_string();
            }
            Environment::Staging => {
                config.observability.json_logs = true;
            }
            Environment::Production => {
                config.observability.json_logs = true;
                config.broker.reconnect_initial_ms = 2_000;
            }
        }
        config
    }

    fn apply_overrides<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Connection targets are required outside development
        match lookup("REDIS_URL") {
            Some(url) => self.redis.url = url,
            None if !self.environment.is_development() => {
                return Err(ConfigError::EnvVarNotSet("REDIS_URL".to_string()));
            }
            None => {}
        }
        match lookup("REDPANDA_BROKERS") {
            Some(brokers) => self.broker.brokers = brokers,
            None if !self.environment.is_development() => {
                return Err(ConfigError::EnvVarNotSet("REDPANDA_BROKERS".to_string()));
            }
            None => {}
        }

        if let Some(prefix) = lookup("REDIS_KEY_PREFIX") {
            self.redis.key_prefix = prefix;
        }
        if let Some(timeout) = parsed(lookup, "REDIS_OPERATION_TIMEOUT_MS")? {
            self.redis.operation_timeout_ms = timeout;
        }
        if let Some(group) = lookup("CONSUMER_GROUP") {
            self.broker.consumer_group = group;
        }
        if let Some(queue) = lookup("ORDER_QUEUE") {
            self.broker.queue = queue;
        }
        if let Some(ttl) = parsed(lookup, "LOCK_TTL_SECS")? {
            self.lock.ttl_secs = ttl;
        }
        if let Some(wait) = parsed(lookup, "LOCK_WAIT_SECS")? {
            self.lock.wait_secs = wait;
        }
        if let Some(prefetch) = parsed(lookup, "CONSUMER_PREFETCH")? {
            self.consumer.prefetch = prefetch;
        }
        if let Some(drain) = parsed(lookup, "CONSUMER_DRAIN_TIMEOUT_SECS")? {
            self.consumer.drain_timeout_secs = drain;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            self.observability.json_logs = match format.to_lowercase().as_str() {
                "json" => true,
                "pretty" | "text" => false,
                other => {
                    return Err(ConfigError::ParseError(format!(
                        "LOG_FORMAT must be json or pretty, got {other}"
                    )));
                }
            };
        }
        if let Some(addr) = lookup("METRICS_ADDR") {
            self.observability.metrics_addr = addr;
        }
        Ok(())
    }

    /// Validate entire configuration
    ///
    /// # Errors
    ///
    /// Returns error if any configuration section is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.redis.validate()?;
        self.broker.validate()?;
        self.lock.validate()?;
        self.consumer.validate()?;
        self.observability.validate()?;
        Ok(())
    }

    /// Check if running in production
    #[must_use]
    pub const fn is_production(&self) -> bool {
        self.environment.is_production()
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            redis: RedisConfig::default(),
            broker: BrokerConfig::default(),
            lock: LockConfig::default(),
            consumer: ConsumerConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

fn parsed<F, T>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.parse()
                .map_err(|e| ConfigError::ParseError(format!("{name}={raw}: {e}")))
        })
        .transpose()
}
