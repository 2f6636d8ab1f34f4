//! Circuit breaker pattern for preventing cascading failures.
//!
//! A circuit breaker monitors operations and "opens" (stops allowing requests) when the
//! failure ratio in the current window crosses a threshold, so a struggling store is
//! left alone instead of being hammered by retries.
//!
//! # States
//!
//! - **Closed**: Normal operation. Requests pass through and are counted. Counts reset
//!   every `interval` (the rolling window).
//! - **Open**: Too many failures. Requests fail immediately until `timeout` elapses.
//! - **HalfOpen**: After the timeout, `half_open_max_requests` trial requests pass.
//!   If they all succeed the circuit closes; any failure reopens it.
//!
//! Every state change starts a new *generation*. Results from requests admitted in an
//! older generation are ignored, so a slow call that started before the circuit opened
//! cannot close it again.
//!
//! # Example
//!
//! ```rust
//! use mall_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CircuitBreakerConfig::builder()
//!     .min_requests(10)
//!     .failure_ratio(0.5)
//!     .timeout(Duration::from_secs(30))
//!     .build();
//!
//! let breaker = CircuitBreaker::new("redis-cache", config);
//!
//! match breaker.call(|| async {
//!     // Your fallible operation
//!     Ok::<_, String>(42)
//! }).await {
//!     Ok(result) => println!("Success: {result}"),
//!     Err(e) => println!("Failed: {e}"),
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Minimum requests in the window before the failure ratio is considered
    pub min_requests: u64,
    /// Failure ratio (0.0 to 1.0) at or above which the circuit opens
    pub failure_ratio: f64,
    /// Length of the rolling window while closed
    pub interval: Duration,
    /// Duration to wait before transitioning from Open to `HalfOpen`
    pub timeout: Duration,
    /// Trial requests allowed in `HalfOpen`
    pub half_open_max_requests: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            min_requests: 10,
            failure_ratio: 0.5,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            min_requests: None,
            failure_ratio: None,
            interval: None,
            timeout: None,
            half_open_max_requests: None,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    min_requests: Option<u64>,
    failure_ratio: Option<f64>,
    interval: Option<Duration>,
    timeout: Option<Duration>,
    half_open_max_requests: Option<u64>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the minimum request count before the circuit may trip.
    #[must_use]
    pub const fn min_requests(mut self, min_requests: u64) -> Self {
        self.min_requests = Some(min_requests);
        self
    }

    /// Set the failure ratio that trips the circuit.
    #[must_use]
    pub const fn failure_ratio(mut self, ratio: f64) -> Self {
        self.failure_ratio = Some(ratio);
        self
    }

    /// Set the rolling window length.
    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Set the timeout duration.
    ///
    /// How long to wait in Open state before trying `HalfOpen`.
    #[must_use]
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Set how many trial requests `HalfOpen` admits.
    #[must_use]
    pub const fn half_open_max_requests(mut self, max: u64) -> Self {
        self.half_open_max_requests = Some(max);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        let defaults = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            min_requests: self.min_requests.unwrap_or(defaults.min_requests),
            failure_ratio: self.failure_ratio.unwrap_or(defaults.failure_ratio),
            interval: self.interval.unwrap_or(defaults.interval),
            timeout: self.timeout.unwrap_or(defaults.timeout),
            half_open_max_requests: self
                .half_open_max_requests
                .unwrap_or(defaults.half_open_max_requests)
                .max(1),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, testing if service recovered
    HalfOpen,
}

impl State {
    /// Lowercase label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Errors from circuit breaker operations.
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open (or the half-open trial slot is taken), request rejected
    #[error("Circuit breaker is open")]
    Open,
    /// Operation failed
    #[error("Operation failed: {0}")]
    Inner(E),
}

/// Request counts for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    /// Requests admitted
    pub requests: u64,
    /// Requests that succeeded
    pub total_successes: u64,
    /// Requests that failed
    pub total_failures: u64,
    /// Successes since the last failure
    pub consecutive_successes: u64,
    /// Failures since the last success
    pub consecutive_failures: u64,
}

impl Counts {
    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

/// Internal state of the circuit breaker.
#[derive(Debug)]
struct CircuitBreakerState {
    state: State,
    generation: u64,
    counts: Counts,
    /// End of the current window (Closed) or cooldown (Open).
    expiry: Option<Instant>,
}

/// Circuit breaker for preventing cascading failures.
///
/// Wraps operations and monitors their success/failure. When the failure ratio
/// crosses the threshold the circuit "opens" and rejects requests for a timeout period.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<CircuitBreakerState>>,
    // Metrics
    total_calls: Arc<AtomicU64>,
    total_successes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    #[must_use]
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        let expiry = Some(Instant::now() + config.interval);
        Self {
            name: Arc::from(name),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(CircuitBreakerState {
                state: State::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            })),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Name used in logs and metrics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state of the circuit breaker.
    ///
    /// Time-based transitions (window reset, Open → `HalfOpen`) are applied first.
    #[allow(clippy::unused_async)]
    pub async fn state(&self) -> State {
        let mut state = self.lock_state();
        self.refresh(&mut state, Instant::now());
        state.state
    }

    /// Counts of the current generation.
    #[allow(clippy::unused_async)]
    pub async fn counts(&self) -> Counts {
        let mut state = self.lock_state();
        self.refresh(&mut state, Instant::now());
        state.counts
    }

    /// Call an operation through the circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the circuit is open.
    /// Returns `CircuitBreakerError::Inner` if the operation fails.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.call_classified(operation, |_| true).await
    }

    /// Call an operation, counting only errors for which `is_failure` returns true.
    ///
    /// Errors that say nothing about the dependency's health (a caller cancelling,
    /// say) pass through without moving the breaker.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the circuit is open.
    /// Returns `CircuitBreakerError::Inner` if the operation fails.
    pub async fn call_classified<F, Fut, T, E, P>(
        &self,
        operation: F,
        is_failure: P,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let Some(mut admission) = self.admit() else {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("circuit_breaker_rejections_total", "breaker" => self.name.to_string())
                .increment(1);
            tracing::warn!(breaker = %self.name, "Circuit breaker is OPEN, rejecting request");
            return Err(CircuitBreakerError::Open);
        };

        // If this future is dropped mid-call, the admission releases its slot.
        match operation().await {
            Ok(result) => {
                admission.settle(Some(true));
                self.total_successes.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Err(err) => {
                if is_failure(&err) {
                    admission.settle(Some(false));
                    self.total_failures.fetch_add(1, Ordering::Relaxed);
                } else {
                    admission.settle(None);
                }
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CircuitBreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self) -> Option<Admission<'_>> {
        self.before_request().map(|generation| Admission {
            breaker: self,
            generation,
            settled: false,
        })
    }

    /// Admit a request, returning its generation, or `None` to reject it.
    fn before_request(&self) -> Option<u64> {
        let mut state = self.lock_state();
        self.refresh(&mut state, Instant::now());

        match state.state {
            State::Open => None,
            State::HalfOpen if state.counts.requests >= self.config.half_open_max_requests => None,
            State::Closed | State::HalfOpen => {
                state.counts.requests += 1;
                Some(state.generation)
            }
        }
    }

    /// Record a result. `None` releases the slot without counting either way.
    fn after_request(&self, generation: u64, success: Option<bool>) {
        let mut state = self.lock_state();
        let now = Instant::now();
        self.refresh(&mut state, now);

        if state.generation != generation {
            return;
        }

        match (state.state, success) {
            (State::HalfOpen, None) => {
                // Free the trial slot for the next caller.
                state.counts.requests = state.counts.requests.saturating_sub(1);
            }
            (_, None) | (State::Open, _) => {}
            (State::Closed, Some(true)) => state.counts.on_success(),
            (State::HalfOpen, Some(true)) => {
                state.counts.on_success();
                if state.counts.consecutive_successes >= self.config.half_open_max_requests {
                    self.transition(&mut state, State::Closed, now);
                }
            }
            (State::Closed, Some(false)) => {
                state.counts.on_failure();
                if self.ready_to_trip(&state.counts) {
                    self.transition(&mut state, State::Open, now);
                }
            }
            (State::HalfOpen, Some(false)) => {
                self.transition(&mut state, State::Open, now);
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn ready_to_trip(&self, counts: &Counts) -> bool {
        if counts.requests < self.config.min_requests || counts.requests == 0 {
            return false;
        }
        let ratio = counts.total_failures as f64 / counts.requests as f64;
        ratio >= self.config.failure_ratio
    }

    /// Apply time-based transitions.
    fn refresh(&self, state: &mut CircuitBreakerState, now: Instant) {
        match state.state {
            State::Closed => {
                if state.expiry.is_some_and(|expiry| expiry <= now) {
                    self.new_generation(state, now);
                }
            }
            State::Open => {
                if state.expiry.is_some_and(|expiry| expiry <= now) {
                    self.transition(state, State::HalfOpen, now);
                }
            }
            State::HalfOpen => {}
        }
    }

    fn transition(&self, state: &mut CircuitBreakerState, to: State, now: Instant) {
        let from = state.state;
        if from == to {
            return;
        }
        state.state = to;
        self.new_generation(state, now);

        metrics::counter!(
            "circuit_breaker_transitions_total",
            "breaker" => self.name.to_string(),
            "to" => to.as_str()
        )
        .increment(1);
        let level = match to {
            State::Closed => 0.0,
            State::HalfOpen => 1.0,
            State::Open => 2.0,
        };
        metrics::gauge!("circuit_breaker_state", "breaker" => self.name.to_string()).set(level);
        match to {
            State::Open => tracing::warn!(
                breaker = %self.name,
                from = from.as_str(),
                "Circuit breaker transitioning -> OPEN"
            ),
            State::HalfOpen | State::Closed => tracing::info!(
                breaker = %self.name,
                from = from.as_str(),
                to = to.as_str(),
                "Circuit breaker state change"
            ),
        }
    }

    fn new_generation(&self, state: &mut CircuitBreakerState, now: Instant) {
        state.generation += 1;
        state.counts = Counts::default();
        state.expiry = match state.state {
            State::Closed => Some(now + self.config.interval),
            State::Open => Some(now + self.config.timeout),
            State::HalfOpen => None,
        };
    }

    /// Get circuit breaker metrics.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Reset the circuit breaker to closed state.
    ///
    /// Useful for testing or manual intervention.
    #[allow(clippy::unused_async)]
    pub async fn reset(&self) {
        let mut state = self.lock_state();
        tracing::info!(breaker = %self.name, "Circuit breaker manually reset to CLOSED");
        state.state = State::Closed;
        self.new_generation(&mut state, Instant::now());
    }
}

/// A request admitted by the breaker.
///
/// Settling records the outcome; dropping unsettled releases the slot without counting,
/// so a caller that abandons its request cannot hold the half-open trial forever.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Admission<'_> {
    fn settle(&mut self, success: Option<bool>) {
        self.settled = true;
        self.breaker.after_request(self.generation, success);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(breaker = %self.breaker.name, "Admitted request abandoned");
            self.breaker.after_request(self.generation, None);
        }
    }
}

/// Metrics for circuit breaker monitoring.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerMetrics {
    /// Total number of calls attempted
    pub total_calls: u64,
    /// Total number of successful calls
    pub total_successes: u64,
    /// Total number of failed calls
    pub total_failures: u64,
    /// Total number of rejected calls (circuit open)
    pub total_rejections: u64,
}

impl CircuitBreakerMetrics {
    /// Calculate success rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 1.0;
        }
        self.total_successes as f64 / self.total_calls as f64
    }

    /// Calculate rejection rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_rejections as f64 / self.total_calls as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::builder()
            .min_requests(10)
            .failure_ratio(0.5)
            .timeout(Duration::from_millis(100))
            .build()
    }

    async fn fail(breaker: &CircuitBreaker, times: usize) {
        for _ in 0..times {
            let _ = breaker.call(|| async { Err::<i32, _>("error") }).await;
        }
    }

    async fn succeed(breaker: &CircuitBreaker, times: usize) {
        for _ in 0..times {
            let _ = breaker.call(|| async { Ok::<_, String>(1) }).await;
        }
    }

    #[tokio::test]
    async fn test_circuit_breaker_closed_on_success() {
        let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::default());

        let result = breaker.call(|| async { Ok::<_, String>(42) }).await;

        assert!(result.is_ok());
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn test_stays_closed_below_min_requests() {
        let breaker = CircuitBreaker::new("test", fast_config());

        fail(&breaker, 9).await;

        assert_eq!(breaker.state().await, State::Closed);
        assert_eq!(breaker.counts().await.total_failures, 9);
    }

    #[tokio::test]
    async fn test_opens_at_half_failures_over_ten_requests() {
        let breaker = CircuitBreaker::new("test", fast_config());

        succeed(&breaker, 5).await;
        fail(&breaker, 5).await;

        assert_eq!(breaker.state().await, State::Open);
    }

    #[tokio::test]
    async fn test_stays_closed_below_failure_ratio() {
        let breaker = CircuitBreaker::new("test", fast_config());

        succeed(&breaker, 6).await;
        fail(&breaker, 4).await;

        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn test_circuit_breaker_rejects_when_open_without_calling() {
        let breaker = CircuitBreaker::new("test", fast_config());
        fail(&breaker, 10).await;

        let calls = AtomicUsize::new(0);
        let result = breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(42)
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Open)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.metrics().total_rejections, 1);
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let breaker = CircuitBreaker::new("test", fast_config());
        fail(&breaker, 10).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(breaker.state().await, State::HalfOpen);

        succeed(&breaker, 1).await;
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", fast_config());
        fail(&breaker, 10).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        fail(&breaker, 1).await;

        assert_eq!(breaker.state().await, State::Open);
    }

    #[tokio::test]
    async fn test_half_open_admits_a_single_trial() {
        let breaker = Arc::new(CircuitBreaker::new("test", fast_config()));
        fail(&breaker, 10).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                breaker
                    .call(|| async move {
                        let _ = release_rx.await;
                        Ok::<_, String>(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = breaker.call(|| async { Ok::<_, String>(2) }).await;
        assert!(matches!(second, Err(CircuitBreakerError::Open)));

        let _ = release_tx.send(());
        let first = trial.await;
        assert!(matches!(first, Ok(Ok(1))));
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn test_dropped_half_open_trial_releases_its_slot() {
        let breaker = CircuitBreaker::new("test", fast_config());
        fail(&breaker, 10).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            breaker.call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, String>(1)
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(breaker.state().await, State::HalfOpen);
        assert_eq!(breaker.counts().await.requests, 0);

        succeed(&breaker, 1).await;
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn test_unclassified_errors_do_not_trip() {
        let breaker = CircuitBreaker::new("test", fast_config());

        for _ in 0..20 {
            let _ = breaker
                .call_classified(|| async { Err::<i32, _>("cancelled") }, |_| false)
                .await;
        }

        assert_eq!(breaker.state().await, State::Closed);
        assert_eq!(breaker.counts().await.total_failures, 0);
    }

    #[tokio::test]
    async fn test_window_resets_counts() {
        let config = CircuitBreakerConfig::builder()
            .interval(Duration::from_millis(50))
            .build();
        let breaker = CircuitBreaker::new("test", config);

        fail(&breaker, 9).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        fail(&breaker, 1).await;

        assert_eq!(breaker.state().await, State::Closed);
        assert_eq!(breaker.counts().await.requests, 1);
    }

    #[tokio::test]
    async fn test_circuit_breaker_reset() {
        let breaker = CircuitBreaker::new("test", fast_config());
        fail(&breaker, 10).await;
        assert_eq!(breaker.state().await, State::Open);

        breaker.reset().await;

        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn test_circuit_breaker_concurrent_calls() {
        let breaker = Arc::new(CircuitBreaker::new("test", CircuitBreakerConfig::default()));

        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..100 {
            let breaker_clone = Arc::clone(&breaker);
            let counter_clone = Arc::clone(&counter);

            let handle = tokio::spawn(async move {
                let _ = breaker_clone
                    .call(|| async {
                        counter_clone.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(())
                    })
                    .await;
            });

            handles.push(handle);
        }

        for handle in handles {
            handle.await.ok();
        }

        let metrics = breaker.metrics();
        assert_eq!(metrics.total_calls, 100);
        assert_eq!(metrics.total_successes, 100);
        assert!((metrics.success_rate() - 1.0).abs() < f64::EPSILON);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }
}
