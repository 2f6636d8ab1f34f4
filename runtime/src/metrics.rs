//! Prometheus metrics for observability and monitoring.
//!
//! Every component records through the `metrics` facade; this module installs the
//! Prometheus recorder and describes the series:
//! - Store calls (latency, errors, hit ratio, coalescing, retries)
//! - Circuit breaker state and rejections
//! - Distributed lock acquisition and renewal
//! - Broker channel state, deliveries and publisher confirms
//!
//! # Example
//!
//! ```rust,no_run
//! use mall_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Scrape endpoint on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and start serving `/metrics`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or the address cannot be bound.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests) this logs a warning and
    /// returns `Ok` without serving.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("seconds".to_string()),
                &[
                    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                self.handle = Some(handle);
                let addr = self.addr;
                tokio::spawn(async move {
                    // The exporter error type is private and implements neither Debug nor Display.
                    if exporter.await.is_err() {
                        tracing::error!(addr = %addr, "Metrics exporter stopped");
                    }
                });
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(_) => {
                tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                Ok(())
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // Store
    describe_histogram!(
        "store_request_duration_seconds",
        "Latency of individual store calls, per operation"
    );
    describe_counter!("store_errors_total", "Failed store calls, per operation and kind");
    describe_counter!("store_cache_results_total", "Store reads by result (hit/miss)");
    describe_counter!(
        "store_coalesced_requests_total",
        "Reads that joined an identical in-flight read"
    );
    describe_counter!(
        "store_retries_exhausted_total",
        "Store operations that failed after every retry"
    );

    // Circuit breaker
    describe_gauge!(
        "circuit_breaker_state",
        "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "circuit_breaker_transitions_total",
        "Circuit breaker state transitions"
    );
    describe_counter!(
        "circuit_breaker_rejections_total",
        "Total number of rejected calls (circuit open)"
    );

    // Distributed lock
    describe_counter!("lock_acquisitions_total", "Lock acquisition attempts by result");
    describe_histogram!("lock_wait_seconds", "Time spent waiting to acquire a lock");
    describe_counter!("lock_renewals_total", "Lease renewals by result");
    describe_counter!(
        "lock_release_not_held_total",
        "Releases that found the lock expired or taken over"
    );

    // Broker channel
    describe_counter!(
        "channel_state_transitions_total",
        "Broker connection state changes"
    );
    describe_counter!("channel_reconnects_total", "Successful broker reconnects");
    describe_counter!("channel_published_total", "Messages handed to the broker");
    describe_counter!(
        "channel_publish_confirms_total",
        "Publisher confirms by result (ack/nack)"
    );
    describe_counter!(
        "channel_deliveries_total",
        "Deliveries settled by consumers, by outcome (ack/nack)"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn test_metrics_server_render() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        metrics::counter!("lock_acquisitions_total", "result" => "acquired").increment(1);
        metrics::histogram!("store_request_duration_seconds", "op" => "get").record(0.002);

        // Another test may have installed the recorder first; then there is no handle.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("lock_acquisitions_total"));
            assert!(rendered.contains("store_request_duration_seconds"));

            // The spawned exporter task answers scrapes.
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            assert!(response.starts_with("HTTP/1.1 200"));
            assert!(response.contains("lock_acquisitions_total"));
        }
    }
}
