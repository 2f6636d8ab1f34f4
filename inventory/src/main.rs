//! Inventory worker.
//!
//! Consumes `OrderCreated` events and deducts stock in Redis.
//!
//! Run with: `cargo run --bin mall-inventory-worker`
//! Metrics: http://localhost:9090/metrics

use anyhow::Context;
use mall_inventory::{InventoryService, OrderWorker, StockConsumer, WorkerConfig};
use mall_redis::RedisStore;
use mall_redpanda::RedpandaTransport;
use mall_runtime::metrics::MetricsServer;
use mall_runtime::{ChannelConfig, InstrumentedStore, ReliableChannel, ResilientStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    init_tracing(&config);

    info!(environment = %config.environment, "Starting inventory worker");

    let mut metrics_server = MetricsServer::new(config.observability.metrics_addr()?);
    metrics_server.start()?;
    mall_inventory::describe_metrics();

    let shutdown = CancellationToken::new();

    info!(prefix = %config.redis.key_prefix, "Connecting to Redis");
    let redis = RedisStore::new(&config.redis.url, &config.redis.key_prefix)
        .await?
        .with_operation_timeout(config.redis.operation_timeout());
    redis.ping().await.context("Redis did not answer PING")?;

    // Locks talk to Redis directly; stock and markers go through the resilient stack.
    let lock_store: Arc<dyn mall_core::KeyValueStore> = Arc::new(redis.clone());
    let store: Arc<dyn mall_core::KeyValueStore> = Arc::new(
        ResilientStore::builder(InstrumentedStore::new(redis))
            .name("redis")
            .shutdown_token(shutdown.clone())
            .build(),
    );

    let inventory = InventoryService::new(Arc::clone(&store), lock_store, config.lock.clone());
    let consumer = Arc::new(
        StockConsumer::new(store, inventory).with_marker_ttl(config.consumer.processed_ttl()),
    );

    info!(brokers = %config.broker.brokers, "Connecting to Redpanda");
    let transport = RedpandaTransport::builder()
        .brokers(&config.broker.brokers)
        .producer_acks(&config.broker.producer_acks)
        .consumer_group(&config.broker.consumer_group)
        .build()?;
    let channel = ReliableChannel::connect(
        Arc::new(transport),
        ChannelConfig {
            prefetch: config.consumer.prefetch,
            reconnect: config.broker.reconnect_policy(),
            drain_timeout: config.consumer.drain_timeout(),
        },
    )
    .await?;

    let worker = OrderWorker::new(channel, consumer).with_queue(&config.broker.queue);
    worker.start().await?;

    info!(queue = %config.broker.queue, "Inventory worker ready");

    shutdown_signal().await;
    info!("Shutdown signal received");

    if let Err(e) = worker.shutdown(&shutdown).await {
        warn!(error = %e, "Broker channel did not close cleanly");
    }

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(config: &WorkerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "mall_inventory={level},mall_runtime={level},mall_redis={level},mall_redpanda={level}",
            level = config.observability.log_level
        )
        .into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.observability.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Unable to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
