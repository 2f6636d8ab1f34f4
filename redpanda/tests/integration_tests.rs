//! Integration tests for [`RedpandaTransport`] with a real Kafka-compatible broker.
//!
//! These tests use testcontainers to spin up Kafka and validate:
//! - Publish/consume round-trip with manual acknowledgement
//! - Dead-lettering on nack
//! - Redelivery of unsettled records to a new session
//! - `ReliableChannel` running on top of the transport
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//!
//! To run explicitly:
//! ```bash
//! cargo test -p mall-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use futures::StreamExt;
use mall_core::broker::{BrokerSession, BrokerTransport, Confirmation, DeliveryStream};
use mall_redpanda::{RedpandaTransport, dead_letter_topic};
use mall_runtime::{ChannelConfig, ReliableChannel, handler_fn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

const QUEUE: &str = "orders.created";

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    (kafka, format!("{host}:{port}"))
}

fn transport(brokers: &str, group: &str) -> RedpandaTransport {
    RedpandaTransport::builder()
        .brokers(brokers)
        .consumer_group(group)
        .build()
        .expect("Failed to build transport")
}

/// Publishing to a topic that does not exist yet triggers auto-creation; retry until the
/// broker confirms.
async fn ensure_topic_exists(session: &Arc<dyn BrokerSession>, topic: &str) {
    for attempt in 1..=60 {
        if let Ok(confirm) = session.publish("", topic, b"warmup").await {
            if confirm.await == Confirmation::Ack {
                tokio::time::sleep(Duration::from_secs(2)).await;
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(attempt != 60, "Failed to create topic {topic}");
    }
}

/// Next delivery whose payload is not a warmup record.
async fn next_order(stream: &mut DeliveryStream) -> mall_core::broker::Delivery {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let delivery = stream.next().await.expect("Delivery stream ended");
            if delivery.payload == b"warmup" {
                delivery.ack().await.expect("Failed to ack warmup");
                continue;
            }
            return delivery;
        }
    })
    .await
    .expect("Timeout waiting for delivery")
}

#[tokio::test]
#[ignore]
async fn test_publish_and_consume_round_trip() {
    let (_kafka, brokers) = start_kafka().await;
    let session = transport(&brokers, "round-trip")
        .connect()
        .await
        .expect("Failed to connect");
    ensure_topic_exists(&session, QUEUE).await;

    let mut stream = session.consume(QUEUE, 1).await.expect("Failed to consume");
    let confirm = session
        .publish("orders", QUEUE, br#"{"order_id":1,"sku_id":101,"quantity":3}"#)
        .await
        .expect("Failed to publish");
    assert_eq!(confirm.await, Confirmation::Ack);

    let delivery = next_order(&mut stream).await;
    assert_eq!(
        delivery.payload,
        br#"{"order_id":1,"sku_id":101,"quantity":3}"#.to_vec()
    );
    delivery.ack().await.expect("Failed to ack");

    session.close().await.expect("Failed to close");
    assert_eq!(session.closed().await, None);
}

#[tokio::test]
#[ignore]
async fn test_nack_forwards_to_dead_letter_topic() {
    let (_kafka, brokers) = start_kafka().await;
    let session = transport(&brokers, "dead-letter")
        .connect()
        .await
        .expect("Failed to connect");
    let dead_letters = dead_letter_topic(QUEUE);
    ensure_topic_exists(&session, QUEUE).await;
    ensure_topic_exists(&session, &dead_letters).await;

    let mut orders = session.consume(QUEUE, 1).await.expect("Failed to consume");
    let mut rejected = session
        .consume(&dead_letters, 1)
        .await
        .expect("Failed to consume dead letters");

    session
        .publish("orders", QUEUE, b"not json")
        .await
        .expect("Failed to publish");
    next_order(&mut orders)
        .await
        .nack(false)
        .await
        .expect("Failed to nack");

    let forwarded = next_order(&mut rejected).await;
    assert_eq!(forwarded.payload, b"not json".to_vec());
    forwarded.ack().await.expect("Failed to ack");
    session.close().await.expect("Failed to close");
}

#[tokio::test]
#[ignore]
async fn test_unsettled_record_is_redelivered_to_a_new_session() {
    let (_kafka, brokers) = start_kafka().await;
    let transport = transport(&brokers, "redelivery");

    let first = transport.connect().await.expect("Failed to connect");
    ensure_topic_exists(&first, QUEUE).await;
    let mut stream = first.consume(QUEUE, 1).await.expect("Failed to consume");
    first
        .publish("orders", QUEUE, b"order-7")
        .await
        .expect("Failed to publish");

    let unsettled = next_order(&mut stream).await;
    assert_eq!(unsettled.payload, b"order-7".to_vec());
    drop(unsettled);
    drop(stream);
    first.close().await.expect("Failed to close");

    let second = transport.connect().await.expect("Failed to reconnect");
    let mut stream = second.consume(QUEUE, 1).await.expect("Failed to consume");
    let again = next_order(&mut stream).await;
    assert_eq!(again.payload, b"order-7".to_vec());
    again.ack().await.expect("Failed to ack");
    second.close().await.expect("Failed to close");
}

#[tokio::test]
#[ignore]
async fn test_reliable_channel_over_redpanda() {
    let (_kafka, brokers) = start_kafka().await;
    let transport = transport(&brokers, "reliable-channel");
    let warmup = transport.connect().await.expect("Failed to connect");
    ensure_topic_exists(&warmup, QUEUE).await;
    warmup.close().await.expect("Failed to close");

    let channel = ReliableChannel::connect(Arc::new(transport), ChannelConfig::default())
        .await
        .expect("Failed to connect channel");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    channel
        .consume(
            QUEUE,
            handler_fn(move |payload: Vec<u8>| {
                let sink = Arc::clone(&sink);
                async move {
                    if payload != b"warmup" {
                        sink.lock().unwrap().push(payload);
                    }
                    Ok::<(), anyhow::Error>(())
                }
            }),
        )
        .await
        .expect("Failed to consume");

    tokio::time::sleep(Duration::from_secs(3)).await;
    channel
        .publish("orders", QUEUE, b"order-9")
        .await
        .expect("Failed to publish");

    let received = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if !seen.lock().unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    assert!(received.is_ok(), "Timeout waiting for the handler");
    assert_eq!(*seen.lock().unwrap(), vec![b"order-9".to_vec()]);

    channel.close().await.expect("Failed to close channel");
}
