//! Integration tests for [`KafkaEventBus`] against a real Kafka broker.
//!
//! Marked `#[ignore]`: they need Docker (testcontainers) and take 15-60 seconds
//! to bring Kafka up.
//!
//! ```bash
//! cargo test -p bks-pipeline-kafka --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use bks_pipeline_core::event::{DomainEvent, TransactionCompleted};
use bks_pipeline_core::event_bus::{EventPublisherExt, EventSubscriber, EventSubscriberExt, HandlerError, handler_fn};
use bks_pipeline_core::event_bus::EventBus;
use bks_pipeline_kafka::KafkaEventBus;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};
use tokio::sync::mpsc;

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
    let brokers = format!("{host}:{port}");
    wait_for_kafka_ready(&brokers).await;
    (kafka, brokers)
}

/// Publish until the broker accepts writes (this also creates the topic).
async fn wait_for_kafka_ready(brokers: &str) {
    let max_attempts = 60;
    for attempt in 1..=max_attempts {
        if let Ok(bus) = KafkaEventBus::builder().brokers(brokers).topic_prefix("warmup").build() {
            if bus.publish_event(&completed("warmup")).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(500)).await;
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            attempt != max_attempts,
            "Kafka failed to become ready after {max_attempts} attempts"
        );
    }
}

fn completed(pipeline: &str) -> DomainEvent<TransactionCompleted> {
    DomainEvent::new(TransactionCompleted {
        pipeline: pipeline.to_string(),
        duration_ms: 12,
        stage_durations_ms: BTreeMap::new(),
    })
}

#[tokio::test]
#[ignore]
async fn test_publish_and_subscribe_round_trip() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = KafkaEventBus::builder()
        .brokers(&brokers)
        .application_name("ledger")
        .topic_prefix("bks")
        .build()
        .expect("Failed to create event bus");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = bus
        .subscribe_typed(move |event: DomainEvent<TransactionCompleted>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
                Ok(())
            }
        })
        .await
        .expect("Failed to subscribe");
    assert_eq!(subscription.topic, "bks-pipeline-transaction-completed");
    assert_eq!(
        subscription.group_id.as_deref(),
        Some("ledger-pipeline.transaction.completed")
    );

    let event = completed("credit").with_correlation_id("corr-42");
    bus.publish_event(&event).await.expect("Failed to publish");

    let received = tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("Timeout waiting for event")
        .expect("Channel closed");
    assert_eq!(received.event_id, event.event_id);
    assert_eq!(received.correlation_id.as_deref(), Some("corr-42"));
    assert_eq!(received.data.pipeline, "credit");

    bus.shutdown().await.expect("Shutdown failed");
}

#[tokio::test]
#[ignore]
async fn test_failed_handler_sees_event_again_after_resubscribe() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = KafkaEventBus::builder()
        .brokers(&brokers)
        .application_name("retry")
        .build()
        .expect("Failed to create event bus");

    let attempts = Arc::new(AtomicUsize::new(0));
    let first = Arc::clone(&attempts);
    bus.subscribe(
        "pipeline.transaction.completed",
        Arc::new(handler_fn(move |_event| {
            first.fetch_add(1, Ordering::SeqCst);
            async { Err(HandlerError::failed("ledger unavailable")) }
        })),
        None,
    )
    .await
    .expect("Failed to subscribe");

    bus.publish_event(&completed("credit")).await.expect("Failed to publish");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while attempts.load(Ordering::SeqCst) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "handler never ran");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    bus.unsubscribe("pipeline.transaction.completed")
        .await
        .expect("Failed to unsubscribe");

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(
        "pipeline.transaction.completed",
        Arc::new(handler_fn(move |event| {
            let _ = tx.send(event.event_id);
            async { Ok(()) }
        })),
        None,
    )
    .await
    .expect("Failed to resubscribe");

    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("Uncommitted event was not redelivered")
        .expect("Channel closed");

    bus.shutdown().await.expect("Shutdown failed");
}
