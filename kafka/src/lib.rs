//! Kafka-style event provider for the BKS transaction pipeline.
//!
//! [`KafkaEventBus`] implements [`EventBus`] on top of a [`BrokerClient`]. The
//! default client is [`RdKafkaBroker`]; any Kafka-compatible broker (Apache Kafka,
//! Redpanda, MSK, Event Hubs) works.
//!
//! # Architecture
//!
//! ```text
//!            publish                          subscribe(event_type)
//!               │                                      │
//!               ▼                                      ▼
//!   ┌────────────────────┐               ┌──────────────────────────┐
//!   │ long-lived producer│               │ consumer loop (tokio task)│
//!   │ acks=all, idempotent│              │ group {app}-{event_type}  │
//!   └─────────┬──────────┘               └────────────┬─────────────┘
//!             ▼                                       ▼
//!     {prefix}-{event-type}  ───────────────▶  recv → decode → handler → commit
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once**, with manual offset commits:
//! - The offset is committed only after the handler returns `Ok`.
//! - A handler error is logged and the offset is left uncommitted; the message is
//!   delivered again after a restart or rebalance. From then on the loop commits
//!   nothing more on that partition, because committing a later offset would
//!   acknowledge the failed message too.
//! - A [`HandlerError::Rejected`] event, or a message that does not decode, is
//!   logged and committed so it cannot wedge the group.
//! - Handlers must be idempotent; `event_id` is stable across redeliveries.
//!
//! # Wire format
//!
//! Key: the event id. Value: the JSON envelope
//! (`eventId`, `eventType`, `occurredOn`, `correlationId`, `metadata`, `data`).
//! Headers: `EventType`, `OccurredOn` and, when present, `CorrelationId`.
//!
//! # Example
//!
//! ```no_run
//! use bks_pipeline_kafka::KafkaEventBus;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = KafkaEventBus::builder()
//!     .brokers("localhost:9092")
//!     .application_name("ledger")
//!     .topic_prefix("bks")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod rdkafka_broker;

pub use broker::{BrokerClient, BrokerConsumer, ConsumerSettings, DeliveryReport, IncomingRecord, OutgoingRecord};
pub use rdkafka_broker::{RdKafkaBroker, RdKafkaConfig};

use bks_pipeline_core::event::EventEnvelope;
use bks_pipeline_core::event_bus::{
    BoxFuture, EventBus, EventBusError, EventHandler, EventPublisher, EventSubscriber, HandlerError,
    Subscription, TopicNamer,
};
use bks_pipeline_core::metrics::PipelineMetrics;
use broker::{HEADER_CORRELATION_ID, HEADER_EVENT_TYPE, HEADER_OCCURRED_ON};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PROVIDER: &str = "kafka";

/// Pause after a receive error before polling again.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Consumer group for a subscription: `{application_name}-{event_type}`.
#[must_use]
pub fn consumer_group(application_name: &str, event_type: &str) -> String {
    format!("{application_name}-{event_type}")
}

/// Build the broker record for `event` on `topic`.
///
/// # Errors
///
/// Returns [`EventBusError::SerializationFailed`] if the envelope cannot be encoded.
pub fn encode_record(event: &EventEnvelope, topic: String) -> Result<OutgoingRecord, EventBusError> {
    let payload = event.to_json_bytes()?;
    let mut headers = vec![
        (HEADER_EVENT_TYPE.to_string(), event.event_type.clone()),
        (HEADER_OCCURRED_ON.to_string(), event.occurred_on.to_rfc3339()),
    ];
    if let Some(correlation_id) = &event.correlation_id {
        headers.push((HEADER_CORRELATION_ID.to_string(), correlation_id.clone()));
    }

    Ok(OutgoingRecord {
        topic,
        key: event.event_id.to_string(),
        payload,
        headers,
    })
}

/// Decode the envelope carried by `record`.
///
/// # Errors
///
/// Returns [`EventBusError::DeserializationFailed`] for an empty or malformed body.
pub fn decode_record(record: &IncomingRecord) -> Result<EventEnvelope, EventBusError> {
    let payload = record
        .payload
        .as_deref()
        .ok_or_else(|| EventBusError::DeserializationFailed("Message has no payload".to_string()))?;
    Ok(EventEnvelope::from_json_bytes(payload)?)
}

struct ConsumerLoop {
    subscription: Subscription,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Kafka-style event bus.
///
/// One producer is shared by all publishes. Each `subscribe` starts one consumer
/// loop in its own tokio task; `unsubscribe` and `shutdown` cancel and join them.
/// Loops are keyed by the topic they consume, so `unsubscribe(event_type)` stops
/// the loops on that type's derived topic and leaves override topics running.
pub struct KafkaEventBus {
    client: Arc<dyn BrokerClient>,
    application_name: String,
    topics: TopicNamer,
    auto_offset_reset: String,
    metrics: Arc<PipelineMetrics>,
    loops: Mutex<HashMap<String, Vec<ConsumerLoop>>>,
    shutdown: CancellationToken,
}

impl KafkaEventBus {
    /// Create a new builder for configuring the event bus.
    #[must_use]
    pub fn builder() -> KafkaEventBusBuilder {
        KafkaEventBusBuilder::default()
    }

    /// Application name used for consumer groups.
    #[must_use]
    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    /// Topic naming used by this bus.
    #[must_use]
    pub const fn topics(&self) -> &TopicNamer {
        &self.topics
    }

    /// Subscriptions whose consumer loops are running.
    pub async fn active_subscriptions(&self) -> Vec<Subscription> {
        self.loops
            .lock()
            .await
            .values()
            .flatten()
            .map(|running| running.subscription.clone())
            .collect()
    }

    async fn stop_loops(loops: Vec<ConsumerLoop>) -> Result<(), EventBusError> {
        for running in &loops {
            running.cancel.cancel();
        }

        let mut failures = Vec::new();
        for running in loops {
            if let Err(e) = running.task.await {
                tracing::warn!(
                    topic = %running.subscription.topic,
                    error = %e,
                    "Consumer loop did not stop cleanly"
                );
                failures.push(EventBusError::Other(format!(
                    "consumer loop for '{}' failed: {e}",
                    running.subscription.topic
                )));
            }
        }

        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Err(EventBusError::Batch(failures)),
        }
    }
}

impl Drop for KafkaEventBus {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl EventPublisher for KafkaEventBus {
    fn publish<'a>(
        &'a self,
        event: &'a EventEnvelope,
        topic_override: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            let topic = self.topics.resolve(&event.event_type, topic_override)?;
            let record = encode_record(event, topic.clone())?;
            let started = Instant::now();

            match self.client.send(record).await {
                Ok(report) => {
                    self.metrics.record_publish(PROVIDER, started.elapsed());
                    tracing::debug!(
                        topic = %topic,
                        partition = report.partition,
                        offset = report.offset,
                        event_type = %event.event_type,
                        event_id = %event.event_id,
                        "Event published successfully"
                    );
                    Ok(())
                },
                Err(e) => {
                    self.metrics.record_publish_error(PROVIDER);
                    tracing::error!(topic = %topic, error = %e, "Failed to publish event");
                    Err(e)
                },
            }
        })
    }
}

impl EventSubscriber for KafkaEventBus {
    fn subscribe<'a>(
        &'a self,
        event_type: &'a str,
        handler: Arc<dyn EventHandler>,
        topic_override: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Subscription, EventBusError>> {
        Box::pin(async move {
            let topic = self.topics.resolve(event_type, topic_override)?;
            let group_id = consumer_group(&self.application_name, event_type);
            let consumer = self.client.consumer(&ConsumerSettings {
                group_id: group_id.clone(),
                topic: topic.clone(),
                auto_offset_reset: self.auto_offset_reset.clone(),
            })?;

            let subscription = Subscription::new(event_type, topic, Some(group_id));
            let cancel = self.shutdown.child_token();
            let task = tokio::spawn(run_consumer_loop(
                consumer,
                handler,
                subscription.clone(),
                cancel.clone(),
                Arc::clone(&self.metrics),
            ));

            tracing::info!(
                topic = %subscription.topic,
                consumer_group = ?subscription.group_id,
                subscription_id = %subscription.id,
                manual_commit = true,
                "Subscribed to topic"
            );

            self.loops
                .lock()
                .await
                .entry(subscription.topic.clone())
                .or_default()
                .push(ConsumerLoop {
                    subscription: subscription.clone(),
                    cancel,
                    task,
                });
            Ok(subscription)
        })
    }

    fn unsubscribe<'a>(&'a self, event_type: &'a str) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            let topic = self.topics.topic_for(event_type)?;
            let loops = self.loops.lock().await.remove(&topic).unwrap_or_default();
            let count = loops.len();
            Self::stop_loops(loops).await?;
            tracing::info!(topic = %topic, event_type, stopped = count, "Unsubscribed");
            Ok(())
        })
    }
}

impl EventBus for KafkaEventBus {
    fn provider_name(&self) -> &'static str {
        PROVIDER
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<(), EventBusError>> {
        Box::pin(async move {
            let loops: Vec<ConsumerLoop> = self.loops.lock().await.drain().flat_map(|(_, v)| v).collect();
            let count = loops.len();
            self.shutdown.cancel();
            Self::stop_loops(loops).await?;
            tracing::info!(stopped = count, "Kafka event bus shut down");
            Ok(())
        })
    }
}

/// What to do with a record's offset once it has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Processed (or permanently unprocessable): commit it
    Ack,
    /// Handler failed: leave it for redelivery
    Retry,
    /// Cancelled mid-handler: stop without committing
    Abandon,
}

async fn run_consumer_loop(
    mut consumer: Box<dyn BrokerConsumer>,
    handler: Arc<dyn EventHandler>,
    subscription: Subscription,
    cancel: CancellationToken,
    metrics: Arc<PipelineMetrics>,
) {
    let topic = subscription.topic.as_str();
    // Partitions with an unacknowledged failure; nothing later on them is committed.
    let mut held: HashSet<(String, i32)> = HashSet::new();

    tracing::debug!(topic, subscription_id = %subscription.id, "Consumer loop started");

    loop {
        let received = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            received = consumer.recv() => received,
        };

        let record = match received {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(topic, error = %e, "Receive failed; retrying");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(RECV_ERROR_BACKOFF) => continue,
                }
            },
        };

        let disposition = match decode_record(&record) {
            Err(e) => {
                tracing::warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Skipping message that cannot be decoded"
                );
                metrics.record_consume_error(PROVIDER);
                Disposition::Ack
            },
            Ok(event) => {
                let event_id = event.event_id;
                let event_type = event.event_type.clone();
                let handled = AssertUnwindSafe(async { handler.handle(event).await }).catch_unwind();
                let outcome = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    outcome = handled => Some(outcome.unwrap_or_else(|_| Err(HandlerError::failed("handler panicked")))),
                };

                match outcome {
                    None => Disposition::Abandon,
                    Some(Ok(())) => {
                        metrics.record_consume(PROVIDER);
                        tracing::debug!(
                            topic = %record.topic,
                            partition = record.partition,
                            offset = record.offset,
                            event_type = %event_type,
                            event_id = %event_id,
                            "Event handled"
                        );
                        Disposition::Ack
                    },
                    Some(Err(HandlerError::Rejected(reason))) => {
                        metrics.record_consume_error(PROVIDER);
                        tracing::warn!(
                            topic = %record.topic,
                            partition = record.partition,
                            offset = record.offset,
                            event_id = %event_id,
                            reason = %reason,
                            "Handler rejected event; committing"
                        );
                        Disposition::Ack
                    },
                    Some(Err(e)) => {
                        metrics.record_consume_error(PROVIDER);
                        tracing::error!(
                            topic = %record.topic,
                            partition = record.partition,
                            offset = record.offset,
                            event_id = %event_id,
                            error = %e,
                            "Handler failed; offset left uncommitted for redelivery"
                        );
                        Disposition::Retry
                    },
                }
            },
        };

        let partition = (record.topic.clone(), record.partition);
        match disposition {
            Disposition::Abandon => break,
            Disposition::Retry => {
                held.insert(partition);
            },
            Disposition::Ack if held.contains(&partition) => {
                tracing::debug!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    "Commit withheld behind an earlier failure on this partition"
                );
            },
            Disposition::Ack => {
                if let Err(e) = consumer.commit(&record.topic, record.partition, record.offset + 1) {
                    tracing::warn!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        "Failed to commit offset (message may be redelivered)"
                    );
                }
            },
        }
    }

    tracing::debug!(topic, subscription_id = %subscription.id, "Consumer loop stopped");
}

/// Builder for configuring a [`KafkaEventBus`].
///
/// # Example
///
/// ```no_run
/// use bks_pipeline_kafka::KafkaEventBus;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = KafkaEventBus::builder()
///     .brokers("kafka-1:9092,kafka-2:9092")
///     .application_name("ledger")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .setting("Producer.linger.ms", "5")
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct KafkaEventBusBuilder {
    brokers: Option<String>,
    client: Option<Arc<dyn BrokerClient>>,
    application_name: Option<String>,
    topic_prefix: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    auto_offset_reset: Option<String>,
    settings: Vec<(String, String)>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl KafkaEventBusBuilder {
    /// Set the broker addresses (comma-separated `host:port` list).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Use a custom broker client instead of creating an [`RdKafkaBroker`].
    #[must_use]
    pub fn client(mut self, client: Arc<dyn BrokerClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Application name used for consumer groups. Default: `"bks-pipeline"`.
    #[must_use]
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Topic prefix. Default: `"bks"`.
    #[must_use]
    pub fn topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = Some(prefix.into());
        self
    }

    /// Producer compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Where new consumer groups start reading: `"earliest"` or `"latest"`.
    ///
    /// Default: "earliest", so a group created after a publish still sees it.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Pass a client property through. Keys prefixed `Producer.` go to the
    /// producer and `Consumer.` to every consumer, with the prefix stripped.
    /// Other keys are ignored.
    #[must_use]
    pub fn setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.push((key.into(), value.into()));
        self
    }

    /// Pass several client properties through. See [`setting`](Self::setting).
    #[must_use]
    pub fn settings<I, K, V>(mut self, settings: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.settings
            .extend(settings.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Record into a shared metrics collector.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the [`KafkaEventBus`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if neither brokers nor a client
    /// were given, or the producer cannot be created.
    pub fn build(self) -> Result<KafkaEventBus, EventBusError> {
        let client: Arc<dyn BrokerClient> = match self.client {
            Some(client) => client,
            None => {
                let brokers = self.brokers.ok_or_else(|| {
                    EventBusError::ConnectionFailed("Brokers not configured".to_string())
                })?;
                let mut config = RdKafkaConfig::new(brokers);
                if let Some(compression) = self.compression {
                    config.compression = compression;
                }
                if let Some(timeout) = self.timeout {
                    config.send_timeout = timeout;
                }
                config.producer_settings = strip_prefix(&self.settings, "Producer.");
                config.consumer_settings = strip_prefix(&self.settings, "Consumer.");
                Arc::new(RdKafkaBroker::new(config)?)
            },
        };

        let application_name = self
            .application_name
            .unwrap_or_else(|| "bks-pipeline".to_string());
        let topics = TopicNamer::new(self.topic_prefix.unwrap_or_else(|| "bks".to_string()));
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            application = %application_name,
            prefix = topics.prefix(),
            auto_offset_reset = %auto_offset_reset,
            "KafkaEventBus created successfully"
        );

        Ok(KafkaEventBus {
            client,
            application_name,
            topics,
            auto_offset_reset,
            metrics: self.metrics.unwrap_or_default(),
            loops: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }
}

fn strip_prefix(settings: &[(String, String)], prefix: &str) -> Vec<(String, String)> {
    settings
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(prefix)
                .filter(|rest| !rest.is_empty())
                .map(|rest| (rest.to_string(), value.clone()))
        })
        .collect()
}
