//! `rdkafka`-backed [`BrokerClient`].
//!
//! Producer: `acks=all` and `enable.idempotence=true`, so a publish resolves only
//! after every in-sync replica has the write. Consumers: `enable.auto.commit=false`;
//! offsets are committed explicitly by the consumer loop.

use crate::broker::{BrokerClient, BrokerConsumer, ConsumerSettings, DeliveryReport, IncomingRecord, OutgoingRecord};
use bks_pipeline_core::event_bus::{BoxFuture, EventBusError};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;

/// Connection and client settings for [`RdKafkaBroker`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RdKafkaConfig {
    /// Comma-separated `host:port` bootstrap list
    pub brokers: String,
    /// Producer compression codec
    pub compression: String,
    /// How long a publish may wait for the broker
    pub send_timeout: Duration,
    /// Extra producer properties, applied last
    pub producer_settings: Vec<(String, String)>,
    /// Extra consumer properties, applied last
    pub consumer_settings: Vec<(String, String)>,
}

impl RdKafkaConfig {
    /// Defaults for `brokers`: no compression, 5 s send timeout, no extra settings.
    #[must_use]
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            compression: "none".to_string(),
            send_timeout: Duration::from_secs(5),
            producer_settings: Vec::new(),
            consumer_settings: Vec::new(),
        }
    }

    fn producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("message.timeout.ms", self.send_timeout.as_millis().to_string())
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("compression.type", &self.compression);
        for (key, value) in &self.producer_settings {
            config.set(key, value);
        }
        config
    }

    fn consumer_config(&self, settings: &ConsumerSettings) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &settings.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &settings.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false");
        for (key, value) in &self.consumer_settings {
            config.set(key, value);
        }
        config
    }
}

/// Production broker client over `rdkafka`.
pub struct RdKafkaBroker {
    producer: FutureProducer,
    config: RdKafkaConfig,
}

impl RdKafkaBroker {
    /// Create the long-lived producer.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(config: RdKafkaConfig) -> Result<Self, EventBusError> {
        let producer: FutureProducer = config
            .producer_config()
            .create()
            .map_err(|e| EventBusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        tracing::info!(
            brokers = %config.brokers,
            compression = %config.compression,
            producer_overrides = config.producer_settings.len(),
            consumer_overrides = config.consumer_settings.len(),
            "Kafka producer created"
        );

        Ok(Self { producer, config })
    }

    /// Settings this client was created with.
    #[must_use]
    pub const fn config(&self) -> &RdKafkaConfig {
        &self.config
    }
}

impl BrokerClient for RdKafkaBroker {
    fn send(&self, record: OutgoingRecord) -> BoxFuture<'_, Result<DeliveryReport, EventBusError>> {
        Box::pin(async move {
            let mut headers = OwnedHeaders::new();
            for (key, value) in &record.headers {
                headers = headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_str()),
                });
            }

            let message = FutureRecord::to(&record.topic)
                .key(&record.key)
                .payload(&record.payload)
                .headers(headers);

            match self
                .producer
                .send(message, Timeout::After(self.config.send_timeout))
                .await
            {
                Ok((partition, offset)) => Ok(DeliveryReport { partition, offset }),
                Err((kafka_error, _)) => Err(EventBusError::PublishFailed {
                    topic: record.topic.clone(),
                    reason: kafka_error.to_string(),
                }),
            }
        })
    }

    fn consumer(&self, settings: &ConsumerSettings) -> Result<Box<dyn BrokerConsumer>, EventBusError> {
        let consumer: StreamConsumer =
            self.config
                .consumer_config(settings)
                .create()
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topic: settings.topic.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

        consumer
            .subscribe(&[settings.topic.as_str()])
            .map_err(|e| EventBusError::SubscriptionFailed {
                topic: settings.topic.clone(),
                reason: format!("Failed to subscribe: {e}"),
            })?;

        Ok(Box::new(RdKafkaConsumer { consumer }))
    }
}

struct RdKafkaConsumer {
    consumer: StreamConsumer,
}

impl BrokerConsumer for RdKafkaConsumer {
    fn recv(&mut self) -> BoxFuture<'_, Result<IncomingRecord, EventBusError>> {
        Box::pin(async move {
            self.consumer
                .recv()
                .await
                .map(|message| to_incoming(&message))
                .map_err(|e| EventBusError::TransportError(format!("Failed to receive message: {e}")))
        })
    }

    fn commit(&mut self, topic: &str, partition: i32, next_offset: i64) -> Result<(), EventBusError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(topic, partition, Offset::Offset(next_offset))
            .map_err(|e| EventBusError::ConsumerGroupError(e.to_string()))?;
        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| EventBusError::ConsumerGroupError(e.to_string()))
    }
}

fn to_incoming(message: &BorrowedMessage<'_>) -> IncomingRecord {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .filter_map(|header| {
                    let value = std::str::from_utf8(header.value?).ok()?;
                    Some((header.key.to_string(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    IncomingRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec),
        headers,
    }
}
