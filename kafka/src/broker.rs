//! Broker client seam.
//!
//! [`KafkaEventBus`](crate::KafkaEventBus) never talks to `rdkafka` directly; it
//! goes through [`BrokerClient`] (producer side plus consumer factory) and
//! [`BrokerConsumer`] (one per subscription). [`RdKafkaBroker`](crate::RdKafkaBroker)
//! is the production implementation; tests plug in a simulated broker.

use bks_pipeline_core::event_bus::{BoxFuture, EventBusError};

/// Header carrying the event type.
pub const HEADER_EVENT_TYPE: &str = "EventType";
/// Header carrying the ISO-8601 occurrence timestamp.
pub const HEADER_OCCURRED_ON: &str = "OccurredOn";
/// Header carrying the correlation id, when the event has one.
pub const HEADER_CORRELATION_ID: &str = "CorrelationId";

/// A message to be written to a topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingRecord {
    /// Destination topic
    pub topic: String,
    /// Message key (the event id)
    pub key: String,
    /// JSON-encoded event
    pub payload: Vec<u8>,
    /// String headers
    pub headers: Vec<(String, String)>,
}

/// A message read from a topic partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingRecord {
    /// Source topic
    pub topic: String,
    /// Partition the message was read from
    pub partition: i32,
    /// Offset of the message within the partition
    pub offset: i64,
    /// Message key, if any
    pub key: Option<Vec<u8>>,
    /// Message body, if any
    pub payload: Option<Vec<u8>>,
    /// Headers whose values are valid UTF-8
    pub headers: Vec<(String, String)>,
}

impl IncomingRecord {
    /// First header named `name`.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Where the broker acknowledged a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Partition written to
    pub partition: i32,
    /// Offset assigned to the message
    pub offset: i64,
}

/// Settings for one subscription's consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// Consumer group id
    pub group_id: String,
    /// Topic to subscribe to
    pub topic: String,
    /// Where a group with no committed offset starts reading
    pub auto_offset_reset: String,
}

/// Producer side of a broker plus a factory for consumers.
pub trait BrokerClient: Send + Sync {
    /// Write `record`, resolving once the broker has accepted it.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the broker rejects the write or
    /// it times out.
    fn send(&self, record: OutgoingRecord) -> BoxFuture<'_, Result<DeliveryReport, EventBusError>>;

    /// Create a consumer joined to `settings.group_id` and subscribed to `settings.topic`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if the consumer cannot be
    /// created or subscribed.
    fn consumer(&self, settings: &ConsumerSettings) -> Result<Box<dyn BrokerConsumer>, EventBusError>;
}

/// One group member reading one topic. Dropping it leaves the group.
pub trait BrokerConsumer: Send {
    /// Wait for the next message.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::TransportError`] on a broker or network error.
    /// The consumer stays usable.
    fn recv(&mut self) -> BoxFuture<'_, Result<IncomingRecord, EventBusError>>;

    /// Commit `next_offset` (the offset of the next message to read) for the
    /// group on `topic`/`partition`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConsumerGroupError`] if the commit is rejected.
    fn commit(&mut self, topic: &str, partition: i32, next_offset: i64) -> Result<(), EventBusError>;
}
