//! In-process Kafka stand-in for deterministic consumer-loop tests.
//!
//! [`MemoryBroker`] implements [`BrokerClient`] with single-partition topics, an
//! append-only log per topic and committed offsets per consumer group. A consumer
//! created for a group resumes from that group's committed offset, so dropping a
//! subscription and subscribing again behaves like a consumer restart.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap on poisoned locks
#![allow(clippy::missing_panics_doc)]

use bks_pipeline_core::event_bus::{BoxFuture, EventBusError};
use bks_pipeline_kafka::{BrokerClient, BrokerConsumer, ConsumerSettings, DeliveryReport, IncomingRecord, OutgoingRecord};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// The only partition of every topic.
pub const PARTITION: i32 = 0;

#[derive(Default)]
struct BrokerState {
    logs: HashMap<String, Vec<IncomingRecord>>,
    committed: HashMap<(String, String), i64>,
    deliveries: HashMap<String, usize>,
    failing_sends: usize,
}

/// Simulated broker shared by producers and consumers.
///
/// # Example
///
/// ```
/// use bks_pipeline_kafka::KafkaEventBus;
/// use bks_pipeline_testing::MemoryBroker;
/// use std::sync::Arc;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = MemoryBroker::new();
/// let bus = KafkaEventBus::builder()
///     .client(Arc::new(broker.clone()))
///     .application_name("ledger")
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    appended: Arc<Notify>,
}

impl MemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` sends fail with [`EventBusError::PublishFailed`].
    pub fn fail_next_sends(&self, count: usize) {
        self.state.lock().unwrap().failing_sends = count;
    }

    /// Append a raw payload, bypassing the producer (e.g. a poison message).
    pub fn append_raw(&self, topic: &str, payload: Vec<u8>) -> i64 {
        let offset = self.append(topic, None, Some(payload), Vec::new());
        self.appended.notify_waiters();
        offset
    }

    /// Records written to `topic`, in offset order.
    #[must_use]
    pub fn records(&self, topic: &str) -> Vec<IncomingRecord> {
        self.state
            .lock()
            .unwrap()
            .logs
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Offset `group` will resume `topic` from, if it ever committed.
    #[must_use]
    pub fn committed_offset(&self, group: &str, topic: &str) -> Option<i64> {
        self.state
            .lock()
            .unwrap()
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .copied()
    }

    /// How many records have been handed to consumers of `topic`, redeliveries included.
    #[must_use]
    pub fn deliveries(&self, topic: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .deliveries
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    fn append(
        &self,
        topic: &str,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
        headers: Vec<(String, String)>,
    ) -> i64 {
        let mut state = self.state.lock().unwrap();
        let log = state.logs.entry(topic.to_string()).or_default();
        let offset = i64::try_from(log.len()).unwrap_or(i64::MAX);
        log.push(IncomingRecord {
            topic: topic.to_string(),
            partition: PARTITION,
            offset,
            key,
            payload,
            headers,
        });
        offset
    }
}

impl BrokerClient for MemoryBroker {
    fn send(&self, record: OutgoingRecord) -> BoxFuture<'_, Result<DeliveryReport, EventBusError>> {
        Box::pin(async move {
            {
                let mut state = self.state.lock().unwrap();
                if state.failing_sends > 0 {
                    state.failing_sends -= 1;
                    return Err(EventBusError::PublishFailed {
                        topic: record.topic,
                        reason: "simulated broker outage".to_string(),
                    });
                }
            }

            let offset = self.append(
                &record.topic,
                Some(record.key.into_bytes()),
                Some(record.payload),
                record.headers,
            );
            self.appended.notify_waiters();
            Ok(DeliveryReport {
                partition: PARTITION,
                offset,
            })
        })
    }

    fn consumer(&self, settings: &ConsumerSettings) -> Result<Box<dyn BrokerConsumer>, EventBusError> {
        let position = {
            let state = self.state.lock().unwrap();
            let committed = state
                .committed
                .get(&(settings.group_id.clone(), settings.topic.clone()))
                .copied();
            match (committed, settings.auto_offset_reset.as_str()) {
                (Some(offset), _) => offset,
                (None, "earliest") => 0,
                (None, "latest") => state
                    .logs
                    .get(&settings.topic)
                    .map_or(0, |log| i64::try_from(log.len()).unwrap_or(i64::MAX)),
                (None, other) => {
                    return Err(EventBusError::SubscriptionFailed {
                        topic: settings.topic.clone(),
                        reason: format!("unknown auto.offset.reset '{other}'"),
                    });
                },
            }
        };

        Ok(Box::new(MemoryConsumer {
            broker: self.clone(),
            group_id: settings.group_id.clone(),
            topic: settings.topic.clone(),
            position,
        }))
    }
}

struct MemoryConsumer {
    broker: MemoryBroker,
    group_id: String,
    topic: String,
    position: i64,
}

impl MemoryConsumer {
    fn next_record(&mut self) -> Option<IncomingRecord> {
        let mut state = self.broker.state.lock().unwrap();
        let index = usize::try_from(self.position).ok()?;
        let record = state.logs.get(&self.topic)?.get(index)?.clone();
        *state.deliveries.entry(self.topic.clone()).or_default() += 1;
        self.position += 1;
        Some(record)
    }
}

impl BrokerConsumer for MemoryConsumer {
    fn recv(&mut self) -> BoxFuture<'_, Result<IncomingRecord, EventBusError>> {
        Box::pin(async move {
            loop {
                let appended = Arc::clone(&self.broker.appended);
                let notified = appended.notified();
                if let Some(record) = self.next_record() {
                    return Ok(record);
                }
                notified.await;
            }
        })
    }

    fn commit(&mut self, topic: &str, _partition: i32, next_offset: i64) -> Result<(), EventBusError> {
        self.broker
            .state
            .lock()
            .unwrap()
            .committed
            .insert((self.group_id.clone(), topic.to_string()), next_offset);
        Ok(())
    }
}
