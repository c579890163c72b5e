//! Placeholder provider for deployments without a broker.
//!
//! Accepts every publish and subscribe, delivers nothing. Topic names are still
//! derived and validated so misconfigured event types surface early.

use bks_pipeline_core::event::EventEnvelope;
use bks_pipeline_core::event_bus::{
    BoxFuture, EventBus, EventBusError, EventHandler, EventPublisher, EventSubscriber, Subscription,
    TopicNamer,
};
use std::sync::Arc;

/// No-op event bus.
#[derive(Clone, Debug)]
pub struct StubEventBus {
    topics: TopicNamer,
}

impl StubEventBus {
    /// Stub deriving topics with `topic_prefix`.
    #[must_use]
    pub fn new(topic_prefix: impl Into<String>) -> Self {
        Self {
            topics: TopicNamer::new(topic_prefix),
        }
    }
}

impl EventPublisher for StubEventBus {
    fn publish<'a>(
        &'a self,
        event: &'a EventEnvelope,
        topic_override: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            let topic = self.topics.resolve(&event.event_type, topic_override)?;
            tracing::debug!(topic = %topic, event_id = %event.event_id, "Stub provider dropped event");
            Ok(())
        })
    }
}

impl EventSubscriber for StubEventBus {
    fn subscribe<'a>(
        &'a self,
        event_type: &'a str,
        _handler: Arc<dyn EventHandler>,
        topic_override: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Subscription, EventBusError>> {
        Box::pin(async move {
            let topic = self.topics.resolve(event_type, topic_override)?;
            tracing::debug!(topic = %topic, event_type, "Stub provider ignored subscription");
            Ok(Subscription::new(event_type, topic, None))
        })
    }

    fn unsubscribe<'a>(&'a self, event_type: &'a str) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            self.topics.topic_for(event_type)?;
            Ok(())
        })
    }
}

impl EventBus for StubEventBus {
    fn provider_name(&self) -> &'static str {
        "stub"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bks_pipeline_core::event::{DomainEvent, TransactionCancelled};
    use bks_pipeline_core::event_bus::{handler_fn, EventPublisherExt};

    #[tokio::test]
    async fn everything_succeeds_and_nothing_is_delivered() {
        let bus = StubEventBus::new("bks");
        let subscription = bus
            .subscribe(
                "pipeline.transaction.cancelled",
                Arc::new(handler_fn(|_event| async { Ok(()) })),
                None,
            )
            .await
            .unwrap();

        assert_eq!(subscription.topic, "bks-pipeline-transaction-cancelled");
        bus.publish_event(&DomainEvent::new(TransactionCancelled {
            pipeline: "credit".to_string(),
            stage: None,
        }))
        .await
        .unwrap();
        bus.unsubscribe("pipeline.transaction.cancelled").await.unwrap();
        assert_eq!(bus.provider_name(), "stub");
    }

    #[tokio::test]
    async fn invalid_event_types_still_fail() {
        let bus = StubEventBus::new("bks");
        assert!(bus.unsubscribe("").await.is_err());
    }
}
