//! In-process event provider.
//!
//! [`InMemoryDispatcher`] owns the topic → handler registry. [`InMemoryEventBus`]
//! holds a forward reference to it and adds topic naming and metrics; nothing in
//! the dispatcher points back at the bus.
//!
//! # Delivery semantics
//!
//! - `publish` snapshots the topic's handlers under a read lock, runs them
//!   **concurrently**, and returns only after **all** of them finish.
//! - The first handler error (or panic) is returned to the publisher as
//!   [`EventBusError::HandlerFailed`]; the remaining handlers still run.
//! - Subscribing or unsubscribing while a publish is in flight affects only later
//!   publishes.
//! - A slow handler delays its publisher.

use bks_pipeline_core::event::EventEnvelope;
use bks_pipeline_core::event_bus::{
    BoxFuture, EventBus, EventBusError, EventHandler, EventPublisher, EventSubscriber, HandlerError,
    Subscription, TopicNamer,
};
use bks_pipeline_core::metrics::PipelineMetrics;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use uuid::Uuid;

const PROVIDER: &str = "in-memory";

type HandlerEntry = (Uuid, Arc<dyn EventHandler>);

/// Topic → handler registry with concurrent fan-out.
#[derive(Default)]
pub struct InMemoryDispatcher {
    handlers: RwLock<HashMap<String, Vec<HandlerEntry>>>,
}

impl InMemoryDispatcher {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `handler` to `topic`; returns the registration id.
    pub async fn register(&self, topic: &str, handler: Arc<dyn EventHandler>) -> Uuid {
        let id = Uuid::new_v4();
        self.handlers
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove every handler bound to `topic`; returns how many were removed.
    pub async fn remove_topic(&self, topic: &str) -> usize {
        self.handlers
            .write()
            .await
            .remove(topic)
            .map_or(0, |entries| entries.len())
    }

    /// Remove one registration; returns whether it existed.
    pub async fn remove(&self, topic: &str, id: Uuid) -> bool {
        let mut handlers = self.handlers.write().await;
        let Some(entries) = handlers.get_mut(topic) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            handlers.remove(topic);
        }
        removed
    }

    /// Number of handlers bound to `topic`.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.handlers.read().await.get(topic).map_or(0, Vec::len)
    }

    /// Deliver `event` to every handler on `topic` and wait for all of them.
    ///
    /// Returns the per-handler results in registration order.
    pub async fn dispatch(&self, topic: &str, event: &EventEnvelope) -> Vec<Result<(), HandlerError>> {
        let snapshot: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .await
            .get(topic)
            .map(|entries| entries.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();

        futures::future::join_all(snapshot.iter().map(|handler| {
            async move {
                AssertUnwindSafe(async move { handler.handle(event.clone()).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(HandlerError::failed("handler panicked")))
            }
        }))
        .await
    }
}

/// Single-process fan-out event bus.
///
/// # Example
///
/// ```rust,ignore
/// let bus = InMemoryEventBus::new("bks");
/// bus.subscribe("pipeline.transaction.completed", handler, None).await?;
/// bus.publish(&event, None).await?; // returns after the handler ran
/// ```
pub struct InMemoryEventBus {
    dispatcher: Arc<InMemoryDispatcher>,
    topics: TopicNamer,
    metrics: Arc<PipelineMetrics>,
}

impl InMemoryEventBus {
    /// Bus deriving topics with `topic_prefix`.
    #[must_use]
    pub fn new(topic_prefix: impl Into<String>) -> Self {
        Self::with_dispatcher(topic_prefix, Arc::new(InMemoryDispatcher::new()))
    }

    /// Bus over an existing dispatcher (several buses may share one registry).
    #[must_use]
    pub fn with_dispatcher(topic_prefix: impl Into<String>, dispatcher: Arc<InMemoryDispatcher>) -> Self {
        let topics = TopicNamer::new(topic_prefix);
        tracing::info!(prefix = topics.prefix(), "In-memory event bus created");
        Self {
            dispatcher,
            topics,
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    /// Record into a shared metrics collector.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The registry behind this bus.
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<InMemoryDispatcher> {
        &self.dispatcher
    }

    /// Topic naming used by this bus.
    #[must_use]
    pub const fn topics(&self) -> &TopicNamer {
        &self.topics
    }
}

impl EventPublisher for InMemoryEventBus {
    fn publish<'a>(
        &'a self,
        event: &'a EventEnvelope,
        topic_override: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            let topic = self.topics.resolve(&event.event_type, topic_override)?;
            let started = Instant::now();

            let results = self.dispatcher.dispatch(&topic, event).await;
            let delivered = results.len();
            let mut first_error = None;
            for result in results {
                match result {
                    Ok(()) => self.metrics.record_consume(PROVIDER),
                    Err(e) => {
                        self.metrics.record_consume_error(PROVIDER);
                        tracing::error!(topic = %topic, event_id = %event.event_id, error = %e, "Handler failed");
                        first_error.get_or_insert(e);
                    },
                }
            }

            if let Some(e) = first_error {
                self.metrics.record_publish_error(PROVIDER);
                return Err(EventBusError::HandlerFailed {
                    topic,
                    reason: e.to_string(),
                });
            }

            self.metrics.record_publish(PROVIDER, started.elapsed());
            tracing::debug!(
                topic = %topic,
                event_type = %event.event_type,
                handlers = delivered,
                "Event published"
            );
            Ok(())
        })
    }
}

impl EventSubscriber for InMemoryEventBus {
    fn subscribe<'a>(
        &'a self,
        event_type: &'a str,
        handler: Arc<dyn EventHandler>,
        topic_override: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Subscription, EventBusError>> {
        Box::pin(async move {
            let topic = self.topics.resolve(event_type, topic_override)?;
            let id = self.dispatcher.register(&topic, handler).await;
            tracing::info!(topic = %topic, event_type, subscription_id = %id, "Subscribed");

            let mut subscription = Subscription::new(event_type, topic, None);
            subscription.id = id;
            Ok(subscription)
        })
    }

    fn unsubscribe<'a>(&'a self, event_type: &'a str) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            let topic = self.topics.topic_for(event_type)?;
            let removed = self.dispatcher.remove_topic(&topic).await;
            tracing::info!(topic = %topic, event_type, removed, "Unsubscribed");
            Ok(())
        })
    }
}

impl EventBus for InMemoryEventBus {
    fn provider_name(&self) -> &'static str {
        PROVIDER
    }
}
