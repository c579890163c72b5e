//! Event bus abstraction for pipeline lifecycle notifications.
//!
//! This module provides the [`EventPublisher`] and [`EventSubscriber`] traits that every
//! provider implements, plus topic naming shared by all of them. Pipelines publish
//! lifecycle events through these traits; observers subscribe by event type.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Pipeline     │
//! │    Executor     │
//! └────────┬────────┘
//!          │ publish(DomainEvent)
//!          ▼
//! ┌─────────────────┐
//! │   EventBus      │◄─── InMemory / Kafka-style / Stub
//! └────────┬────────┘
//!          │ topic = prefix-normalized(eventType)
//!     ┌────┴────┐
//!     │         │
//!     ▼         ▼
//! ┌───────┐ ┌───────┐
//! │Handler│ │Handler│
//! └───────┘ └───────┘
//! ```
//!
//! # Key Principles
//!
//! - **Observational**: events describe what happened; they never roll back business work
//! - **Provider-agnostic topics**: every provider derives the same topic from an event type
//! - **Errors surface**: publish failures are returned to the caller, never swallowed
//! - **Idempotency**: broker-backed providers deliver at least once
//!
//! # Topic Naming Convention
//!
//! Topics follow `{prefix}-{event-type-with-dots-as-dashes}`, lower-cased:
//! - `pipeline.transaction.completed` with prefix `bks` → `bks-pipeline-transaction-completed`
//! - `Account.Opened` with prefix `bks` → `bks-account-opened`
//!
//! # Example
//!
//! ```rust,ignore
//! use bks_pipeline_core::event_bus::{EventPublisherExt, EventSubscriberExt};
//! use bks_pipeline_core::event::{DomainEvent, TransactionCompleted};
//!
//! async fn example(bus: impl EventBus) -> Result<(), EventBusError> {
//!     bus.subscribe_typed(|event: DomainEvent<TransactionCompleted>| async move {
//!         tracing::info!(duration_ms = event.data.duration_ms, "transaction completed");
//!         Ok(())
//!     })
//!     .await?;
//!
//!     bus.publish_event(&DomainEvent::new(completed)).await
//! }
//! ```

use crate::event::{DomainEvent, EventEnvelope, EventError, EventPayload};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Boxed, sendable future used by the dyn-compatible traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to a topic
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to serialize an event
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failed to deserialize an event
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Event type or topic is not usable
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// A subscriber's handler returned an error during an in-process publish
    #[error("Handler failed for topic '{topic}': {reason}")]
    HandlerFailed {
        /// The topic being delivered
        topic: String,
        /// The handler's error
        reason: String,
    },

    /// Consumer group error
    #[error("Consumer group error: {0}")]
    ConsumerGroupError(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The operation was cancelled before it completed
    #[error("Operation cancelled")]
    Cancelled,

    /// One or more publishes in a batch failed
    #[error("Batch publish failed: {} of the events could not be published", .0.len())]
    Batch(Vec<EventBusError>),

    /// Generic error for other failures
    #[error("Event bus error: {0}")]
    Other(String),
}

impl From<EventError> for EventBusError {
    fn from(error: EventError) -> Self {
        match error {
            EventError::SerializationError(reason) => Self::SerializationFailed(reason),
            other => Self::DeserializationFailed(other.to_string()),
        }
    }
}

/// Error returned by an [`EventHandler`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Processing failed; broker-backed providers will redeliver the event.
    #[error("Handler failed: {0}")]
    Failed(String),

    /// The event can never be processed (e.g. its payload has the wrong shape).
    /// Broker-backed providers acknowledge it instead of redelivering forever.
    #[error("Event rejected: {0}")]
    Rejected(String),
}

impl HandlerError {
    /// Build a retryable failure.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    /// Build a permanent rejection.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    /// Whether redelivering the same event could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Something that reacts to delivered events.
///
/// Handlers behind broker-backed providers may see the same event more than once
/// and must be idempotent (the `event_id` is stable across redeliveries).
pub trait EventHandler: Send + Sync {
    /// Handle one delivered event.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] when the event could not be processed.
    fn handle(&self, event: EventEnvelope) -> BoxFuture<'_, Result<(), HandlerError>>;
}

/// [`EventHandler`] backed by an async closure over the raw envelope.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as an [`EventHandler`].
pub const fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, event: EventEnvelope) -> BoxFuture<'_, Result<(), HandlerError>> {
        Box::pin((self.f)(event))
    }
}

/// [`EventHandler`] that decodes the payload into `E` before calling the closure.
///
/// A payload that does not decode is reported as [`HandlerError::Rejected`].
pub struct TypedHandler<E, F> {
    f: F,
    _event: PhantomData<fn() -> E>,
}

impl<E, F> TypedHandler<E, F> {
    /// Wrap a typed async closure.
    pub const fn new(f: F) -> Self {
        Self {
            f,
            _event: PhantomData,
        }
    }
}

impl<E, F, Fut> EventHandler for TypedHandler<E, F>
where
    E: EventPayload,
    F: Fn(DomainEvent<E>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, event: EventEnvelope) -> BoxFuture<'_, Result<(), HandlerError>> {
        match event.decode::<E>() {
            Ok(typed) => Box::pin((self.f)(typed)),
            Err(e) => Box::pin(async move { Err(HandlerError::Rejected(e.to_string())) }),
        }
    }
}

/// Handle describing an active subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    /// Unique id of this subscription
    pub id: Uuid,
    /// Event type the handler was registered for
    pub event_type: String,
    /// Topic the handler is bound to
    pub topic: String,
    /// Provider-specific consumer group, if any
    pub group_id: Option<String>,
}

impl Subscription {
    /// Create a subscription handle with a fresh id.
    #[must_use]
    pub fn new(event_type: impl Into<String>, topic: impl Into<String>, group_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            topic: topic.into(),
            group_id,
        }
    }
}

/// Publishing side of an event provider.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so providers can be held as `Arc<dyn EventBus>` by pipelines and stages.
pub trait EventPublisher: Send + Sync {
    /// Publish an event to its derived topic, or to `topic_override` when given.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] if the provider rejects the publish (transport,
    /// serialization, or a failing in-process handler).
    fn publish<'a>(
        &'a self,
        event: &'a EventEnvelope,
        topic_override: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), EventBusError>>;

    /// Publish several events concurrently and independently.
    ///
    /// Every event is attempted even if others fail.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Batch`] holding every individual failure.
    fn publish_batch<'a>(
        &'a self,
        events: &'a [EventEnvelope],
        topic_override: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            let results = futures::future::join_all(
                events.iter().map(|event| self.publish(event, topic_override)),
            )
            .await;

            let failures: Vec<EventBusError> = results.into_iter().filter_map(Result::err).collect();
            if failures.is_empty() {
                Ok(())
            } else {
                Err(EventBusError::Batch(failures))
            }
        })
    }
}

/// Subscribing side of an event provider.
pub trait EventSubscriber: Send + Sync {
    /// Register `handler` for `event_type` (bound to the derived topic, or to
    /// `topic_override` when given).
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::InvalidTopic`] for unusable event types and
    /// [`EventBusError::SubscriptionFailed`] if the provider cannot subscribe.
    fn subscribe<'a>(
        &'a self,
        event_type: &'a str,
        handler: Arc<dyn EventHandler>,
        topic_override: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Subscription, EventBusError>>;

    /// Remove every handler bound to `event_type`'s derived topic.
    ///
    /// Unsubscribing a type with no handlers is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::InvalidTopic`] for unusable event types.
    fn unsubscribe<'a>(&'a self, event_type: &'a str) -> BoxFuture<'a, Result<(), EventBusError>>;
}

/// A full provider: publisher plus subscriber.
pub trait EventBus: EventPublisher + EventSubscriber {
    /// Short provider name for logs (`"in-memory"`, `"kafka"`, `"stub"`).
    fn provider_name(&self) -> &'static str;

    /// Stop background work and release connections.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] if a background task could not be joined cleanly.
    fn shutdown(&self) -> BoxFuture<'_, Result<(), EventBusError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Typed publishing helpers available on every [`EventPublisher`].
pub trait EventPublisherExt: EventPublisher {
    /// Encode and publish a typed event to its derived topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SerializationFailed`] if the payload cannot be
    /// encoded, otherwise whatever [`EventPublisher::publish`] returns.
    fn publish_event<'a, E: EventPayload>(
        &'a self,
        event: &DomainEvent<E>,
    ) -> BoxFuture<'a, Result<(), EventBusError>> {
        let envelope = event.to_envelope();
        Box::pin(async move {
            let envelope = envelope?;
            self.publish(&envelope, None).await
        })
    }

    /// Publish, giving up with [`EventBusError::Cancelled`] once `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Cancelled`] or the provider's publish error.
    fn publish_cancellable<'a>(
        &'a self,
        event: &'a EventEnvelope,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => Err(EventBusError::Cancelled),
                result = self.publish(event, None) => result,
            }
        })
    }
}

impl<T: EventPublisher + ?Sized> EventPublisherExt for T {}

/// Typed subscribing helpers available on every [`EventSubscriber`].
pub trait EventSubscriberExt: EventSubscriber {
    /// Subscribe a typed async closure to `E::EVENT_TYPE`.
    ///
    /// # Errors
    ///
    /// Returns whatever [`EventSubscriber::subscribe`] returns.
    fn subscribe_typed<E, F, Fut>(&self, f: F) -> BoxFuture<'_, Result<Subscription, EventBusError>>
    where
        E: EventPayload,
        F: Fn(DomainEvent<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: Arc<dyn EventHandler> = Arc::new(TypedHandler::<E, F>::new(f));
        self.subscribe(E::EVENT_TYPE, handler, None)
    }
}

impl<T: EventSubscriber + ?Sized> EventSubscriberExt for T {}

/// Check that an event type key can be turned into a topic unambiguously.
///
/// Keys are dot-separated segments of lowercase ASCII letters, digits and `_`.
/// Dashes would collide with normalized dots and uppercase letters with the
/// lower-cased topic, so both are rejected.
///
/// # Errors
///
/// Returns [`EventBusError::InvalidTopic`] describing the problem.
pub fn validate_event_type(event_type: &str) -> Result<(), EventBusError> {
    if event_type.is_empty() {
        return Err(EventBusError::InvalidTopic("event type is empty".to_string()));
    }

    if event_type.split('.').any(str::is_empty) {
        return Err(EventBusError::InvalidTopic(format!(
            "event type '{event_type}' has an empty segment"
        )));
    }

    if let Some(bad) = event_type
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '.'))
    {
        return Err(EventBusError::InvalidTopic(format!(
            "event type '{event_type}' contains '{bad}'"
        )));
    }

    Ok(())
}

/// Derive a topic name: `{prefix}-{event_type with '.' → '-'}`, lower-cased.
///
/// Pure; performs no validation. Use [`TopicNamer::topic_for`] at API boundaries.
#[must_use]
pub fn topic_name(prefix: &str, event_type: &str) -> String {
    format!("{prefix}-{}", event_type.replace('.', "-")).to_lowercase()
}

/// Topic derivation bound to one prefix; shared by every provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicNamer {
    prefix: String,
}

impl TopicNamer {
    /// Create a namer for `prefix`.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The configured prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Topic for an event type.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::InvalidTopic`] if the event type is not a valid key.
    pub fn topic_for(&self, event_type: &str) -> Result<String, EventBusError> {
        validate_event_type(event_type)?;
        Ok(topic_name(&self.prefix, event_type))
    }

    /// Resolve the topic for a publish or subscribe: the override verbatim if given,
    /// otherwise the derived topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::InvalidTopic`] for an empty override or an invalid
    /// event type.
    pub fn resolve(&self, event_type: &str, topic_override: Option<&str>) -> Result<String, EventBusError> {
        match topic_override {
            Some(topic) if topic.trim().is_empty() => {
                Err(EventBusError::InvalidTopic("topic override is empty".to_string()))
            },
            Some(topic) => Ok(topic.to_string()),
            None => self.topic_for(event_type),
        }
    }
}
