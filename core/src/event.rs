//! Domain events and the pipeline lifecycle events.
//!
//! A [`DomainEvent`] is an immutable record of something that happened, wrapped in an
//! envelope that every provider understands: a unique id, a stable type key, the time
//! it occurred, an optional correlation id and a string metadata map. The payload type
//! is a parameter; the untyped [`EventEnvelope`] (payload as JSON) is what crosses
//! provider boundaries.
//!
//! # Wire format
//!
//! Serialized envelopes use camel-cased keys:
//!
//! ```json
//! {
//!   "eventId": "5b0f...",
//!   "eventType": "pipeline.transaction.completed",
//!   "occurredOn": "2025-01-01T00:00:00Z",
//!   "correlationId": "req-42",
//!   "metadata": { "pipeline": "credit" },
//!   "data": { "durationMs": 12 }
//! }
//! ```
//!
//! # Example
//!
//! ```
//! use bks_pipeline_core::event::{DomainEvent, TransactionCompleted};
//!
//! let event = DomainEvent::new(TransactionCompleted {
//!     pipeline: "credit".to_string(),
//!     duration_ms: 12,
//!     stage_durations_ms: Default::default(),
//! })
//! .with_correlation_id("req-42");
//!
//! assert_eq!(event.event_type, "pipeline.transaction.completed");
//! let envelope = event.to_envelope().unwrap();
//! assert_eq!(envelope.data["durationMs"], 12);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Error types for event encoding and decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize an event.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize an event.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// The envelope carries a different event type than the one requested.
    #[error("Event type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// The type the caller asked for
        expected: String,
        /// The type found in the envelope
        actual: String,
    },
}

/// A payload that can travel inside a [`DomainEvent`].
///
/// `EVENT_TYPE` is the stable key used for routing and topic derivation. It is an
/// associated constant rather than a method so subscribers can name the type they
/// want before any instance exists.
///
/// Keys are dotted identifiers: ASCII letters, digits and `_`, separated by `.`
/// (for example `"pipeline.transaction.completed"`).
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable type key for this payload.
    const EVENT_TYPE: &'static str;
}

/// Envelope around an event payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent<E> {
    /// Unique per publish.
    pub event_id: Uuid,
    /// Stable type key.
    pub event_type: String,
    /// When the event occurred.
    pub occurred_on: DateTime<Utc>,
    /// Correlation id propagated from the originating pipeline, if any.
    pub correlation_id: Option<String>,
    /// Free-form string metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// The payload.
    pub data: E,
}

/// An envelope whose payload is still raw JSON.
pub type EventEnvelope = DomainEvent<serde_json::Value>;

impl<E: EventPayload> DomainEvent<E> {
    /// Wrap a payload in a fresh envelope (new id, current time, no correlation id).
    #[must_use]
    pub fn new(data: E) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: E::EVENT_TYPE.to_string(),
            occurred_on: Utc::now(),
            correlation_id: None,
            metadata: BTreeMap::new(),
            data,
        }
    }

    /// Encode the payload to JSON, producing an [`EventEnvelope`].
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the payload cannot be encoded.
    pub fn to_envelope(&self) -> Result<EventEnvelope, EventError> {
        let data = serde_json::to_value(&self.data)
            .map_err(|e| EventError::SerializationError(e.to_string()))?;

        Ok(DomainEvent {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            occurred_on: self.occurred_on,
            correlation_id: self.correlation_id.clone(),
            metadata: self.metadata.clone(),
            data,
        })
    }
}

impl<E> DomainEvent<E> {
    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Add one metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Override the occurrence time (used with an injected clock).
    #[must_use]
    pub const fn occurred_at(mut self, occurred_on: DateTime<Utc>) -> Self {
        self.occurred_on = occurred_on;
        self
    }
}

impl EventEnvelope {
    /// Decode the JSON payload into a typed event.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::TypeMismatch`] if the envelope's type key is not
    /// `E::EVENT_TYPE`, or [`EventError::DeserializationError`] if the payload
    /// does not have the expected shape.
    pub fn decode<E: EventPayload>(&self) -> Result<DomainEvent<E>, EventError> {
        if self.event_type != E::EVENT_TYPE {
            return Err(EventError::TypeMismatch {
                expected: E::EVENT_TYPE.to_string(),
                actual: self.event_type.clone(),
            });
        }

        let data = E::deserialize(&self.data)
            .map_err(|e| EventError::DeserializationError(e.to_string()))?;

        Ok(DomainEvent {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            occurred_on: self.occurred_on,
            correlation_id: self.correlation_id.clone(),
            metadata: self.metadata.clone(),
            data,
        })
    }

    /// Serialize the whole envelope as a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if encoding fails.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Parse an envelope from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if the bytes are not a valid envelope.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

impl<E> fmt::Display for DomainEvent<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DomainEvent {{ type: {}, id: {} }}", self.event_type, self.event_id)
    }
}

/// A pipeline accepted a request and is about to run its first stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStarted {
    /// Pipeline name
    pub pipeline: String,
    /// Unqualified request type name
    pub request_type: String,
}

impl EventPayload for TransactionStarted {
    const EVENT_TYPE: &'static str = "pipeline.transaction.started";
}

/// The prepare stage finished its pre-flight work and the request is being processed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionProcessing {
    /// Pipeline name
    pub pipeline: String,
    /// Stage that emitted the event
    pub stage: String,
}

impl EventPayload for TransactionProcessing {
    const EVENT_TYPE: &'static str = "pipeline.transaction.processing";
}

/// Every stage succeeded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionCompleted {
    /// Pipeline name
    pub pipeline: String,
    /// Total wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Per-stage durations in milliseconds
    #[serde(default)]
    pub stage_durations_ms: BTreeMap<String, u64>,
}

impl EventPayload for TransactionCompleted {
    const EVENT_TYPE: &'static str = "pipeline.transaction.completed";
}

/// A stage failed, faulted, or the pipeline timed out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionFailed {
    /// Pipeline name
    pub pipeline: String,
    /// Stage that failed, if the failure happened inside one
    pub stage: Option<String>,
    /// Failure message
    pub error: String,
    /// Failure category (`validation`, `no_handler`, `stage`, `panic`, `timeout`)
    pub kind: String,
    /// For faults, where the panic happened, followed by its backtrace when
    /// `RUST_BACKTRACE` enables capture
    pub stack_trace: Option<String>,
}

impl EventPayload for TransactionFailed {
    const EVENT_TYPE: &'static str = "pipeline.transaction.failed";
}

/// The caller cancelled the pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionCancelled {
    /// Pipeline name
    pub pipeline: String,
    /// Stage that was running or about to run
    pub stage: Option<String>,
}

impl EventPayload for TransactionCancelled {
    const EVENT_TYPE: &'static str = "pipeline.transaction.cancelled";
}
