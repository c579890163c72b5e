//! # BKS Pipeline Core
//!
//! Core contracts for the BKS transaction pipeline.
//!
//! A request enters a pipeline, passes through ordered stages (validate, prepare,
//! execute, finalize) and comes out as a single result. Along the way the pipeline
//! announces lifecycle transitions as domain events on a pluggable event bus.
//!
//! ## Core Concepts
//!
//! - **Outcome**: success-or-failure value returned by stages and handlers ([`outcome`])
//! - **Stage**: named, ordered unit of work ([`stage`])
//! - **Context**: per-execution correlation id, cancellation and timings ([`context`])
//! - **Dispatch**: handler/processor registries behind the execute stage ([`dispatch`])
//! - **Events**: envelopes and lifecycle payloads ([`event`]) published through
//!   provider-agnostic contracts ([`event_bus`])
//! - **Configuration**: processing mode and event provider selection ([`config`])
//! - **Metrics**: explicit per-process collector ([`metrics`])
//!
//! The executor, the in-process provider and the standard stages live in
//! `bks-pipeline-runtime`; the Kafka-style provider lives in `bks-pipeline-kafka`.

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use tokio_util::sync::CancellationToken;

pub mod config;
pub mod context;
pub mod dispatch;
pub mod event;
pub mod event_bus;
pub mod metrics;
pub mod outcome;
pub mod stage;

pub use context::{FailureKind, PipelineContext, PipelineState};
pub use outcome::Outcome;
pub use stage::{Stage, StageOutput};

/// Environment module - injected dependencies
///
/// External effects that need to be deterministic in tests are abstracted behind
/// traits and injected into the runtime.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// The executor stamps lifecycle events with `clock.now()`.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
