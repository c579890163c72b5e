//! # BKS Pipeline Runtime
//!
//! Executor and in-process providers for the BKS transaction pipeline.
//!
//! ## Core Components
//!
//! - **Pipeline**: runs a request through its ordered stages and publishes
//!   lifecycle events
//! - **Standard stages**: Validate → Prepare → Execute (dispatch) → Finalize
//! - **Providers**: [`InMemoryEventBus`] (in-process fan-out), [`StubEventBus`]
//!   (no-op), and the Kafka-style bus from `bks-pipeline-kafka`, selected by
//!   [`event_bus_from_config`]
//!
//! ## Example
//!
//! ```rust,ignore
//! let config = AppConfig::load("config/pipeline.toml")?;
//! let metrics = Arc::new(PipelineMetrics::new());
//! let bus = event_bus_from_config(&config, Arc::clone(&metrics))?;
//!
//! let handlers = HandlerRegistry::builder()
//!     .register::<CreditCommand, CreditResponse, _>(CreditHandler::new(accounts))
//!     .build()?;
//! let resolver = Arc::new(resolver_from_config(&config, handlers, ProcessorRegistry::empty()));
//!
//! let stages = StandardStages::new(resolver).validator(validator_fn(|cmd: &CreditCommand| {
//!     if cmd.amount > 0 {
//!         Outcome::Success(())
//!     } else {
//!         Outcome::failure("amount must be positive")
//!     }
//! }));
//!
//! let pipeline = Pipeline::builder("credit")
//!     .standard_stages(stages)
//!     .maybe_event_bus(bus)
//!     .metrics(metrics)
//!     .timeout(Duration::from_secs(5))
//!     .build()?;
//!
//! let response = pipeline.execute(CreditCommand { amount: 10 }, CancellationToken::new()).await?;
//! ```

/// In-process fan-out provider
pub mod in_memory;

/// Prometheus exporter for the pipeline and event bus metrics
pub mod metrics;

/// The pipeline executor and its builder
pub mod pipeline;

/// Event provider selection from configuration
pub mod providers;

/// Validate, Prepare, Execute and Finalize stages
pub mod stages;

/// No-op provider
pub mod stub;

pub use in_memory::{InMemoryDispatcher, InMemoryEventBus};
pub use metrics::{MetricsError, MetricsServer};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use providers::{ProviderError, event_bus_from_config, resolver_from_config};
pub use stages::{
    ExecuteStage, FinalizeStage, Finalizer, PrepareStage, Preparer, StandardStages, ValidateStage, Validator,
    finalizer_fn, preparer_fn, validator_fn,
};
pub use stub::StubEventBus;

/// Error types for pipeline construction and execution
pub mod error {
    use bks_pipeline_core::context::{FailureKind, PipelineState};
    use std::time::Duration;
    use thiserror::Error;

    /// Why a pipeline execution did not produce a response.
    ///
    /// Cancellation is its own variant so callers never mistake it for a failure.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum PipelineError {
        /// A stage failed, panicked, or no handler was registered
        #[error("{message}")]
        Failed {
            /// Stage that failed
            stage: String,
            /// Category of the failure
            kind: FailureKind,
            /// Failure message (also the `Display` output)
            message: String,
        },

        /// The cancellation token fired before or during a stage
        #[error("pipeline cancelled{}", stage.as_deref().map(|s| format!(" at stage '{s}'")).unwrap_or_default())]
        Cancelled {
            /// Stage that was skipped or interrupted
            stage: Option<String>,
        },

        /// The whole-pipeline deadline passed
        #[error("pipeline timed out after {after:?}")]
        TimedOut {
            /// Configured deadline
            after: Duration,
            /// Stage running when the deadline passed
            stage: Option<String>,
        },
    }

    impl PipelineError {
        /// Build a [`PipelineError::Failed`].
        pub fn failed(stage: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
            Self::Failed {
                stage: stage.into(),
                kind,
                message: message.into(),
            }
        }

        /// Failure category; `None` for cancellation.
        #[must_use]
        pub const fn kind(&self) -> Option<FailureKind> {
            match self {
                Self::Failed { kind, .. } => Some(*kind),
                Self::TimedOut { .. } => Some(FailureKind::Timeout),
                Self::Cancelled { .. } => None,
            }
        }

        /// Stage the error is attributed to, if any.
        #[must_use]
        pub fn stage(&self) -> Option<&str> {
            match self {
                Self::Failed { stage, .. } => Some(stage),
                Self::Cancelled { stage } | Self::TimedOut { stage, .. } => stage.as_deref(),
            }
        }

        /// Whether the caller cancelled the execution.
        #[must_use]
        pub const fn is_cancelled(&self) -> bool {
            matches!(self, Self::Cancelled { .. })
        }

        /// Terminal pipeline state this error leads to.
        #[must_use]
        pub const fn terminal_state(&self) -> PipelineState {
            match self {
                Self::Failed { .. } => PipelineState::Failed,
                Self::Cancelled { .. } => PipelineState::Cancelled,
                Self::TimedOut { .. } => PipelineState::TimedOut,
            }
        }
    }

    /// Invalid pipeline definition.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum PipelineBuildError {
        /// No stage was added
        #[error("pipeline '{pipeline}' has no stages")]
        Empty {
            /// Pipeline name
            pipeline: String,
        },

        /// Stage orders start at 1
        #[error("stage '{stage}' has order 0; orders start at 1")]
        InvalidOrder {
            /// Offending stage
            stage: String,
        },

        /// Two stages claim the same position
        #[error("stages '{first}' and '{second}' share order {order}")]
        DuplicateOrder {
            /// Shared order
            order: u32,
            /// First stage
            first: String,
            /// Second stage
            second: String,
        },
    }

}
