//! Per-execution pipeline context and the pipeline state machine.
//!
//! A [`PipelineContext`] is created once at pipeline entry and owned by that one
//! execution: it fixes the correlation id, carries the caller's cancellation token,
//! tracks the [`PipelineState`] and accumulates per-stage elapsed time.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Pipeline-level lifecycle.
///
/// ```text
/// Created → Validating → PreProcessing → Processing → PostProcessing
///                                                   ↘ Completed | Failed | Cancelled | TimedOut
/// ```
///
/// Any non-terminal state may jump straight to a terminal one. Terminal states
/// are absorbing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// Context built, no stage started yet
    Created,
    /// Validate phase running
    Validating,
    /// Prepare phase running
    PreProcessing,
    /// Execute phase running
    Processing,
    /// Finalize phase running
    PostProcessing,
    /// All stages succeeded
    Completed,
    /// A stage failed or faulted
    Failed,
    /// The caller cancelled
    Cancelled,
    /// The pipeline ran past its deadline
    TimedOut,
}

impl PipelineState {
    /// Whether no transition can leave this state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Validating => 1,
            Self::PreProcessing => 2,
            Self::Processing => 3,
            Self::PostProcessing => 4,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut => 5,
        }
    }

    /// Whether moving from `self` to `next` is legal.
    ///
    /// Staying in the same non-terminal phase is allowed (several stages may share
    /// a phase); moving backwards is not.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.is_terminal() || next.rank() >= self.rank()
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Validating => "validating",
            Self::PreProcessing => "pre_processing",
            Self::Processing => "processing",
            Self::PostProcessing => "post_processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

/// Category of a pipeline failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The validate stage rejected the request; no side effects occurred
    Validation,
    /// No handler or processor is registered for the request
    NoHandler,
    /// A stage returned a failure
    Stage,
    /// A stage panicked; caught at the executor boundary
    Panic,
    /// The pipeline exceeded its deadline
    Timeout,
}

impl FailureKind {
    /// Stable lower-case name, used in events and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NoHandler => "no_handler",
            Self::Stage => "stage",
            Self::Panic => "panic",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Illegal state machine move.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Illegal pipeline transition from {from} to {to}")]
pub struct StateTransitionError {
    /// State before the attempted move
    pub from: PipelineState,
    /// Requested state
    pub to: PipelineState,
}

/// State owned by a single pipeline execution.
#[derive(Debug)]
pub struct PipelineContext {
    pipeline: String,
    correlation_id: String,
    cancellation: CancellationToken,
    started_at: Instant,
    state: PipelineState,
    current_stage: Option<String>,
    failure_kind: Option<FailureKind>,
    fault_trace: Option<String>,
    stage_timings: Vec<(String, Duration)>,
    metadata: BTreeMap<String, String>,
}

impl PipelineContext {
    /// New context with a generated correlation id.
    #[must_use]
    pub fn new(pipeline: impl Into<String>, cancellation: CancellationToken) -> Self {
        Self::with_correlation_id(pipeline, Uuid::new_v4().to_string(), cancellation)
    }

    /// New context reusing a correlation id supplied by the caller.
    #[must_use]
    pub fn with_correlation_id(
        pipeline: impl Into<String>,
        correlation_id: impl Into<String>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            correlation_id: correlation_id.into(),
            cancellation,
            started_at: Instant::now(),
            state: PipelineState::Created,
            current_stage: None,
            failure_kind: None,
            fault_trace: None,
            stage_timings: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Name of the pipeline running this context.
    #[must_use]
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Correlation id, fixed for the lifetime of the execution.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Cancellation token shared with the caller.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the caller has asked to stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> PipelineState {
        self.state
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`StateTransitionError`] when leaving a terminal state or moving
    /// backwards.
    pub fn transition_to(&mut self, next: PipelineState) -> Result<(), StateTransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(StateTransitionError {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Mark `stage` as the one currently running.
    pub fn enter_stage(&mut self, stage: impl Into<String>) {
        self.current_stage = Some(stage.into());
    }

    /// Name of the stage currently (or most recently) running.
    #[must_use]
    pub fn current_stage(&self) -> Option<&str> {
        self.current_stage.as_deref()
    }

    /// Let a stage say what kind of failure it is about to report.
    ///
    /// The executor otherwise infers the kind from the stage's phase.
    pub fn classify_failure(&mut self, kind: FailureKind) {
        self.failure_kind = Some(kind);
    }

    /// Take the classification left by the failing stage, if any.
    pub fn take_failure_kind(&mut self) -> Option<FailureKind> {
        self.failure_kind.take()
    }

    /// Record where a stage fault happened (panic location and, if enabled, backtrace).
    pub fn record_fault_trace(&mut self, trace: impl Into<String>) {
        self.fault_trace = Some(trace.into());
    }

    /// Trace recorded for the fault that ended this execution, if any.
    #[must_use]
    pub fn fault_trace(&self) -> Option<&str> {
        self.fault_trace.as_deref()
    }

    /// Record how long a stage took.
    pub fn record_stage(&mut self, stage: impl Into<String>, elapsed: Duration) {
        self.stage_timings.push((stage.into(), elapsed));
    }

    /// Stage durations in execution order.
    #[must_use]
    pub fn stage_timings(&self) -> &[(String, Duration)] {
        &self.stage_timings
    }

    /// Sum of all recorded stage durations.
    #[must_use]
    pub fn total_stage_time(&self) -> Duration {
        self.stage_timings.iter().map(|(_, d)| *d).sum()
    }

    /// Wall-clock time since the context was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Annotate the execution; copied into lifecycle event metadata.
    pub fn insert_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Annotations added so far.
    #[must_use]
    pub const fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}
