//! The pipeline stage abstraction.
//!
//! A stage is a named, ordered unit of work. The executor runs stages strictly in
//! ascending `order`, stopping at the first [`Outcome::Failure`]. A stage's success
//! value says whether it produced the pipeline's response ([`StageOutput::Respond`])
//! or simply let the request through ([`StageOutput::Continue`]).
//!
//! The four conventional phases and their orders:
//!
//! | phase    | order | state            |
//! |----------|-------|------------------|
//! | validate | 1     | `Validating`     |
//! | prepare  | 2     | `PreProcessing`  |
//! | execute  | 3     | `Processing`     |
//! | finalize | 4     | `PostProcessing` |

use crate::context::{PipelineContext, PipelineState};
use crate::event_bus::BoxFuture;
use crate::outcome::Outcome;

/// What a successful stage hands back to the executor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageOutput<Resp> {
    /// Nothing to report; the current response (if any) is kept.
    Continue,
    /// Replace the pipeline's current response.
    Respond(Resp),
}

/// Future returned by [`Stage::execute`].
pub type StageFuture<'a, Resp> = BoxFuture<'a, Outcome<StageOutput<Resp>>>;

/// Phase a stage belongs to, derived from its order by default.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StagePhase {
    /// Input checks, no side effects
    Validate,
    /// Pre-flight checks and analytics
    Prepare,
    /// The actual work (dispatch)
    Execute,
    /// Best-effort cleanup and notification
    Finalize,
}

impl StagePhase {
    /// Phase for a stage order: 1, 2, 3, then everything later is finalize.
    #[must_use]
    pub const fn from_order(order: u32) -> Self {
        match order {
            0 | 1 => Self::Validate,
            2 => Self::Prepare,
            3 => Self::Execute,
            _ => Self::Finalize,
        }
    }

    /// Pipeline state while a stage of this phase runs.
    #[must_use]
    pub const fn state(self) -> PipelineState {
        match self {
            Self::Validate => PipelineState::Validating,
            Self::Prepare => PipelineState::PreProcessing,
            Self::Execute => PipelineState::Processing,
            Self::Finalize => PipelineState::PostProcessing,
        }
    }
}

/// A single named unit of work with a fixed position in a pipeline.
///
/// # Contract
///
/// - `order` is ≥ 1 and unique within a pipeline (checked when the pipeline is built).
/// - `execute` returns [`Outcome::Failure`] for expected failures. Panics are caught
///   by the executor and reported as faults.
/// - Long-running stages should observe `ctx.cancellation()`; the executor also
///   races every stage against it.
///
/// # Dyn Compatibility
///
/// `execute` returns a boxed future so pipelines can hold `Box<dyn Stage<Req, Resp>>`.
pub trait Stage<Req, Resp>: Send + Sync {
    /// Stage name used in logs, events and errors.
    fn name(&self) -> &str;

    /// Position in the pipeline (≥ 1).
    fn order(&self) -> u32;

    /// Phase of this stage. Defaults to [`StagePhase::from_order`].
    fn phase(&self) -> StagePhase {
        StagePhase::from_order(self.order())
    }

    /// Run the stage.
    ///
    /// `response` is the latest response produced by an earlier stage, if any.
    fn execute<'a>(
        &'a self,
        request: &'a Req,
        response: Option<&'a Resp>,
        ctx: &'a mut PipelineContext,
    ) -> StageFuture<'a, Resp>;
}
