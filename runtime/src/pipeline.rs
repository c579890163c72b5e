//! The pipeline executor.
//!
//! A [`Pipeline`] owns an ordered list of stages, fixed when it is built, and runs
//! each request through them strictly in sequence:
//!
//! ```text
//! Started ─▶ stage 1 ─▶ stage 2 ─▶ … ─▶ stage n ─▶ Completed
//!              │           │              │
//!              └───────────┴──────────────┴──▶ Failed | Cancelled
//! ```
//!
//! - A failing stage stops the run; later stages never execute.
//! - A panicking stage is caught at the executor boundary and reported as a
//!   failure of kind [`FailureKind::Panic`].
//! - The cancellation token is checked before every stage and raced against it.
//! - Lifecycle events are observational: a publish failure is logged and never
//!   changes the result returned to the caller.

use crate::error::{PipelineBuildError, PipelineError};
use crate::stages::StandardStages;
use bks_pipeline_core::config::AppConfig;
use bks_pipeline_core::context::{FailureKind, PipelineContext, PipelineState};
use bks_pipeline_core::dispatch::short_type_name;
use bks_pipeline_core::environment::{Clock, SystemClock};
use bks_pipeline_core::event::{
    DomainEvent, EventPayload, TransactionCancelled, TransactionCompleted, TransactionFailed,
    TransactionStarted,
};
use bks_pipeline_core::event_bus::{EventBus, EventPublisherExt};
use bks_pipeline_core::metrics::PipelineMetrics;
use bks_pipeline_core::outcome::Outcome;
use bks_pipeline_core::stage::{Stage, StageOutput, StagePhase};
use futures::FutureExt;
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Builder for [`Pipeline`].
pub struct PipelineBuilder<Req, Resp> {
    name: String,
    stages: Vec<Box<dyn Stage<Req, Resp>>>,
    standard: Option<StandardStages<Req, Resp>>,
    event_bus: Option<Arc<dyn EventBus>>,
    metrics: Option<Arc<PipelineMetrics>>,
    clock: Arc<dyn Clock>,
    timeout: Option<Duration>,
}

impl<Req, Resp> PipelineBuilder<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Send + Sync + 'static,
{
    /// Start building a pipeline called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            standard: None,
            event_bus: None,
            metrics: None,
            clock: Arc::new(SystemClock),
            timeout: None,
        }
    }

    /// Add a stage. Stages may be added in any order; they run by `order()`.
    #[must_use]
    pub fn stage(mut self, stage: impl Stage<Req, Resp> + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Add an already boxed stage.
    #[must_use]
    pub fn boxed_stage(mut self, stage: Box<dyn Stage<Req, Resp>>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Use the standard validate/prepare/execute/finalize stages.
    ///
    /// The prepare stage publishes through the same event bus as the executor.
    #[must_use]
    pub fn standard_stages(mut self, stages: StandardStages<Req, Resp>) -> Self {
        self.standard = Some(stages);
        self
    }

    /// Publish lifecycle events to `event_bus`. Without one, events are skipped.
    #[must_use]
    pub fn event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Same as [`event_bus`](Self::event_bus) but accepts "events disabled".
    #[must_use]
    pub fn maybe_event_bus(mut self, event_bus: Option<Arc<dyn EventBus>>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Share a metrics collector. A private one is created otherwise.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Clock used to stamp lifecycle events.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Fail executions that run longer than `timeout`.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Same as [`timeout`](Self::timeout) but accepts "no deadline".
    #[must_use]
    pub const fn maybe_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Apply the pipeline options from application configuration.
    ///
    /// Sets the deadline from `PipelineTimeoutMs`; without one the pipeline has none.
    #[must_use]
    pub fn config(self, config: &AppConfig) -> Self {
        self.maybe_timeout(config.pipeline_timeout())
    }

    /// Validate stage orders and freeze the pipeline.
    ///
    /// # Errors
    ///
    /// - [`PipelineBuildError::Empty`] if no stage was added
    /// - [`PipelineBuildError::InvalidOrder`] if a stage has order 0
    /// - [`PipelineBuildError::DuplicateOrder`] if two stages share an order
    pub fn build(self) -> Result<Pipeline<Req, Resp>, PipelineBuildError> {
        let Self {
            name,
            mut stages,
            standard,
            event_bus,
            metrics,
            clock,
            timeout,
        } = self;

        if let Some(standard) = standard {
            stages.extend(standard.into_stages(event_bus.clone(), Arc::clone(&clock)));
        }

        if stages.is_empty() {
            return Err(PipelineBuildError::Empty { pipeline: name });
        }
        if let Some(stage) = stages.iter().find(|s| s.order() == 0) {
            return Err(PipelineBuildError::InvalidOrder {
                stage: stage.name().to_string(),
            });
        }

        stages.sort_by_key(|s| s.order());
        if let Some(pair) = stages.windows(2).find(|w| w[0].order() == w[1].order()) {
            return Err(PipelineBuildError::DuplicateOrder {
                order: pair[0].order(),
                first: pair[0].name().to_string(),
                second: pair[1].name().to_string(),
            });
        }

        tracing::debug!(
            pipeline = %name,
            stages = ?stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            events = event_bus.as_ref().map_or("disabled", |bus| bus.provider_name()),
            "Pipeline built"
        );

        install_panic_capture();
        Ok(Pipeline {
            name,
            request_type: short_type_name::<Req>(),
            stages,
            event_bus,
            metrics: metrics.unwrap_or_default(),
            clock,
            timeout,
        })
    }
}

/// An immutable, ordered list of stages plus the collaborators needed to run them.
///
/// A pipeline is built once and can run any number of requests concurrently;
/// every execution gets its own [`PipelineContext`].
pub struct Pipeline<Req, Resp> {
    name: String,
    request_type: String,
    stages: Vec<Box<dyn Stage<Req, Resp>>>,
    event_bus: Option<Arc<dyn EventBus>>,
    metrics: Arc<PipelineMetrics>,
    clock: Arc<dyn Clock>,
    timeout: Option<Duration>,
}

impl<Req, Resp> fmt::Debug for Pipeline<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stages", &self.stages.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<Req, Resp> Pipeline<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Send + Sync + 'static,
{
    /// Start building a pipeline called `name`.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> PipelineBuilder<Req, Resp> {
        PipelineBuilder::new(name)
    }

    /// Pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage names in execution order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Metrics collector this pipeline records into.
    #[must_use]
    pub const fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Run `request` through every stage.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::Failed`] when a stage fails or panics
    /// - [`PipelineError::Cancelled`] when `cancel` fires before or during a stage
    /// - [`PipelineError::TimedOut`] when the configured deadline passes
    pub async fn execute(&self, request: Req, cancel: CancellationToken) -> Result<Resp, PipelineError> {
        self.run(request, PipelineContext::new(self.name.clone(), cancel))
            .await
    }

    /// Like [`execute`](Self::execute) but continues an existing correlation id.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub async fn execute_with_correlation_id(
        &self,
        request: Req,
        correlation_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<Resp, PipelineError> {
        self.run(
            request,
            PipelineContext::with_correlation_id(self.name.clone(), correlation_id, cancel),
        )
        .await
    }

    #[tracing::instrument(
        skip_all,
        name = "pipeline_execute",
        fields(pipeline = %self.name, correlation_id = %ctx.correlation_id())
    )]
    async fn run(&self, request: Req, mut ctx: PipelineContext) -> Result<Resp, PipelineError> {
        self.metrics.record_execution_started(&self.name);

        let started = TransactionStarted {
            pipeline: self.name.clone(),
            request_type: self.request_type.clone(),
        };
        let cancel = ctx.cancellation().clone();
        self.publish_lifecycle(&ctx, started, Some(&cancel)).await;

        let result = match self.timeout {
            Some(limit) => {
                let bounded = tokio::time::timeout(limit, self.run_stages(&request, &mut ctx)).await;
                bounded.unwrap_or_else(|_| {
                    Err(PipelineError::TimedOut {
                        after: limit,
                        stage: ctx.current_stage().map(str::to_string),
                    })
                })
            },
            None => self.run_stages(&request, &mut ctx).await,
        };

        self.finish(&mut ctx, &result).await;
        result
    }

    async fn run_stages(&self, request: &Req, ctx: &mut PipelineContext) -> Result<Resp, PipelineError> {
        let cancel = ctx.cancellation().clone();
        let mut response: Option<Resp> = None;

        for stage in &self.stages {
            let name = stage.name();
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled {
                    stage: Some(name.to_string()),
                });
            }

            let phase = stage.phase();
            if let Err(e) = ctx.transition_to(phase.state()) {
                return Err(PipelineError::failed(name, FailureKind::Stage, e.to_string()));
            }
            ctx.enter_stage(name);
            tracing::debug!(stage = name, order = stage.order(), "Stage started");

            let stage_started = Instant::now();
            let guarded = AssertUnwindSafe(stage.execute(request, response.as_ref(), ctx)).catch_unwind();
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                result = guarded => Some(result),
            };
            let elapsed = stage_started.elapsed();
            ctx.record_stage(name, elapsed);
            self.metrics.record_stage(&self.name, name, elapsed);

            match result {
                None => {
                    tracing::info!(stage = name, "Pipeline cancelled during stage");
                    return Err(PipelineError::Cancelled {
                        stage: Some(name.to_string()),
                    });
                },
                Some(Err(payload)) => {
                    let message = panic_message(payload.as_ref());
                    if let Some(trace) = take_panic_site() {
                        ctx.record_fault_trace(trace);
                    }
                    tracing::error!(stage = name, error = %message, "Stage panicked");
                    return Err(PipelineError::failed(name, FailureKind::Panic, message));
                },
                Some(Ok(Outcome::Failure(message))) => {
                    let kind = ctx.take_failure_kind().unwrap_or(match phase {
                        StagePhase::Validate => FailureKind::Validation,
                        _ => FailureKind::Stage,
                    });
                    tracing::error!(stage = name, kind = %kind, error = %message, "Stage failed");
                    return Err(PipelineError::failed(name, kind, message));
                },
                Some(Ok(Outcome::Success(StageOutput::Respond(value)))) => {
                    tracing::debug!(stage = name, elapsed_ms = elapsed.as_millis(), "Stage produced a response");
                    response = Some(value);
                },
                Some(Ok(Outcome::Success(StageOutput::Continue))) => {
                    tracing::debug!(stage = name, elapsed_ms = elapsed.as_millis(), "Stage completed");
                },
            }
        }

        response.ok_or_else(|| {
            PipelineError::failed(
                "pipeline",
                FailureKind::Stage,
                "pipeline completed without a response",
            )
        })
    }

    async fn finish(&self, ctx: &mut PipelineContext, result: &Result<Resp, PipelineError>) {
        let state = match result {
            Ok(_) => PipelineState::Completed,
            Err(error) => error.terminal_state(),
        };
        if let Err(e) = ctx.transition_to(state) {
            tracing::warn!(error = %e, "Could not record terminal pipeline state");
        }

        let elapsed = ctx.elapsed();
        self.metrics.record_outcome(&self.name, state, elapsed);

        match result {
            Ok(_) => {
                tracing::info!(elapsed_ms = elapsed.as_millis(), "Pipeline completed");
                let completed = TransactionCompleted {
                    pipeline: self.name.clone(),
                    duration_ms: millis(elapsed),
                    stage_durations_ms: ctx
                        .stage_timings()
                        .iter()
                        .map(|(stage, d)| (stage.clone(), millis(*d)))
                        .collect::<BTreeMap<_, _>>(),
                };
                self.publish_lifecycle(ctx, completed, None).await;
            },
            Err(PipelineError::Cancelled { stage }) => {
                tracing::info!(stage = ?stage, "Pipeline cancelled");
                let cancelled = TransactionCancelled {
                    pipeline: self.name.clone(),
                    stage: stage.clone(),
                };
                self.publish_lifecycle(ctx, cancelled, None).await;
            },
            Err(error) => {
                tracing::error!(error = %error, elapsed_ms = elapsed.as_millis(), "Pipeline failed");
                let kind = error.kind().unwrap_or(FailureKind::Stage);
                let failed = TransactionFailed {
                    pipeline: self.name.clone(),
                    stage: error.stage().map(str::to_string),
                    error: error.to_string(),
                    kind: kind.as_str().to_string(),
                    stack_trace: (kind == FailureKind::Panic)
                        .then(|| ctx.fault_trace().map(str::to_string))
                        .flatten(),
                };
                self.publish_lifecycle(ctx, failed, None).await;
            },
        }
    }

    /// Publish a lifecycle event; failures are logged and dropped.
    async fn publish_lifecycle<E: EventPayload>(
        &self,
        ctx: &PipelineContext,
        payload: E,
        cancel: Option<&CancellationToken>,
    ) {
        let Some(bus) = &self.event_bus else {
            return;
        };

        let mut event = DomainEvent::new(payload)
            .with_correlation_id(ctx.correlation_id())
            .occurred_at(self.clock.now())
            .with_metadata("pipeline", self.name.clone());
        for (key, value) in ctx.metadata() {
            event = event.with_metadata(key.clone(), value.clone());
        }

        let published = match (event.to_envelope(), cancel) {
            (Ok(envelope), Some(cancel)) => bus.publish_cancellable(&envelope, cancel).await,
            (Ok(envelope), None) => bus.publish(&envelope, None).await,
            (Err(e), _) => Err(e.into()),
        };

        match published {
            Ok(()) => tracing::debug!(event_type = E::EVENT_TYPE, "Lifecycle event published"),
            Err(e) => tracing::warn!(
                event_type = E::EVENT_TYPE,
                provider = bus.provider_name(),
                error = %e,
                "Lifecycle event publish failed; pipeline result unaffected"
            ),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "stage panicked".to_string())
}

static PANIC_CAPTURE: Once = Once::new();

thread_local! {
    static PANIC_SITE: Cell<Option<String>> = const { Cell::new(None) };
}

/// Chain a panic hook that remembers where the last panic on this thread happened.
///
/// The stage future is polled inside `catch_unwind` on the panicking thread, so
/// the executor reads the slot on that same thread once the unwind is caught.
/// The previous hook still runs.
fn install_panic_capture() {
    PANIC_CAPTURE.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let mut trace = info
                .location()
                .map_or_else(|| "panicked at an unknown location".to_string(), |l| format!("panicked at {l}"));
            let backtrace = Backtrace::capture();
            if backtrace.status() == BacktraceStatus::Captured {
                trace.push('\n');
                trace.push_str(&backtrace.to_string());
            }
            PANIC_SITE.with(|slot| slot.set(Some(trace)));
            previous(info);
        }));
    });
}

fn take_panic_site() -> Option<String> {
    PANIC_SITE.with(Cell::take)
}

#[allow(clippy::cast_possible_truncation)]
const fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use bks_pipeline_core::stage::StageFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Amount(i64);

    struct Step {
        name: &'static str,
        order: u32,
        runs: Arc<AtomicUsize>,
        behavior: Behavior,
    }

    #[derive(Clone, Copy)]
    enum Behavior {
        Continue,
        Respond(i64),
        Fail(&'static str),
        Panic,
        Cancel,
        Sleep(Duration),
    }

    struct Cancels(CancellationToken);

    impl Step {
        fn new(name: &'static str, order: u32, behavior: Behavior) -> (Self, Arc<AtomicUsize>) {
            let runs = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    name,
                    order,
                    runs: Arc::clone(&runs),
                    behavior,
                },
                runs,
            )
        }
    }

    impl Stage<Amount, i64> for Step {
        fn name(&self) -> &str {
            self.name
        }

        fn order(&self) -> u32 {
            self.order
        }

        fn execute<'a>(
            &'a self,
            request: &'a Amount,
            response: Option<&'a i64>,
            ctx: &'a mut PipelineContext,
        ) -> StageFuture<'a, i64> {
            Box::pin(async move {
                self.runs.fetch_add(1, Ordering::SeqCst);
                match self.behavior {
                    Behavior::Continue => Outcome::Success(StageOutput::Continue),
                    Behavior::Respond(bonus) => {
                        Outcome::Success(StageOutput::Respond(request.0 + bonus + response.copied().unwrap_or(0)))
                    },
                    Behavior::Fail(message) => Outcome::failure(message),
                    Behavior::Panic => panic!("ledger exploded"),
                    Behavior::Cancel => {
                        ctx.cancellation().cancel();
                        Outcome::Success(StageOutput::Continue)
                    },
                    Behavior::Sleep(duration) => {
                        tokio::time::sleep(duration).await;
                        Outcome::Success(StageOutput::Continue)
                    },
                }
            })
        }
    }

    impl Stage<Amount, i64> for Cancels {
        fn name(&self) -> &str {
            "cancels"
        }

        fn order(&self) -> u32 {
            2
        }

        fn execute<'a>(
            &'a self,
            _request: &'a Amount,
            _response: Option<&'a i64>,
            _ctx: &'a mut PipelineContext,
        ) -> StageFuture<'a, i64> {
            Box::pin(async move {
                self.0.cancel();
                futures::future::pending::<()>().await;
                Outcome::Success(StageOutput::Continue)
            })
        }
    }

    #[tokio::test]
    async fn stages_run_in_order_and_last_response_wins() {
        let (first, _) = Step::new("execute", 3, Behavior::Respond(1));
        let (second, _) = Step::new("enrich", 4, Behavior::Respond(100));
        let (validate, validate_runs) = Step::new("validate", 1, Behavior::Continue);

        let pipeline = Pipeline::builder("credit")
            .stage(second)
            .stage(first)
            .stage(validate)
            .build()
            .unwrap();

        assert_eq!(pipeline.stage_names(), vec!["validate", "execute", "enrich"]);
        let response = pipeline.execute(Amount(10), CancellationToken::new()).await.unwrap();
        assert_eq!(response, 10 + 100 + 11);
        assert_eq!(validate_runs.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.metrics().snapshot().completed, 1);
    }

    #[tokio::test]
    async fn failure_short_circuits_later_stages() {
        let (validate, _) = Step::new("validate", 1, Behavior::Fail("amount must be positive"));
        let (execute, execute_runs) = Step::new("execute", 3, Behavior::Respond(0));

        let pipeline = Pipeline::builder("credit").stage(validate).stage(execute).build().unwrap();
        let error = pipeline.execute(Amount(-5), CancellationToken::new()).await.unwrap_err();

        assert_eq!(error.to_string(), "amount must be positive");
        assert_eq!(error.kind(), Some(FailureKind::Validation));
        assert_eq!(error.stage(), Some("validate"));
        assert_eq!(execute_runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panic_becomes_failure() {
        let (boom, _) = Step::new("execute", 3, Behavior::Panic);
        let (finalize, finalize_runs) = Step::new("finalize", 4, Behavior::Continue);

        let pipeline = Pipeline::builder("credit").stage(boom).stage(finalize).build().unwrap();
        let error = pipeline.execute(Amount(1), CancellationToken::new()).await.unwrap_err();

        assert_eq!(error.kind(), Some(FailureKind::Panic));
        assert_eq!(error.to_string(), "ledger exploded");
        assert_eq!(finalize_runs.load(Ordering::SeqCst), 0);
        assert!(take_panic_site().is_none());
        assert_eq!(pipeline.metrics().snapshot().failed, 1);
    }

    #[tokio::test]
    async fn cancellation_before_a_stage_skips_it() {
        let (validate, _) = Step::new("validate", 1, Behavior::Cancel);
        let (prepare, prepare_runs) = Step::new("prepare", 2, Behavior::Continue);

        let pipeline = Pipeline::builder("credit").stage(validate).stage(prepare).build().unwrap();
        let error = pipeline.execute(Amount(1), CancellationToken::new()).await.unwrap_err();

        assert_eq!(
            error,
            PipelineError::Cancelled {
                stage: Some("prepare".to_string())
            }
        );
        assert_eq!(prepare_runs.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.metrics().snapshot().cancelled, 1);
    }

    #[tokio::test]
    async fn cancellation_during_a_stage_interrupts_it() {
        let token = CancellationToken::new();
        let (finalize, finalize_runs) = Step::new("finalize", 4, Behavior::Continue);

        let pipeline = Pipeline::builder("credit")
            .stage(Cancels(token.clone()))
            .stage(finalize)
            .build()
            .unwrap();
        let error = pipeline.execute(Amount(1), token).await.unwrap_err();

        assert!(error.is_cancelled());
        assert_eq!(error.stage(), Some("cancels"));
        assert_eq!(finalize_runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_yields_timed_out() {
        let (slow, _) = Step::new("execute", 3, Behavior::Sleep(Duration::from_secs(60)));

        let pipeline = Pipeline::builder("credit")
            .stage(slow)
            .timeout(Duration::from_secs(1))
            .build()
            .unwrap();
        let error = pipeline.execute(Amount(1), CancellationToken::new()).await.unwrap_err();

        assert_eq!(
            error,
            PipelineError::TimedOut {
                after: Duration::from_secs(1),
                stage: Some("execute".to_string()),
            }
        );
        assert_eq!(pipeline.metrics().snapshot().timed_out, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn configured_deadline_yields_timed_out() {
        let (slow, _) = Step::new("execute", 3, Behavior::Sleep(Duration::from_secs(60)));
        let config = AppConfig {
            pipeline_timeout_ms: Some(250),
            ..AppConfig::default()
        };

        let pipeline = Pipeline::builder("credit").stage(slow).config(&config).build().unwrap();
        let error = pipeline.execute(Amount(1), CancellationToken::new()).await.unwrap_err();

        assert!(matches!(error, PipelineError::TimedOut { after, .. } if after == Duration::from_millis(250)));
    }

    #[tokio::test]
    async fn no_response_is_a_failure() {
        let (validate, _) = Step::new("validate", 1, Behavior::Continue);
        let pipeline = Pipeline::builder("credit").stage(validate).build().unwrap();

        let error = pipeline.execute(Amount(1), CancellationToken::new()).await.unwrap_err();
        assert_eq!(error.to_string(), "pipeline completed without a response");
    }

    #[test]
    fn build_rejects_bad_orders() {
        let empty = Pipeline::<Amount, i64>::builder("p").build().unwrap_err();
        assert!(matches!(empty, PipelineBuildError::Empty { .. }));

        let (zero, _) = Step::new("zero", 0, Behavior::Continue);
        let invalid = Pipeline::builder("p").stage(zero).build().unwrap_err();
        assert_eq!(invalid, PipelineBuildError::InvalidOrder { stage: "zero".to_string() });

        let (a, _) = Step::new("a", 2, Behavior::Continue);
        let (b, _) = Step::new("b", 2, Behavior::Continue);
        let duplicate = Pipeline::builder("p").stage(a).stage(b).build().unwrap_err();
        assert!(matches!(duplicate, PipelineBuildError::DuplicateOrder { order: 2, .. }));
    }

    #[test]
    fn panic_messages_are_extracted() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        let other: Box<dyn Any + Send> = Box::new(42_u8);

        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "borrowed");
        assert_eq!(panic_message(other.as_ref()), "stage panicked");
    }
}
