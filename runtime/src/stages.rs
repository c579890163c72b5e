//! Standard validate, prepare, execute and finalize stages.
//!
//! Each stage is assembled from parts registered explicitly at the composition
//! root; nothing is discovered at runtime.
//!
//! | stage | order | parts | on failure |
//! |---|---|---|---|
//! | [`ValidateStage`] | 1 | [`Validator`]s | first rejection wins, pipeline stops |
//! | [`PrepareStage`] | 2 | [`Preparer`]s, then a Processing event | pipeline stops |
//! | [`ExecuteStage`] | 3 | [`DispatchResolver`] | pipeline stops |
//! | [`FinalizeStage`] | 4 | [`Finalizer`]s | logged, never fails |
//!
//! # Example
//!
//! ```rust,ignore
//! let stages = StandardStages::new(Arc::new(resolver))
//!     .validator(validator_fn(|cmd: &CreditCommand| {
//!         if cmd.amount > 0 { Outcome::Success(()) } else { Outcome::failure("amount must be positive") }
//!     }))
//!     .finalizer(AuditTrail::new(log));
//!
//! let pipeline = Pipeline::builder("credit").standard_stages(stages).event_bus(bus).build()?;
//! ```

use bks_pipeline_core::context::{FailureKind, PipelineContext};
use bks_pipeline_core::dispatch::DispatchResolver;
use bks_pipeline_core::environment::Clock;
use bks_pipeline_core::event::{DomainEvent, TransactionProcessing};
use bks_pipeline_core::event_bus::{BoxFuture, EventBus, EventPublisherExt};
use bks_pipeline_core::outcome::Outcome;
use bks_pipeline_core::stage::{Stage, StageFuture, StageOutput};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Synchronous request check run by [`ValidateStage`].
pub trait Validator<Req>: Send + Sync {
    /// Accept (`Success(())`) or reject the request with a message.
    fn validate(&self, request: &Req) -> Outcome<()>;
}

/// [`Validator`] backed by a closure. See [`validator_fn`].
pub struct FnValidator<F>(F);

/// Wrap a closure as a [`Validator`].
pub const fn validator_fn<F>(f: F) -> FnValidator<F> {
    FnValidator(f)
}

impl<Req, F> Validator<Req> for FnValidator<F>
where
    F: Fn(&Req) -> Outcome<()> + Send + Sync,
{
    fn validate(&self, request: &Req) -> Outcome<()> {
        (self.0)(request)
    }
}

/// Pre-flight hook run by [`PrepareStage`] before the request is executed.
pub trait Preparer<Req>: Send + Sync {
    /// Run the check. May annotate `ctx` (its metadata ends up on lifecycle events).
    fn prepare<'a>(&'a self, request: &'a Req, ctx: &'a mut PipelineContext) -> BoxFuture<'a, Outcome<()>>;
}

/// [`Preparer`] backed by a synchronous closure. See [`preparer_fn`].
pub struct FnPreparer<F>(F);

/// Wrap a synchronous closure as a [`Preparer`].
pub const fn preparer_fn<F>(f: F) -> FnPreparer<F> {
    FnPreparer(f)
}

impl<Req, F> Preparer<Req> for FnPreparer<F>
where
    Req: Sync,
    F: Fn(&Req, &mut PipelineContext) -> Outcome<()> + Send + Sync,
{
    fn prepare<'a>(&'a self, request: &'a Req, ctx: &'a mut PipelineContext) -> BoxFuture<'a, Outcome<()>> {
        Box::pin(async move { (self.0)(request, ctx) })
    }
}

/// Best-effort cleanup or notification run by [`FinalizeStage`].
pub trait Finalizer<Req, Resp>: Send + Sync {
    /// Run the hook. `response` is the response produced by the execute stage.
    fn finalize<'a>(
        &'a self,
        request: &'a Req,
        response: Option<&'a Resp>,
        ctx: &'a PipelineContext,
    ) -> BoxFuture<'a, Outcome<()>>;
}

/// [`Finalizer`] backed by a synchronous closure. See [`finalizer_fn`].
pub struct FnFinalizer<F>(F);

/// Wrap a synchronous closure as a [`Finalizer`].
pub const fn finalizer_fn<F>(f: F) -> FnFinalizer<F> {
    FnFinalizer(f)
}

impl<Req, Resp, F> Finalizer<Req, Resp> for FnFinalizer<F>
where
    Req: Sync,
    Resp: Sync,
    F: Fn(&Req, Option<&Resp>, &PipelineContext) -> Outcome<()> + Send + Sync,
{
    fn finalize<'a>(
        &'a self,
        request: &'a Req,
        response: Option<&'a Resp>,
        ctx: &'a PipelineContext,
    ) -> BoxFuture<'a, Outcome<()>> {
        Box::pin(async move { (self.0)(request, response, ctx) })
    }
}

/// Order 1: rejects malformed requests before any side effect.
pub struct ValidateStage<Req> {
    validators: Vec<Box<dyn Validator<Req>>>,
}

impl<Req> ValidateStage<Req> {
    /// Stage running `validators` in registration order.
    #[must_use]
    pub fn new(validators: Vec<Box<dyn Validator<Req>>>) -> Self {
        Self { validators }
    }
}

impl<Req, Resp> Stage<Req, Resp> for ValidateStage<Req>
where
    Req: Send + Sync,
    Resp: Send + Sync,
{
    fn name(&self) -> &str {
        "validate"
    }

    fn order(&self) -> u32 {
        1
    }

    fn execute<'a>(
        &'a self,
        request: &'a Req,
        _response: Option<&'a Resp>,
        ctx: &'a mut PipelineContext,
    ) -> StageFuture<'a, Resp> {
        Box::pin(async move {
            for validator in &self.validators {
                if let Outcome::Failure(message) = validator.validate(request) {
                    ctx.classify_failure(FailureKind::Validation);
                    return Outcome::Failure(message);
                }
            }
            Outcome::Success(StageOutput::Continue)
        })
    }
}

/// Order 2: pre-flight hooks, then a Processing event.
pub struct PrepareStage<Req> {
    preparers: Vec<Box<dyn Preparer<Req>>>,
    event_bus: Option<Arc<dyn EventBus>>,
    clock: Arc<dyn Clock>,
    require_processing_event: bool,
}

impl<Req> PrepareStage<Req> {
    /// Stage running `preparers`, then publishing to `event_bus` if present.
    #[must_use]
    pub fn new(
        preparers: Vec<Box<dyn Preparer<Req>>>,
        event_bus: Option<Arc<dyn EventBus>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            preparers,
            event_bus,
            clock,
            require_processing_event: false,
        }
    }

    /// Fail the stage when the Processing event cannot be published.
    ///
    /// Off by default: the publish error is logged and the pipeline continues.
    #[must_use]
    pub const fn require_processing_event(mut self, required: bool) -> Self {
        self.require_processing_event = required;
        self
    }

    async fn announce(&self, ctx: &PipelineContext) -> Outcome<()> {
        let Some(bus) = &self.event_bus else {
            return Outcome::Success(());
        };

        let mut event = DomainEvent::new(TransactionProcessing {
            pipeline: ctx.pipeline().to_string(),
            stage: "prepare".to_string(),
        })
        .with_correlation_id(ctx.correlation_id())
        .occurred_at(self.clock.now())
        .with_metadata("pipeline", ctx.pipeline());
        for (key, value) in ctx.metadata() {
            event = event.with_metadata(key.clone(), value.clone());
        }

        let published = match event.to_envelope() {
            Ok(envelope) => bus.publish_cancellable(&envelope, ctx.cancellation()).await,
            Err(e) => Err(e.into()),
        };

        match published {
            Ok(()) => Outcome::Success(()),
            Err(e) if self.require_processing_event => {
                Outcome::failure(format!("processing event publish failed: {e}"))
            },
            Err(e) => {
                tracing::warn!(
                    correlation_id = %ctx.correlation_id(),
                    provider = bus.provider_name(),
                    error = %e,
                    "Processing event publish failed; continuing"
                );
                Outcome::Success(())
            },
        }
    }
}

impl<Req, Resp> Stage<Req, Resp> for PrepareStage<Req>
where
    Req: Send + Sync,
    Resp: Send + Sync,
{
    fn name(&self) -> &str {
        "prepare"
    }

    fn order(&self) -> u32 {
        2
    }

    fn execute<'a>(
        &'a self,
        request: &'a Req,
        _response: Option<&'a Resp>,
        ctx: &'a mut PipelineContext,
    ) -> StageFuture<'a, Resp> {
        Box::pin(async move {
            for preparer in &self.preparers {
                if let Outcome::Failure(message) = preparer.prepare(request, ctx).await {
                    return Outcome::Failure(message);
                }
            }
            self.announce(ctx).await.map(|()| StageOutput::Continue)
        })
    }
}

/// Order 3: hands the request to the [`DispatchResolver`].
#[derive(Clone, Debug)]
pub struct ExecuteStage {
    resolver: Arc<DispatchResolver>,
}

impl ExecuteStage {
    /// Stage dispatching through `resolver`.
    #[must_use]
    pub const fn new(resolver: Arc<DispatchResolver>) -> Self {
        Self { resolver }
    }
}

impl<Req, Resp> Stage<Req, Resp> for ExecuteStage
where
    Req: Send + Sync + 'static,
    Resp: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "execute"
    }

    fn order(&self) -> u32 {
        3
    }

    fn execute<'a>(
        &'a self,
        request: &'a Req,
        _response: Option<&'a Resp>,
        ctx: &'a mut PipelineContext,
    ) -> StageFuture<'a, Resp> {
        Box::pin(async move {
            if !self.resolver.has_route::<Req, Resp>() {
                ctx.classify_failure(FailureKind::NoHandler);
            }
            self.resolver
                .dispatch::<Req, Resp>(request, ctx)
                .await
                .map(StageOutput::Respond)
        })
    }
}

/// Order 4: best-effort hooks. Always succeeds.
pub struct FinalizeStage<Req, Resp> {
    finalizers: Vec<Box<dyn Finalizer<Req, Resp>>>,
}

impl<Req, Resp> FinalizeStage<Req, Resp> {
    /// Stage running every finalizer in registration order.
    #[must_use]
    pub fn new(finalizers: Vec<Box<dyn Finalizer<Req, Resp>>>) -> Self {
        Self { finalizers }
    }
}

impl<Req, Resp> Stage<Req, Resp> for FinalizeStage<Req, Resp>
where
    Req: Send + Sync,
    Resp: Send + Sync,
{
    fn name(&self) -> &str {
        "finalize"
    }

    fn order(&self) -> u32 {
        4
    }

    fn execute<'a>(
        &'a self,
        request: &'a Req,
        response: Option<&'a Resp>,
        ctx: &'a mut PipelineContext,
    ) -> StageFuture<'a, Resp> {
        Box::pin(async move {
            let ctx: &PipelineContext = ctx;
            for (index, finalizer) in self.finalizers.iter().enumerate() {
                match AssertUnwindSafe(finalizer.finalize(request, response, ctx))
                    .catch_unwind()
                    .await
                {
                    Ok(Outcome::Success(())) => {},
                    Ok(Outcome::Failure(message)) => tracing::warn!(
                        correlation_id = %ctx.correlation_id(),
                        finalizer = index,
                        error = %message,
                        "Finalizer failed; ignored"
                    ),
                    Err(_) => tracing::warn!(
                        correlation_id = %ctx.correlation_id(),
                        finalizer = index,
                        "Finalizer panicked; ignored"
                    ),
                }
            }
            Outcome::Success(StageOutput::Continue)
        })
    }
}

/// Parts for the four standard stages, handed to
/// [`PipelineBuilder::standard_stages`](crate::PipelineBuilder::standard_stages).
pub struct StandardStages<Req, Resp> {
    validators: Vec<Box<dyn Validator<Req>>>,
    preparers: Vec<Box<dyn Preparer<Req>>>,
    resolver: Arc<DispatchResolver>,
    finalizers: Vec<Box<dyn Finalizer<Req, Resp>>>,
    require_processing_event: bool,
}

impl<Req, Resp> StandardStages<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Send + Sync + 'static,
{
    /// Standard stages dispatching through `resolver`, with no hooks yet.
    #[must_use]
    pub fn new(resolver: Arc<DispatchResolver>) -> Self {
        Self {
            validators: Vec::new(),
            preparers: Vec::new(),
            resolver,
            finalizers: Vec::new(),
            require_processing_event: false,
        }
    }

    /// Add a validator.
    #[must_use]
    pub fn validator(mut self, validator: impl Validator<Req> + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    /// Add a pre-flight hook.
    #[must_use]
    pub fn preparer(mut self, preparer: impl Preparer<Req> + 'static) -> Self {
        self.preparers.push(Box::new(preparer));
        self
    }

    /// Add a finalize hook.
    #[must_use]
    pub fn finalizer(mut self, finalizer: impl Finalizer<Req, Resp> + 'static) -> Self {
        self.finalizers.push(Box::new(finalizer));
        self
    }

    /// See [`PrepareStage::require_processing_event`].
    #[must_use]
    pub const fn require_processing_event(mut self, required: bool) -> Self {
        self.require_processing_event = required;
        self
    }

    pub(crate) fn into_stages(
        self,
        event_bus: Option<Arc<dyn EventBus>>,
        clock: Arc<dyn Clock>,
    ) -> Vec<Box<dyn Stage<Req, Resp>>> {
        vec![
            Box::new(ValidateStage::new(self.validators)),
            Box::new(
                PrepareStage::new(self.preparers, event_bus, clock)
                    .require_processing_event(self.require_processing_event),
            ),
            Box::new(ExecuteStage::new(self.resolver)),
            Box::new(FinalizeStage::new(self.finalizers)),
        ]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use bks_pipeline_core::dispatch::{HandlerRegistry, ProcessingMode, ProcessorRegistry, RequestHandler};
    use bks_pipeline_core::environment::SystemClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct Credit(i64);
    #[derive(Debug, PartialEq)]
    struct Credited(i64);

    struct CreditHandler;

    impl RequestHandler<Credit, Credited> for CreditHandler {
        fn handle<'a>(&'a self, request: &'a Credit, _ctx: &'a PipelineContext) -> BoxFuture<'a, Outcome<Credited>> {
            Box::pin(async move { Outcome::Success(Credited(request.0)) })
        }
    }

    fn ctx() -> PipelineContext {
        PipelineContext::new("credit", CancellationToken::new())
    }

    fn resolver(with_handler: bool) -> Arc<DispatchResolver> {
        let mut handlers = HandlerRegistry::builder();
        if with_handler {
            handlers = handlers.register::<Credit, Credited, _>(CreditHandler);
        }
        Arc::new(DispatchResolver::new(
            ProcessingMode::RequestResponse,
            handlers.build().unwrap(),
            ProcessorRegistry::empty(),
        ))
    }

    #[tokio::test]
    async fn first_rejecting_validator_wins() {
        let stage = ValidateStage::new(vec![
            Box::new(validator_fn(|c: &Credit| {
                if c.0 > 0 { Outcome::Success(()) } else { Outcome::failure("amount must be positive") }
            })),
            Box::new(validator_fn(|_: &Credit| Outcome::failure("never reached"))),
        ]);
        let mut ctx = ctx();

        let outcome = Stage::<Credit, Credited>::execute(&stage, &Credit(-5), None, &mut ctx).await;
        assert_eq!(outcome.error(), Some("amount must be positive"));
        assert_eq!(ctx.take_failure_kind(), Some(FailureKind::Validation));
    }

    #[tokio::test]
    async fn preparers_can_annotate_the_context() {
        let stage = PrepareStage::new(
            vec![Box::new(preparer_fn(|c: &Credit, ctx: &mut PipelineContext| {
                ctx.insert_metadata("amount", c.0.to_string());
                Outcome::Success(())
            }))],
            None,
            Arc::new(SystemClock),
        );
        let mut ctx = ctx();

        let outcome = Stage::<Credit, Credited>::execute(&stage, &Credit(7), None, &mut ctx).await;
        assert!(outcome.is_success());
        assert_eq!(ctx.metadata().get("amount").map(String::as_str), Some("7"));
    }

    #[tokio::test]
    async fn execute_stage_responds_with_handler_result() {
        let stage = ExecuteStage::new(resolver(true));
        let mut ctx = ctx();

        let outcome = Stage::<Credit, Credited>::execute(&stage, &Credit(3), None, &mut ctx).await;
        match outcome {
            Outcome::Success(StageOutput::Respond(response)) => assert_eq!(response, Credited(3)),
            other => panic!("unexpected outcome: {:?}", other.error()),
        }
    }

    #[tokio::test]
    async fn execute_stage_classifies_missing_handler() {
        let stage = ExecuteStage::new(resolver(false));
        let mut ctx = ctx();

        let outcome = Stage::<Credit, Credited>::execute(&stage, &Credit(3), None, &mut ctx).await;
        assert_eq!(outcome.error(), Some("no handler registered for Credit→Credited"));
        assert_eq!(ctx.take_failure_kind(), Some(FailureKind::NoHandler));
    }

    #[tokio::test]
    async fn finalize_swallows_failures_and_panics() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let stage: FinalizeStage<Credit, Credited> = FinalizeStage::new(vec![
            Box::new(finalizer_fn(|_: &Credit, _: Option<&Credited>, _: &PipelineContext| {
                Outcome::failure("audit log unavailable")
            })),
            Box::new(finalizer_fn(|_: &Credit, _: Option<&Credited>, _: &PipelineContext| -> Outcome<()> {
                panic!("notifier crashed")
            })),
            Box::new(finalizer_fn(move |_: &Credit, response: Option<&Credited>, _: &PipelineContext| {
                assert_eq!(response, Some(&Credited(9)));
                counter.fetch_add(1, Ordering::SeqCst);
                Outcome::Success(())
            })),
        ]);
        let mut ctx = ctx();

        let outcome = stage.execute(&Credit(9), Some(&Credited(9)), &mut ctx).await;
        assert!(outcome.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
