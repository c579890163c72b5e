//! End-to-end pipeline scenarios over the standard stages.
//!
//! Each test builds a credit pipeline (Validate → Prepare → Execute → Finalize)
//! with an in-memory event bus and checks both the caller-visible result and the
//! lifecycle events that were published.

#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use bks_pipeline_core::config::AppConfig;
use bks_pipeline_core::context::{FailureKind, PipelineContext};
use bks_pipeline_core::dispatch::{
    DispatchResolver, HandlerRegistry, ProcessingMode, ProcessorRegistry, RequestHandler, TransactionProcessor,
};
use bks_pipeline_core::event::{EventPayload, TransactionCancelled, TransactionCompleted, TransactionFailed, TransactionProcessing, TransactionStarted};
use bks_pipeline_core::event_bus::{BoxFuture, EventBus, EventSubscriber};
use bks_pipeline_core::metrics::PipelineMetrics;
use bks_pipeline_core::outcome::Outcome;
use bks_pipeline_core::CancellationToken;
use bks_pipeline_runtime::error::PipelineError;
use bks_pipeline_runtime::{InMemoryEventBus, Pipeline, StandardStages, finalizer_fn, preparer_fn, validator_fn};
use bks_pipeline_testing::{CountingStage, RecordingHandler, StageBehavior, init_test_tracing, test_clock};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
struct CreditCommand {
    account: String,
    amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CreditResponse {
    balance: i64,
}

#[derive(Default)]
struct CreditHandler {
    calls: AtomicUsize,
}

impl RequestHandler<CreditCommand, CreditResponse> for CreditHandler {
    fn handle<'a>(
        &'a self,
        request: &'a CreditCommand,
        _ctx: &'a PipelineContext,
    ) -> BoxFuture<'a, Outcome<CreditResponse>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Outcome::Success(CreditResponse {
                balance: 100 + request.amount,
            })
        })
    }
}

struct PanickingProcessor;

impl TransactionProcessor<CreditCommand, CreditResponse> for PanickingProcessor {
    fn process<'a>(
        &'a self,
        _request: &'a CreditCommand,
        _ctx: &'a PipelineContext,
    ) -> BoxFuture<'a, Outcome<CreditResponse>> {
        Box::pin(async move { panic!("ledger exploded") })
    }
}

struct SlowHandler;

impl RequestHandler<CreditCommand, CreditResponse> for SlowHandler {
    fn handle<'a>(
        &'a self,
        _request: &'a CreditCommand,
        _ctx: &'a PipelineContext,
    ) -> BoxFuture<'a, Outcome<CreditResponse>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Outcome::Success(CreditResponse { balance: 0 })
        })
    }
}

/// Subscribes a recorder to every lifecycle event type.
struct Lifecycle {
    started: RecordingHandler,
    processing: RecordingHandler,
    completed: RecordingHandler,
    failed: RecordingHandler,
    cancelled: RecordingHandler,
}

impl Lifecycle {
    async fn attach(bus: &InMemoryEventBus) -> Self {
        let lifecycle = Self {
            started: RecordingHandler::new(),
            processing: RecordingHandler::new(),
            completed: RecordingHandler::new(),
            failed: RecordingHandler::new(),
            cancelled: RecordingHandler::new(),
        };
        for (event_type, recorder) in [
            (TransactionStarted::EVENT_TYPE, &lifecycle.started),
            (TransactionProcessing::EVENT_TYPE, &lifecycle.processing),
            (TransactionCompleted::EVENT_TYPE, &lifecycle.completed),
            (TransactionFailed::EVENT_TYPE, &lifecycle.failed),
            (TransactionCancelled::EVENT_TYPE, &lifecycle.cancelled),
        ] {
            bus.subscribe(event_type, recorder.handler(), None).await.unwrap();
        }
        lifecycle
    }
}

fn positive_amount() -> impl bks_pipeline_runtime::Validator<CreditCommand> {
    validator_fn(|cmd: &CreditCommand| {
        if cmd.amount > 0 {
            Outcome::Success(())
        } else {
            Outcome::failure("amount must be positive")
        }
    })
}

fn credit(amount: i64) -> CreditCommand {
    CreditCommand {
        account: "acc-1".to_string(),
        amount,
    }
}

fn request_response(handler: impl RequestHandler<CreditCommand, CreditResponse> + 'static) -> Arc<DispatchResolver> {
    let handlers = HandlerRegistry::builder()
        .register::<CreditCommand, CreditResponse, _>(handler)
        .build()
        .unwrap();
    Arc::new(DispatchResolver::new(
        ProcessingMode::RequestResponse,
        handlers,
        ProcessorRegistry::empty(),
    ))
}

#[tokio::test]
async fn successful_credit_publishes_full_lifecycle() {
    init_test_tracing();
    let bus = Arc::new(InMemoryEventBus::new("bks"));
    let lifecycle = Lifecycle::attach(&bus).await;
    let finalized = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&finalized);

    let stages = StandardStages::new(request_response(CreditHandler::default()))
        .validator(positive_amount())
        .preparer(preparer_fn(|cmd: &CreditCommand, ctx: &mut PipelineContext| {
            ctx.insert_metadata("account", cmd.account.clone());
            Outcome::Success(())
        }))
        .finalizer(finalizer_fn(move |_: &CreditCommand, response: Option<&CreditResponse>, _: &PipelineContext| {
            assert_eq!(response, Some(&CreditResponse { balance: 110 }));
            seen.fetch_add(1, Ordering::SeqCst);
            Outcome::Success(())
        }));
    let pipeline = Pipeline::builder("credit")
        .standard_stages(stages)
        .event_bus(bus.clone())
        .clock(Arc::new(test_clock()))
        .build()
        .unwrap();

    let response = pipeline
        .execute_with_correlation_id(credit(10), "corr-1", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response, CreditResponse { balance: 110 });
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
    assert_eq!(lifecycle.started.successes(), 1);
    assert_eq!(lifecycle.processing.successes(), 1);
    assert_eq!(lifecycle.completed.successes(), 1);
    assert_eq!(lifecycle.failed.calls(), 0);

    let completed = lifecycle.completed.events().remove(0);
    assert_eq!(completed.correlation_id.as_deref(), Some("corr-1"));
    assert_eq!(completed.occurred_on, test_clock_time());
    assert_eq!(completed.metadata.get("account").map(String::as_str), Some("acc-1"));
    let payload = completed.decode::<TransactionCompleted>().unwrap().data;
    assert_eq!(
        payload.stage_durations_ms.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["execute", "finalize", "prepare", "validate"]
    );
}

fn test_clock_time() -> chrono::DateTime<chrono::Utc> {
    use bks_pipeline_core::environment::Clock;
    test_clock().now()
}

#[tokio::test]
async fn negative_amount_fails_validation_and_skips_later_stages() {
    let handler = Arc::new(CreditHandler::default());
    let bus = Arc::new(InMemoryEventBus::new("bks"));
    let lifecycle = Lifecycle::attach(&bus).await;
    let finalize = CountingStage::<CreditResponse>::new("audit", 5, StageBehavior::Continue);

    let handlers = HandlerRegistry::builder()
        .register::<CreditCommand, CreditResponse, _>(SharedHandler(Arc::clone(&handler)))
        .build()
        .unwrap();
    let resolver = Arc::new(DispatchResolver::new(
        ProcessingMode::RequestResponse,
        handlers,
        ProcessorRegistry::empty(),
    ));
    let pipeline = Pipeline::builder("credit")
        .standard_stages(StandardStages::new(resolver).validator(positive_amount()))
        .stage(finalize.clone())
        .event_bus(bus.clone())
        .build()
        .unwrap();

    let error = pipeline.execute(credit(-5), CancellationToken::new()).await.unwrap_err();

    assert_eq!(error.to_string(), "amount must be positive");
    assert_eq!(error.kind(), Some(FailureKind::Validation));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    assert_eq!(finalize.runs(), 0);
    assert_eq!(lifecycle.processing.calls(), 0);

    let failed = lifecycle.failed.events().remove(0).decode::<TransactionFailed>().unwrap().data;
    assert_eq!(failed.error, "amount must be positive");
    assert_eq!(failed.kind, "validation");
    assert_eq!(failed.stage.as_deref(), Some("validate"));
}

struct SharedHandler(Arc<CreditHandler>);

impl RequestHandler<CreditCommand, CreditResponse> for SharedHandler {
    fn handle<'a>(
        &'a self,
        request: &'a CreditCommand,
        ctx: &'a PipelineContext,
    ) -> BoxFuture<'a, Outcome<CreditResponse>> {
        self.0.handle(request, ctx)
    }
}

#[tokio::test]
async fn missing_handler_names_both_types() -> anyhow::Result<()> {
    let resolver = Arc::new(DispatchResolver::new(
        ProcessingMode::RequestResponse,
        HandlerRegistry::empty(),
        ProcessorRegistry::empty(),
    ));
    let pipeline = Pipeline::<CreditCommand, CreditResponse>::builder("credit")
        .standard_stages(StandardStages::new(resolver))
        .build()?;

    let error = pipeline.execute(credit(10), CancellationToken::new()).await.unwrap_err();

    assert_eq!(
        error.to_string(),
        "no handler registered for CreditCommand→CreditResponse"
    );
    assert_eq!(error.kind(), Some(FailureKind::NoHandler));
    assert_eq!(error.stage(), Some("execute"));
    Ok(())
}

#[tokio::test]
async fn processor_mode_ignores_request_response_handlers() {
    let handlers = HandlerRegistry::builder()
        .register::<CreditCommand, CreditResponse, _>(CreditHandler::default())
        .build()
        .unwrap();
    let resolver = Arc::new(DispatchResolver::new(
        ProcessingMode::TransactionProcessor,
        handlers,
        ProcessorRegistry::empty(),
    ));
    let pipeline = Pipeline::<CreditCommand, CreditResponse>::builder("credit")
        .standard_stages(StandardStages::new(resolver))
        .build()
        .unwrap();

    let error = pipeline.execute(credit(10), CancellationToken::new()).await.unwrap_err();
    assert_eq!(
        error.to_string(),
        "no processor registered for CreditCommand→CreditResponse"
    );
}

#[tokio::test]
async fn panicking_processor_is_reported_as_a_fault() {
    let processors = ProcessorRegistry::builder()
        .register::<CreditCommand, CreditResponse, _>(PanickingProcessor)
        .build()
        .unwrap();
    let resolver = Arc::new(DispatchResolver::new(
        ProcessingMode::TransactionProcessor,
        HandlerRegistry::empty(),
        processors,
    ));
    let bus = Arc::new(InMemoryEventBus::new("bks"));
    let lifecycle = Lifecycle::attach(&bus).await;
    let metrics = Arc::new(PipelineMetrics::new());
    let pipeline = Pipeline::builder("credit")
        .standard_stages(StandardStages::<_, CreditResponse>::new(resolver))
        .event_bus(bus.clone())
        .metrics(Arc::clone(&metrics))
        .build()
        .unwrap();

    let error = pipeline.execute(credit(10), CancellationToken::new()).await.unwrap_err();

    assert_eq!(error.kind(), Some(FailureKind::Panic));
    assert_eq!(error.to_string(), "ledger exploded");
    assert_eq!(metrics.snapshot().failed, 1);
    let failed = lifecycle.failed.events().remove(0).decode::<TransactionFailed>().unwrap().data;
    assert_eq!(failed.kind, "panic");
    assert_eq!(failed.stage.as_deref(), Some("execute"));

    // The trace points at the processor that panicked, not at the executor.
    let trace = failed.stack_trace.unwrap();
    assert!(trace.starts_with("panicked at "), "{trace}");
    assert!(trace.contains("pipeline_scenarios.rs"), "{trace}");
}

#[tokio::test]
async fn cancellation_before_prepare_skips_its_side_effects() {
    let token = CancellationToken::new();
    let trigger = token.clone();
    let prepared = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&prepared);
    let bus = Arc::new(InMemoryEventBus::new("bks"));
    let lifecycle = Lifecycle::attach(&bus).await;

    let stages = StandardStages::<_, CreditResponse>::new(request_response(CreditHandler::default()))
        .validator(validator_fn(move |_: &CreditCommand| {
            trigger.cancel();
            Outcome::Success(())
        }))
        .preparer(preparer_fn(move |_: &CreditCommand, _: &mut PipelineContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            Outcome::Success(())
        }));
    let pipeline = Pipeline::builder("credit")
        .standard_stages(stages)
        .event_bus(bus.clone())
        .build()
        .unwrap();

    let error = pipeline.execute(credit(10), token).await.unwrap_err();

    assert_eq!(
        error,
        PipelineError::Cancelled {
            stage: Some("prepare".to_string())
        }
    );
    assert_eq!(prepared.load(Ordering::SeqCst), 0);
    assert_eq!(lifecycle.cancelled.successes(), 1);
    assert_eq!(lifecycle.failed.calls(), 0);
    assert_eq!(lifecycle.completed.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_handler_times_out() {
    let bus = Arc::new(InMemoryEventBus::new("bks"));
    let lifecycle = Lifecycle::attach(&bus).await;
    let config = AppConfig::from_toml_str("PipelineTimeoutMs = 2000").unwrap();
    let pipeline = Pipeline::builder("credit")
        .standard_stages(StandardStages::<_, CreditResponse>::new(request_response(SlowHandler)))
        .event_bus(bus.clone())
        .config(&config)
        .build()
        .unwrap();

    let error = pipeline.execute(credit(10), CancellationToken::new()).await.unwrap_err();

    assert_eq!(error.kind(), Some(FailureKind::Timeout));
    assert!(matches!(error, PipelineError::TimedOut { after, .. } if after == Duration::from_secs(2)));
    assert_eq!(error.stage(), Some("execute"));
    let failed = lifecycle.failed.events().remove(0).decode::<TransactionFailed>().unwrap().data;
    assert_eq!(failed.kind, "timeout");
}

#[tokio::test]
async fn processing_event_failure_is_tolerated_unless_required() {
    let bus = Arc::new(InMemoryEventBus::new("bks"));
    bus.subscribe(
        TransactionProcessing::EVENT_TYPE,
        RecordingHandler::rejecting().handler(),
        None,
    )
    .await
    .unwrap();
    let shared: Arc<dyn EventBus> = bus;

    let lenient = Pipeline::builder("credit")
        .standard_stages(StandardStages::<_, CreditResponse>::new(request_response(CreditHandler::default())))
        .event_bus(Arc::clone(&shared))
        .build()
        .unwrap();
    assert!(lenient.execute(credit(10), CancellationToken::new()).await.is_ok());

    let strict = Pipeline::builder("credit")
        .standard_stages(
            StandardStages::<_, CreditResponse>::new(request_response(CreditHandler::default())).require_processing_event(true),
        )
        .event_bus(shared)
        .build()
        .unwrap();
    let error = strict.execute(credit(10), CancellationToken::new()).await.unwrap_err();
    assert_eq!(error.stage(), Some("prepare"));
}
