//! # BKS Pipeline Testing
//!
//! Test doubles and helpers for the BKS transaction pipeline.
//!
//! This crate provides:
//! - [`MemoryBroker`]: a simulated Kafka broker with per-group committed offsets
//! - [`RecordingHandler`]: an event handler that records deliveries and can fail on demand
//! - [`CountingStage`]: a stage that counts its executions
//! - [`FixedClock`]: deterministic time
//! - proptest strategies for event type keys
//!
//! ## Example
//!
//! ```ignore
//! use bks_pipeline_testing::{CountingStage, StageBehavior};
//!
//! #[tokio::test]
//! async fn failing_validation_stops_the_pipeline() {
//!     let validate = CountingStage::new("validate", 1, StageBehavior::Fail("amount must be positive"));
//!     let execute = CountingStage::new("execute", 3, StageBehavior::Respond(0));
//!
//!     let pipeline = Pipeline::builder("credit")
//!         .stage(validate.clone())
//!         .stage(execute.clone())
//!         .build()?;
//!
//!     assert!(pipeline.execute(-5, CancellationToken::new()).await.is_err());
//!     assert_eq!(execute.runs(), 0);
//! }
//! ```

use chrono::{DateTime, Utc};

pub mod broker;

/// Mock implementations for testing.
pub mod mocks {
    #![allow(clippy::unwrap_used)] // Poisoned locks only happen after a test already panicked
    #![allow(clippy::missing_panics_doc)]

    use super::{DateTime, Utc};
    use bks_pipeline_core::context::PipelineContext;
    use bks_pipeline_core::environment::Clock;
    use bks_pipeline_core::event::EventEnvelope;
    use bks_pipeline_core::event_bus::{BoxFuture, EventHandler, HandlerError};
    use bks_pipeline_core::outcome::Outcome;
    use bks_pipeline_core::stage::{Stage, StageFuture, StageOutput};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use bks_pipeline_testing::mocks::FixedClock;
    /// use bks_pipeline_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    #[derive(Default)]
    struct Recorded {
        events: Mutex<Vec<EventEnvelope>>,
        calls: AtomicUsize,
        failures_left: AtomicUsize,
        reject: bool,
        delay: Option<Duration>,
    }

    /// Event handler that records what it receives.
    ///
    /// Clones share state, so a test keeps one clone for assertions and hands
    /// another to the bus.
    #[derive(Clone, Default)]
    pub struct RecordingHandler {
        inner: Arc<Recorded>,
    }

    impl RecordingHandler {
        /// Handler that accepts everything.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Handler that fails (retryably) on its first `count` calls.
        #[must_use]
        pub fn failing_first(count: usize) -> Self {
            Self {
                inner: Arc::new(Recorded {
                    failures_left: AtomicUsize::new(count),
                    ..Recorded::default()
                }),
            }
        }

        /// Handler that rejects every event as permanently unprocessable.
        #[must_use]
        pub fn rejecting() -> Self {
            Self {
                inner: Arc::new(Recorded {
                    reject: true,
                    ..Recorded::default()
                }),
            }
        }

        /// Handler that sleeps for `delay` before accepting.
        #[must_use]
        pub fn slow(delay: Duration) -> Self {
            Self {
                inner: Arc::new(Recorded {
                    delay: Some(delay),
                    ..Recorded::default()
                }),
            }
        }

        /// Shared handle suitable for `subscribe`.
        #[must_use]
        pub fn handler(&self) -> Arc<dyn EventHandler> {
            Arc::new(self.clone())
        }

        /// Number of times `handle` was called.
        #[must_use]
        pub fn calls(&self) -> usize {
            self.inner.calls.load(Ordering::SeqCst)
        }

        /// Events handled successfully, in order.
        #[must_use]
        pub fn events(&self) -> Vec<EventEnvelope> {
            self.inner.events.lock().unwrap().clone()
        }

        /// Number of events handled successfully.
        #[must_use]
        pub fn successes(&self) -> usize {
            self.inner.events.lock().unwrap().len()
        }
    }

    impl EventHandler for RecordingHandler {
        fn handle(&self, event: EventEnvelope) -> BoxFuture<'_, Result<(), HandlerError>> {
            Box::pin(async move {
                self.inner.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(delay) = self.inner.delay {
                    tokio::time::sleep(delay).await;
                }
                if self.inner.reject {
                    return Err(HandlerError::rejected(format!("rejected {}", event.event_id)));
                }
                let failing = self
                    .inner
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                    .is_ok();
                if failing {
                    return Err(HandlerError::failed(format!("transient failure on {}", event.event_id)));
                }
                self.inner.events.lock().unwrap().push(event);
                Ok(())
            })
        }
    }

    /// What a [`CountingStage`] does when it runs.
    #[derive(Clone, Debug)]
    pub enum StageBehavior<Resp> {
        /// Succeed without a response
        Continue,
        /// Succeed with this response
        Respond(Resp),
        /// Fail with this message
        Fail(&'static str),
    }

    /// Stage that counts how often it runs.
    #[derive(Clone)]
    pub struct CountingStage<Resp> {
        name: &'static str,
        order: u32,
        behavior: StageBehavior<Resp>,
        runs: Arc<AtomicUsize>,
    }

    impl<Resp> CountingStage<Resp> {
        /// Stage `name` at `order` behaving as `behavior`.
        #[must_use]
        pub fn new(name: &'static str, order: u32, behavior: StageBehavior<Resp>) -> Self {
            Self {
                name,
                order,
                behavior,
                runs: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Number of executions so far (shared between clones).
        #[must_use]
        pub fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    impl<Req, Resp> Stage<Req, Resp> for CountingStage<Resp>
    where
        Req: Sync,
        Resp: Clone + Send + Sync,
    {
        fn name(&self) -> &str {
            self.name
        }

        fn order(&self) -> u32 {
            self.order
        }

        fn execute<'a>(
            &'a self,
            _request: &'a Req,
            _response: Option<&'a Resp>,
            _ctx: &'a mut PipelineContext,
        ) -> StageFuture<'a, Resp> {
            Box::pin(async move {
                self.runs.fetch_add(1, Ordering::SeqCst);
                match &self.behavior {
                    StageBehavior::Continue => Outcome::Success(StageOutput::Continue),
                    StageBehavior::Respond(value) => Outcome::Success(StageOutput::Respond(value.clone())),
                    StageBehavior::Fail(message) => Outcome::failure(*message),
                }
            })
        }
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use std::sync::Once;
    use std::time::Duration;
    use tokio::time::Instant;

    static TRACING: Once = Once::new();

    /// Install a `tracing` subscriber once per test binary.
    ///
    /// Honours `RUST_LOG`; output goes through the test writer so it only shows
    /// for failing tests.
    pub fn init_test_tracing() {
        TRACING.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
                )
                .with_test_writer()
                .try_init();
        });
    }

    /// Poll `condition` every 10 ms until it holds or `timeout` passes.
    ///
    /// Returns whether the condition was met.
    pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// Valid event type keys: one to four dot-separated segments of
    /// `[a-z0-9_]`, each starting with a letter.
    pub fn event_type() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-z][a-z0-9_]{0,8}", 1..=4).prop_map(|segments| segments.join("."))
    }

    /// Pairs of distinct valid event type keys.
    pub fn distinct_event_types() -> impl Strategy<Value = (String, String)> {
        (event_type(), event_type()).prop_filter("event types must differ", |(a, b)| a != b)
    }

    /// Event type keys with at least one uppercase letter, which never validate.
    pub fn mixed_case_event_type() -> impl Strategy<Value = String> {
        (event_type(), any::<prop::sample::Index>()).prop_map(|(key, index)| {
            let letters: Vec<usize> = key
                .char_indices()
                .filter(|(_, c)| c.is_ascii_lowercase())
                .map(|(i, _)| i)
                .collect();
            // Every segment starts with a letter, so `letters` is never empty.
            let at = letters[index.index(letters.len())];
            let mut mixed = key;
            mixed[at..=at].make_ascii_uppercase();
            mixed
        })
    }

    /// Valid topic prefixes.
    pub fn topic_prefix() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9]{0,6}"
    }
}

// Re-export commonly used items
pub use broker::MemoryBroker;
pub use helpers::{init_test_tracing, wait_until};
pub use mocks::{CountingStage, FixedClock, RecordingHandler, StageBehavior, test_clock};

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bks_pipeline_core::environment::Clock;
    use bks_pipeline_core::event::{DomainEvent, TransactionCancelled};
    use bks_pipeline_core::event_bus::{EventHandler, HandlerError};
    use tokio_test::{assert_err, assert_ok};

    fn event() -> bks_pipeline_core::event::EventEnvelope {
        DomainEvent::new(TransactionCancelled {
            pipeline: "credit".to_string(),
            stage: None,
        })
        .to_envelope()
        .unwrap()
    }

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[tokio::test]
    async fn recording_handler_fails_then_records() {
        let handler = RecordingHandler::failing_first(1);
        assert!(matches!(handler.handle(event()).await, Err(HandlerError::Failed(_))));
        assert_ok!(handler.handle(event()).await);

        assert_eq!(handler.calls(), 2);
        assert_eq!(handler.successes(), 1);
    }

    #[tokio::test]
    async fn rejecting_handler_never_records() {
        let handler = RecordingHandler::rejecting();
        let error = assert_err!(handler.handle(event()).await);
        assert!(!error.is_retryable());
        assert_eq!(handler.successes(), 0);
    }

    #[tokio::test]
    async fn wait_until_gives_up() {
        assert!(!wait_until(std::time::Duration::from_millis(30), || false).await);
        assert!(wait_until(std::time::Duration::from_millis(30), || true).await);
    }
}
