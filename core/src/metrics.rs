//! Explicit metrics collector for pipelines and providers.
//!
//! One [`PipelineMetrics`] is created per process and shared by `Arc` with the
//! executor and the event providers. Every recording goes to the `metrics` facade
//! (picked up by whatever recorder is installed, e.g. the Prometheus exporter in
//! `bks-pipeline-runtime`) and to in-process counters readable via
//! [`PipelineMetrics::snapshot`].

use crate::context::PipelineState;
use metrics::{counter, histogram};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time copy of the in-process counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Pipeline executions started
    pub executions: u64,
    /// Executions that completed
    pub completed: u64,
    /// Executions that failed
    pub failed: u64,
    /// Executions that were cancelled
    pub cancelled: u64,
    /// Executions that timed out
    pub timed_out: u64,
    /// Events accepted by a provider
    pub events_published: u64,
    /// Publishes rejected by a provider
    pub publish_errors: u64,
    /// Events handled successfully by a subscriber
    pub events_consumed: u64,
    /// Deliveries whose handler failed
    pub consume_errors: u64,
}

/// Metrics collector shared across one process.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    executions: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    events_published: AtomicU64,
    publish_errors: AtomicU64,
    events_consumed: AtomicU64,
    consume_errors: AtomicU64,
}

impl PipelineMetrics {
    /// Create a collector with zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A pipeline execution began.
    pub fn record_execution_started(&self, pipeline: &str) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        counter!("pipeline_executions_total", "pipeline" => pipeline.to_string()).increment(1);
    }

    /// A pipeline execution reached a terminal state.
    pub fn record_outcome(&self, pipeline: &str, state: PipelineState, duration: Duration) {
        let slot = match state {
            PipelineState::Completed => &self.completed,
            PipelineState::Cancelled => &self.cancelled,
            PipelineState::TimedOut => &self.timed_out,
            _ => &self.failed,
        };
        slot.fetch_add(1, Ordering::Relaxed);

        if state != PipelineState::Completed {
            counter!(
                "pipeline_failures_total",
                "pipeline" => pipeline.to_string(),
                "outcome" => state.to_string()
            )
            .increment(1);
        }
        histogram!(
            "pipeline_execution_duration_seconds",
            "pipeline" => pipeline.to_string(),
            "outcome" => state.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// A stage finished (successfully or not).
    pub fn record_stage(&self, pipeline: &str, stage: &str, duration: Duration) {
        histogram!(
            "pipeline_stage_duration_seconds",
            "pipeline" => pipeline.to_string(),
            "stage" => stage.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// A provider accepted a publish.
    pub fn record_publish(&self, provider: &'static str, duration: Duration) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        counter!("event_bus_messages_published_total", "provider" => provider).increment(1);
        histogram!("event_bus_publish_duration_seconds", "provider" => provider)
            .record(duration.as_secs_f64());
    }

    /// A provider rejected a publish.
    pub fn record_publish_error(&self, provider: &'static str) {
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
        counter!("event_bus_publish_errors_total", "provider" => provider).increment(1);
    }

    /// A subscriber handled a delivery.
    pub fn record_consume(&self, provider: &'static str) {
        self.events_consumed.fetch_add(1, Ordering::Relaxed);
        counter!("event_bus_messages_consumed_total", "provider" => provider).increment(1);
    }

    /// A subscriber's handler failed on a delivery.
    pub fn record_consume_error(&self, provider: &'static str) {
        self.consume_errors.fetch_add(1, Ordering::Relaxed);
        counter!("event_bus_consume_errors_total", "provider" => provider).increment(1);
    }

    /// Copy the in-process counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            executions: self.executions.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            events_consumed: self.events_consumed.load(Ordering::Relaxed),
            consume_errors: self.consume_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_land_in_their_slots() {
        let metrics = PipelineMetrics::new();
        metrics.record_execution_started("p");
        metrics.record_execution_started("p");
        metrics.record_execution_started("p");
        metrics.record_outcome("p", PipelineState::Completed, Duration::from_millis(1));
        metrics.record_outcome("p", PipelineState::Cancelled, Duration::from_millis(1));
        metrics.record_outcome("p", PipelineState::Failed, Duration::from_millis(1));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.executions, 3);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.cancelled, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.timed_out, 0);
    }

    #[test]
    fn provider_counters_are_independent_per_instance() {
        let a = PipelineMetrics::new();
        let b = PipelineMetrics::new();
        a.record_publish("in-memory", Duration::from_millis(2));
        a.record_publish_error("in-memory");
        b.record_consume("kafka");

        assert_eq!(a.snapshot().events_published, 1);
        assert_eq!(a.snapshot().publish_errors, 1);
        assert_eq!(b.snapshot().events_published, 0);
        assert_eq!(b.snapshot().events_consumed, 1);
    }
}
