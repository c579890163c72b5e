//! Event provider selection from configuration.
//!
//! The composition root calls [`event_bus_from_config`] once and hands the result
//! to every [`PipelineBuilder`](crate::PipelineBuilder) via `maybe_event_bus`;
//! `PipelineBuilder::config` applies the rest of the pipeline options.

use crate::in_memory::InMemoryEventBus;
use crate::stub::StubEventBus;
use bks_pipeline_core::config::{AppConfig, ConfigError, EventProviderKind};
use bks_pipeline_core::dispatch::{DispatchResolver, HandlerRegistry, ProcessorRegistry};
use bks_pipeline_core::event_bus::{EventBus, EventBusError};
use bks_pipeline_core::metrics::PipelineMetrics;
use bks_pipeline_kafka::KafkaEventBus;
use std::sync::Arc;
use thiserror::Error;

/// Failure to build the configured event provider.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The configuration does not validate
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The provider could not be created
    #[error("Failed to create {provider} event provider: {source}")]
    Provider {
        /// Configured provider
        provider: EventProviderKind,
        /// Underlying error
        #[source]
        source: EventBusError,
    },
}

/// Build the event bus selected by `config.events`.
///
/// Returns `Ok(None)` when events are disabled; pipelines then publish nothing.
///
/// # Errors
///
/// - [`ProviderError::Config`] if the configuration is invalid
/// - [`ProviderError::Provider`] if the Kafka-style producer cannot be created
pub fn event_bus_from_config(
    config: &AppConfig,
    metrics: Arc<PipelineMetrics>,
) -> Result<Option<Arc<dyn EventBus>>, ProviderError> {
    config.validate()?;
    let events = &config.events;

    if !events.enabled {
        tracing::info!("Event publishing disabled");
        return Ok(None);
    }

    let bus: Arc<dyn EventBus> = match events.provider {
        EventProviderKind::InMemory => {
            Arc::new(InMemoryEventBus::new(events.topic_prefix.clone()).with_metrics(metrics))
        },
        EventProviderKind::KafkaStyle => {
            let brokers = events.connection_string.clone().ok_or_else(|| {
                ConfigError::ValidationError("ConnectionString is required for provider KafkaStyle".to_string())
            })?;
            let bus = KafkaEventBus::builder()
                .brokers(brokers)
                .application_name(config.application_name.clone())
                .topic_prefix(events.topic_prefix.clone())
                .settings(
                    events
                        .settings_with_prefix("Producer.")
                        .into_iter()
                        .map(|(k, v)| (format!("Producer.{k}"), v)),
                )
                .settings(
                    events
                        .settings_with_prefix("Consumer.")
                        .into_iter()
                        .map(|(k, v)| (format!("Consumer.{k}"), v)),
                )
                .metrics(metrics)
                .build()
                .map_err(|source| ProviderError::Provider {
                    provider: events.provider,
                    source,
                })?;
            Arc::new(bus)
        },
        EventProviderKind::Stub => Arc::new(StubEventBus::new(events.topic_prefix.clone())),
    };

    tracing::info!(
        provider = bus.provider_name(),
        topic_prefix = %events.topic_prefix,
        "Event provider configured"
    );
    Ok(Some(bus))
}

/// Resolver running in the configured processing mode.
#[must_use]
pub fn resolver_from_config(
    config: &AppConfig,
    handlers: HandlerRegistry,
    processors: ProcessorRegistry,
) -> DispatchResolver {
    DispatchResolver::new(config.processing_mode, handlers, processors)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bks_pipeline_core::dispatch::ProcessingMode;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn disabled_events_yield_no_bus() {
        let mut config = AppConfig::default();
        config.events.enabled = false;
        assert!(event_bus_from_config(&config, Arc::default()).unwrap().is_none());
    }

    #[test]
    fn in_memory_is_the_default_provider() {
        let bus = event_bus_from_config(&AppConfig::default(), Arc::default())
            .unwrap()
            .unwrap();
        assert_eq!(bus.provider_name(), "in-memory");

        tokio_test::block_on(async {
            assert_ok!(bus.unsubscribe("pipeline.transaction.completed").await);
            assert_err!(bus.unsubscribe("pipeline-transaction").await);
        });
    }

    #[test]
    fn stub_provider_is_selectable() {
        let mut config = AppConfig::default();
        config.events.provider = EventProviderKind::Stub;
        let bus = event_bus_from_config(&config, Arc::default()).unwrap().unwrap();
        assert_eq!(bus.provider_name(), "stub");
    }

    #[test]
    fn kafka_without_connection_string_is_rejected() {
        let mut config = AppConfig::default();
        config.events.provider = EventProviderKind::KafkaStyle;
        let error = event_bus_from_config(&config, Arc::default()).err().unwrap();
        assert!(matches!(error, ProviderError::Config(ConfigError::ValidationError(_))));
    }

    #[test]
    fn resolver_uses_configured_mode() {
        let config = AppConfig {
            processing_mode: ProcessingMode::TransactionProcessor,
            ..AppConfig::default()
        };
        let resolver = resolver_from_config(&config, HandlerRegistry::empty(), ProcessorRegistry::empty());
        assert_eq!(resolver.mode(), ProcessingMode::TransactionProcessor);
    }
}
