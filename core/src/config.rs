//! Configuration for pipelines and the event subsystem.
//!
//! Configuration comes from a TOML document (keys mirror the option names used in
//! deployment manifests) with `BKS_*` environment variables layered on top, and is
//! validated before use.
//!
//! ```toml
//! ApplicationName = "ledger"
//! ProcessingMode = "RequestResponse"
//!
//! [Events]
//! Enabled = true
//! Provider = "KafkaStyle"
//! ConnectionString = "broker-1:9092,broker-2:9092"
//! TopicPrefix = "bks"
//!
//! [Events.AdditionalSettings]
//! "Consumer.session.timeout.ms" = "6000"
//! "Producer.compression.type" = "lz4"
//! ```
//!
//! # Example
//!
//! ```no_run
//! use bks_pipeline_core::config::AppConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load("config/pipeline.toml")?;
//! println!("provider: {}", config.events.provider);
//! # Ok(())
//! # }
//! ```

use crate::dispatch::ProcessingMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Environment variable not set
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),
    /// A value could not be interpreted
    #[error("Invalid value for {key}: {value}")]
    InvalidValue {
        /// Option name
        key: String,
        /// Offending value
        value: String,
    },
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
    /// Failed to read or parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Which event provider backs the bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventProviderKind {
    /// In-process fan-out
    #[default]
    InMemory,
    /// Kafka-compatible broker
    KafkaStyle,
    /// No-op placeholder for a future broker integration
    Stub,
}

impl EventProviderKind {
    /// Parse a configuration value (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for unknown providers.
    pub fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "inmemory" => Ok(Self::InMemory),
            "kafkastyle" | "kafka" => Ok(Self::KafkaStyle),
            "stub" | "rabbitmq" => Ok(Self::Stub),
            _ => Err(ConfigError::InvalidValue {
                key: "Events.Provider".to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Whether this provider needs a broker connection string.
    #[must_use]
    pub const fn requires_broker(self) -> bool {
        matches!(self, Self::KafkaStyle)
    }
}

impl fmt::Display for EventProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InMemory => write!(f, "InMemory"),
            Self::KafkaStyle => write!(f, "KafkaStyle"),
            Self::Stub => write!(f, "Stub"),
        }
    }
}

/// Event subsystem configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EventsConfig {
    /// Publish lifecycle events at all
    pub enabled: bool,
    /// Backing provider
    pub provider: EventProviderKind,
    /// Broker bootstrap list (`host:port[,host:port...]`)
    pub connection_string: Option<String>,
    /// Prefix for derived topics
    pub topic_prefix: String,
    /// Provider-specific passthrough settings
    pub additional_settings: HashMap<String, String>,
}

impl EventsConfig {
    /// Validate events configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic_prefix.trim().is_empty() {
            return Err(ConfigError::ValidationError("TopicPrefix cannot be empty".to_string()));
        }
        if self.topic_prefix.chars().any(char::is_whitespace) {
            return Err(ConfigError::ValidationError(format!(
                "TopicPrefix '{}' must not contain whitespace",
                self.topic_prefix
            )));
        }
        if self.additional_settings.keys().any(|k| k.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "AdditionalSettings keys cannot be empty".to_string(),
            ));
        }

        if self.enabled && self.provider.requires_broker() {
            let Some(connection) = self.connection_string.as_deref() else {
                return Err(ConfigError::ValidationError(format!(
                    "ConnectionString is required for provider {}",
                    self.provider
                )));
            };
            validate_broker_list(connection)?;
        }
        Ok(())
    }

    /// Additional settings whose key starts with `prefix` (e.g. `"Consumer."`),
    /// with the prefix stripped.
    #[must_use]
    pub fn settings_with_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        let mut settings: Vec<(String, String)> = self
            .additional_settings
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(prefix).map(|rest| (rest.to_string(), v.clone())))
            .filter(|(k, _)| !k.is_empty())
            .collect();
        settings.sort();
        settings
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: EventProviderKind::InMemory,
            connection_string: None,
            topic_prefix: "bks".to_string(),
            additional_settings: HashMap::new(),
        }
    }
}

/// Check a `host:port[,host:port...]` broker list.
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] naming the first bad entry.
pub fn validate_broker_list(connection: &str) -> Result<(), ConfigError> {
    if connection.trim().is_empty() {
        return Err(ConfigError::ValidationError("ConnectionString cannot be empty".to_string()));
    }

    for entry in connection.split(',').map(str::trim) {
        let Some((host, port)) = entry.rsplit_once(':') else {
            return Err(ConfigError::ValidationError(format!(
                "broker '{entry}' must be host:port"
            )));
        };
        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(ConfigError::ValidationError(format!("broker '{entry}' has an invalid host")));
        }
        match port.parse::<u16>() {
            Ok(p) if p > 0 => {},
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "broker '{entry}' has an invalid port"
                )));
            },
        }
    }
    Ok(())
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AppConfig {
    /// Application name; used for consumer group names
    pub application_name: String,
    /// Handler lookup strategy
    pub processing_mode: ProcessingMode,
    /// Whole-pipeline deadline in milliseconds (none when absent)
    pub pipeline_timeout_ms: Option<u64>,
    /// Event subsystem
    pub events: EventsConfig,
}

impl AppConfig {
    /// Load a TOML file, apply `BKS_*` overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed, or the result is invalid
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus `BKS_*` overrides, validated.
    ///
    /// # Errors
    ///
    /// Returns error if an override is malformed or the result is invalid
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without validating it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] if the document is malformed
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Apply overrides read through `lookup`:
    ///
    /// | variable | option |
    /// |---|---|
    /// | `BKS_APPLICATION_NAME` | `ApplicationName` |
    /// | `BKS_PROCESSING_MODE` | `ProcessingMode` |
    /// | `BKS_PIPELINE_TIMEOUT_MS` | `PipelineTimeoutMs` |
    /// | `BKS_EVENTS_ENABLED` | `Events.Enabled` |
    /// | `BKS_EVENTS_PROVIDER` | `Events.Provider` |
    /// | `BKS_EVENTS_CONNECTION_STRING` | `Events.ConnectionString` |
    /// | `BKS_EVENTS_TOPIC_PREFIX` | `Events.TopicPrefix` |
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for values that do not parse
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("BKS_APPLICATION_NAME") {
            self.application_name = name;
        }
        if let Some(mode) = lookup("BKS_PROCESSING_MODE") {
            self.processing_mode = ProcessingMode::parse(&mode).ok_or(ConfigError::InvalidValue {
                key: "ProcessingMode".to_string(),
                value: mode,
            })?;
        }
        if let Some(timeout) = lookup("BKS_PIPELINE_TIMEOUT_MS") {
            let parsed = timeout.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                key: "PipelineTimeoutMs".to_string(),
                value: timeout,
            })?;
            self.pipeline_timeout_ms = Some(parsed);
        }
        if let Some(enabled) = lookup("BKS_EVENTS_ENABLED") {
            self.events.enabled = match enabled.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "Events.Enabled".to_string(),
                        value: enabled,
                    });
                },
            };
        }
        if let Some(provider) = lookup("BKS_EVENTS_PROVIDER") {
            self.events.provider = EventProviderKind::from_str(&provider)?;
        }
        if let Some(connection) = lookup("BKS_EVENTS_CONNECTION_STRING") {
            self.events.connection_string = Some(connection);
        }
        if let Some(prefix) = lookup("BKS_EVENTS_TOPIC_PREFIX") {
            self.events.topic_prefix = prefix;
        }
        Ok(())
    }

    /// Validate entire configuration
    ///
    /// # Errors
    ///
    /// Returns error if any configuration section is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_name.trim().is_empty() {
            return Err(ConfigError::ValidationError("ApplicationName cannot be empty".to_string()));
        }
        if let Some(bad) = self
            .application_name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(ConfigError::ValidationError(format!(
                "ApplicationName contains '{bad}'"
            )));
        }
        if self.pipeline_timeout_ms == Some(0) {
            return Err(ConfigError::ValidationError("PipelineTimeoutMs must be > 0".to_string()));
        }
        self.events.validate()
    }

    /// Pipeline deadline as a Duration
    #[must_use]
    pub fn pipeline_timeout(&self) -> Option<Duration> {
        self.pipeline_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            application_name: "bks-pipeline".to_string(),
            processing_mode: ProcessingMode::RequestResponse,
            pipeline_timeout_ms: None,
            events: EventsConfig::default(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.processing_mode, ProcessingMode::RequestResponse);
        assert_eq!(config.events.provider, EventProviderKind::InMemory);
        assert!(config.pipeline_timeout().is_none());
    }

    #[test]
    fn parses_pascal_case_toml() {
        let raw = r#"
            ApplicationName = "ledger"
            ProcessingMode = "TransactionProcessor"
            PipelineTimeoutMs = 2500

            [Events]
            Enabled = true
            Provider = "KafkaStyle"
            ConnectionString = "broker-1:9092,broker-2:9093"
            TopicPrefix = "bks"

            [Events.AdditionalSettings]
            "Consumer.session.timeout.ms" = "6000"
            "Producer.compression.type" = "lz4"
        "#;

        let config = AppConfig::from_toml_str(raw).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.application_name, "ledger");
        assert_eq!(config.processing_mode, ProcessingMode::TransactionProcessor);
        assert_eq!(config.events.provider, EventProviderKind::KafkaStyle);
        assert_eq!(config.pipeline_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(
            config.events.settings_with_prefix("Consumer."),
            vec![("session.timeout.ms".to_string(), "6000".to_string())]
        );
    }

    #[test]
    fn broker_provider_requires_connection_string() {
        let mut config = AppConfig::default();
        config.events.provider = EventProviderKind::KafkaStyle;
        assert!(config.validate().is_err());

        config.events.connection_string = Some("localhost:9092".to_string());
        assert!(config.validate().is_ok());

        config.events.enabled = false;
        config.events.connection_string = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn broker_list_format_is_checked() {
        assert!(validate_broker_list("localhost:9092").is_ok());
        assert!(validate_broker_list("a:1, b:2").is_ok());
        assert!(validate_broker_list("localhost").is_err());
        assert!(validate_broker_list("localhost:notaport").is_err());
        assert!(validate_broker_list(":9092").is_err());
        assert!(validate_broker_list("a:9092,").is_err());
        assert!(validate_broker_list("a:0").is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = AppConfig::default();
        config
            .apply_env_overrides_from(lookup_from(&[
                ("BKS_PROCESSING_MODE", "transaction-processor"),
                ("BKS_EVENTS_PROVIDER", "stub"),
                ("BKS_EVENTS_ENABLED", "off"),
                ("BKS_EVENTS_TOPIC_PREFIX", "acme"),
                ("BKS_PIPELINE_TIMEOUT_MS", "100"),
            ]))
            .unwrap();

        assert_eq!(config.processing_mode, ProcessingMode::TransactionProcessor);
        assert_eq!(config.events.provider, EventProviderKind::Stub);
        assert!(!config.events.enabled);
        assert_eq!(config.events.topic_prefix, "acme");
        assert_eq!(config.pipeline_timeout_ms, Some(100));
    }

    #[test]
    fn bad_env_values_are_reported() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env_overrides_from(lookup_from(&[("BKS_EVENTS_ENABLED", "maybe")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "Events.Enabled".to_string(),
                value: "maybe".to_string(),
            }
        );
    }

    #[test]
    fn application_name_is_checked() {
        let mut config = AppConfig::default();
        config.application_name = "has space".to_string();
        assert!(config.validate().is_err());
        config.application_name = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::ValidationError("test failed".to_string());
        assert_eq!(err.to_string(), "Configuration validation failed: test failed");
    }
}
