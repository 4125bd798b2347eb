use std::time::Duration;

use envconfig::Envconfig;
use thiserror::Error;

use crate::fault::FailureInjectionPolicy;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8000")]
    pub port: u16,

    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "orders")]
    pub kafka_topic: String,

    #[envconfig(default = "event-processor")]
    pub kafka_consumer_group: String,

    // We default to "earliest" so a fresh consumer group replays what is still retained
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "10")]
    pub max_batch_size: usize,

    #[envconfig(default = "5000")]
    pub max_wait_time_ms: u64,

    // Document store, persistence is skipped when unset
    pub database_url: Option<String>,

    #[envconfig(default = "processed_events")]
    pub document_collection: String,

    #[envconfig(default = "10")]
    pub max_pg_connections: u32,

    // Recent activity cache, skipped when unset
    pub redis_url: Option<String>,

    // Notifications are simulated locally when unset
    pub notification_service_url: Option<String>,

    #[envconfig(default = "3000")]
    pub notification_timeout_ms: u64,

    // Failure injection defaults, tunable at runtime through the control API
    #[envconfig(default = "true")]
    pub failure_injection_enabled: bool,

    #[envconfig(default = "0.1")]
    pub latency_injection_probability: f64,

    #[envconfig(default = "0.05")]
    pub error_injection_probability: f64,

    #[envconfig(default = "true")]
    pub auto_start: bool,

    #[envconfig(default = "30")]
    pub shutdown_timeout_secs: u64,

    // OpenTelemetry export, disabled when no URL is given
    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "event-processor")]
    pub otel_service_name: String,

    #[envconfig(from = "OTEL_LOG_LEVEL", default = "info")]
    pub log_level: tracing::Level,
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be within [0, 1], got {value}")]
    InvalidProbability { name: &'static str, value: f64 },
    #[error("max_batch_size must be greater than zero")]
    EmptyBatchSize,
    #[error("invalid document collection name '{0}', expected [a-zA-Z_][a-zA-Z0-9_]*")]
    InvalidCollection(String),
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_wait_time(&self) -> Duration {
        Duration::from_millis(self.max_wait_time_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_millis(self.notification_timeout_ms)
    }

    /// Initial failure injection policy, before any runtime update
    pub fn failure_injection_policy(&self) -> FailureInjectionPolicy {
        FailureInjectionPolicy {
            enabled: self.failure_injection_enabled,
            latency_probability: self.latency_injection_probability,
            error_probability: self.error_injection_probability,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.failure_injection_policy().validate()?;

        if self.max_batch_size == 0 {
            return Err(ConfigError::EmptyBatchSize);
        }

        if !is_valid_identifier(&self.document_collection) {
            return Err(ConfigError::InvalidCollection(
                self.document_collection.clone(),
            ));
        }

        Ok(())
    }
}

/// The collection name ends up interpolated in SQL, so only plain identifiers are accepted.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
