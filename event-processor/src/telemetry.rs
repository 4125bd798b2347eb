use std::time::Duration;

use opentelemetry::trace::TraceError;
use opentelemetry::{KeyValue, Value};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{BatchConfig, RandomIdGenerator, Sampler, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use tracing::level_filters::LevelFilter;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::Config;

pub fn init_tracer(
    sink_url: &str,
    sampling_rate: f64,
    service_name: &str,
) -> Result<Tracer, TraceError> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                    sampling_rate,
                ))))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    Value::from(service_name.to_string()),
                )])),
        )
        .with_batch_config(BatchConfig::default())
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(sink_url)
                .with_timeout(Duration::from_secs(3)),
        )
        .install_batch(runtime::Tokio)
}

/// Installs the global subscriber:
///   - stdout, filtered by RUST_LOG (default INFO)
///   - OpenTelemetry when an OTEL_URL is configured, filtered by OTEL_LOG_LEVEL
pub fn setup_tracing(config: &Config) -> Result<(), TraceError> {
    let mut log_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    if let Ok(directive) = "rdkafka=warn".parse() {
        log_filter = log_filter.add_directive(directive);
    }
    let log_layer = tracing_subscriber::fmt::layer().with_filter(log_filter);

    let tracer = match &config.otel_url {
        Some(url) => Some(init_tracer(
            url,
            config.otel_sampling_rate,
            &config.otel_service_name,
        )?),
        None => None,
    };
    let otel_layer = tracer
        .map(OpenTelemetryLayer::new)
        .with_filter(LevelFilter::from_level(config.log_level));

    tracing_subscriber::registry()
        .with(log_layer)
        .with(otel_layer)
        .init();

    Ok(())
}
