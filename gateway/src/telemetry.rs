//! Telemetry initialization: tracing with an optional OpenTelemetry OTLP
//! export layer.
//!
//! Configuration is done via standard OpenTelemetry environment variables:
//!
//! - `OTEL_EXPORTER_OTLP_ENDPOINT` - The OTLP endpoint URL
//! - `OTEL_EXPORTER_OTLP_PROTOCOL` - Protocol (http/protobuf, http/json)
//! - `OTEL_EXPORTER_OTLP_HEADERS` - Headers as comma-separated key=value pairs
//! - `OTEL_SERVICE_NAME` - Service name for resource identification
//!
//! `enable_otel_export` gates whether OTLP export is attempted at all; when
//! it's `false`, only console logging is enabled regardless of environment.

use std::collections::HashMap;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::{Protocol, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::trace::TracerProvider;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initializes the global tracing subscriber. Returns the OTLP tracer
/// provider when export succeeded, so the caller can flush it on shutdown.
pub fn init_telemetry(enable_otel_export: bool) -> anyhow::Result<Option<TracerProvider>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if !enable_otel_export {
        tracing_subscriber::registry().with(env_filter).with(tracing_subscriber::fmt::layer()).try_init()?;
        return Ok(None);
    }

    match create_otlp_tracer() {
        Ok((tracer, provider)) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()?;
            info!("telemetry initialized with OTLP export enabled");
            Ok(Some(provider))
        }
        Err(e) => {
            tracing_subscriber::registry().with(env_filter).with(tracing_subscriber::fmt::layer()).try_init()?;
            info!("telemetry initialized without OTLP export: {}", e);
            Ok(None)
        }
    }
}

fn create_otlp_tracer() -> anyhow::Result<(opentelemetry_sdk::trace::Tracer, TracerProvider)> {
    let service_name = std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "gateway".to_string());
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_else(|_| "http://localhost:4318".to_string());

    let mut headers = HashMap::new();
    if let Ok(headers_str) = std::env::var("OTEL_EXPORTER_OTLP_HEADERS") {
        let decoded = headers_str.replace("%20", " ");
        for pair in decoded.split(',') {
            if let Some((key, value)) = pair.split_once('=') {
                headers.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
    }

    let protocol = match std::env::var("OTEL_EXPORTER_OTLP_PROTOCOL").as_deref().unwrap_or("http/protobuf") {
        "http/json" => Protocol::HttpJson,
        _ => Protocol::HttpBinary,
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(&endpoint)
        .with_protocol(protocol)
        .with_headers(headers)
        .build()?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(opentelemetry_sdk::Resource::new(vec![opentelemetry::KeyValue::new(
            "service.name",
            service_name.clone(),
        )]))
        .build();

    let tracer = tracer_provider.tracer(service_name);
    Ok((tracer, tracer_provider))
}

/// Flushes and shuts down the OTLP tracer provider, if one was created.
pub fn shutdown_telemetry(provider: Option<TracerProvider>) {
    if let Some(provider) = provider {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "error shutting down tracer provider");
        }
    }
}
