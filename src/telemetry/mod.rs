//! Logging, tracing and metrics setup.
//!
//! Installs a tracing-subscriber registry. With an OTLP endpoint, traces,
//! metrics and logs are exported there as well; otherwise only the fmt
//! layer is active.

pub mod message;
pub mod metrics;

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

use crate::error::{Error, Result};

/// Configuration for telemetry initialization.
pub struct TelemetryConfig {
    /// Optional OTLP endpoint (e.g. "http://localhost:4317").
    pub endpoint: Option<String>,
    /// The service name reported in telemetry signals.
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            service_name: service_name.into(),
            log_level: "info".to_string(),
        }
    }

    pub fn endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }
}

/// Flushes and shuts down the OTel providers on drop.
///
/// Hold it for the lifetime of the process.
#[derive(Default)]
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
    logger_provider: Option<SdkLoggerProvider>,
}

impl TelemetryGuard {
    /// Force-flush all pipelines.
    pub fn force_flush(&self) {
        if let Some(ref provider) = self.tracer_provider {
            let _ = provider.force_flush();
        }
        if let Some(ref provider) = self.meter_provider {
            let _ = provider.force_flush();
        }
        if let Some(ref provider) = self.logger_provider {
            let _ = provider.force_flush();
        }
    }

    pub fn is_exporting(&self) -> bool {
        self.tracer_provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.logger_provider.take() {
            let _ = provider.shutdown();
        }
        if let Some(provider) = self.meter_provider.take() {
            let _ = provider.shutdown();
        }
        if let Some(provider) = self.tracer_provider.take() {
            let _ = provider.shutdown();
        }
    }
}

/// Initialize logging and, if configured, OTLP export.
///
/// # Errors
///
/// Fails if an exporter cannot be built or a global subscriber is
/// already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let Some(endpoint) = config.endpoint else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;
        return Ok(TelemetryGuard::default());
    };

    let resource = Resource::builder()
        .with_service_name(config.service_name)
        .with_attribute(KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ))
        .build();

    let tracer_provider = tracer_provider(&endpoint, resource.clone())?;
    let meter_provider = meter_provider(&endpoint, resource.clone())?;
    let logger_provider = logger_provider(&endpoint, resource)?;

    opentelemetry::global::set_meter_provider(meter_provider.clone());

    let otel_trace_layer =
        tracing_opentelemetry::layer().with_tracer(tracer_provider.tracer("workq"));
    let otel_log_layer =
        opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&logger_provider);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(otel_trace_layer)
        .with(otel_log_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    Ok(TelemetryGuard {
        tracer_provider: Some(tracer_provider),
        meter_provider: Some(meter_provider),
        logger_provider: Some(logger_provider),
    })
}

fn tracer_provider(endpoint: &str, resource: Resource) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::Other(format!("failed to create OTLP span exporter: {e}")))?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build())
}

fn meter_provider(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::Other(format!("failed to create OTLP metric exporter: {e}")))?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(resource)
        .build())
}

fn logger_provider(endpoint: &str, resource: Resource) -> Result<SdkLoggerProvider> {
    let exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::Other(format!("failed to create OTLP log exporter: {e}")))?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build())
}
