//! OTLP export of relay spans and counters.
//!
//! Compiled only with the `metrics` feature. [`init_metrics`] points both
//! the span and the metric pipeline at one OTLP/gRPC collector, tagged with
//! the `tokenrelay` service name. [`relay_meters`] holds the counters the
//! server bumps: sessions opened and closed, agent redials, exhausted retry
//! budgets and forwarded messages.

use std::sync::OnceLock;

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider};

/// Service name attached to every exported span and metric.
pub const SERVICE_NAME: &str = "tokenrelay";

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(#[from] opentelemetry_otlp::ExporterBuildError),

    #[error("OpenTelemetry SDK error: {0}")]
    Sdk(#[from] opentelemetry_sdk::error::OTelSdkError),
}

/// Keeps the relay's span and metric providers registered.
///
/// Dropping it leaves buffered telemetry unsent; [`MetricsGuard::shutdown`]
/// flushes first.
pub struct MetricsGuard {
    spans: SdkTracerProvider,
    meters: SdkMeterProvider,
}

impl MetricsGuard {
    /// Tracer for the `tracing-opentelemetry` layer.
    pub fn tracer(&self, name: &'static str) -> SdkTracer {
        self.spans.tracer(name)
    }

    /// Flush and stop both pipelines.
    pub fn shutdown(self) -> Result<(), MetricsError> {
        self.spans.shutdown()?;
        self.meters.shutdown()?;
        Ok(())
    }
}

fn span_provider(endpoint: &str, resource: Resource) -> Result<SdkTracerProvider, MetricsError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    Ok(SdkTracerProvider::builder()
        .with_resource(resource)
        .with_batch_exporter(exporter)
        .build())
}

fn meter_provider(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider, MetricsError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    Ok(SdkMeterProvider::builder()
        .with_resource(resource)
        .with_periodic_exporter(exporter)
        .build())
}

/// Export relay spans and counters to the OTLP collector at `endpoint`
/// (e.g. `http://localhost:4317`) and install both providers globally, so
/// [`relay_meters`] records into this pipeline.
pub fn init_metrics(endpoint: &str) -> Result<MetricsGuard, MetricsError> {
    let resource = Resource::builder().with_service_name(SERVICE_NAME).build();
    let spans = span_provider(endpoint, resource.clone())?;
    let meters = meter_provider(endpoint, resource)?;

    global::set_tracer_provider(spans.clone());
    global::set_meter_provider(meters.clone());
    Ok(MetricsGuard { spans, meters })
}

/// Counters recorded by the relay server.
pub struct RelayMeters {
    pub sessions_opened: Counter<u64>,
    pub sessions_closed: Counter<u64>,
    pub reconnect_attempts: Counter<u64>,
    pub reconnect_exhausted: Counter<u64>,
    pub messages_forwarded: Counter<u64>,
}

/// Process-wide relay counters, created lazily from the global meter provider.
pub fn relay_meters() -> &'static RelayMeters {
    static METERS: OnceLock<RelayMeters> = OnceLock::new();
    METERS.get_or_init(|| {
        let meter = global::meter(SERVICE_NAME);
        RelayMeters {
            sessions_opened: meter
                .u64_counter("tokenrelay.sessions.opened")
                .with_description("Relay sessions started")
                .build(),
            sessions_closed: meter
                .u64_counter("tokenrelay.sessions.closed")
                .with_description("Relay sessions cleaned up")
                .build(),
            reconnect_attempts: meter
                .u64_counter("tokenrelay.agent.reconnect_attempts")
                .with_description("Agent redial attempts")
                .build(),
            reconnect_exhausted: meter
                .u64_counter("tokenrelay.agent.reconnect_exhausted")
                .with_description("Sessions closed after exhausting agent retries")
                .build(),
            messages_forwarded: meter
                .u64_counter("tokenrelay.messages.forwarded")
                .with_description("Messages forwarded between client and agent")
                .build(),
        }
    })
}
