//! Shared tracing/logging initialization.
//!
//! The relay binary and its test harnesses use the same pattern for setting
//! up `tracing_subscriber` with an env-filter and optional JSON output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn env_filter(default_filter: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    )
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"tokenrelay_server=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter(default_filter))
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter(default_filter))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialise tracing and, when an endpoint is given, the OTLP export
/// pipeline. The returned guard must be held for the process lifetime.
#[cfg(feature = "metrics")]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    metrics_endpoint: Option<&str>,
) -> Option<crate::metrics::MetricsGuard> {
    let Some(endpoint) = metrics_endpoint else {
        init_tracing(default_filter, log_json);
        return None;
    };

    let guard = match crate::metrics::init_metrics(endpoint) {
        Ok(guard) => guard,
        Err(e) => {
            init_tracing(default_filter, log_json);
            tracing::warn!(error = %e, endpoint, "OpenTelemetry export disabled");
            return None;
        }
    };

    let otel_layer = tracing_opentelemetry::layer().with_tracer(guard.tracer(crate::metrics::SERVICE_NAME));
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter(default_filter))
            .with(tracing_subscriber::fmt::layer().json())
            .with(otel_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter(default_filter))
            .with(tracing_subscriber::fmt::layer())
            .with(otel_layer)
            .init();
    }
    Some(guard)
}

/// Without the `metrics` feature this is [`init_tracing`]; a configured
/// endpoint is reported and ignored.
#[cfg(not(feature = "metrics"))]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    metrics_endpoint: Option<&str>,
) -> Option<()> {
    init_tracing(default_filter, log_json);
    if let Some(endpoint) = metrics_endpoint {
        tracing::warn!(endpoint, "Built without the `metrics` feature; ignoring endpoint");
    }
    None
}
