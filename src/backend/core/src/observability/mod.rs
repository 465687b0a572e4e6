//! Observability: logging, distributed tracing and metrics.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::ObservabilityConfig;

/// Initialize the observability stack.
///
/// `RUST_LOG` wins over the configured level when set. The OTLP exporter is
/// installed only when an endpoint is configured.
pub fn init(config: &ObservabilityConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let fmt_layer = if config.json_logging {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let telemetry_layer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(
                    opentelemetry_sdk::trace::config().with_resource(
                        opentelemetry_sdk::Resource::new(vec![opentelemetry::KeyValue::new(
                            "service.name",
                            config.service_name.clone(),
                        )]),
                    ),
                )
                .install_batch(opentelemetry_sdk::runtime::Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(telemetry_layer)
        .try_init()?;

    Ok(())
}

/// Shutdown OpenTelemetry.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Install the Prometheus recorder and describe every metric this crate
/// emits. The handle renders the `/metrics` body.
pub fn install_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    metrics::register_metrics();
    Ok(handle)
}

/// Metric descriptions.
pub mod metrics {
    use metrics::{describe_counter, describe_histogram, Unit};

    /// Register all metric descriptions.
    pub fn register_metrics() {
        describe_counter!(
            "scopegate_authz_decisions_total",
            "Permission checks by action, scope type and decision"
        );
        describe_counter!(
            "scopegate_proxy_requests_total",
            "Proxied requests by backend and outcome"
        );
        describe_counter!(
            "scopegate_errors_total",
            "Errors raised, by code and category"
        );
        describe_counter!(
            "scopegate_auth_errors_total",
            "Rejected authentication attempts by error type"
        );
        describe_counter!(
            "scopegate_auth_success_total",
            "Verified bearer tokens by verification method"
        );

        describe_histogram!(
            "scopegate_proxy_upstream_seconds",
            Unit::Seconds,
            "Upstream round-trip latency per backend"
        );
    }
}
