use anyhow::Context;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{trace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub struct TelemetryHandle {
    exporting: bool,
}

impl TelemetryHandle {
    /// Flushes pending spans. Call once, after the command finished.
    pub fn shutdown(self) {
        if self.exporting {
            opentelemetry::global::shutdown_tracer_provider();
        }
    }
}

fn service_name() -> String {
    std::env::var("DOLTCLUSTERCTL_OTEL_SERVICE_NAME")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .or_else(|| std::env::var("OTEL_SERVICE_NAME").ok())
        .unwrap_or_else(|| "doltclusterctl".to_string())
}

/// Installs the global subscriber: an `EnvFilter` (default `info`) over a fmt
/// layer, plus OTLP span export when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
pub fn init() -> anyhow::Result<TelemetryHandle> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .filter(|value| !value.trim().is_empty());

    let tracer = match endpoint {
        Some(endpoint) => {
            let resource = Resource::new(vec![KeyValue::new("service.name", service_name())]);
            let trace_config = trace::Config::default().with_resource(resource);
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint.clone()),
                )
                .with_trace_config(trace_config)
                .install_batch(opentelemetry_sdk::runtime::Tokio)
                .with_context(|| format!("failed to install otlp exporter for {endpoint}"))?;
            Some(tracer)
        }
        None => None,
    };
    let exporting = tracer.is_some();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer)))
        .try_init()
        .ok();

    Ok(TelemetryHandle { exporting })
}
