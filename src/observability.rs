use std::env;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::TracerProvider as SdkTracerProvider;
use opentelemetry_sdk::Resource;
use serde_json::json;
use tokio::runtime::Runtime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";
const OTLP_ENDPOINT_OVERRIDE_ENV: &str = "PLUGIN_WARDEN_OTEL_EXPORTER_OTLP_ENDPOINT";
const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
const DEFAULT_SERVICE_NAME: &str = "plugin-warden";
const DEFAULT_METRIC_EXPORT_INTERVAL_SECS: u64 = 15;

static UPDATE_ATTEMPTS_COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
static UPDATE_FAILURES_COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
static UPDATE_DURATION_SECONDS_HISTOGRAM: OnceLock<Histogram<f64>> = OnceLock::new();
static SELF_UPDATE_COUNTER: OnceLock<Counter<u64>> = OnceLock::new();

pub struct ObservabilityGuard {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
    _tokio_runtime: Option<Runtime>,
}

impl ObservabilityGuard {
    /// Installs the global tracing subscriber. With `export` the OTLP span
    /// and metric pipeline is attached; when it cannot be built the agent
    /// keeps running with console logging only.
    pub fn init(debug: bool, export: bool) -> Self {
        let default_level = if debug { "debug" } else { "info" };
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);

        let pipeline = if export {
            setup_otel_pipeline().map_err(|err| {
                log_observability_event("observability_init", "degraded", None, &err.to_string());
            })
        } else {
            Err(())
        };

        let Ok(pipeline) = pipeline else {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init();
            init_instruments();
            return Self {
                tracer_provider: None,
                meter_provider: None,
                _tokio_runtime: None,
            };
        };

        let tracer = pipeline.tracer_provider.tracer("plugin-warden");
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init();
        init_instruments();
        log_observability_event("observability_init", "ok", None, &pipeline.endpoint);

        Self {
            tracer_provider: Some(pipeline.tracer_provider),
            meter_provider: Some(pipeline.meter_provider),
            _tokio_runtime: Some(pipeline.runtime),
        }
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let Some(meter_provider) = self.meter_provider.as_ref() {
            if let Err(err) = meter_provider.force_flush() {
                log_shutdown_error("metrics", "flush_error", &err.to_string());
            }
            if let Err(err) = meter_provider.shutdown() {
                log_shutdown_error("metrics", "shutdown_error", &err.to_string());
            }
        }

        if let Some(tracer_provider) = self.tracer_provider.as_ref() {
            let flush_errors = tracer_provider
                .force_flush()
                .into_iter()
                .filter_map(|result| result.err().map(|err| err.to_string()))
                .collect::<Vec<_>>();
            if !flush_errors.is_empty() {
                log_shutdown_error("traces", "flush_error", &flush_errors.join("; "));
            }
            if let Err(err) = tracer_provider.shutdown() {
                log_shutdown_error("traces", "shutdown_error", &err.to_string());
            }
        }
    }
}

fn log_shutdown_error(component: &str, status: &str, message: &str) {
    log_observability_event("observability_shutdown", status, Some(component), message);
}

// The subscriber may not exist yet (or any more), so these go straight to stderr.
fn log_observability_event(event: &str, status: &str, component: Option<&str>, message: &str) {
    eprintln!(
        "{}",
        json!({
            "event": event,
            "status": status,
            "component": component,
            "message": message,
        })
    );
}

struct PipelineState {
    runtime: Runtime,
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
    endpoint: String,
}

fn setup_otel_pipeline() -> Result<PipelineState> {
    let endpoint = read_env_trimmed(OTLP_ENDPOINT_OVERRIDE_ENV)
        .or_else(|| read_env_trimmed(OTLP_ENDPOINT_ENV))
        .unwrap_or_else(|| DEFAULT_OTLP_ENDPOINT.to_string());
    let service_name = read_env_trimmed("OTEL_SERVICE_NAME")
        .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());
    let export_interval_secs = read_env_trimmed("OTEL_METRIC_EXPORT_INTERVAL_SECS")
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_METRIC_EXPORT_INTERVAL_SECS);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("plugin-warden-otel")
        .build()
        .context("failed building tokio runtime for OpenTelemetry")?;
    let _runtime_guard = runtime.enter();

    let resource = Resource::new(vec![KeyValue::new("service.name", service_name)]);

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .build()
        .context("failed building OTLP span exporter")?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_resource(resource.clone())
        .with_batch_exporter(span_exporter, opentelemetry_sdk::runtime::Tokio)
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .build()
        .context("failed building OTLP metric exporter")?;

    let periodic_reader =
        PeriodicReader::builder(metric_exporter, opentelemetry_sdk::runtime::Tokio)
            .with_interval(Duration::from_secs(export_interval_secs))
            .build();

    let meter_provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(periodic_reader)
        .build();
    global::set_meter_provider(meter_provider.clone());

    Ok(PipelineState {
        runtime,
        tracer_provider,
        meter_provider,
        endpoint,
    })
}

fn read_env_trimmed(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn init_instruments() {
    let meter = global::meter("plugin-warden");

    let _ = UPDATE_ATTEMPTS_COUNTER.get_or_init(|| {
        meter
            .u64_counter("plugin_update_attempts_total")
            .with_description("Plugin update attempts by outcome status.")
            .build()
    });
    let _ = UPDATE_FAILURES_COUNTER.get_or_init(|| {
        meter
            .u64_counter("plugin_update_failures_total")
            .with_description("Plugin failures reported to the metrics sink by subject.")
            .build()
    });
    let _ = UPDATE_DURATION_SECONDS_HISTOGRAM.get_or_init(|| {
        meter
            .f64_histogram("plugin_update_duration_seconds")
            .with_description("Wall-clock duration of plugin update attempts in seconds.")
            .build()
    });
    let _ = SELF_UPDATE_COUNTER.get_or_init(|| {
        meter
            .u64_counter("self_update_total")
            .with_description("Self-update checks by outcome status.")
            .build()
    });
}

pub fn record_update_attempt(status: &str, latency_ms: u64) {
    let attrs = vec![KeyValue::new("status", status.to_string())];

    if let Some(counter) = UPDATE_ATTEMPTS_COUNTER.get() {
        counter.add(1, &attrs);
    }
    if let Some(histogram) = UPDATE_DURATION_SECONDS_HISTOGRAM.get() {
        histogram.record((latency_ms as f64) / 1000.0, &attrs);
    }
}

pub fn record_update_failure(subject: &str, endpoint: &str) {
    let subject = subject.trim();
    if subject.is_empty() {
        return;
    }

    let attrs = vec![
        KeyValue::new("subject", subject.to_string()),
        KeyValue::new("endpoint", endpoint.to_string()),
    ];
    if let Some(counter) = UPDATE_FAILURES_COUNTER.get() {
        counter.add(1, &attrs);
    }
}

pub fn record_self_update(status: &str) {
    let attrs = vec![KeyValue::new("status", status.to_string())];
    if let Some(counter) = SELF_UPDATE_COUNTER.get() {
        counter.add(1, &attrs);
    }
}
