//! # Telemetry
//!
//! Console logging is always on. Spans and events go through
//! `tracing_subscriber::fmt`, filtered by `RUST_LOG` (default `info`).
//!
//! ## Feature matrix
//!
//! - `tracing`: emits spans and events from the server and the pipeline.
//! - `metrics`: records OpenTelemetry counters and histograms.
//! - `stdout`: exports metrics to stdout every few seconds.
//!
//! `stdout` requires `metrics`.
//!
//! ## Instruments
//!
//! - `requests{route}`: HTTP requests received
//! - `request_duration{route}` (ms): end-to-end handler latency
//! - `units_generated{kind}`: units that reached `Persisted`
//! - `stage_failures{stage}`: units that ended in a failed stage
//! - `orphans_removed`: uploads deleted after a failed insert
//!
//! The helper functions below compile to no-ops without `metrics`.

#[cfg(all(feature = "stdout", not(feature = "metrics")))]
compile_error!("The 'stdout' feature requires the 'metrics' feature to be enabled.");

use tagsmith_core::{PipelineObserver, Stage, SymbolKind};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use opentelemetry::{
    InstrumentationScope, KeyValue,
    metrics::{Counter, Histogram, Meter},
};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::{Resource, metrics as sdkmetrics};
#[cfg(feature = "metrics")]
use opentelemetry_semantic_conventions as semvcns;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

pub struct TelemetryProviders {
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and stops exporters. Errors are printed since the subscriber
    /// may already be gone.
    pub fn shutdown(self) {
        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        )
        .try_init()?;

    #[cfg(feature = "metrics")]
    {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let scope = InstrumentationScope::builder("tagsmith")
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(semvcns::SCHEMA_URL)
            .build();
        init_metric_handles(opentelemetry::global::meter_with_scope(scope));
    }

    Ok(TelemetryProviders {
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(feature = "metrics")]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name("tagsmith")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> sdkmetrics::SdkMeterProvider {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        let exporter = opentelemetry_stdout::MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();
        builder.with_reader(reader)
    };

    builder.build()
}

#[cfg(feature = "metrics")]
static REQUESTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUEST_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static UNITS_GENERATED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static STAGE_FAILURES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static ORPHANS_REMOVED: OnceLock<Counter<u64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = REQUESTS.set(
        meter
            .u64_counter("requests")
            .with_description("HTTP requests received")
            .build(),
    );

    let _ = REQUEST_DURATION_MS.set(
        meter
            .f64_histogram("request_duration")
            .with_unit("ms")
            .with_description("End-to-end request duration")
            .build(),
    );

    let _ = UNITS_GENERATED.set(
        meter
            .u64_counter("units_generated")
            .with_description("Artifacts published and persisted")
            .build(),
    );

    let _ = STAGE_FAILURES.set(
        meter
            .u64_counter("stage_failures")
            .with_description("Units that failed, by stage")
            .build(),
    );

    let _ = ORPHANS_REMOVED.set(
        meter
            .u64_counter("orphans_removed")
            .with_description("Uploads deleted after a failed insert")
            .build(),
    );
}

#[cfg(feature = "metrics")]
pub fn increment_requests(route: &'static str) {
    if let Some(counter) = REQUESTS.get() {
        counter.add(1, &[KeyValue::new("route", route)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_requests(_route: &'static str) {}

#[cfg(feature = "metrics")]
pub fn record_request_duration(route: &'static str, duration_ms: f64) {
    if let Some(histogram) = REQUEST_DURATION_MS.get() {
        histogram.record(duration_ms, &[KeyValue::new("route", route)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_request_duration(_route: &'static str, _duration_ms: f64) {}

#[cfg(feature = "metrics")]
pub fn increment_units_generated(kind: SymbolKind) {
    if let Some(counter) = UNITS_GENERATED.get() {
        counter.add(1, &[KeyValue::new("kind", kind.label())]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_units_generated(_kind: SymbolKind) {}

#[cfg(feature = "metrics")]
pub fn increment_stage_failures(stage: Stage) {
    if let Some(counter) = STAGE_FAILURES.get() {
        counter.add(1, &[KeyValue::new("stage", stage.name())]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_stage_failures(_stage: Stage) {}

#[cfg(feature = "metrics")]
pub fn increment_orphans_removed() {
    if let Some(counter) = ORPHANS_REMOVED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_orphans_removed() {}

/// Forwards pipeline outcomes to the metric helpers.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsObserver;

impl PipelineObserver for MetricsObserver {
    fn unit_persisted(&self, kind: SymbolKind) {
        increment_units_generated(kind);
    }

    fn stage_failed(&self, stage: Stage) {
        increment_stage_failures(stage);
    }

    fn orphan_removed(&self) {
        increment_orphans_removed();
    }
}
