//! # Telemetry Features
//!
//! Console logging through `tracing_subscriber::fmt` is always on. On top of
//! it, OpenTelemetry export can be switched on per signal.
//!
//! ## Feature matrix
//!
//! - `otel`: Exports `tracing` spans (one per apply call and per fulfillment
//!   delivery) as OpenTelemetry traces.
//! - `metrics`: Records campaign counters and histograms as OpenTelemetry
//!   metrics.
//! - `stdout`: Enables the stdout exporter for whichever of the above is on.
//!
//! ## Feature constraints
//!
//! - `stdout` requires at least one of `otel` or `metrics`.
//!
//! ## Log filtering
//!
//! The console filter comes from `RUST_LOG` and defaults to `info`. Per-call
//! admission decisions are logged at `debug`:
//!
//! ```bash
//! RUST_LOG=coupon_issuer=debug cargo run -- --simulate-users 1000
//! ```
//!
//! Enable traces and metrics, exported to stdout:
//!
//! ```bash
//! cargo run --features otel,metrics,stdout -- --simulate-users 1000
//! ```

#[cfg(all(feature = "stdout", not(any(feature = "otel", feature = "metrics"))))]
compile_error!("The 'stdout' feature requires at least one of 'otel' or 'metrics' to be enabled.");

use coupon_issuer::{Decision, FulfillmentStats};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel")]
use opentelemetry_sdk::trace as sdktrace;

const SERVICE_NAME: &str = "coupon-issuer";

pub struct TelemetryProviders {
    #[cfg(feature = "otel")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down every enabled exporter. Errors are printed, not
    /// returned, since the subscriber may already be unusable at this point.
    pub fn shutdown(self) {
        #[cfg(feature = "otel")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

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
    #[cfg(feature = "otel")]
    let tracer_provider = init_tracer();

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics();

    #[cfg(any(feature = "metrics", feature = "otel"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    // Logs go to stderr so stdin/stdout stay free for the campaign itself.
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true),
        );

    #[cfg(feature = "otel")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "otel")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "otel"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
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
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    builder.build()
}

#[cfg(feature = "otel")]
fn init_tracer() -> sdktrace::SdkTracerProvider {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::SpanExporter;
        let batch = sdktrace::BatchSpanProcessor::builder(SpanExporter::default())
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();
        builder.with_span_processor(batch)
    };

    builder.build()
}

#[cfg(feature = "metrics")]
static DECISIONS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static APPLY_ERRORS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static APPLY_INFLIGHT: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static APPLY_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static DELIVERIES: OnceLock<Counter<u64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = DECISIONS.set(
        meter
            .u64_counter("admission_decisions")
            .with_description("Apply calls answered, by decision")
            .build(),
    );

    let _ = APPLY_ERRORS.set(
        meter
            .u64_counter("admission_errors")
            .with_description("Apply calls that failed, by error kind")
            .build(),
    );

    let _ = APPLY_INFLIGHT.set(
        meter
            .i64_up_down_counter("admission_inflight")
            .with_description("Concurrent apply calls")
            .build(),
    );

    let _ = APPLY_DURATION_MS.set(
        meter
            .f64_histogram("admission_duration")
            .with_unit("ms")
            .with_description("End-to-end apply call duration")
            .build(),
    );

    let _ = DELIVERIES.set(
        meter
            .u64_counter("fulfillment_deliveries")
            .with_description("Settled fulfillment deliveries, by outcome")
            .build(),
    );
}

#[cfg(feature = "metrics")]
pub fn record_decision(decision: Decision) {
    if let Some(counter) = DECISIONS.get() {
        counter.add(1, &[KeyValue::new("decision", decision.as_str())]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_decision(_decision: Decision) {}

#[cfg(feature = "metrics")]
pub fn increment_apply_errors(kind: &'static str) {
    if let Some(counter) = APPLY_ERRORS.get() {
        counter.add(1, &[KeyValue::new("kind", kind)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_apply_errors(_kind: &'static str) {}

#[cfg(feature = "metrics")]
pub fn increment_apply_inflight() {
    if let Some(counter) = APPLY_INFLIGHT.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_apply_inflight() {}

#[cfg(feature = "metrics")]
pub fn decrement_apply_inflight() {
    if let Some(counter) = APPLY_INFLIGHT.get() {
        counter.add(-1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_apply_inflight() {}

#[cfg(feature = "metrics")]
pub fn record_apply_duration(duration_ms: f64) {
    if let Some(histogram) = APPLY_DURATION_MS.get() {
        histogram.record(duration_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_apply_duration(_duration_ms: f64) {}

#[cfg(feature = "metrics")]
pub fn record_fulfillment(stats: &FulfillmentStats) {
    if let Some(counter) = DELIVERIES.get() {
        for (outcome, count) in [
            ("fulfilled", stats.fulfilled),
            ("already_fulfilled", stats.duplicates),
            ("retried", stats.retries),
            ("dead_lettered", stats.dead_lettered),
        ] {
            counter.add(count, &[KeyValue::new("outcome", outcome)]);
        }
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_fulfillment(_stats: &FulfillmentStats) {}
