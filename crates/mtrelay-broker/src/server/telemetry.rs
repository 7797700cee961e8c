//! # Telemetry
//!
//! Console logging is always on: a `tracing_subscriber` registry filtered by
//! `RUST_LOG` (default `info`) with a pretty `fmt` layer. OpenTelemetry export
//! is opt-in through cargo features.
//!
//! ## Feature matrix
//!
//! - `tracing`: Exports spans through OpenTelemetry.
//! - `metrics`: Exports the broker counters below through OpenTelemetry.
//! - `honeycomb`: Enables the Honeycomb OTLP exporter.
//! - `stdout`: Enables the stdout OTLP exporter.
//!
//! Exporters require at least one of `tracing` or `metrics`. Both exporters
//! can be enabled together.
//!
//! ## Metrics
//!
//! | Name                   | Kind      | Meaning                                    |
//! |------------------------|-----------|--------------------------------------------|
//! | `requests`             | counter   | Client requests received                   |
//! | `requests_dispatched`  | counter   | Requests handed to a worker                |
//! | `requests_queued`      | counter   | Requests parked for lack of a worker       |
//! | `requests_expired`     | counter   | Requests answered with `KO\|Expired`       |
//! | `queue_rejections`     | counter   | Requests refused because a queue was full  |
//! | `replies_abandoned`    | counter   | Worker replies nobody was waiting for      |
//! | `workers_evicted`      | counter   | Workers dropped for missing their deadline |
//! | `ready_workers`        | gauge     | Idle workers                               |
//! | `events_forwarded`     | counter   | Published events delivered to subscribers  |
//! | `frames_dropped`       | counter   | Frames dropped for a gone/slow peer        |
//! | `queue_wait`           | histogram | Time a request spent queued (ms)           |
//!
//! Every recording function compiles to a no-op without `metrics`.
//!
//! ```bash
//! cargo run -p mtrelay-broker --features tracing,metrics,honeycomb
//! cargo run -p mtrelay-broker --features metrics,stdout
//! ```

#[cfg(all(
    feature = "honeycomb",
    not(any(feature = "tracing", feature = "metrics"))
))]
compile_error!(
    "The 'honeycomb' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

#[cfg(all(feature = "stdout", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "tracing")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(all(feature = "honeycomb", feature = "metrics"))]
use opentelemetry_sdk::metrics::Temporality;
#[cfg(feature = "honeycomb")]
use tonic::{metadata::MetadataMap, transport::ClientTlsConfig};

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::trace as sdktrace;

const SERVICE_NAME: &str = "mtrelay-broker";

/// Providers that must be flushed and shut down before the process exits.
pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes pending spans and metrics. Failures are logged, not returned.
    pub fn shutdown(self) {
        #[cfg(feature = "tracing")]
        if let Err(e) = self.tracer_provider.shutdown() {
            tracing::error!("Failed to shut down tracer provider: {e}");
        }
        #[cfg(feature = "metrics")]
        if let Err(e) = self.meter_provider.shutdown() {
            tracing::error!("Failed to shut down meter provider: {e}");
        }
    }
}

/// Installs the global subscriber and, with the export features, the
/// OpenTelemetry providers.
///
/// # Errors
///
/// Fails if an exporter cannot be configured or a global subscriber is
/// already installed.
pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "tracing")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "tracing")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        );

    #[cfg(feature = "tracing")]
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
        init_metric_handles(&opentelemetry::global::meter_with_scope(scope));
        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(feature = "honeycomb")]
struct HoneycombSettings {
    metadata: MetadataMap,
    endpoint: String,
    compression: Compression,
}

#[cfg(feature = "honeycomb")]
fn honeycomb_settings() -> anyhow::Result<HoneycombSettings> {
    use anyhow::Context;
    use std::str::FromStr;

    let api_key = std::env::var("HONEYCOMB_API_KEY").context("missing `HONEYCOMB_API_KEY`")?;
    let dataset = std::env::var("HONEYCOMB_DATASET").context("missing `HONEYCOMB_DATASET`")?;
    let endpoint = std::env::var("HONEYCOMB_ENDPOINT").context("missing `HONEYCOMB_ENDPOINT`")?;
    let compression = std::env::var("HONEYCOMB_COMPRESSION")
        .context("missing `HONEYCOMB_COMPRESSION`")?
        .to_ascii_lowercase();

    let mut metadata = MetadataMap::new();
    metadata.insert(
        "x-honeycomb-team",
        api_key.parse().context("invalid API key")?,
    );
    metadata.insert(
        "x-honeycomb-dataset",
        dataset.parse().context("invalid dataset")?,
    );

    Ok(HoneycombSettings {
        metadata,
        endpoint,
        compression: Compression::from_str(&compression)?,
    })
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
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
fn init_metrics() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        let reader = sdkmetrics::PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
            .with_interval(std::time::Duration::from_secs(5))
            .build();
        builder.with_reader(reader)
    };

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let settings = honeycomb_settings()?;
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(settings.metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(settings.compression)
            .with_endpoint(settings.endpoint)
            .with_protocol(Protocol::Grpc)
            .with_temporality(Temporality::Delta)
            .build()
            .context("failed to build metrics exporter")?;
        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "tracing")]
fn batch_config() -> sdktrace::BatchConfig {
    sdktrace::BatchConfigBuilder::default()
        .with_scheduled_delay(std::time::Duration::from_secs(5))
        .with_max_queue_size(2048)
        .build()
}

#[cfg(feature = "tracing")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_span_processor(
        sdktrace::BatchSpanProcessor::builder(opentelemetry_stdout::SpanExporter::default())
            .with_batch_config(batch_config())
            .build(),
    );

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let settings = honeycomb_settings()?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(settings.metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(settings.compression)
            .with_endpoint(settings.endpoint)
            .with_protocol(Protocol::Grpc)
            .build()
            .context("failed to build tracer exporter")?;
        builder.with_span_processor(
            sdktrace::BatchSpanProcessor::builder(exporter)
                .with_batch_config(batch_config())
                .build(),
        )
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
struct Instruments {
    requests: Counter<u64>,
    dispatched: Counter<u64>,
    queued: Counter<u64>,
    expired: Counter<u64>,
    queue_rejections: Counter<u64>,
    abandoned: Counter<u64>,
    evicted: Counter<u64>,
    ready_workers: Gauge<u64>,
    events_forwarded: Counter<u64>,
    frames_dropped: Counter<u64>,
    queue_wait_ms: Histogram<f64>,
}

#[cfg(feature = "metrics")]
static INSTRUMENTS: OnceLock<Instruments> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: &Meter) {
    let counter = |name: &'static str, description: &'static str| {
        meter.u64_counter(name).with_description(description).build()
    };

    let _ = INSTRUMENTS.set(Instruments {
        requests: counter("requests", "Client requests received"),
        dispatched: counter("requests_dispatched", "Requests handed to a worker"),
        queued: counter("requests_queued", "Requests queued for lack of a worker"),
        expired: counter("requests_expired", "Requests answered with KO|Expired"),
        queue_rejections: counter("queue_rejections", "Requests refused by a full queue"),
        abandoned: counter("replies_abandoned", "Worker replies with no waiting client"),
        evicted: counter("workers_evicted", "Workers dropped for missing a deadline"),
        ready_workers: meter
            .u64_gauge("ready_workers")
            .with_description("Idle workers")
            .build(),
        events_forwarded: counter("events_forwarded", "Events delivered to subscribers"),
        frames_dropped: counter("frames_dropped", "Frames dropped for a gone or slow peer"),
        queue_wait_ms: meter
            .f64_histogram("queue_wait")
            .with_unit("ms")
            .with_description("Time a request spent queued before dispatch")
            .build(),
    });
}

/// Defines a recording function that is a no-op without `metrics`.
macro_rules! instrument_fn {
    ($(#[$doc:meta])* $name:ident($($arg:ident: $ty:ty),*) => |$m:ident| $body:expr) => {
        $(#[$doc])*
        #[cfg(feature = "metrics")]
        pub fn $name($($arg: $ty),*) {
            if let Some($m) = INSTRUMENTS.get() {
                $body;
            }
        }

        $(#[$doc])*
        #[cfg(not(feature = "metrics"))]
        #[allow(unused_variables)]
        pub fn $name($($arg: $ty),*) {}
    };
}

instrument_fn!(increment_requests() => |m| m.requests.add(1, &[]));
instrument_fn!(increment_dispatched() => |m| m.dispatched.add(1, &[]));
instrument_fn!(increment_queued() => |m| m.queued.add(1, &[]));
instrument_fn!(increment_expired(count: usize) => |m| m.expired.add(count as u64, &[]));
instrument_fn!(increment_queue_rejections() => |m| m.queue_rejections.add(1, &[]));
instrument_fn!(increment_abandoned_replies() => |m| m.abandoned.add(1, &[]));
instrument_fn!(increment_workers_evicted() => |m| m.evicted.add(1, &[]));
instrument_fn!(
    /// Records the current size of the ready queue.
    record_ready_workers(count: usize) => |m| m.ready_workers.record(count as u64, &[])
);
instrument_fn!(increment_events_forwarded(count: usize) => |m| m.events_forwarded.add(count as u64, &[]));
instrument_fn!(increment_frames_dropped() => |m| m.frames_dropped.add(1, &[]));
instrument_fn!(
    /// Records how long a request sat in a queue before reaching a worker.
    record_queue_wait(waited: core::time::Duration) => |m| m.queue_wait_ms.record(waited.as_secs_f64() * 1000.0, &[])
);
