//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! Flow runs log with structured fields (`flow`, `step`, `run` spans), so
//! the fmt layer keeps targets visible and records span close timing.
//! The OTel bridge uses a stdout exporter, suitable for local
//! development; swap it for OTLP in production.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use std::sync::OnceLock;

/// Holds the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// How the global subscriber is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingOptions {
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
    /// Bridge tracing spans to OpenTelemetry (stdout exporter).
    pub otel: bool,
}

/// Initialize the global tracing subscriber.
///
/// Respects `RUST_LOG`; defaults to `info` when unset.
///
/// # Errors
///
/// Returns an error if a global subscriber has already been installed.
pub fn init_tracing(options: TracingOptions) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    if options.otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("rpcflow");

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);

        if options.json {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_target(true))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()?;
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_span_events(FmtSpan::CLOSE),
                )
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()?;
        }
    } else if options.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    }

    Ok(())
}

/// Flush pending traces and shut down the OTel tracer provider.
///
/// Safe to call when OTel was never enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}
