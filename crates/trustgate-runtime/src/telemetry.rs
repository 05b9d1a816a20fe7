//! Logging and trace export bootstrap.
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `TRUSTGATE_LOG_FORMAT=json` | Newline-delimited JSON instead of compact text. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP/HTTP collector URL.  When set, spans (including the `#[instrument]` boot spans) are exported. |
//!
//! ```rust,no_run
//! // Keep the guard alive until the process exits.
//! let _guard = trustgate_runtime::telemetry::init_tracing("trustgate");
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FORMAT_ENV: &str = "TRUSTGATE_LOG_FORMAT";
pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    /// `json` (any case) selects JSON; anything else is compact.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }

    pub fn from_env() -> Self {
        Self::parse(std::env::var(LOG_FORMAT_ENV).ok().as_deref())
    }
}

/// Install the global subscriber.  Safe to call more than once; later calls
/// leave the first subscriber in place.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = match LogFormat::from_env() {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .boxed(),
    };

    let provider = build_provider(service_name, std::env::var(OTLP_ENDPOINT_ENV).ok());
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("trustgate")));

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(otel_layer)
        .with(filter)
        .try_init()
    {
        eprintln!("[trustgate] tracing already initialised: {e}");
    }

    TracerProviderGuard(provider)
}

/// Flushes and shuts down the span exporter on drop.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl TracerProviderGuard {
    pub fn is_exporting(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[trustgate] OpenTelemetry shutdown error: {e}");
        }
    }
}

/// `None` without an endpoint or when the exporter cannot be built.
fn build_provider(service_name: &str, endpoint: Option<String>) -> Option<SdkTracerProvider> {
    let endpoint = endpoint.filter(|e| !e.trim().is_empty())?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[trustgate] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    // Simple exporter: the binary starts tracing before any async runtime.
    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            .with_simple_exporter(exporter)
            .build(),
    )
}
