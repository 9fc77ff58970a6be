//! Logging setup and OpenTelemetry spans for throttled calls.
//!
//! Log lines go through `tracing`; spans around acquisitions and the
//! outbound calls they guard go through OpenTelemetry, exported over OTLP
//! when an endpoint is configured and dropped otherwise.

use opentelemetry::global::BoxedSpan;
use opentelemetry::trace::{Span, Status, Tracer};
use opentelemetry::KeyValue;

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Install the global `tracing` subscriber on stderr. `RUST_LOG` wins over
/// the built-in `api_throttle=info` filter.
pub fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "api_throttle=info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let result = match format {
        LogFormat::Plain => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    // a subscriber may already be installed (tests, embedding apps)
    let _ = result;
}

// ---------------------------------------------------------------------------
// Configuration types
// ---------------------------------------------------------------------------

/// Exporter backend for trace data.
#[derive(Debug, Clone, PartialEq)]
pub enum ExporterType {
    Otlp,
    None,
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub exporter: ExporterType,
    /// Only used by the OTLP exporter.
    pub otlp_endpoint: Option<String>,
}

impl TracingConfig {
    /// OTLP when an endpoint is given, noop otherwise.
    pub fn from_endpoint(endpoint: Option<String>) -> Self {
        Self {
            exporter: if endpoint.is_some() {
                ExporterType::Otlp
            } else {
                ExporterType::None
            },
            otlp_endpoint: endpoint,
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::from_endpoint(None)
    }
}

// ---------------------------------------------------------------------------
// SpanGuard
// ---------------------------------------------------------------------------

/// RAII wrapper that ends the span when dropped.
pub struct SpanGuard {
    inner: BoxedSpan,
}

impl SpanGuard {
    pub fn set_attribute(&mut self, key: &str, value: String) {
        self.inner
            .set_attribute(KeyValue::new(key.to_owned(), value));
    }

    pub fn set_status(&mut self, success: bool, message: &str) {
        if success {
            self.inner.set_status(Status::Ok);
        } else {
            self.inner.set_status(Status::error(message.to_owned()));
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.inner.end();
    }
}

// ---------------------------------------------------------------------------
// ThrottleTracer
// ---------------------------------------------------------------------------

/// Owns the [`SdkTracerProvider`](opentelemetry_sdk::trace::SdkTracerProvider)
/// so it can be flushed on shutdown.
pub struct ThrottleTracer {
    provider: opentelemetry_sdk::trace::SdkTracerProvider,
}

impl ThrottleTracer {
    /// # Errors
    /// Returns an error if the OTLP exporter cannot be configured.
    pub fn init(config: &TracingConfig) -> anyhow::Result<Self> {
        let provider = match config.exporter {
            ExporterType::None => opentelemetry_sdk::trace::SdkTracerProvider::builder().build(),
            ExporterType::Otlp => {
                let mut builder = opentelemetry_otlp::SpanExporter::builder().with_http();
                if let Some(ref endpoint) = config.otlp_endpoint {
                    use opentelemetry_otlp::HasExportConfig;
                    builder.export_config().endpoint = Some(endpoint.clone());
                }
                let exporter = builder.build()?;
                opentelemetry_sdk::trace::SdkTracerProvider::builder()
                    .with_simple_exporter(exporter)
                    .build()
            }
        };

        Ok(Self { provider })
    }

    /// Make this provider back the global tracer used by
    /// [`trace_acquisition`] and [`trace_outbound_call`].
    pub fn install_global(&self) {
        opentelemetry::global::set_tracer_provider(self.provider.clone());
    }

    pub fn shutdown(&self) {
        let _ = self.provider.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Convenience functions
// ---------------------------------------------------------------------------

/// Span covering the wait for a token.
pub fn trace_acquisition(provider: &str) -> SpanGuard {
    let tracer = opentelemetry::global::tracer("api-throttle");
    let mut span = tracer.start(format!("throttle/{provider}"));
    span.set_attribute(KeyValue::new("throttle.provider", provider.to_owned()));
    SpanGuard { inner: span }
}

/// Span covering the outbound call made under a granted token.
pub fn trace_outbound_call(provider: &str, operation: &str) -> SpanGuard {
    let tracer = opentelemetry::global::tracer("api-throttle");
    let mut span = tracer.start(format!("outbound/{provider}/{operation}"));
    span.set_attribute(KeyValue::new("outbound.provider", provider.to_owned()));
    span.set_attribute(KeyValue::new("outbound.operation", operation.to_owned()));
    SpanGuard { inner: span }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
