//! EnterpriseHub Telemetry
//!
//! Structured logging setup and the lock-light metric primitives every
//! pipeline component reports through.

mod config;
mod metrics;
mod tracing_setup;

pub use config::{LogFormat, TelemetryConfig};
pub use metrics::{Counter, Histogram, HistogramSnapshot};
pub use tracing_setup::init_tracing;

/// Install tracing from the environment. Keep the guard alive for the
/// lifetime of the process.
pub fn init(service_name: &str) -> Result<TelemetryGuard, TelemetryError> {
    init_tracing(service_name, &TelemetryConfig::from_env())?;
    Ok(TelemetryGuard {
        service: service_name.to_string(),
    })
}

/// Flushes the global tracer provider on drop
pub struct TelemetryGuard {
    service: String,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::debug!(service = %self.service, "Shutting down telemetry");
        opentelemetry::global::shutdown_tracer_provider();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Tracing initialization failed: {0}")]
    TracingInit(String),

    #[error("OTLP configuration error: {0}")]
    OtlpConfig(String),
}
