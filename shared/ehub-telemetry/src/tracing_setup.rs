//! Global subscriber installation

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;
use crate::{TelemetryConfig, TelemetryError};

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured default directive.
pub fn init_tracing(service_name: &str, config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.default_directive).map_err(|e| {
            TelemetryError::TracingInit(format!("invalid directive {:?}: {}", config.default_directive, e))
        })?,
    };

    if let Some(endpoint) = &config.otlp_endpoint {
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(TelemetryError::OtlpConfig(format!(
                "endpoint must be an http(s) URL, got {}",
                endpoint
            )));
        }
    }

    let fmt = tracing_subscriber::fmt::layer().with_target(true);
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Json => registry.with(fmt.json().with_thread_ids(true)).try_init(),
        LogFormat::Text => registry.with(fmt.compact()).try_init(),
    };
    installed.map_err(|e| TelemetryError::TracingInit(e.to_string()))?;

    if let Some(endpoint) = &config.otlp_endpoint {
        tracing::warn!(endpoint = %endpoint, "OTLP endpoint set; spans are logged locally only");
    }
    tracing::info!(
        service = service_name,
        directive = %config.default_directive,
        format = config.format.as_str(),
        "Tracing initialized"
    );
    Ok(())
}
