//! Telemetry settings

/// Output encoding for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "text" | "pretty" | "plain" => Some(Self::Text),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub default_directive: String,
    pub format: LogFormat,
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            format: LogFormat::Json,
            otlp_endpoint: None,
        }
    }
}

impl TelemetryConfig {
    /// `LOG_LEVEL`, `LOG_FORMAT` (or the older `JSON_LOGS` flag) and
    /// `OTEL_EXPORTER_OTLP_ENDPOINT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let format = get("LOG_FORMAT")
            .and_then(|raw| LogFormat::parse(&raw))
            .or_else(|| {
                get("JSON_LOGS").map(|v| match v.trim() {
                    "false" | "0" => LogFormat::Text,
                    _ => LogFormat::Json,
                })
            })
            .unwrap_or(LogFormat::Json);

        Self {
            default_directive: get("LOG_LEVEL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "info".to_string()),
            format,
            otlp_endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT").filter(|v| !v.trim().is_empty()),
        }
    }
}
