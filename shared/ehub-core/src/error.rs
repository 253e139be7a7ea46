//! Error types for EnterpriseHub services

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EhubError>;

/// Platform error.
///
/// Every variant carries a rendered message rather than a source error so the
/// type stays `Clone`: a single failed computation can be handed to every
/// caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EhubError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Computation failed: {0}")]
    Compute(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EhubError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Unavailable(_) => 503,
            Self::Timeout(_) => 504,
            _ => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Network(_) => "NETWORK_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Compute(_) => "COMPUTE_ERROR",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Timeout(_) => "TIMEOUT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Transport-level failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Unavailable(_) | Self::Timeout(_))
    }
}

impl From<std::io::Error> for EhubError {
    fn from(err: std::io::Error) -> Self {
        EhubError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for EhubError {
    fn from(err: serde_json::Error) -> Self {
        EhubError::Serialization(err.to_string())
    }
}
