//! Error types for the BI realtime service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ehub_core::EhubError;
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] EhubError),

    #[error("Unknown window: {0}")]
    UnknownWindow(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Aggregate not found: {0}")]
    AggregateNotFound(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::UnknownWindow(_) | Error::InvalidRequest(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            Error::AggregateNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            Error::Core(inner) => {
                let status = StatusCode::from_u16(inner.status_code())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if status.is_server_error() {
                    tracing::error!("Internal error: {:?}", self);
                }
                (status, self.to_string())
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
