//! Error types for certgate

use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for certgate
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A parsed request body could not be re-encoded for its content type
    #[error("Body encoding error: {0}")]
    BodyEncoding(String),

    /// Request body stream failed before it was fully read
    #[error("Failed to read request body: {0}")]
    BodyRead(String),

    /// Request body exceeded the buffering limit
    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge {
        /// Configured limit in bytes
        limit: usize,
    },

    /// Upstream connection could not be established
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Upstream did not answer in time
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status surfaced to the original client
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BodyEncoding(_) | Self::BodyRead(_) => StatusCode::BAD_REQUEST,
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Config(_) | Self::Io(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Classify a reqwest failure from the forwarding step
    #[must_use]
    pub fn from_upstream(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::UpstreamTimeout(err.to_string())
        } else {
            Self::UpstreamUnreachable(err.to_string())
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (
            status,
            Json(json!({
                "error": {
                    "status": status.as_u16(),
                    "message": self.to_string()
                }
            })),
        )
            .into_response()
    }
}
