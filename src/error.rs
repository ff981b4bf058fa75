//! # Error Handling
//!
//! One error type for the whole service. The realtime path uses it to decide
//! what a failure means for a live connection; the HTTP surface uses it to
//! render a JSON error body.
//!
//! ## Error Categories:
//! - **Fatal to the connection**: authentication, unknown counterpart, missing
//!   voice identity, model session open timeout
//! - **Recoverable**: upstream transport/HTTP failures mid-conversation
//! - **Everything else**: configuration and internal faults

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Bearer credential missing, malformed or rejected
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Requested resource (counterpart, session) does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller supplied an unusable argument (e.g. no voice identity)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Remote end did not acknowledge readiness in time
    #[error("Connection timeout: {0}")]
    ConnectionTimeout(String),

    /// Entry already registered under the same key
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Network or websocket failure talking to an upstream service
    #[error("Transport error: {0}")]
    Transport(String),

    /// Upstream answered with a non-success status
    #[error("Upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// Configuration file or environment variable problems
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether this failure terminates the client connection.
    ///
    /// Setup-phase failures are fatal; transport and upstream failures during
    /// an active conversation only abandon the current turn.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            AppError::Unauthenticated(_)
                | AppError::NotFound(_)
                | AppError::InvalidArgument(_)
                | AppError::ConnectionTimeout(_)
                | AppError::AlreadyExists(_)
        )
    }

    /// Machine-readable error type used in JSON bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Unauthenticated(_) => "unauthenticated",
            AppError::NotFound(_) => "not_found",
            AppError::InvalidArgument(_) => "invalid_argument",
            AppError::ConnectionTimeout(_) => "connection_timeout",
            AppError::AlreadyExists(_) => "already_exists",
            AppError::Transport(_) => "transport_error",
            AppError::Upstream { .. } => "upstream_error",
            AppError::Config(_) => "config_error",
            AppError::Internal(_) => "internal_error",
        }
    }
}

/// Converts errors into HTTP responses for the plain REST routes and for
/// websocket upgrades rejected before the handshake.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "unauthenticated",
///     "message": "Unauthenticated: missing bearer credential",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            AppError::ConnectionTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::AlreadyExists(_) => StatusCode::CONFLICT,
            AppError::Transport(_) | AppError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            AppError::Config(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidArgument(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => AppError::Upstream {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => AppError::Transport(err.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::Transport(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_failures_are_fatal() {
        assert!(AppError::Unauthenticated("bad token".into()).is_fatal_to_connection());
        assert!(AppError::NotFound("counterpart".into()).is_fatal_to_connection());
        assert!(AppError::ConnectionTimeout("model".into()).is_fatal_to_connection());
        assert!(!AppError::Transport("reset".into()).is_fatal_to_connection());
        assert!(!AppError::Upstream { status: 503, message: "busy".into() }.is_fatal_to_connection());
    }

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(AppError::Unauthenticated("x".into()).status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::InvalidArgument("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::Upstream { status: 500, message: "x".into() }.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_json_error_becomes_invalid_argument() {
        let err: AppError = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err().into();
        assert_eq!(err.kind(), "invalid_argument");
    }
}
