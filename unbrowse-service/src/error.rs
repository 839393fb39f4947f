//! Error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the service error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the service
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Missing or malformed argument
    #[error("Bad request: {0}")]
    Input(String),

    /// Unknown skill, endpoint, or session
    #[error("Not found: {0}")]
    NotFound(String),

    /// Mutation attempted without confirmation
    #[error("Confirmation required: {0}")]
    ConfirmRequired(String),

    /// A live capture for the domain is already running
    #[error("Capture in flight: {0}")]
    CaptureInFlight(String),

    /// Resource conflict (lock contention, duplicate state)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Marketplace or target site unreachable or failing
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Correlation source value missing at replay time
    #[error("Replay mismatch: {0}")]
    ReplayMismatch(String),

    /// Token refresh failed
    #[error("Refresh error: {0}")]
    Schedule(String),

    /// Credential store or keychain failure
    #[error("Credential error: {0}")]
    Credential(String),

    /// Interactive login did not complete in time
    #[error("Login timed out: {0}")]
    LoginTimeout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Self::Config(Box::new(e))
    }
}

impl Error {
    /// Machine-readable code carried in the wire error body
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Input(_) => "input",
            Self::NotFound(_) => "not_found",
            Self::ConfirmRequired(_) => "confirm_required",
            Self::CaptureInFlight(_) => "capture_in_flight",
            Self::Conflict(_) => "conflict",
            Self::Upstream(_) => "upstream",
            Self::ReplayMismatch(_) => "replay_mismatch",
            Self::Schedule(_) => "schedule",
            Self::Credential(_) => "credential",
            Self::LoginTimeout(_) => "login_timeout",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Input(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ConfirmRequired(_) => StatusCode::PRECONDITION_FAILED,
            Self::CaptureInFlight(_) | Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::LoginTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Wire error body: `{error, code?}`
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable message, never empty
    pub error: String,

    /// Machine-readable code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        // Internal details stay in the logs, never on the wire.
        let message = match &self {
            Self::Internal(_) => {
                tracing::error!("Internal error: {}", self);
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorResponse {
            error: message,
            code: Some(self.code().to_string()),
        };
        (status, Json(body)).into_response()
    }
}
