//! Error types for the HTTP service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use conduit_core::{DispatchError, EventStoreError, QueueError, ReceiveError, SignatureError};
use tracing::{error, warn};

/// Seconds a shed webhook sender is asked to wait before redelivering.
pub const OVERLOAD_RETRY_AFTER_SECONDS: u64 = 5;

/// Build the JSON error body shared by every error response.
fn error_response(status: StatusCode, message: String, retry_after: Option<u64>) -> Response {
    let body = serde_json::json!({
        "error": message,
        "status": status.as_u16(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    let mut response = (status, Json(body)).into_response();

    if let Some(retry_seconds) = retry_after {
        if let Ok(header_value) = retry_seconds.to_string().parse() {
            response.headers_mut().insert("Retry-After", header_value);
        }
    }

    response
}

/// Webhook handler errors with HTTP status code mapping
///
/// - `400 Bad Request`: malformed body, do not retry
/// - `401 Unauthorized`: signature missing, unreadable or wrong, or unknown provider
/// - `503 Service Unavailable`: queue full or ledger unavailable, retry later
///
/// Authentication failures deliberately return the same message whatever
/// the underlying reason, so callers cannot distinguish an unknown provider
/// from a bad signature. The precise reason is logged server-side.
#[derive(Debug, thiserror::Error)]
pub enum WebhookHandlerError {
    #[error(transparent)]
    Receive(#[from] ReceiveError),
}

impl IntoResponse for WebhookHandlerError {
    fn into_response(self) -> Response {
        let (status, message, retry_after) = match self {
            Self::Receive(ReceiveError::Authentication(ref e)) => {
                warn!(reason = e.reason(), error = %e, "Webhook authentication failed");
                let message = match e {
                    SignatureError::MissingSignature => "Missing signature",
                    _ => "Invalid signature",
                };
                (StatusCode::UNAUTHORIZED, message.to_string(), None)
            }
            Self::Receive(ReceiveError::Validation(ref e)) => {
                (StatusCode::BAD_REQUEST, format!("Invalid webhook: {}", e), None)
            }
            Self::Receive(ReceiveError::Overloaded) => {
                warn!("Webhook shed, work queue is full");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    self.to_string(),
                    Some(OVERLOAD_RETRY_AFTER_SECONDS),
                )
            }
            Self::Receive(ReceiveError::Store(ref e)) => {
                error!(error = %e, "Event store failure during webhook admission");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Event store unavailable. Please retry later.".to_string(),
                    Some(OVERLOAD_RETRY_AFTER_SECONDS),
                )
            }
        };

        error_response(status, message, retry_after)
    }
}

/// Operator endpoint errors
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("{what} not found")]
    NotFound { what: String },

    #[error("{message}")]
    Conflict { message: String },

    #[error("Work queue is full")]
    QueueFull,

    #[error("Service unavailable: {message}")]
    Unavailable { message: String },
}

impl From<EventStoreError> for AdminError {
    fn from(e: EventStoreError) -> Self {
        match e {
            EventStoreError::NotFound { key } => Self::NotFound {
                what: format!("Event '{}'", key),
            },
            EventStoreError::InvalidTransition { .. } => Self::Conflict {
                message: e.to_string(),
            },
            EventStoreError::Unavailable { message } => Self::Unavailable { message },
        }
    }
}

impl From<DispatchError> for AdminError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Store(e) => e.into(),
            DispatchError::Queue(QueueError::Full) => Self::QueueFull,
            other => Self::Unavailable {
                message: other.to_string(),
            },
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, retry_after) = match self {
            Self::NotFound { .. } => (StatusCode::NOT_FOUND, None),
            Self::Conflict { .. } => (StatusCode::CONFLICT, None),
            Self::QueueFull => (
                StatusCode::SERVICE_UNAVAILABLE,
                Some(OVERLOAD_RETRY_AFTER_SECONDS),
            ),
            Self::Unavailable { ref message } => {
                error!(error = %message, "Admin operation failed");
                (StatusCode::SERVICE_UNAVAILABLE, None)
            }
        };

        error_response(status, self.to_string(), retry_after)
    }
}

/// Service-level errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Failed to bind to address {address}: {message}")]
    BindFailed { address: String, message: String },

    #[error("Server failed: {message}")]
    ServerFailed { message: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Shutdown failed: {message}")]
    ShutdownFailed { message: String },
}

impl ServiceError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::BindFailed { .. } => 1,
            Self::ServerFailed { .. } => 2,
            Self::Configuration(_) => 3,
            Self::ShutdownFailed { .. } => 4,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {0}")]
    Parsing(#[from] config::ConfigError),
}

#[cfg(test)]
#[path = "errors_tests.rs"]
mod tests;
