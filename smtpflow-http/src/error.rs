//! HTTP front door error types

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use smtpflow_delivery::SubmissionError;
use smtpflow_store::StoreError;
use thiserror::Error;

/// Errors that can occur while running the HTTP server
#[derive(Debug, Error)]
pub enum HttpError {
    /// Failed to bind to the specified address
    #[error("Failed to bind HTTP server to {address}: {source}")]
    BindError {
        address: String,
        source: std::io::Error,
    },

    /// HTTP server encountered a runtime error
    #[error("HTTP server error: {0}")]
    ServerError(String),
}

/// One rejected field of an API request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// A request that could not be served, rendered as a JSON body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid request")]
    Validation(Vec<FieldError>),

    #[error("Missing tracking_id")]
    MissingTrackingId,

    #[error("Not found")]
    NotFound,

    #[error(transparent)]
    Submission(#[from] SubmissionError),

    #[error("Storage unavailable: {0}")]
    Store(#[from] StoreError),
}

impl ApiError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Validation(_) | Self::MissingTrackingId => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Submission(err) => match err {
                SubmissionError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                SubmissionError::Malformed(_) => StatusCode::BAD_REQUEST,
                SubmissionError::Relay(_) => StatusCode::BAD_GATEWAY,
                SubmissionError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
            Self::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(%status, "{self}");
        }

        match self {
            Self::Validation(errors) => {
                (status, Json(serde_json::json!({ "errors": errors }))).into_response()
            }
            err => (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use smtpflow_delivery::RelayError;

    use super::*;

    #[test]
    fn statuses() {
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::from(SubmissionError::QuotaExceeded { used: 5, limit: 5 }).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::from(SubmissionError::Relay(RelayError::Unavailable("down".into())))
                .status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn display() {
        assert_eq!(
            ApiError::from(SubmissionError::QuotaExceeded { used: 5, limit: 5 }).to_string(),
            "Monthly limit reached (5/5)"
        );
        assert_eq!(ApiError::MissingTrackingId.to_string(), "Missing tracking_id");

        let err = HttpError::ServerError("boom".into());
        assert_eq!(err.to_string(), "HTTP server error: boom");
    }
}
