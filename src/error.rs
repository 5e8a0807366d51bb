//! Error types for the airhost-rust library.
//!
//! This module provides custom error types using `thiserror` for better error handling
//! and more specific error messages throughout the application.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Errors that can occur in the airhost-rust application.
#[derive(Error, Debug)]
pub enum AirhostError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Connection pool errors
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Outbound HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A remote API answered with a non-success status
    #[error("{service} API returned {status}: {body}")]
    Upstream {
        /// Name of the remote service
        service: &'static str,
        /// HTTP status code
        status: u16,
        /// Response body, as returned
        body: String,
    },

    /// Requested row does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Request input rejected
    #[error("Validation error: {0}")]
    Validation(String),

    /// Request body missing, malformed or of the wrong shape
    #[error("Invalid request body: {}", .0.body_text())]
    InvalidBody(#[from] JsonRejection),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary serialization errors
    #[error("Binary serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// CSV export errors
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Cache errors
    #[error("Cache error: {0}")]
    Cache(String),

    /// General error with context
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Result with AirhostError
pub type Result<T> = std::result::Result<T, AirhostError>;

impl AirhostError {
    /// HTTP status used when this error reaches a handler
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::InvalidBody(rejection) => rejection.status(),
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Upstream { .. } | Self::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for AirhostError {
    fn from(err: anyhow::Error) -> Self {
        AirhostError::Other(err.to_string())
    }
}

impl From<sled::Error> for AirhostError {
    fn from(err: sled::Error) -> Self {
        AirhostError::Cache(err.to_string())
    }
}

impl IntoResponse for AirhostError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AirhostError::Validation("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AirhostError::NotFound("property".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            AirhostError::Upstream { service: "WhatsApp", status: 401, body: String::new() }.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(AirhostError::Other("boom".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_not_found_message() {
        assert_eq!(AirhostError::NotFound("Property p1".into()).to_string(), "Property p1 not found");
    }
}
