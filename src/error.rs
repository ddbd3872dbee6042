//! Error types for the gateway and their HTTP mapping.
//!
//! Every failure is terminal for the request. Responses carry the status
//! code and a short `detail` string; backend error text is logged but never
//! returned to the caller.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced to HTTP callers.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Credential absent, unknown or expired. Deliberately undifferentiated.
    #[error("Invalid, expired or missing API Key")]
    Unauthorized,

    /// A key exists for the identity but it is past its expiry.
    #[error("API Key expired")]
    Expired,

    /// A required caller-supplied field is missing.
    #[error("{0}")]
    BadRequest(String),

    /// No record for the requested identity or resource.
    #[error("{0}")]
    NotFound(String),

    /// The key directory or the table reader could not be reached in time.
    #[error("Backing service unavailable")]
    ServiceUnavailable,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized | GatewayError::Expired => StatusCode::UNAUTHORIZED,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// JSON error envelope.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: u16,
    pub detail: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            status: status.as_u16(),
            detail: self.to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}

/// Failures talking to the key directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory request failed: {0}")]
    Unavailable(String),

    #[error("directory lookup timed out")]
    Timeout,

    #[error("malformed directory document: {0}")]
    Malformed(String),
}

/// Failures talking to the table reader.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("table query failed: {0}")]
    Query(String),

    #[error("table query timed out")]
    Timeout,

    #[error("unexpected table response: {0}")]
    Decode(String),
}

impl From<DirectoryError> for GatewayError {
    fn from(e: DirectoryError) -> Self {
        tracing::warn!(error = %e, "key directory failure");
        GatewayError::ServiceUnavailable
    }
}

impl From<TableError> for GatewayError {
    fn from(e: TableError) -> Self {
        tracing::warn!(error = %e, "table reader failure");
        GatewayError::ServiceUnavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(GatewayError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(GatewayError::Expired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::BadRequest("address is required".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::NotFound("no key".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::ServiceUnavailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_backend_errors_hide_detail() {
        let err: GatewayError = DirectoryError::Unavailable("10.0.0.4 refused".into()).into();
        assert!(matches!(err, GatewayError::ServiceUnavailable));
        assert!(!err.to_string().contains("10.0.0.4"));
    }

    #[test]
    fn test_error_body_serialization() {
        let body = ErrorBody {
            status: 401,
            detail: GatewayError::Unauthorized.to_string(),
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"status\":401"));
        assert!(json.contains("\"detail\":\"Invalid, expired or missing API Key\""));
    }
}
