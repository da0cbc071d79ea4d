//! Edge error kinds and their HTTP mapping.
//!
//! Control-plane routes answer with a structured envelope
//! `{"success":false,"error":{"code","message"}}`. Public tunnel traffic gets
//! a small plain-text diagnostic instead (see the dispatcher).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    /// A tunnel exists but no agent is connected for it.
    #[error("tunnel offline: {0}")]
    TunnelOffline(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation failed: {0}")]
    Validation(String),
    /// The session closed while the request was in flight.
    #[error("tunnel disconnected: {0}")]
    Disconnected(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    /// The agent reported a failure executing the request at the origin.
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::TunnelOffline(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Disconnected(_) => StatusCode::BAD_GATEWAY,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::ProtocolViolation(_) => StatusCode::BAD_GATEWAY,
            Error::QuotaExceeded(_) => StatusCode::PAYMENT_REQUIRED,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::TunnelOffline(_) => "TUNNEL_OFFLINE",
            Error::Unauthenticated(_) => "UNAUTHENTICATED",
            Error::Forbidden(_) => "FORBIDDEN",
            Error::Conflict(_) => "CONFLICT",
            Error::Validation(_) => "VALIDATION",
            Error::Disconnected(_) => "DISCONNECTED",
            Error::Timeout(_) => "TIMEOUT",
            Error::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            Error::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Error::Upstream(_) => "UPSTREAM",
            Error::Internal(_) => "INTERNAL",
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => Error::Conflict(msg),
            StoreError::Backend(msg) => Error::Internal(msg),
        }
    }
}

impl From<giraffecloud_proto::ProtocolError> for Error {
    fn from(err: giraffecloud_proto::ProtocolError) -> Self {
        Error::ProtocolViolation(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            Error::TunnelOffline("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::QuotaExceeded("x".into()).status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            Error::Timeout("x".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            Error::Disconnected("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(Error::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn store_conflict_maps_to_conflict() {
        let err: Error = StoreError::Conflict("domain taken".into()).into();
        assert!(matches!(err, Error::Conflict(_)));
    }
}
