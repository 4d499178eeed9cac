//! Standardized error handling for agent API responses
//!
//! Maps internal errors onto the wire taxonomy: short machine-readable
//! codes in `{ "error": ... }` bodies with the matching HTTP status.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use nos_common::agent::ErrorBody;
use tracing::error;

/// API error with a fixed status mapping.
#[derive(Debug)]
pub enum ApiError {
    /// 400 Bad Request
    InvalidInput(String),

    /// 403 Forbidden (also: rejected by the command allowlist)
    NotAllowed(String),

    /// 404 Not Found
    NotFound(String),

    /// 405 Method Not Allowed
    MethodNotAllowed,

    /// 409 Conflict
    Conflict(String),

    /// 412 Precondition Failed (firewall validate failures)
    PreconditionFailed(String),

    /// 413 Payload Too Large
    PayloadTooLarge(String),

    /// 500 Internal Server Error
    Internal(String),

    /// 501 Not Implemented (host-specific paths)
    NotImplemented(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::NotAllowed(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::InvalidInput(m)
            | ApiError::NotAllowed(m)
            | ApiError::NotFound(m)
            | ApiError::Conflict(m)
            | ApiError::PreconditionFailed(m)
            | ApiError::PayloadTooLarge(m)
            | ApiError::Internal(m)
            | ApiError::NotImplemented(m) => m.clone(),
            ApiError::MethodNotAllowed => "method_not_allowed".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(ref msg) = self {
            error!("internal agent error: {}", msg);
        }
        let body = ErrorBody {
            error: self.message(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<nos_common::Error> for ApiError {
    fn from(err: nos_common::Error) -> Self {
        use nos_common::Error;
        match err {
            Error::InvalidInput(m) => ApiError::InvalidInput(m),
            Error::NotAllowed(m) => ApiError::NotAllowed(m),
            Error::NotFound(m) => ApiError::NotFound(m),
            Error::Conflict(m) => ApiError::Conflict(m),
            Error::PayloadTooLarge(m) => ApiError::PayloadTooLarge(m),
            Error::RateLimited { retry_after_sec } => {
                // The agent has no rate-limited surface of its own.
                ApiError::Internal(format!("rate limited, retry after {}s", retry_after_sec))
            }
            Error::PreconditionFailed(m) => ApiError::PreconditionFailed(m),
            Error::NotImplemented(m) => ApiError::NotImplemented(m),
            Error::Internal(m) => ApiError::Internal(m),
            Error::Io(e) => ApiError::Internal(format!("I/O error: {}", e)),
            Error::Json(e) => ApiError::InvalidInput(format!("invalid JSON: {}", e)),
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::InvalidInput("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotAllowed("invalid_command".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::PreconditionFailed("nft: syntax error".into()).status(),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(
            ApiError::NotImplemented("smartctl not present".into()).status(),
            StatusCode::NOT_IMPLEMENTED
        );
    }

    #[test]
    fn test_common_error_conversion() {
        let err: ApiError = nos_common::Error::NotAllowed("invalid_command".into()).into();
        assert!(matches!(err, ApiError::NotAllowed(_)));

        let err: ApiError =
            nos_common::Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom")).into();
        assert!(matches!(err, ApiError::Internal(_)));
    }
}
