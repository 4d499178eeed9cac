//! Standardized error handling for control-plane API responses
//!
//! The base taxonomy maps to HTTP statuses; auth-specific codes are
//! layered on top as dotted strings so clients can branch without
//! parsing prose.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

/// Error body returned on every failure.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_sec: Option<u64>,
}

/// API error with a fixed status mapping.
#[derive(Debug)]
pub enum ApiError {
    /// 400 Bad Request
    InvalidInput(String),

    /// 401 Unauthorized with a dotted auth code
    Unauthorized(&'static str),

    /// 403 Forbidden
    Forbidden(String),

    /// 404 Not Found
    NotFound(String),

    /// 405 Method Not Allowed
    MethodNotAllowed,

    /// 409 Conflict
    Conflict(String),

    /// 412 Precondition Failed
    PreconditionFailed(String),

    /// 413 Payload Too Large
    PayloadTooLarge(String),

    /// 429 Too Many Requests with Retry-After
    RateLimited { retry_after_sec: u64 },

    /// 500 Internal Server Error
    Internal(String),

    /// 501 Not Implemented
    NotImplemented(String),
}

/// Dotted auth error codes.
pub mod codes {
    pub const INVALID_CREDENTIALS: &str = "auth.invalid_credentials";
    pub const ACCOUNT_LOCKED: &str = "auth.account_locked";
    pub const TWO_FACTOR_REQUIRED: &str = "auth.2fa_required";
    pub const SESSION_EXPIRED: &str = "auth.session.expired";
    pub const CSRF_MISSING: &str = "auth.csrf.missing";
    pub const CSRF_INVALID: &str = "auth.csrf.invalid";
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
        }
    }

    fn code(&self) -> String {
        match self {
            ApiError::InvalidInput(m) => m.clone(),
            ApiError::Unauthorized(code) => (*code).to_string(),
            ApiError::Forbidden(m) => m.clone(),
            ApiError::NotFound(m) => m.clone(),
            ApiError::MethodNotAllowed => "method_not_allowed".to_string(),
            ApiError::Conflict(m) => m.clone(),
            ApiError::PreconditionFailed(m) => m.clone(),
            ApiError::PayloadTooLarge(m) => m.clone(),
            ApiError::RateLimited { .. } => "rate_limited".to_string(),
            ApiError::Internal(m) => m.clone(),
            ApiError::NotImplemented(m) => m.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(ref msg) = self {
            error!("internal error: {}", msg);
        }

        let retry_after = match self {
            ApiError::RateLimited { retry_after_sec } => Some(retry_after_sec),
            _ => None,
        };
        let body = ErrorBody {
            error: self.code(),
            retry_after_sec: retry_after,
        };
        let mut response = (self.status(), Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<nos_common::Error> for ApiError {
    fn from(err: nos_common::Error) -> Self {
        use nos_common::Error;
        match err {
            Error::InvalidInput(m) => ApiError::InvalidInput(m),
            Error::NotAllowed(m) => ApiError::Forbidden(m),
            Error::NotFound(m) => ApiError::NotFound(m),
            Error::Conflict(m) => ApiError::Conflict(m),
            Error::PayloadTooLarge(m) => ApiError::PayloadTooLarge(m),
            Error::RateLimited { retry_after_sec } => ApiError::RateLimited { retry_after_sec },
            Error::PreconditionFailed(m) => ApiError::PreconditionFailed(m),
            Error::NotImplemented(m) => ApiError::NotImplemented(m),
            Error::Internal(m) => ApiError::Internal(m),
            Error::Io(e) => ApiError::Internal(format!("I/O error: {}", e)),
            Error::Json(e) => ApiError::InvalidInput(format!("invalid JSON: {}", e)),
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
