use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Details of a rate-limit denial, returned to the caller that tripped it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaDenial {
    pub action: String,
    pub limit: u32,
    pub remaining: u32,
    pub retry_after_secs: u64,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Rate limit exceeded for '{}', retry after {}s", .0.action, .0.retry_after_secs)]
    QuotaExceeded(QuotaDenial),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
            retry_after: None,
        }
    }

    pub fn from_error(err: &Error) -> Self {
        let message = err.to_string();
        match err {
            Error::QuotaExceeded(denial) => Self {
                retry_after: Some(denial.retry_after_secs),
                ..Self::new("rate_limit_exceeded", &message, 429)
            },
            Error::Validation(_) => Self::new("validation_error", &message, 422),
            Error::StoreUnavailable(_) => Self::new("service_unavailable", &message, 503),
            Error::Configuration(_) => Self::new("configuration_error", &message, 500),
            Error::Serialization(_) | Error::Io(_) => Self::new("internal_error", &message, 500),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(body)).into_response();

        if let Error::QuotaExceeded(denial) = &self {
            let headers = response.headers_mut();
            headers.insert("Retry-After", HeaderValue::from(denial.retry_after_secs));
            headers.insert("X-RateLimit-Limit", HeaderValue::from(denial.limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(denial.remaining));
        }

        response
    }
}
