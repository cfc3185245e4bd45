//! Structured errors for the HTTP surface.
//!
//! Only upgrade-time refusals surface as HTTP errors; everything after the
//! upgrade is reported in-band as `status` frames.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

#[derive(Debug)]
pub enum ApiError {
    /// 429 - per-IP connection quota exhausted.
    RateLimited,
    /// 503 - broker is shutting down, no new upgrades.
    ShuttingDown,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::RateLimited => "rate_limited",
            ApiError::ShuttingDown => "shutting_down",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ApiError::RateLimited => "Too many connection attempts from this address.",
            ApiError::ShuttingDown => "The broker is shutting down.",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        }));
        (self.status_code(), body).into_response()
    }
}
