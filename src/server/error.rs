use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::{ErrorKind, ServiceError, classify};

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

#[derive(Debug)]
pub enum ApiError {
    Service(ServiceError),
    BadRequest(String),
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError::Service(err)
    }
}

/// Status code and short label for a round-level failure.
pub fn status_for(err: &ServiceError) -> (StatusCode, &'static str) {
    if let ServiceError::RateNotFound { .. } = err {
        return (StatusCode::NOT_FOUND, "rate not found");
    }
    match classify(err) {
        ErrorKind::NoProviders => (StatusCode::SERVICE_UNAVAILABLE, "no providers configured"),
        ErrorKind::ContextCancelled => (StatusCode::REQUEST_TIMEOUT, "request cancelled"),
        ErrorKind::NetworkError => (StatusCode::BAD_GATEWAY, "network error"),
        ErrorKind::InvalidResponse => (StatusCode::BAD_GATEWAY, "invalid response"),
        ErrorKind::ProviderFailed => (StatusCode::BAD_GATEWAY, "failed to fetch rates"),
        ErrorKind::Unknown => (StatusCode::INTERNAL_SERVER_ERROR, "service error"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, label, message) = match self {
            ApiError::Service(err) => {
                let (status, label) = status_for(&err);
                warn!(kind = %classify(&err), status = status.as_u16(), "Rates request failed: {}", err);
                (status, label, err.to_string())
            }
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad request", message),
        };

        let body = ErrorResponse {
            error: label.to_string(),
            message,
            code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
