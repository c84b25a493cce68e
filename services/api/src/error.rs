use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use wayfinder_core::NavError;

/// Errors returned by the HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Navigation(#[from] NavError),
    #[error("Bad request: {0}")]
    BadRequest(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: &'static str,
    message: String,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Navigation(NavError::SessionNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Navigation(NavError::LocationUnavailable) => StatusCode::CONFLICT,
            ApiError::Navigation(NavError::RouteUnavailable(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Navigation(NavError::InvalidInput(_)) | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Navigation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::Navigation(NavError::SessionNotFound(_)) => "SESSION_NOT_FOUND",
            ApiError::Navigation(NavError::LocationUnavailable) => "LOCATION_UNAVAILABLE",
            ApiError::Navigation(NavError::RouteUnavailable(_)) => "ROUTE_UNAVAILABLE",
            ApiError::Navigation(NavError::RefinementUnavailable(_)) => "REFINEMENT_UNAVAILABLE",
            ApiError::Navigation(NavError::RerouteFailed(_)) => "REROUTE_FAILED",
            ApiError::Navigation(NavError::InvalidInput(_)) | ApiError::BadRequest(_) => {
                "BAD_REQUEST"
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }

        let body = ErrorBody {
            success: false,
            error: self.error_code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
