//! Core error to HTTP response mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

/// Wrapper giving core errors an HTTP shape
#[derive(Debug)]
pub struct ApiError(pub fastlane_core::Error);

impl From<fastlane_core::Error> for ApiError {
    fn from(error: fastlane_core::Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(category = self.0.category(), "request failed: {}", self.0);
        }

        let body = Json(serde_json::json!({
            "error": {
                "category": self.0.category(),
                "message": self.0.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

/// Handler result alias
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let response = ApiError(fastlane_core::Error::not_found("job")).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ApiError(fastlane_core::Error::conflict("terminal")).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = ApiError(fastlane_core::Error::validation("bad cron")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
