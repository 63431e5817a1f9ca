//! API response types.

use conveyor_core::{ConveyorError, ErrorResponse};
use conveyor_jobs::JobError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

/// Standard API response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorResponse>,
}

impl<T> ApiResponse<T> {
    /// Creates a successful response.
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    /// Creates an error response.
    pub fn error(error: ErrorResponse) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Application error type for Axum.
#[derive(Debug)]
pub struct AppError(pub ConveyorError);

impl From<ConveyorError> for AppError {
    fn from(err: ConveyorError) -> Self {
        Self(err)
    }
}

impl From<JobError> for AppError {
    fn from(err: JobError) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }

        let error_response = ErrorResponse::from_error(&self.0);
        let body = Json(ApiResponse::error(error_response));

        (status, body).into_response()
    }
}

/// Result type for Axum handlers.
pub type ApiResult<T> = Result<T, AppError>;

/// Helper to create an accepted (202) response.
pub fn accepted<T: Serialize>(data: T) -> (StatusCode, Json<T>) {
    (StatusCode::ACCEPTED, Json(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_errors_map_to_status_codes() {
        let cases = [
            (JobError::UnknownKind("nope".into()), StatusCode::BAD_REQUEST),
            (JobError::invalid_arguments("test-task", "missing file_id"), StatusCode::BAD_REQUEST),
            (JobError::DuplicateJobId("j1".into()), StatusCode::CONFLICT),
            (JobError::NotFound("j1".into()), StatusCode::NOT_FOUND),
            (JobError::Transport("down".into()), StatusCode::SERVICE_UNAVAILABLE),
        ];

        for (err, expected) in cases {
            assert_eq!(AppError::from(err).into_response().status(), expected);
        }
    }

    #[test]
    fn test_error_body_shape() {
        let body = serde_json::to_value(ApiResponse::error(ErrorResponse::from_error(
            &ConveyorError::validation("bad"),
        )))
        .unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert!(body.get("data").is_none());
    }
}
