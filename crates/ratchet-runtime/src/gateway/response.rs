use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use ratchet_core::error::RatchetError;

/// HTTP projection of engine errors.
#[derive(Debug)]
pub struct ApiError(pub RatchetError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<RatchetError> for ApiError {
    fn from(e: RatchetError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RatchetError::WorkflowUnknown(_) | RatchetError::NotFound(_) => StatusCode::NOT_FOUND,
            // A wrong callback token deliberately reads as "not found" so
            // the endpoint does not confirm that the process is awaiting.
            RatchetError::TokenMismatch => StatusCode::NOT_FOUND,
            RatchetError::Forbidden(_) => StatusCode::FORBIDDEN,
            RatchetError::FormInvalid(_)
            | RatchetError::NotTask
            | RatchetError::RangeInvalid(_)
            | RatchetError::FilterInvalid(_) => StatusCode::BAD_REQUEST,
            RatchetError::BadStatus(_) | RatchetError::ResumeAllInProgress => StatusCode::CONFLICT,
            RatchetError::WorkflowGone(_) => StatusCode::GONE,
            RatchetError::EngineLocked => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        (status, Json(json!({"detail": self.0.to_string()}))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (RatchetError::WorkflowUnknown("x".into()), StatusCode::NOT_FOUND),
            (RatchetError::TokenMismatch, StatusCode::NOT_FOUND),
            (RatchetError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (RatchetError::FormInvalid("x".into()), StatusCode::BAD_REQUEST),
            (RatchetError::BadStatus("x".into()), StatusCode::CONFLICT),
            (RatchetError::ResumeAllInProgress, StatusCode::CONFLICT),
            (RatchetError::EngineLocked, StatusCode::SERVICE_UNAVAILABLE),
            (RatchetError::WorkflowGone("x".into()), StatusCode::GONE),
            (RatchetError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, expected) in cases {
            let response = ApiError(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
