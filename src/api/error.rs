use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, error};

use crate::judger::GradeError;
use crate::playground::ExecuteError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Missing or invalid X-User-Id header")]
    Unauthenticated,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Timeout(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<ExecuteError> for ApiError {
    fn from(value: ExecuteError) -> Self {
        match value {
            ExecuteError::MissingCode | ExecuteError::UnsupportedLanguage(_) => {
                ApiError::BadRequest(value.to_string())
            }
            ExecuteError::Timeout { .. } => ApiError::Timeout(value.to_string()),
            ExecuteError::LaunchFailed(_) => ApiError::Internal(anyhow::anyhow!(value)),
            ExecuteError::System(e) => ApiError::Internal(e),
        }
    }
}

impl From<GradeError> for ApiError {
    fn from(value: GradeError) -> Self {
        match value {
            GradeError::System(e) => ApiError::Internal(e),
            other => ApiError::Internal(anyhow::anyhow!(other)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(msg) => {
                debug!("Rejected request: {}", msg);
                StatusCode::BAD_REQUEST
            }
            ApiError::Unauthenticated => {
                debug!("Client sent no or malformed user id");
                StatusCode::UNAUTHORIZED
            }
            ApiError::NotFound(what) => {
                debug!("{} is not found", what);
                StatusCode::NOT_FOUND
            }
            ApiError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            ApiError::Internal(e) => {
                error!("Internal error: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (ApiError::from(ExecuteError::MissingCode), StatusCode::BAD_REQUEST),
            (
                ApiError::from(ExecuteError::UnsupportedLanguage("go".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(ExecuteError::Timeout { time_ms: 5000 }),
                StatusCode::REQUEST_TIMEOUT,
            ),
            (
                ApiError::from(ExecuteError::LaunchFailed("missing".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ApiError::from(GradeError::LaunchFailed("missing".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (ApiError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (ApiError::NotFound("Test"), StatusCode::NOT_FOUND),
        ];

        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn test_timeout_message_kept() {
        let err = ApiError::from(ExecuteError::Timeout { time_ms: 5000 });
        assert_eq!(err.to_string(), "Execution timeout (5 seconds)");
    }
}
