use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Outcome of shelling out to the media tools. Probe failures are expected
/// while the file is still mostly holes; extraction failures carry what the
/// tool actually said.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("ffprobe failed: {0}")]
    ProbeFailed(String),
    #[error("ffmpeg exited with {exit_code:?}")]
    ExtractFailed {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("failed to run media tool: {0}")]
    Tool(#[from] std::io::Error),
}

/// Errors the HTTP layer maps to status codes, with a JSON
/// `{"error": "<message>"}` body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    NotReady(String),
    #[error("requested range not satisfiable")]
    RangeNotSatisfiable,
    #[error("internal server error")]
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) | ApiError::NotReady(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(err) = &self {
            tracing::error!("internal error: {err:#}");
        }
        let body = Json(json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ApiError::InvalidInput("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::NotReady("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::RangeNotSatisfiable.status(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            ApiError::Internal(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
