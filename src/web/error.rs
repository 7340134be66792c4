use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::backend::BackendError;

#[derive(Debug, Error)]
pub enum WebError {
    #[error("Quiz not found: {0}")]
    QuizNotFound(Uuid),
    #[error("Quiz backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            WebError::QuizNotFound(id) => (StatusCode::NOT_FOUND, format!("Quiz {id} not found")),
            WebError::Backend(err) => {
                tracing::error!(error = %err, "Quiz backend request failed");
                (
                    StatusCode::BAD_GATEWAY,
                    "Quiz service is unavailable".to_string(),
                )
            }
            WebError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

pub type Result<T, E = WebError> = std::result::Result<T, E>;
