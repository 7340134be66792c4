use axum::{
    extract::{Path, State},
    response::Json,
};
use chrono::Utc;
use uuid::Uuid;

use super::error::{Result as WebResult, WebError};
use crate::engine::QuizSummary;
use crate::state::AppState;

#[tracing::instrument(skip(app_state), fields(quiz.id = %quiz_id))]
pub async fn get_quiz_handler(
    State(app_state): State<AppState>,
    Path(quiz_id): Path<Uuid>,
) -> WebResult<Json<QuizSummary>> {
    tracing::info!("HTTP: Received get_quiz request");

    let quiz = app_state
        .services
        .backend
        .get_quiz(quiz_id)
        .await?
        .ok_or(WebError::QuizNotFound(quiz_id))?;

    Ok(Json(QuizSummary::from_quiz(&quiz, Utc::now())))
}

pub async fn health_handler() -> &'static str {
    "ok"
}
