use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::error::BackendError;
use super::models::{NewQuizResult, Question, Quiz, QuizResult};
use super::QuizBackend;

/// Client for a PostgREST-style row store (`/rest/v1/<table>`).
#[derive(Debug, Clone)]
pub struct RestBackend {
    client: reqwest::Client,
    base_url: String,
}

impl RestBackend {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, BackendError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(api_key)
            .map_err(|e| BackendError::Config(format!("Invalid API key header: {}", e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| BackendError::Config(format!("Invalid API key header: {}", e)))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| BackendError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    #[tracing::instrument(skip(self, filters), fields(http.table = table))]
    async fn select(
        &self,
        table: &str,
        filters: &[(&str, String)],
    ) -> Result<Vec<JsonValue>, BackendError> {
        let url = self.table_url(table);
        let mut query: Vec<(&str, String)> = vec![("select", "*".to_string())];
        query.extend(filters.iter().cloned());

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| BackendError::Http {
                url: url.clone(),
                source: e,
            })?;

        let response = check_status(&url, response).await?;
        response
            .json::<Vec<JsonValue>>()
            .await
            .map_err(|e| BackendError::Http { url, source: e })
    }
}

async fn check_status(
    url: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::warn!(http.url = %url, http.status = status.as_u16(), "Row store request failed");
    Err(BackendError::Status {
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}

fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{}", value)
}

#[async_trait]
impl QuizBackend for RestBackend {
    async fn get_quiz(&self, quiz_id: Uuid) -> Result<Option<Quiz>, BackendError> {
        let rows = self.select("quizzes", &[("id", eq(quiz_id))]).await?;
        rows.first().map(Quiz::from_row).transpose()
    }

    async fn get_questions(&self, quiz_id: Uuid) -> Result<Vec<Question>, BackendError> {
        let rows = self
            .select("questions", &[("quiz_id", eq(quiz_id))])
            .await?;
        let questions = Question::from_rows(&rows);
        tracing::debug!(
            quiz.id = %quiz_id,
            rows.count = rows.len(),
            questions.count = questions.len(),
            "Fetched question bank"
        );
        Ok(questions)
    }

    async fn find_result(
        &self,
        quiz_id: Uuid,
        student_id: &str,
    ) -> Result<Option<QuizResult>, BackendError> {
        let rows = self
            .select(
                "quiz_results",
                &[
                    ("quiz_id", eq(quiz_id)),
                    ("student_id", eq(student_id)),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        rows.first().map(QuizResult::from_row).transpose()
    }

    #[tracing::instrument(skip(self, result), fields(quiz.id = %result.quiz_id))]
    async fn insert_result(&self, result: NewQuizResult) -> Result<QuizResult, BackendError> {
        let url = self.table_url("quiz_results");
        let response = self
            .client
            .post(&url)
            .header("Prefer", "return=representation")
            .json(&[&result])
            .send()
            .await
            .map_err(|e| BackendError::Http {
                url: url.clone(),
                source: e,
            })?;

        let response = check_status(&url, response).await?;
        let rows = response
            .json::<Vec<JsonValue>>()
            .await
            .map_err(|e| BackendError::Http {
                url: url.clone(),
                source: e,
            })?;

        let stored = rows.first().ok_or_else(|| BackendError::InsertRejected {
            table: "quiz_results",
            reason: "insert returned no row".to_string(),
        })?;
        QuizResult::from_row(stored)
    }
}
