use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::error::BackendError;
use super::models::{NewQuizResult, Question, Quiz, QuizResult};
use super::QuizBackend;

#[derive(Debug, Deserialize)]
struct SeedSnapshot {
    #[serde(default)]
    quizzes: Vec<JsonValue>,
    #[serde(default)]
    questions: Vec<JsonValue>,
    #[serde(default)]
    quiz_results: Vec<JsonValue>,
}

/// Row store kept in process memory. Like the hosted store it has no
/// uniqueness constraint on (quiz_id, student_id).
#[derive(Debug, Default)]
pub struct MemoryBackend {
    quizzes: RwLock<HashMap<Uuid, Quiz>>,
    questions: RwLock<Vec<Question>>,
    results: RwLock<Vec<QuizResult>>,
    insert_calls: AtomicUsize,
    fail_inserts: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    #[tracing::instrument]
    pub async fn from_seed_file(path: &str) -> Result<Self, BackendError> {
        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| BackendError::SeedFile {
                    path: path.to_string(),
                    source: e,
                })?;
        Self::from_seed_str(&content).await
    }

    #[tracing::instrument(skip(content), fields(content.length = content.len()))]
    pub async fn from_seed_str(content: &str) -> Result<Self, BackendError> {
        let snapshot: SeedSnapshot = serde_json::from_str(content)
            .map_err(|e| BackendError::SeedParse(format!("Failed to parse JSON: {}", e)))?;

        let backend = Self::new();
        for row in &snapshot.quizzes {
            match Quiz::from_row(row) {
                Ok(quiz) => backend.insert_quiz(quiz).await,
                Err(e) => tracing::warn!(error = %e, "Skipping malformed quiz row"),
            }
        }
        for question in Question::from_rows(&snapshot.questions) {
            backend.insert_question(question).await;
        }
        for row in &snapshot.quiz_results {
            match QuizResult::from_row(row) {
                Ok(result) => backend.results.write().await.push(result),
                Err(e) => tracing::warn!(error = %e, "Skipping malformed result row"),
            }
        }

        tracing::info!(
            quizzes.count = backend.quizzes.read().await.len(),
            questions.count = backend.questions.read().await.len(),
            results.count = backend.results.read().await.len(),
            "Loaded in-memory backend seed"
        );
        Ok(backend)
    }

    pub async fn insert_quiz(&self, quiz: Quiz) {
        self.quizzes.write().await.insert(quiz.id, quiz);
    }

    pub async fn insert_question(&self, question: Question) {
        self.questions.write().await.push(question);
    }

    pub async fn results(&self) -> Vec<QuizResult> {
        self.results.read().await.clone()
    }

    /// Number of `insert_result` calls, successful or not.
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    /// Makes every following insert fail, to exercise the save-failure path.
    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl QuizBackend for MemoryBackend {
    async fn get_quiz(&self, quiz_id: Uuid) -> Result<Option<Quiz>, BackendError> {
        Ok(self.quizzes.read().await.get(&quiz_id).cloned())
    }

    async fn get_questions(&self, quiz_id: Uuid) -> Result<Vec<Question>, BackendError> {
        Ok(self
            .questions
            .read()
            .await
            .iter()
            .filter(|q| q.quiz_id == quiz_id)
            .cloned()
            .collect())
    }

    async fn find_result(
        &self,
        quiz_id: Uuid,
        student_id: &str,
    ) -> Result<Option<QuizResult>, BackendError> {
        Ok(self
            .results
            .read()
            .await
            .iter()
            .find(|r| r.quiz_id == quiz_id && r.student_id == student_id)
            .cloned())
    }

    async fn insert_result(&self, result: NewQuizResult) -> Result<QuizResult, BackendError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(BackendError::InsertRejected {
                table: "quiz_results",
                reason: "insert failure injected".to_string(),
            });
        }

        let stored = QuizResult {
            id: Uuid::new_v4().to_string(),
            quiz_id: result.quiz_id,
            student_id: result.student_id,
            score: result.score,
            total: result.total,
            taken_at: Some(result.taken_at),
        };
        self.results.write().await.push(stored.clone());
        Ok(stored)
    }
}
