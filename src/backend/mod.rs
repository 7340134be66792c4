use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{BackendConfig, BackendSourceType};

pub mod error;
pub mod memory;
pub mod models;
pub mod rest;

pub use error::BackendError;
pub use memory::MemoryBackend;
pub use models::{Availability, NewQuizResult, Question, Quiz, QuizResult};
pub use rest::RestBackend;

/// The four row-store operations the session engine depends on.
#[async_trait]
pub trait QuizBackend: Send + Sync + Debug {
    async fn get_quiz(&self, quiz_id: Uuid) -> Result<Option<Quiz>, BackendError>;

    async fn get_questions(&self, quiz_id: Uuid) -> Result<Vec<Question>, BackendError>;

    async fn find_result(
        &self,
        quiz_id: Uuid,
        student_id: &str,
    ) -> Result<Option<QuizResult>, BackendError>;

    async fn insert_result(&self, result: NewQuizResult) -> Result<QuizResult, BackendError>;
}

#[tracing::instrument(skip(config), fields(backend.source_type = ?config.source_type))]
pub async fn build_backend(config: &BackendConfig) -> Result<Arc<dyn QuizBackend>, BackendError> {
    match config.source_type {
        BackendSourceType::Memory => {
            let backend = match config.seed_file.as_deref() {
                Some(path) => MemoryBackend::from_seed_file(path).await?,
                None => {
                    tracing::warn!("No seed file configured, in-memory backend starts empty");
                    MemoryBackend::new()
                }
            };
            Ok(Arc::new(backend))
        }
        BackendSourceType::Rest => {
            let base_url = config.rest_url.as_ref().ok_or_else(|| {
                BackendError::Config("rest_url required for rest backend".to_string())
            })?;
            let api_key = config.api_key.as_ref().ok_or_else(|| {
                BackendError::Config("api_key required for rest backend".to_string())
            })?;
            Ok(Arc::new(RestBackend::new(base_url, api_key)?))
        }
    }
}
