use regex::Regex;
use uuid::Uuid;

use super::error::Rejection;
use crate::backend::QuizBackend;

pub const DEFAULT_STUDENT_ID_PATTERN: &str = r"^BTH/\d{2}[A-Z]/\d{4}$";
pub const DEFAULT_STUDENT_ID_HINT: &str = "BTH/XXY/XXXX (e.g., BTH/18U/1234)";

/// A student let through the gate, carrying the normalized identifier that
/// every later comparison and the stored result use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub quiz_id: Uuid,
    pub student_id: String,
}

#[derive(Debug, Clone)]
pub struct IdentityGate {
    pattern: Regex,
    hint: String,
}

impl Default for IdentityGate {
    fn default() -> Self {
        Self {
            pattern: Regex::new(DEFAULT_STUDENT_ID_PATTERN)
                .expect("Failed to compile default student ID regex"),
            hint: DEFAULT_STUDENT_ID_HINT.to_string(),
        }
    }
}

impl IdentityGate {
    pub fn new(pattern: &str, hint: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            hint: hint.into(),
        })
    }

    pub fn normalize(raw_student_id: &str) -> String {
        raw_student_id.trim().to_uppercase()
    }

    /// Normalizes and pattern-checks the identifier without touching the backend.
    pub fn check_format(&self, raw_student_id: &str) -> Result<String, Rejection> {
        let normalized = Self::normalize(raw_student_id);
        if self.pattern.is_match(&normalized) {
            Ok(normalized)
        } else {
            Err(Rejection::InvalidFormat {
                hint: self.hint.clone(),
            })
        }
    }

    #[tracing::instrument(skip(self, backend, raw_student_id), fields(quiz.id = %quiz_id))]
    pub async fn validate_and_enter(
        &self,
        backend: &dyn QuizBackend,
        quiz_id: Uuid,
        raw_student_id: &str,
    ) -> Result<Admission, Rejection> {
        let student_id = self.check_format(raw_student_id)?;

        match backend.find_result(quiz_id, &student_id).await {
            Ok(Some(existing)) => {
                tracing::info!(
                    student.id = %student_id,
                    result.id = %existing.id,
                    "Retake refused, result already recorded"
                );
                Err(Rejection::AlreadyTaken)
            }
            Ok(None) => Ok(Admission {
                quiz_id,
                student_id,
            }),
            Err(e) => {
                tracing::error!(error = %e, "Existing-result lookup failed");
                Err(Rejection::BackendUnavailable)
            }
        }
    }
}
