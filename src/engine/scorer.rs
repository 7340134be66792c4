use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::question_set::SessionQuestion;
use crate::backend::{BackendError, NewQuizResult, QuizBackend, QuizResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub score: u32,
    pub total: u32,
}

/// Counts answers that match each question's session-local correct index.
/// Unanswered slots never match.
pub fn score(questions: &[SessionQuestion], answers: &[Option<usize>]) -> Score {
    let correct = questions
        .iter()
        .zip(answers)
        .filter(|(question, answer)| answer.is_some_and(|chosen| question.is_correct(chosen)))
        .count();

    Score {
        score: correct as u32,
        total: questions.len() as u32,
    }
}

#[tracing::instrument(skip(backend), fields(quiz.id = %quiz_id, student.id = %student_id))]
pub async fn write_result(
    backend: &dyn QuizBackend,
    quiz_id: Uuid,
    student_id: &str,
    score: Score,
    taken_at: DateTime<Utc>,
) -> Result<QuizResult, BackendError> {
    let row = NewQuizResult {
        quiz_id,
        student_id: student_id.to_string(),
        score: score.score,
        total: score.total,
        taken_at,
    };

    match backend.insert_result(row).await {
        Ok(stored) => {
            tracing::info!(
                result.id = %stored.id,
                result.score = score.score,
                result.total = score.total,
                "Quiz result saved"
            );
            Ok(stored)
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                result.score = score.score,
                result.total = score.total,
                "Failed to save quiz result"
            );
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn question(correct_index: usize) -> SessionQuestion {
        SessionQuestion {
            question_id: Uuid::new_v4(),
            text: "Q".to_string(),
            options: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            correct_index,
        }
    }

    #[test]
    fn test_score_counts_only_matching_answers() {
        let questions = vec![question(0), question(3), question(1)];
        let answers = vec![Some(0), Some(2), None];
        assert_eq!(
            score(&questions, &answers),
            Score { score: 1, total: 3 }
        );
    }

    #[test]
    fn test_unanswered_session_scores_zero() {
        let questions = vec![question(0), question(1)];
        assert_eq!(
            score(&questions, &[None, None]),
            Score { score: 0, total: 2 }
        );
    }

    #[test]
    fn test_score_is_bounded_and_idempotent() {
        let questions = vec![question(2), question(2), question(0)];
        let answers = vec![Some(2), Some(2), Some(0)];
        let first = score(&questions, &answers);
        assert_eq!(first, score(&questions, &answers));
        assert!(first.score <= first.total);
        assert_eq!(first.total, questions.len() as u32);
    }

    #[test]
    fn test_empty_session() {
        assert_eq!(score(&[], &[]), Score { score: 0, total: 0 });
    }

    #[tokio::test]
    async fn test_write_result_stores_the_row() {
        let backend = MemoryBackend::new();
        let quiz_id = Uuid::new_v4();
        let stored = write_result(
            &backend,
            quiz_id,
            "BTH/18U/1234",
            Score { score: 3, total: 5 },
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(stored.quiz_id, quiz_id);
        assert_eq!(stored.student_id, "BTH/18U/1234");
        assert_eq!((stored.score, stored.total), (3, 5));
        assert_eq!(backend.results().await.len(), 1);
    }

    #[tokio::test]
    async fn test_write_result_surfaces_failures() {
        let backend = MemoryBackend::new();
        backend.set_fail_inserts(true);
        let result = write_result(
            &backend,
            Uuid::new_v4(),
            "BTH/18U/1234",
            Score { score: 1, total: 1 },
            Utc::now(),
        )
        .await;
        assert!(result.is_err());
    }
}
