use serde::Serialize;
use thiserror::Error;

/// Reasons a tab is refused entry into a session. Each one asks the
/// student for a different corrective action, so each has its own message.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum Rejection {
    #[error("Invalid ID format. Please use {hint} format.")]
    InvalidFormat { hint: String },
    #[error("You have already taken this quiz. Retakes are not allowed.")]
    AlreadyTaken,
    #[error("This quiz is already open in another tab. Continue there or close it first.")]
    AlreadyOpenElsewhere,
    #[error("This quiz is unavailable: it has no questions yet.")]
    EmptyQuestionBank,
    #[error("Quiz not found.")]
    QuizNotFound,
    #[error("This quiz is not open for attempts right now.")]
    QuizUnavailable,
    #[error("Could not reach the quiz service. Please try again in a moment.")]
    BackendUnavailable,
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::InvalidFormat { .. } => "InvalidFormat",
            Rejection::AlreadyTaken => "AlreadyTaken",
            Rejection::AlreadyOpenElsewhere => "AlreadyOpenElsewhere",
            Rejection::EmptyQuestionBank => "EmptyQuestionBank",
            Rejection::QuizNotFound => "QuizNotFound",
            Rejection::QuizUnavailable => "QuizUnavailable",
            Rejection::BackendUnavailable => "BackendUnavailable",
        }
    }

    /// Rejections the student can fix in the same tab.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Rejection::InvalidFormat { .. } | Rejection::BackendUnavailable
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum SessionError {
    #[error("The session has not started yet")]
    NotStarted,
    #[error("The session has already started")]
    AlreadyStarted,
    #[error("The session is already completed")]
    AlreadyCompleted,
    #[error("A session needs at least one question")]
    NoQuestions,
    #[error("Question {index} is out of range ({len} questions)")]
    QuestionOutOfRange { index: usize, len: usize },
    #[error("Option {index} is out of range ({len} options)")]
    OptionOutOfRange { index: usize, len: usize },
    #[error("Answer the current question before moving on")]
    CurrentQuestionUnanswered,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("Session actor is no longer running")]
    ActorGone,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_rejections_have_distinct_messages() {
        let rejections = [
            Rejection::InvalidFormat {
                hint: "BTH/XXY/XXXX".to_string(),
            },
            Rejection::AlreadyTaken,
            Rejection::AlreadyOpenElsewhere,
            Rejection::EmptyQuestionBank,
            Rejection::QuizNotFound,
            Rejection::QuizUnavailable,
            Rejection::BackendUnavailable,
        ];

        let messages: std::collections::HashSet<String> =
            rejections.iter().map(ToString::to_string).collect();
        let codes: std::collections::HashSet<&str> =
            rejections.iter().map(Rejection::code).collect();

        assert_eq!(messages.len(), rejections.len());
        assert_eq!(codes.len(), rejections.len());
        assert!(messages.iter().all(|m| !m.is_empty()));
    }

    #[test]
    fn test_only_format_and_backend_rejections_are_recoverable() {
        assert!(
            Rejection::InvalidFormat {
                hint: String::new()
            }
            .is_recoverable()
        );
        assert!(Rejection::BackendUnavailable.is_recoverable());
        assert!(!Rejection::AlreadyTaken.is_recoverable());
        assert!(!Rejection::AlreadyOpenElsewhere.is_recoverable());
    }
}
