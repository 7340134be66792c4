use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{Rejection, SessionError};
use super::scorer::Score;
use super::session::{Completion, CompletionReason, QuestionView};
use crate::backend::{Availability, Quiz};

/// What a tab is told about a quiz before the student enters.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QuizSummary {
    pub quiz_id: Uuid,
    pub title: String,
    pub week: Option<u32>,
    pub num_questions: usize,
    /// `None` for untimed quizzes.
    pub timer_seconds: Option<u64>,
    pub availability: Availability,
    pub days_remaining: Option<i64>,
}

impl QuizSummary {
    pub fn from_quiz(quiz: &Quiz, now: DateTime<Utc>) -> Self {
        Self {
            quiz_id: quiz.id,
            title: quiz.title.clone(),
            week: quiz.week,
            num_questions: quiz.num_questions,
            timer_seconds: quiz.is_timed().then_some(quiz.timer_seconds),
            availability: quiz.availability(now),
            days_remaining: quiz.days_remaining(now.date_naive()),
        }
    }
}

/// Messages a quiz tab sends over its WebSocket.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "messageType", content = "payload")]
pub enum ClientToServerMessage {
    /// Must be the first message on a new connection.
    OpenQuiz { quiz_id: Uuid, browser_id: String },
    StartSession { student_id: String },
    SubmitAnswer { option_index: usize },
    GoNext,
    GoPrev,
    CurrentQuestion,
    /// The student backed out; the connection closes after this.
    LeaveQuiz,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "messageType", content = "payload")]
pub enum ServerToClientMessage {
    QuizOpened {
        session_id: Uuid,
        quiz: QuizSummary,
    },
    SessionStarted {
        session_id: Uuid,
        student_id: String,
        total_questions: usize,
        remaining_seconds: Option<u64>,
    },
    QuestionView {
        question: QuestionView,
    },
    TimeUpdate {
        remaining_seconds: u64,
    },
    Rejected {
        reason: String,
        message: String,
        recoverable: bool,
    },
    /// Another tab of the same browser took this quiz while this one was
    /// still on the entry screen.
    SessionAborted {
        message: String,
    },
    SessionCompleted {
        score: u32,
        total: u32,
        reason: CompletionReason,
    },
    ResultSaving,
    ResultSaved {
        result_id: String,
    },
    ResultSaveFailed {
        message: String,
        score: u32,
        total: u32,
    },
    CommandError {
        message: String,
    },
    SystemError {
        message: String,
    },
}

impl ServerToClientMessage {
    pub fn to_ws_text(&self) -> Result<axum::extract::ws::Message, serde_json::Error> {
        serde_json::to_string(self)
            .map(|json_string| axum::extract::ws::Message::Text(json_string.into()))
    }

    pub fn rejected(rejection: &Rejection) -> Self {
        ServerToClientMessage::Rejected {
            reason: rejection.code().to_string(),
            message: rejection.to_string(),
            recoverable: rejection.is_recoverable(),
        }
    }

    pub fn command_error(error: &SessionError) -> Self {
        ServerToClientMessage::CommandError {
            message: error.to_string(),
        }
    }

    pub fn completed(completion: &Completion) -> Self {
        ServerToClientMessage::SessionCompleted {
            score: completion.score.score,
            total: completion.score.total,
            reason: completion.reason,
        }
    }

    pub fn save_failed(score: Score) -> Self {
        ServerToClientMessage::ResultSaveFailed {
            message: "Your result could not be saved. Please tell your instructor your score."
                .to_string(),
            score: score.score,
            total: score.total,
        }
    }
}

pub fn client_message_from_ws_text(text: &str) -> Result<ClientToServerMessage, serde_json::Error> {
    serde_json::from_str(text)
}
