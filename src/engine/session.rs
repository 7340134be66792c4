use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::SessionError;
use super::identity::Admission;
use super::question_set::SessionQuestion;
use super::scorer::{self, Score};
use crate::backend::Quiz;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    AwaitingIdentity,
    InProgress,
    Completed,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    Finished,
    TimeExpired,
}

/// Produced exactly once per session, by whichever event completed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub quiz_id: Uuid,
    pub student_id: String,
    pub score: Score,
    pub reason: CompletionReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Untimed quiz, or the session is not in progress.
    Idle,
    Running { remaining_seconds: u64 },
    Expired(Completion),
}

/// What the student sees for one question. Never carries the answer key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct QuestionView {
    pub question_id: Uuid,
    pub index: usize,
    pub total: usize,
    pub text: String,
    pub options: Vec<String>,
    pub selected: Option<usize>,
    pub can_advance: bool,
    pub is_last: bool,
}

#[derive(Debug)]
pub struct QuizSession {
    session_id: Uuid,
    quiz: Quiz,
    student_id: Option<String>,
    questions: Vec<SessionQuestion>,
    answers: Vec<Option<usize>>,
    current: usize,
    remaining_seconds: u64,
    status: SessionStatus,
    completion: Option<Completion>,
}

impl QuizSession {
    pub fn new(quiz: Quiz) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            remaining_seconds: quiz.timer_seconds,
            quiz,
            student_id: None,
            questions: Vec::new(),
            answers: Vec::new(),
            current: 0,
            status: SessionStatus::AwaitingIdentity,
            completion: None,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn quiz(&self) -> &Quiz {
        &self.quiz
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn student_id(&self) -> Option<&str> {
        self.student_id.as_deref()
    }

    pub fn is_timed(&self) -> bool {
        self.quiz.is_timed()
    }

    /// Enters the session with a fixed question set. The order chosen here
    /// is kept for the rest of the session.
    pub fn begin(
        &mut self,
        admission: Admission,
        questions: Vec<SessionQuestion>,
    ) -> Result<(), SessionError> {
        self.ensure_awaiting_identity()?;
        if questions.is_empty() {
            return Err(SessionError::NoQuestions);
        }

        self.answers = vec![None; questions.len()];
        self.questions = questions;
        self.student_id = Some(admission.student_id);
        self.current = 0;
        self.remaining_seconds = self.quiz.timer_seconds;
        self.status = SessionStatus::InProgress;

        tracing::info!(
            session.id = %self.session_id,
            quiz.id = %self.quiz.id,
            questions.count = self.questions.len(),
            timer.seconds = self.quiz.timer_seconds,
            "Session started"
        );
        Ok(())
    }

    pub fn record_answer(
        &mut self,
        question_index: usize,
        option_index: usize,
    ) -> Result<(), SessionError> {
        self.ensure_in_progress()?;
        let question =
            self.questions
                .get(question_index)
                .ok_or(SessionError::QuestionOutOfRange {
                    index: question_index,
                    len: self.questions.len(),
                })?;
        if option_index >= question.options.len() {
            return Err(SessionError::OptionOutOfRange {
                index: option_index,
                len: question.options.len(),
            });
        }

        self.answers[question_index] = Some(option_index);
        Ok(())
    }

    /// Answers the question currently on screen.
    pub fn submit_answer(&mut self, option_index: usize) -> Result<(), SessionError> {
        self.record_answer(self.current, option_index)
    }

    /// Moves to the next question, or completes the session from the last
    /// one. Blocked while the current question is unanswered.
    pub fn advance(&mut self) -> Result<Option<Completion>, SessionError> {
        self.ensure_in_progress()?;
        if self.answers[self.current].is_none() {
            return Err(SessionError::CurrentQuestionUnanswered);
        }

        if self.current + 1 >= self.questions.len() {
            return Ok(self.complete(CompletionReason::Finished));
        }
        self.current += 1;
        Ok(None)
    }

    pub fn retreat(&mut self) -> Result<(), SessionError> {
        self.ensure_in_progress()?;
        self.current = self.current.saturating_sub(1);
        Ok(())
    }

    /// One second of the countdown. Reaching zero completes the session.
    pub fn tick(&mut self) -> TickOutcome {
        if self.status != SessionStatus::InProgress || !self.is_timed() {
            return TickOutcome::Idle;
        }

        self.remaining_seconds = self.remaining_seconds.saturating_sub(1);
        if self.remaining_seconds > 0 {
            return TickOutcome::Running {
                remaining_seconds: self.remaining_seconds,
            };
        }

        match self.complete(CompletionReason::TimeExpired) {
            Some(completion) => TickOutcome::Expired(completion),
            None => TickOutcome::Idle,
        }
    }

    /// The only transition into `Completed`. Returns the completion to the
    /// first caller and `None` to everyone after.
    pub fn complete(&mut self, reason: CompletionReason) -> Option<Completion> {
        if self.status != SessionStatus::InProgress {
            return None;
        }
        self.status = SessionStatus::Completed;

        let completion = Completion {
            quiz_id: self.quiz.id,
            student_id: self.student_id.clone().unwrap_or_default(),
            score: self.score(),
            reason,
        };
        tracing::info!(
            session.id = %self.session_id,
            quiz.id = %self.quiz.id,
            completion.reason = ?reason,
            result.score = completion.score.score,
            result.total = completion.score.total,
            "Session completed"
        );
        self.completion = Some(completion.clone());
        Some(completion)
    }

    pub fn score(&self) -> Score {
        scorer::score(&self.questions, &self.answers)
    }

    pub fn current_question(&self) -> Option<QuestionView> {
        if self.status != SessionStatus::InProgress {
            return None;
        }
        let question = self.questions.get(self.current)?;
        let selected = self.answers[self.current];

        Some(QuestionView {
            question_id: question.question_id,
            index: self.current,
            total: self.questions.len(),
            text: question.text.clone(),
            options: question.options.clone(),
            selected,
            can_advance: selected.is_some(),
            is_last: self.current + 1 == self.questions.len(),
        })
    }

    /// Seconds left on a timed quiz; `None` when untimed.
    pub fn remaining_time(&self) -> Option<u64> {
        self.is_timed().then_some(self.remaining_seconds)
    }

    pub fn is_complete(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    pub fn final_score(&self) -> Option<Score> {
        self.completion.as_ref().map(|c| c.score)
    }

    fn ensure_awaiting_identity(&self) -> Result<(), SessionError> {
        match self.status {
            SessionStatus::AwaitingIdentity => Ok(()),
            SessionStatus::InProgress => Err(SessionError::AlreadyStarted),
            SessionStatus::Completed => Err(SessionError::AlreadyCompleted),
        }
    }

    fn ensure_in_progress(&self) -> Result<(), SessionError> {
        match self.status {
            SessionStatus::InProgress => Ok(()),
            SessionStatus::AwaitingIdentity => Err(SessionError::NotStarted),
            SessionStatus::Completed => Err(SessionError::AlreadyCompleted),
        }
    }
}
