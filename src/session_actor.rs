use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval};
use uuid::Uuid;

use crate::backend::{Availability, Quiz, QuizBackend};
use crate::engine::guard::lock_key;
use crate::engine::messages::{self, ClientToServerMessage, QuizSummary, ServerToClientMessage};
use crate::engine::scorer::{self, Score};
use crate::engine::session::{Completion, QuestionView, SessionStatus, TickOutcome};
use crate::engine::{
    CommandError, IdentityGate, LockEvent, LockLease, LockRegistry, LockStore, QuizSession,
    Rejection, SessionError, build_session,
};

const TICK: StdDuration = StdDuration::from_secs(1);
const SESSION_MAILBOX_SIZE: usize = 32;

/// Shared dependencies every session actor needs.
#[derive(Clone, Debug)]
pub struct SessionServices {
    pub backend: Arc<dyn QuizBackend>,
    pub gate: Arc<IdentityGate>,
    pub locks: Arc<LockRegistry>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub enum SaveState {
    NotStarted,
    Saving,
    Saved { result_id: String },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Start { student_id: String },
    SubmitAnswer { option_index: usize },
    GoNext,
    GoPrev,
    CurrentQuestion,
    Leave,
}

#[derive(Serialize, Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub quiz_id: Uuid,
    pub status: SessionStatus,
    pub student_id: Option<String>,
    pub current_question: Option<QuestionView>,
    pub remaining_time: Option<u64>,
    pub final_score: Option<Score>,
    pub save_state: SaveState,
}

#[derive(Debug)]
pub enum SessionActorMessage {
    Command {
        command: SessionCommand,
        respond_to: Option<oneshot::Sender<Result<(), CommandError>>>,
    },
    ClientEvent {
        raw_payload: String,
    },
    Snapshot {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },
    ClientDisconnected,
}

/// Drives one tab's session. Student commands, the countdown and lock
/// events from sibling tabs all arrive through the same select loop, so the
/// session is never mutated from two places at once.
pub struct SessionActor {
    receiver: mpsc::Receiver<SessionActorMessage>,
    session: QuizSession,
    services: SessionServices,
    lock_store: Arc<LockStore>,
    lease: Option<LockLease>,
    lock_events: Option<broadcast::Receiver<LockEvent>>,
    ticker: Option<Interval>,
    save_state: SaveState,
    client_tx: mpsc::Sender<ServerToClientMessage>,
}

impl SessionActor {
    fn new(
        receiver: mpsc::Receiver<SessionActorMessage>,
        quiz: Quiz,
        lock_store: Arc<LockStore>,
        services: SessionServices,
        client_tx: mpsc::Sender<ServerToClientMessage>,
    ) -> Self {
        let lock_events = Some(lock_store.subscribe());
        SessionActor {
            receiver,
            session: QuizSession::new(quiz),
            services,
            lock_store,
            lease: None,
            lock_events,
            ticker: None,
            save_state: SaveState::NotStarted,
            client_tx,
        }
    }

    fn quiz_id(&self) -> Uuid {
        self.session.quiz().id
    }

    async fn push(&self, message: ServerToClientMessage) {
        if self.client_tx.send(message).await.is_err() {
            tracing::debug!(
                session.id = %self.session.session_id(),
                "Client channel closed, dropping outgoing message"
            );
        }
    }

    async fn push_question(&self) {
        if let Some(question) = self.session.current_question() {
            self.push(ServerToClientMessage::QuestionView { question })
                .await;
        }
    }

    /// Returns `true` when the actor should shut down.
    #[tracing::instrument(skip(self, msg), fields(
        session.id = %self.session.session_id(),
        quiz.id = %self.quiz_id(),
        msg_type = %std::any::type_name_of_val(&msg)
    ))]
    async fn handle_message(&mut self, msg: SessionActorMessage) -> bool {
        match msg {
            SessionActorMessage::Command {
                command,
                respond_to,
            } => {
                let shutdown = command == SessionCommand::Leave;
                let result = self.handle_command(command).await;
                if let Some(respond_to) = respond_to {
                    let _ = respond_to.send(result);
                }
                shutdown
            }
            SessionActorMessage::ClientEvent { raw_payload } => {
                tracing::trace!(event.raw = %raw_payload, "Raw event from client");
                let command = match messages::client_message_from_ws_text(&raw_payload) {
                    Ok(parsed) => match to_command(parsed) {
                        Some(command) => command,
                        None => {
                            self.push(ServerToClientMessage::SystemError {
                                message: "This connection already has a quiz open.".to_string(),
                            })
                            .await;
                            return false;
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, event.raw = %raw_payload, "Failed to deserialize event from client");
                        self.push(ServerToClientMessage::SystemError {
                            message: format!(
                                "Invalid message format: {e}. Please send JSON like: {{\"messageType\":\"SubmitAnswer\",\"payload\":{{\"option_index\":0}}}}"
                            ),
                        })
                        .await;
                        return false;
                    }
                };

                let shutdown = command == SessionCommand::Leave;
                match self.handle_command(command).await {
                    Ok(()) => {}
                    Err(CommandError::Rejected(rejection)) => {
                        self.push(ServerToClientMessage::rejected(&rejection)).await;
                    }
                    Err(CommandError::Session(error)) => {
                        self.push(ServerToClientMessage::command_error(&error)).await;
                    }
                    Err(CommandError::ActorGone) => {}
                }
                shutdown
            }
            SessionActorMessage::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
                false
            }
            SessionActorMessage::ClientDisconnected => {
                tracing::info!(status = ?self.session.status(), "Client disconnected");
                true
            }
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) -> Result<(), CommandError> {
        match command {
            SessionCommand::Start { student_id } => self.start(&student_id).await,
            SessionCommand::SubmitAnswer { option_index } => {
                self.session.submit_answer(option_index)?;
                self.push_question().await;
                Ok(())
            }
            SessionCommand::GoNext => {
                match self.session.advance()? {
                    Some(completion) => self.finish(completion).await,
                    None => self.push_question().await,
                }
                Ok(())
            }
            SessionCommand::GoPrev => {
                self.session.retreat()?;
                self.push_question().await;
                Ok(())
            }
            SessionCommand::CurrentQuestion => match self.session.current_question() {
                Some(question) => {
                    self.push(ServerToClientMessage::QuestionView { question })
                        .await;
                    Ok(())
                }
                None => Err(self.not_in_progress().into()),
            },
            SessionCommand::Leave => {
                if !self.session.is_complete() {
                    tracing::info!("Session abandoned before completion, nothing is recorded");
                }
                self.ticker = None;
                self.lease = None;
                Ok(())
            }
        }
    }

    /// Lock, then gate, then question set. Any refusal after the lock is
    /// taken gives the lock back.
    async fn start(&mut self, raw_student_id: &str) -> Result<(), CommandError> {
        if self.session.status() != SessionStatus::AwaitingIdentity {
            return Err(self.not_awaiting_identity().into());
        }
        if self.session.quiz().availability(Utc::now()) != Availability::Available {
            return Err(Rejection::QuizUnavailable.into());
        }

        let quiz_id = self.quiz_id();
        let session_id = self.session.session_id();

        // Our own acquire must not look like another tab taking over.
        self.lock_events = None;
        let lease = match self.lock_store.try_acquire(quiz_id, session_id) {
            Ok(lease) => lease,
            Err(rejection) => return Err(self.refuse_entry(None, rejection)),
        };

        let admission = match self
            .services
            .gate
            .validate_and_enter(self.services.backend.as_ref(), quiz_id, raw_student_id)
            .await
        {
            Ok(admission) => admission,
            Err(rejection) => return Err(self.refuse_entry(Some(lease), rejection)),
        };

        let bank = match self.services.backend.get_questions(quiz_id).await {
            Ok(bank) => bank,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load question bank");
                return Err(self.refuse_entry(Some(lease), Rejection::BackendUnavailable));
            }
        };
        let questions = build_session(&bank, self.session.quiz().num_questions);
        if questions.is_empty() {
            tracing::warn!(bank.size = bank.len(), "Quiz has no usable questions");
            return Err(self.refuse_entry(Some(lease), Rejection::EmptyQuestionBank));
        }

        let total_questions = questions.len();
        if let Err(e) = self.session.begin(admission, questions) {
            drop(lease);
            return Err(e.into());
        }
        self.lease = Some(lease);

        if self.session.is_timed() {
            self.ticker = Some(tokio::time::interval_at(Instant::now() + TICK, TICK));
        }

        self.push(ServerToClientMessage::SessionStarted {
            session_id,
            student_id: self.session.student_id().unwrap_or_default().to_string(),
            total_questions,
            remaining_seconds: self.session.remaining_time(),
        })
        .await;
        self.push_question().await;
        Ok(())
    }

    fn refuse_entry(&mut self, lease: Option<LockLease>, rejection: Rejection) -> CommandError {
        drop(lease);
        tracing::info!(rejection = rejection.code(), "Session start refused");
        // Still on the entry screen, so keep watching sibling tabs.
        self.lock_events = Some(self.lock_store.subscribe());
        rejection.into()
    }

    async fn handle_tick(&mut self) {
        match self.session.tick() {
            TickOutcome::Idle => self.ticker = None,
            TickOutcome::Running { remaining_seconds } => {
                self.push(ServerToClientMessage::TimeUpdate { remaining_seconds })
                    .await;
            }
            TickOutcome::Expired(completion) => {
                self.push(ServerToClientMessage::TimeUpdate {
                    remaining_seconds: 0,
                })
                .await;
                self.finish(completion).await;
            }
        }
    }

    /// Runs once per session: the session only hands out one `Completion`.
    async fn finish(&mut self, completion: Completion) {
        self.ticker = None;
        self.push(ServerToClientMessage::completed(&completion)).await;

        self.save_state = SaveState::Saving;
        self.push(ServerToClientMessage::ResultSaving).await;

        let saved = scorer::write_result(
            self.services.backend.as_ref(),
            completion.quiz_id,
            &completion.student_id,
            completion.score,
            Utc::now(),
        )
        .await;

        let outcome = match saved {
            Ok(stored) => {
                self.save_state = SaveState::Saved {
                    result_id: stored.id.clone(),
                };
                ServerToClientMessage::ResultSaved {
                    result_id: stored.id,
                }
            }
            Err(e) => {
                // The session stays completed; the score is still shown.
                self.save_state = SaveState::Failed {
                    message: e.to_string(),
                };
                ServerToClientMessage::save_failed(completion.score)
            }
        };

        self.lease = None;
        self.push(outcome).await;
    }

    /// Returns `true` when another tab took this quiz and this tab must abort.
    fn handle_lock_event(&mut self, event: Result<LockEvent, RecvError>) -> bool {
        match event {
            Ok(LockEvent::Acquired { key, holder }) => {
                key == lock_key(self.quiz_id())
                    && holder != self.session.session_id()
                    && self.session.status() == SessionStatus::AwaitingIdentity
            }
            Ok(LockEvent::Released { .. }) => false,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Lock observer lagged");
                false
            }
            Err(RecvError::Closed) => {
                self.lock_events = None;
                false
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session.session_id(),
            quiz_id: self.quiz_id(),
            status: self.session.status(),
            student_id: self.session.student_id().map(str::to_string),
            current_question: self.session.current_question(),
            remaining_time: self.session.remaining_time(),
            final_score: self.session.final_score(),
            save_state: self.save_state.clone(),
        }
    }

    fn not_in_progress(&self) -> SessionError {
        match self.session.status() {
            SessionStatus::Completed => SessionError::AlreadyCompleted,
            _ => SessionError::NotStarted,
        }
    }

    fn not_awaiting_identity(&self) -> SessionError {
        match self.session.status() {
            SessionStatus::Completed => SessionError::AlreadyCompleted,
            _ => SessionError::AlreadyStarted,
        }
    }
}

fn to_command(message: ClientToServerMessage) -> Option<SessionCommand> {
    match message {
        ClientToServerMessage::OpenQuiz { .. } => None,
        ClientToServerMessage::StartSession { student_id } => {
            Some(SessionCommand::Start { student_id })
        }
        ClientToServerMessage::SubmitAnswer { option_index } => {
            Some(SessionCommand::SubmitAnswer { option_index })
        }
        ClientToServerMessage::GoNext => Some(SessionCommand::GoNext),
        ClientToServerMessage::GoPrev => Some(SessionCommand::GoPrev),
        ClientToServerMessage::CurrentQuestion => Some(SessionCommand::CurrentQuestion),
        ClientToServerMessage::LeaveQuiz => Some(SessionCommand::Leave),
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_lock_event(
    events: &mut Option<broadcast::Receiver<LockEvent>>,
) -> Result<LockEvent, RecvError> {
    match events {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

#[tracing::instrument(skip(actor), fields(
    session.id = %actor.session.session_id(),
    quiz.id = %actor.quiz_id(),
    browser.scope = %actor.lock_store.scope()
))]
pub async fn run_session_actor(mut actor: SessionActor) {
    tracing::info!("Session actor started");

    actor
        .push(ServerToClientMessage::QuizOpened {
            session_id: actor.session.session_id(),
            quiz: QuizSummary::from_quiz(actor.session.quiz(), Utc::now()),
        })
        .await;

    loop {
        tokio::select! {
            maybe_msg = actor.receiver.recv() => {
                match maybe_msg {
                    Some(msg) => {
                        if actor.handle_message(msg).await {
                            tracing::info!("Session shutdown requested by message handler");
                            break;
                        }
                    }
                    None => {
                        tracing::info!("Session actor channel closed. Shutting down");
                        break;
                    }
                }
            }
            _ = next_tick(&mut actor.ticker) => {
                actor.handle_tick().await;
            }
            event = next_lock_event(&mut actor.lock_events) => {
                if actor.handle_lock_event(event) {
                    tracing::info!("Quiz opened in another tab, aborting this one");
                    actor
                        .push(ServerToClientMessage::SessionAborted {
                            message: "This quiz was started in another tab.".to_string(),
                        })
                        .await;
                    break;
                }
            }
        }
    }

    tracing::info!(
        status = ?actor.session.status(),
        lock.held = actor.lease.is_some(),
        "Session actor stopping"
    );
}

#[derive(Clone, Debug)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionActorMessage>,
    pub quiz_id: Uuid,
}

impl SessionHandle {
    /// Looks the quiz up and spawns the tab's actor. The actor pushes
    /// `QuizOpened` as its first message.
    #[tracing::instrument(skip(services, client_tx), fields(quiz.id = %quiz_id, browser.scope = %browser_id))]
    pub async fn open(
        quiz_id: Uuid,
        browser_id: &str,
        services: SessionServices,
        client_tx: mpsc::Sender<ServerToClientMessage>,
    ) -> Result<Self, Rejection> {
        let quiz = match services.backend.get_quiz(quiz_id).await {
            Ok(Some(quiz)) => quiz,
            Ok(None) => {
                tracing::info!("Quiz not found");
                return Err(Rejection::QuizNotFound);
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to load quiz");
                return Err(Rejection::BackendUnavailable);
            }
        };
        Ok(Self::spawn(
            quiz,
            browser_id,
            SESSION_MAILBOX_SIZE,
            services,
            client_tx,
        ))
    }

    pub fn spawn(
        quiz: Quiz,
        browser_id: &str,
        buffer_size: usize,
        services: SessionServices,
        client_tx: mpsc::Sender<ServerToClientMessage>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(buffer_size);
        let quiz_id = quiz.id;
        let lock_store = services.locks.scope(browser_id);
        let actor = SessionActor::new(receiver, quiz, lock_store, services, client_tx);
        tokio::spawn(run_session_actor(actor));
        Self { sender, quiz_id }
    }

    async fn command(&self, command: SessionCommand) -> Result<(), CommandError> {
        let (respond_to, rx) = oneshot::channel();
        self.sender
            .send(SessionActorMessage::Command {
                command,
                respond_to: Some(respond_to),
            })
            .await
            .map_err(|_| CommandError::ActorGone)?;
        rx.await.map_err(|_| CommandError::ActorGone)?
    }

    pub async fn start_session(&self, student_id: impl Into<String>) -> Result<(), CommandError> {
        self.command(SessionCommand::Start {
            student_id: student_id.into(),
        })
        .await
    }

    pub async fn submit_answer(&self, option_index: usize) -> Result<(), CommandError> {
        self.command(SessionCommand::SubmitAnswer { option_index })
            .await
    }

    pub async fn go_next(&self) -> Result<(), CommandError> {
        self.command(SessionCommand::GoNext).await
    }

    pub async fn go_prev(&self) -> Result<(), CommandError> {
        self.command(SessionCommand::GoPrev).await
    }

    /// Ends the session without recording anything and releases the lock.
    pub async fn cancel(&self) -> Result<(), CommandError> {
        self.command(SessionCommand::Leave).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, CommandError> {
        let (respond_to, rx) = oneshot::channel();
        self.sender
            .send(SessionActorMessage::Snapshot { respond_to })
            .await
            .map_err(|_| CommandError::ActorGone)?;
        rx.await.map_err(|_| CommandError::ActorGone)
    }

    pub async fn current_question(&self) -> Result<Option<QuestionView>, CommandError> {
        Ok(self.snapshot().await?.current_question)
    }

    pub async fn remaining_time(&self) -> Result<Option<u64>, CommandError> {
        Ok(self.snapshot().await?.remaining_time)
    }

    pub async fn is_complete(&self) -> Result<bool, CommandError> {
        Ok(self.snapshot().await?.status == SessionStatus::Completed)
    }

    pub async fn final_score(&self) -> Result<Option<Score>, CommandError> {
        Ok(self.snapshot().await?.final_score)
    }

    pub async fn forward_client_event(&self, raw_payload: String) -> Result<(), CommandError> {
        self.sender
            .send(SessionActorMessage::ClientEvent { raw_payload })
            .await
            .map_err(|_| CommandError::ActorGone)
    }

    pub async fn client_disconnected(&self) {
        if self
            .sender
            .send(SessionActorMessage::ClientDisconnected)
            .await
            .is_err()
        {
            tracing::debug!(quiz.id = %self.quiz_id, "Session actor already stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, NewQuizResult, Question};

    const STUDENT: &str = "BTH/18U/1234";

    struct Fixture {
        backend: Arc<MemoryBackend>,
        services: SessionServices,
        quiz: Quiz,
    }

    async fn fixture(num_questions: usize, timer_seconds: u64) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let quiz = Quiz {
            id: Uuid::new_v4(),
            title: "Week 6: Thermodynamics".to_string(),
            week: Some(6),
            course_id: None,
            num_questions,
            timer_seconds,
            is_enabled: true,
            valid_from: None,
            valid_to: None,
        };
        backend.insert_quiz(quiz.clone()).await;
        for (text, correct_option) in [("First law?", 0), ("Entropy unit?", 1), ("Absolute zero?", 2)] {
            backend
                .insert_question(Question {
                    id: Uuid::new_v4(),
                    quiz_id: quiz.id,
                    text: text.to_string(),
                    options: vec!["a".into(), "b".into(), "c".into(), "d".into()],
                    correct_option,
                })
                .await;
        }

        let services = SessionServices {
            backend: backend.clone(),
            gate: Arc::new(IdentityGate::default()),
            locks: Arc::new(LockRegistry::new()),
        };
        Fixture {
            backend,
            services,
            quiz,
        }
    }

    async fn open_tab(
        fixture: &Fixture,
        browser_id: &str,
    ) -> (SessionHandle, mpsc::Receiver<ServerToClientMessage>) {
        let (client_tx, mut client_rx) = mpsc::channel(128);
        let handle = SessionHandle::open(
            fixture.quiz.id,
            browser_id,
            fixture.services.clone(),
            client_tx,
        )
        .await
        .unwrap();
        match client_rx.recv().await {
            Some(ServerToClientMessage::QuizOpened { quiz, .. }) => {
                assert_eq!(quiz.quiz_id, fixture.quiz.id)
            }
            other => panic!("expected QuizOpened, got {other:?}"),
        }
        (handle, client_rx)
    }

    async fn wait_for_save(
        client_rx: &mut mpsc::Receiver<ServerToClientMessage>,
    ) -> Vec<ServerToClientMessage> {
        let mut seen = Vec::new();
        while let Some(message) = client_rx.recv().await {
            let done = matches!(
                message,
                ServerToClientMessage::ResultSaved { .. }
                    | ServerToClientMessage::ResultSaveFailed { .. }
            );
            seen.push(message);
            if done {
                break;
            }
        }
        seen
    }

    fn rejection(result: Result<(), CommandError>) -> Rejection {
        match result {
            Err(CommandError::Rejected(rejection)) => rejection,
            other => panic!("expected a rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_quiz_is_not_found() {
        let fixture = fixture(2, 0).await;
        let (client_tx, _client_rx) = mpsc::channel(8);
        let result =
            SessionHandle::open(Uuid::new_v4(), "browser-a", fixture.services.clone(), client_tx)
                .await;
        assert_eq!(result.unwrap_err(), Rejection::QuizNotFound);
    }

    #[tokio::test]
    async fn test_untimed_session_runs_to_a_saved_result() {
        let fixture = fixture(2, 0).await;
        let (tab, mut client_rx) = open_tab(&fixture, "browser-a").await;

        tab.start_session(" bth/18u/1234 ").await.unwrap();
        assert_eq!(tab.remaining_time().await.unwrap(), None);

        for _ in 0..2 {
            tab.submit_answer(0).await.unwrap();
            tab.go_next().await.unwrap();
        }

        let messages = wait_for_save(&mut client_rx).await;
        assert!(matches!(
            messages.last(),
            Some(ServerToClientMessage::ResultSaved { .. })
        ));
        assert!(tab.is_complete().await.unwrap());

        let score = tab.final_score().await.unwrap().unwrap();
        assert_eq!(score.total, 2);

        let results = fixture.backend.results().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].student_id, STUDENT);
        assert_eq!((results[0].score, results[0].total), (score.score, 2));
    }

    #[tokio::test]
    async fn test_advance_requires_an_answer() {
        let fixture = fixture(2, 0).await;
        let (tab, _client_rx) = open_tab(&fixture, "browser-a").await;
        tab.start_session(STUDENT).await.unwrap();

        assert_eq!(
            tab.go_next().await,
            Err(CommandError::Session(SessionError::CurrentQuestionUnanswered))
        );
        assert_eq!(tab.go_prev().await, Ok(()));
        assert_eq!(tab.current_question().await.unwrap().unwrap().index, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_expiry_saves_zero_score_once() {
        let fixture = fixture(3, 5).await;
        let (tab, mut client_rx) = open_tab(&fixture, "browser-a").await;
        tab.start_session(STUDENT).await.unwrap();
        assert_eq!(tab.remaining_time().await.unwrap(), Some(5));

        let messages = wait_for_save(&mut client_rx).await;
        let countdown: Vec<u64> = messages
            .iter()
            .filter_map(|m| match m {
                ServerToClientMessage::TimeUpdate { remaining_seconds } => Some(*remaining_seconds),
                _ => None,
            })
            .collect();
        assert_eq!(countdown, vec![4, 3, 2, 1, 0]);
        assert!(messages.contains(&ServerToClientMessage::SessionCompleted {
            score: 0,
            total: 3,
            reason: crate::engine::CompletionReason::TimeExpired,
        }));

        // Pressing finish after expiry changes nothing.
        assert_eq!(
            tab.submit_answer(0).await,
            Err(CommandError::Session(SessionError::AlreadyCompleted))
        );
        tokio::time::sleep(StdDuration::from_secs(10)).await;
        assert_eq!(fixture.backend.insert_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_and_expiry_in_the_same_second_write_once() {
        let fixture = fixture(1, 1).await;
        let (tab, mut client_rx) = open_tab(&fixture, "browser-a").await;
        tab.start_session(STUDENT).await.unwrap();
        tab.submit_answer(0).await.unwrap();

        tokio::time::sleep(TICK).await;
        let _ = tab.go_next().await;
        wait_for_save(&mut client_rx).await;
        tokio::time::sleep(StdDuration::from_secs(5)).await;

        assert!(tab.is_complete().await.unwrap());
        assert_eq!(fixture.backend.insert_calls(), 1);
    }

    #[tokio::test]
    async fn test_second_tab_is_refused_until_first_ends() {
        let fixture = fixture(2, 0).await;
        let (first, _first_rx) = open_tab(&fixture, "browser-a").await;
        first.start_session(STUDENT).await.unwrap();

        let (second, _second_rx) = open_tab(&fixture, "browser-a").await;
        assert_eq!(
            rejection(second.start_session(STUDENT).await),
            Rejection::AlreadyOpenElsewhere
        );

        first.cancel().await.unwrap();
        assert_eq!(second.start_session(STUDENT).await, Ok(()));
        assert!(fixture.backend.results().await.is_empty());
    }

    #[tokio::test]
    async fn test_other_browsers_are_not_blocked() {
        let fixture = fixture(2, 0).await;
        let (first, _first_rx) = open_tab(&fixture, "browser-a").await;
        first.start_session(STUDENT).await.unwrap();

        let (other, _other_rx) = open_tab(&fixture, "browser-b").await;
        assert_eq!(other.start_session("BTH/19A/0001").await, Ok(()));
    }

    #[tokio::test]
    async fn test_completed_quiz_falls_through_to_retake_check() {
        let fixture = fixture(1, 0).await;
        let (first, mut first_rx) = open_tab(&fixture, "browser-a").await;
        first.start_session(STUDENT).await.unwrap();
        first.submit_answer(0).await.unwrap();
        first.go_next().await.unwrap();
        wait_for_save(&mut first_rx).await;

        let (second, _second_rx) = open_tab(&fixture, "browser-a").await;
        assert_eq!(
            rejection(second.start_session("bth/18u/1234").await),
            Rejection::AlreadyTaken
        );
        // The refused start gave the lock back.
        assert!(
            fixture
                .services
                .locks
                .scope("browser-a")
                .holder(fixture.quiz.id)
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_pre_entry_tab_aborts_when_another_tab_starts() {
        let fixture = fixture(2, 0).await;
        let (first, _first_rx) = open_tab(&fixture, "browser-a").await;
        let (waiting, mut waiting_rx) = open_tab(&fixture, "browser-a").await;

        first.start_session(STUDENT).await.unwrap();

        assert!(matches!(
            waiting_rx.recv().await,
            Some(ServerToClientMessage::SessionAborted { .. })
        ));
        assert_eq!(waiting_rx.recv().await, None);
        assert_eq!(
            waiting.start_session(STUDENT).await,
            Err(CommandError::ActorGone)
        );
    }

    #[tokio::test]
    async fn test_invalid_id_keeps_tab_on_entry_screen() {
        let fixture = fixture(2, 0).await;
        let (tab, _client_rx) = open_tab(&fixture, "browser-a").await;

        assert!(matches!(
            rejection(tab.start_session("not-an-id").await),
            Rejection::InvalidFormat { .. }
        ));
        assert_eq!(
            fixture
                .services
                .locks
                .scope("browser-a")
                .holder(fixture.quiz.id),
            None
        );
        assert_eq!(tab.start_session(STUDENT).await, Ok(()));
    }

    #[tokio::test]
    async fn test_empty_bank_is_refused() {
        let fixture = fixture(2, 0).await;
        let empty = Quiz {
            id: Uuid::new_v4(),
            ..fixture.quiz.clone()
        };
        fixture.backend.insert_quiz(empty.clone()).await;

        let (client_tx, _client_rx) = mpsc::channel(16);
        let tab = SessionHandle::open(empty.id, "browser-a", fixture.services.clone(), client_tx)
            .await
            .unwrap();
        assert_eq!(
            rejection(tab.start_session(STUDENT).await),
            Rejection::EmptyQuestionBank
        );
        assert!(fixture.backend.results().await.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_quiz_is_refused() {
        let fixture = fixture(2, 0).await;
        let disabled = Quiz {
            id: Uuid::new_v4(),
            is_enabled: false,
            ..fixture.quiz.clone()
        };
        fixture.backend.insert_quiz(disabled.clone()).await;

        let (client_tx, _client_rx) = mpsc::channel(16);
        let tab = SessionHandle::open(disabled.id, "browser-a", fixture.services.clone(), client_tx)
            .await
            .unwrap();
        assert_eq!(
            rejection(tab.start_session(STUDENT).await),
            Rejection::QuizUnavailable
        );
    }

    #[tokio::test]
    async fn test_save_failure_is_reported_without_rollback() {
        let fixture = fixture(1, 0).await;
        fixture.backend.set_fail_inserts(true);
        let (tab, mut client_rx) = open_tab(&fixture, "browser-a").await;

        tab.start_session(STUDENT).await.unwrap();
        tab.submit_answer(0).await.unwrap();
        tab.go_next().await.unwrap();

        let messages = wait_for_save(&mut client_rx).await;
        assert!(matches!(
            messages.last(),
            Some(ServerToClientMessage::ResultSaveFailed { total: 1, .. })
        ));

        let snapshot = tab.snapshot().await.unwrap();
        assert_eq!(snapshot.status, SessionStatus::Completed);
        assert!(matches!(snapshot.save_state, SaveState::Failed { .. }));
        assert!(snapshot.final_score.is_some());
        assert_eq!(fixture.backend.insert_calls(), 1);
    }

    #[tokio::test]
    async fn test_retake_refused_when_result_exists() {
        let fixture = fixture(2, 0).await;
        fixture
            .backend
            .insert_result(NewQuizResult {
                quiz_id: fixture.quiz.id,
                student_id: STUDENT.to_string(),
                score: 2,
                total: 2,
                taken_at: Utc::now(),
            })
            .await
            .unwrap();

        let (tab, _client_rx) = open_tab(&fixture, "browser-a").await;
        assert_eq!(
            rejection(tab.start_session("  Bth/18U/1234").await),
            Rejection::AlreadyTaken
        );
    }

    #[tokio::test]
    async fn test_client_events_drive_the_session() {
        let fixture = fixture(2, 0).await;
        let (tab, mut client_rx) = open_tab(&fixture, "browser-a").await;

        tab.forward_client_event(
            r#"{"messageType":"StartSession","payload":{"student_id":"BTH/18U/1234"}}"#
                .to_string(),
        )
        .await
        .unwrap();
        assert!(matches!(
            client_rx.recv().await,
            Some(ServerToClientMessage::SessionStarted { total_questions: 2, .. })
        ));
        assert!(matches!(
            client_rx.recv().await,
            Some(ServerToClientMessage::QuestionView { .. })
        ));

        tab.forward_client_event(r#"{"messageType":"GoNext"}"#.to_string())
            .await
            .unwrap();
        assert!(matches!(
            client_rx.recv().await,
            Some(ServerToClientMessage::CommandError { .. })
        ));

        tab.forward_client_event("not json".to_string()).await.unwrap();
        assert!(matches!(
            client_rx.recv().await,
            Some(ServerToClientMessage::SystemError { .. })
        ));

        tab.forward_client_event(r#"{"messageType":"LeaveQuiz"}"#.to_string())
            .await
            .unwrap();
        assert_eq!(client_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_disconnect_releases_the_lock() {
        let fixture = fixture(2, 0).await;
        let (tab, mut client_rx) = open_tab(&fixture, "browser-a").await;
        tab.start_session(STUDENT).await.unwrap();

        tab.client_disconnected().await;
        while client_rx.recv().await.is_some() {}

        let store = fixture.services.locks.scope("browser-a");
        assert_eq!(store.holder(fixture.quiz.id), None);
        assert!(fixture.backend.results().await.is_empty());
    }
}
