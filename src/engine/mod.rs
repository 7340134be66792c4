pub mod error;
pub mod guard;
pub mod identity;
pub mod messages;
pub mod question_set;
pub mod scorer;
pub mod session;
pub mod shuffle;

pub use error::{CommandError, Rejection, SessionError};
pub use guard::{LockEvent, LockLease, LockRegistry, LockStore};
pub use identity::{Admission, IdentityGate};
pub use messages::{ClientToServerMessage, QuizSummary, ServerToClientMessage};
pub use question_set::{SessionQuestion, build_session};
pub use scorer::Score;
pub use session::{
    Completion, CompletionReason, QuestionView, QuizSession, SessionStatus, TickOutcome,
};
