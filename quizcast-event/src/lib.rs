//! Event domain for quizcast
//!
//! Everything the live hub consumes from the outside world: the quiz state
//! graph, the roles a connection can take, the user/team/question/answer
//! models, and the collaborator traits through which the hub reads rosters
//! and drives the state machine.
//!
//! The hub never owns persistence. In-memory implementations of every
//! collaborator are provided here so the daemon can run standalone and the
//! hub can be tested without a database.

pub mod error;
pub mod machine;
pub mod models;
pub mod state;
pub mod store;

// Re-exports
pub use error::{EventError, Result};
pub use machine::{EventStateMachine, InMemoryStateMachine};
pub use models::{Answer, Question, Role, Team, User};
pub use state::EventState;
pub use store::{AnswerStore, MemoryStore, QuestionBank, QuestionSource, TeamStore, UserStore};
