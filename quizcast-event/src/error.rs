use thiserror::Error;

use crate::state::EventState;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: EventState, to: EventState },

    #[error("Question number {number} out of range (total questions: {total})")]
    QuestionOutOfRange { number: u32, total: u32 },

    #[error("Unknown event state: {0}")]
    UnknownState(String),

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("User {0} not found")]
    UserNotFound(u64),

    #[error("Store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, EventError>;
