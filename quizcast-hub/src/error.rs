use quizcast_event::{EventError, Role};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Frame type '{kind}' not accepted from {role} connections")]
    UnauthorizedFrame { kind: String, role: Role },

    #[error("Handshake rejected: {0}")]
    Handshake(String),

    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("Connection hub is not running")]
    HubClosed,
}

pub type Result<T> = std::result::Result<T, HubError>;
