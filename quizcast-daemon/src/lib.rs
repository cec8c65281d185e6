//! quizcast daemon
//!
//! Binds the live sync hub to TCP for quiz clients and to a Unix control
//! socket for the operator, seeded from a TOML quiz file.

pub mod config;
pub mod control;
pub mod listener;
pub mod quiz;

pub use config::DaemonConfig;
pub use control::{ControlCommand, ControlServer};
pub use quiz::QuizFile;
