//! Wire messages exchanged with clients.
//!
//! Every frame is one line of JSON shaped `{"type": ..., "data": {...}}`,
//! with an optional `"target"` role on outbound frames addressed to a role.

use quizcast_event::{EventState, Question, Role, Team};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{HubError, Result};
use crate::guard::RecoveryAction;
use crate::latency::LatencyReport;
use crate::snapshot::SyncPayload;

/// Messages the server sends to clients.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Latency probe; the client must answer with a `pong` echoing the id.
    Ping { ping_id: String },

    /// Full role-scoped view of the event.
    InitialSync(SyncPayload),

    /// The event moved to another state.
    StateChanged {
        event_state: EventState,
        question_number: u32,
    },

    /// A question went live. `correct` is the sentinel for non-admins.
    QuestionStarted {
        question_number: u32,
        question: Question,
    },

    /// Countdown tick (admin and screen only).
    Countdown {
        question_number: u32,
        seconds_remaining: u32,
    },

    /// A participant answered (admin only).
    AnswerSubmitted {
        user_id: u64,
        question_number: u32,
        answer_index: u32,
    },

    /// Per-choice answer counts; `counts[i]` is the number of answers for
    /// choice `i + 1`.
    AnswerStats {
        question_number: u32,
        counts: Vec<u32>,
        total_answers: u32,
    },

    /// The answer key of a question, released to everyone.
    AnswerReveal { question_number: u32, correct: u32 },

    /// Team roster after assignment.
    TeamAssignment { teams: Vec<Team> },

    /// A user connected or disconnected (admin only).
    UserConnection {
        user_id: u64,
        role: Role,
        connected: bool,
    },

    LatencyReport(LatencyReport),

    RecoveryAction(RecoveryAction),

    /// The event was forced back to its initial state.
    EmergencyReset {
        event_state: EventState,
        question_number: u32,
    },
}

impl ServerMessage {
    /// Wire `type` of the message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Ping { .. } => "ping",
            ServerMessage::InitialSync(_) => "initial_sync",
            ServerMessage::StateChanged { .. } => "state_changed",
            ServerMessage::QuestionStarted { .. } => "question_started",
            ServerMessage::Countdown { .. } => "countdown",
            ServerMessage::AnswerSubmitted { .. } => "answer_submitted",
            ServerMessage::AnswerStats { .. } => "answer_stats",
            ServerMessage::AnswerReveal { .. } => "answer_reveal",
            ServerMessage::TeamAssignment { .. } => "team_assignment",
            ServerMessage::UserConnection { .. } => "user_connection",
            ServerMessage::LatencyReport(_) => "latency_report",
            ServerMessage::RecoveryAction(_) => "recovery_action",
            ServerMessage::EmergencyReset { .. } => "emergency_reset",
        }
    }
}

/// Outbound message plus optional audience tag.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message: ServerMessage,
    pub target: Option<Role>,
}

impl Envelope {
    pub fn new(message: ServerMessage) -> Self {
        Self {
            message,
            target: None,
        }
    }

    pub fn targeted(message: ServerMessage, target: Role) -> Self {
        Self {
            message,
            target: Some(target),
        }
    }

    /// Encode as a newline-terminated JSON frame shared by every recipient.
    pub fn encode(&self) -> Result<Arc<str>> {
        let mut value = serde_json::to_value(&self.message)?;
        if let (Some(target), Some(object)) = (self.target, value.as_object_mut()) {
            object.insert("target".to_string(), serde_json::to_value(target)?);
        }
        let mut line = serde_json::to_string(&value)?;
        line.push('\n');
        Ok(Arc::from(line))
    }
}

/// Handshake sent by a client as its first frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Hello {
    pub role: Role,
    #[serde(default)]
    pub user_id: u64,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Messages clients may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Hello(Hello),
    Pong { ping_id: String },
    /// Any other `type`; carried only so it can be logged.
    Unknown(String),
}

#[derive(Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct PongData {
    ping_id: String,
}

/// Decode one inbound line into a typed client message.
pub fn decode_frame(raw: &str) -> Result<ClientMessage> {
    let frame: InboundFrame = serde_json::from_str(raw.trim())
        .map_err(|e| HubError::InvalidFrame(format!("not an envelope: {}", e)))?;

    match frame.kind.as_str() {
        "pong" => {
            let pong: PongData = serde_json::from_value(frame.data)
                .map_err(|e| HubError::InvalidFrame(format!("pong: {}", e)))?;
            if pong.ping_id.is_empty() {
                return Err(HubError::InvalidFrame("pong: empty ping_id".to_string()));
            }
            Ok(ClientMessage::Pong {
                ping_id: pong.ping_id,
            })
        }
        "hello" => {
            let hello: Hello = serde_json::from_value(frame.data)
                .map_err(|e| HubError::InvalidFrame(format!("hello: {}", e)))?;
            Ok(ClientMessage::Hello(hello))
        }
        other => Ok(ClientMessage::Unknown(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let envelope = Envelope::new(ServerMessage::Ping {
            ping_id: "abc".to_string(),
        });
        let line = envelope.encode().unwrap();
        assert!(line.ends_with('\n'));

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "ping");
        assert_eq!(value["data"]["ping_id"], "abc");
        assert!(value.get("target").is_none());
    }

    #[test]
    fn test_targeted_envelope_carries_role() {
        let envelope = Envelope::targeted(
            ServerMessage::Countdown {
                question_number: 2,
                seconds_remaining: 5,
            },
            Role::Screen,
        );
        let value: serde_json::Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "countdown");
        assert_eq!(value["target"], "screen");
        assert_eq!(value["data"]["seconds_remaining"], 5);
    }

    #[test]
    fn test_kind_matches_wire_type() {
        let message = ServerMessage::StateChanged {
            event_state: EventState::Results,
            question_number: 4,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], message.kind());
        assert_eq!(value["data"]["event_state"], "results");
    }

    #[test]
    fn test_decode_pong() {
        let msg = decode_frame(r#"{"type":"pong","data":{"ping_id":"p-1"}}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Pong {
                ping_id: "p-1".to_string()
            }
        );
    }

    #[test]
    fn test_decode_pong_without_id_is_invalid() {
        assert!(matches!(
            decode_frame(r#"{"type":"pong","data":{}}"#),
            Err(HubError::InvalidFrame(_))
        ));
        assert!(matches!(
            decode_frame(r#"{"type":"pong"}"#),
            Err(HubError::InvalidFrame(_))
        ));
        assert!(matches!(
            decode_frame(r#"{"type":"pong","data":{"ping_id":""}}"#),
            Err(HubError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_decode_hello_defaults() {
        let msg = decode_frame(r#"{"type":"hello","data":{"role":"screen"}}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Hello(Hello {
                role: Role::Screen,
                user_id: 0,
                session_id: None,
            })
        );
    }

    #[test]
    fn test_decode_unknown_and_garbage() {
        assert_eq!(
            decode_frame(r#"{"type":"chat","data":{"text":"hi"}}"#).unwrap(),
            ClientMessage::Unknown("chat".to_string())
        );
        assert!(decode_frame("not json").is_err());
        assert!(decode_frame(r#"{"data":{}}"#).is_err());
    }
}
