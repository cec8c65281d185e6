//! Data models shared between the hub and its collaborators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::EventError;

/// Value written into `correct` for every non-admin view of a question.
pub const CORRECT_SENTINEL: u32 = 0;

/// Audience a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Participant,
    Screen,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Admin, Role::Participant, Role::Screen];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Participant => "participant",
            Role::Screen => "screen",
        }
    }

    /// Whether views built for this role may carry the answer key.
    pub fn sees_answer_key(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "participant" => Ok(Role::Participant),
            "screen" => Ok(Role::Screen),
            _ => Err(EventError::UnknownRole(s.to_string())),
        }
    }
}

/// A registered user of the quiz run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub team_id: Option<u64>,
    #[serde(default)]
    pub connected: bool,
}

/// A team together with its members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub members: Vec<User>,
}

/// Question payload as stored, including the answer key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    #[serde(rename = "type")]
    pub question_type: String,
    pub text: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub choices: Vec<String>,
    /// 1-based index of the correct choice.
    pub correct: u32,
}

impl Question {
    /// Copy of the question with the answer key replaced by the sentinel.
    pub fn redacted(&self) -> Question {
        Question {
            correct: CORRECT_SENTINEL,
            ..self.clone()
        }
    }
}

/// A participant's answer to one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub user_id: u64,
    pub question_number: u32,
    pub answer_index: u32,
    pub answered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse_and_display() {
        for role in Role::ALL {
            assert_eq!(role.to_string().parse::<Role>().unwrap(), role);
        }
        assert!(" Screen ".parse::<Role>().is_ok());
        assert!(matches!("judge".parse::<Role>(), Err(EventError::UnknownRole(_))));
    }

    #[test]
    fn test_question_serializes_type_field() {
        let question = Question {
            question_type: "choice".to_string(),
            text: "2 + 2?".to_string(),
            image: None,
            choices: vec!["3".into(), "4".into()],
            correct: 2,
        };
        let json = serde_json::to_value(&question).unwrap();
        assert_eq!(json["type"], "choice");
        assert_eq!(json["correct"], 2);
    }

    #[test]
    fn test_redacted_question_hides_answer_key() {
        let question = Question {
            question_type: "choice".to_string(),
            text: "Capital of France?".to_string(),
            image: Some("paris.png".to_string()),
            choices: vec!["Lyon".into(), "Paris".into()],
            correct: 2,
        };
        let redacted = question.redacted();
        assert_eq!(redacted.correct, CORRECT_SENTINEL);
        assert_eq!(redacted.choices, question.choices);
        assert_eq!(question.correct, 2);
    }
}
