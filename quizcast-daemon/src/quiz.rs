//! Quiz content file: questions, users and teams used to seed the
//! in-memory collaborators.
//!
//! ```toml
//! [[questions]]
//! type = "choice"
//! text = "Largest planet?"
//! choices = ["Mars", "Jupiter"]
//! correct = 2
//!
//! [[teams]]
//! id = 1
//! name = "Owls"
//!
//! [[users]]
//! id = 10
//! name = "Ada"
//! team_id = 1
//! ```

use anyhow::{bail, Context, Result};
use quizcast_event::{InMemoryStateMachine, MemoryStore, Question, QuestionBank, Role, User};
use quizcast_hub::Collaborators;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    pub id: u64,
    pub name: String,
    #[serde(default = "default_role")]
    pub role: Role,
    #[serde(default)]
    pub team_id: Option<u64>,
}

fn default_role() -> Role {
    Role::Participant
}

#[derive(Debug, Clone, Deserialize)]
pub struct TeamEntry {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuizFile {
    #[serde(default)]
    pub questions: Vec<Question>,
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default)]
    pub teams: Vec<TeamEntry>,
}

impl QuizFile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read quiz file {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("Invalid quiz file {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let quiz: QuizFile = toml::from_str(contents).context("Failed to parse quiz TOML")?;
        quiz.validate()?;
        Ok(quiz)
    }

    fn validate(&self) -> Result<()> {
        for (i, question) in self.questions.iter().enumerate() {
            let number = i + 1;
            if question.correct == 0 || question.correct as usize > question.choices.len() {
                bail!(
                    "Question {} has correct = {} but {} choices",
                    number,
                    question.correct,
                    question.choices.len()
                );
            }
        }

        let mut ids = HashSet::new();
        for user in &self.users {
            if user.id == 0 {
                bail!("User '{}' has id 0, which is reserved", user.name);
            }
            if !ids.insert(user.id) {
                bail!("Duplicate user id {}", user.id);
            }
        }

        let teams: HashSet<u64> = self.teams.iter().map(|t| t.id).collect();
        for user in &self.users {
            if let Some(team_id) = user.team_id {
                if !teams.contains(&team_id) {
                    bail!("User {} refers to unknown team {}", user.id, team_id);
                }
            }
        }
        Ok(())
    }

    /// Build in-memory collaborators holding this quiz.
    pub fn into_collaborators(self) -> Collaborators {
        let store = Arc::new(MemoryStore::new());
        for team in &self.teams {
            store.add_team(team.id, &team.name);
        }
        for user in &self.users {
            store.add_user(User {
                id: user.id,
                name: user.name.clone(),
                role: user.role,
                team_id: user.team_id,
                connected: false,
            });
        }

        info!(
            "Quiz loaded: {} questions, {} users, {} teams",
            self.questions.len(),
            self.users.len(),
            self.teams.len()
        );

        let machine = Arc::new(InMemoryStateMachine::new(self.questions.len() as u32));
        let bank = Arc::new(QuestionBank::new(self.questions));
        Collaborators::in_memory(machine, store, bank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quizcast_event::{EventStateMachine, QuestionSource, TeamStore};

    const SAMPLE: &str = r#"
[[questions]]
type = "choice"
text = "Largest planet?"
choices = ["Mars", "Jupiter", "Venus"]
correct = 2

[[questions]]
type = "choice"
text = "Smallest prime?"
image = "primes.png"
choices = ["1", "2"]
correct = 2

[[teams]]
id = 1
name = "Owls"

[[users]]
id = 10
name = "Ada"
team_id = 1

[[users]]
id = 1
name = "Host"
role = "admin"
"#;

    #[test]
    fn test_parse_sample() {
        let quiz = QuizFile::parse(SAMPLE).unwrap();
        assert_eq!(quiz.questions.len(), 2);
        assert_eq!(quiz.questions[1].image.as_deref(), Some("primes.png"));
        assert_eq!(quiz.users[0].role, Role::Participant);
        assert_eq!(quiz.users[1].role, Role::Admin);
    }

    #[test]
    fn test_seeded_collaborators() {
        let collaborators = QuizFile::parse(SAMPLE).unwrap().into_collaborators();
        assert_eq!(collaborators.state.total_questions(), 2);
        assert_eq!(collaborators.questions.question(1).unwrap().correct, 2);

        let teams = collaborators.teams.all_teams_with_members().unwrap();
        assert_eq!(teams.len(), 1);
        assert_eq!(teams[0].members.len(), 1);
        assert_eq!(teams[0].members[0].name, "Ada");

        let snapshot = collaborators.build_snapshot().unwrap();
        assert_eq!(snapshot.participants.len(), 1);
    }

    #[test]
    fn test_rejects_bad_content() {
        let bad_key = r#"
[[questions]]
type = "choice"
text = "?"
choices = ["a"]
correct = 3
"#;
        assert!(QuizFile::parse(bad_key).is_err());

        let duplicate = r#"
[[users]]
id = 5
name = "a"

[[users]]
id = 5
name = "b"
"#;
        assert!(QuizFile::parse(duplicate).is_err());

        let orphan = r#"
[[users]]
id = 5
name = "a"
team_id = 9
"#;
        assert!(QuizFile::parse(orphan).is_err());
    }

    #[test]
    fn test_empty_quiz_is_valid() {
        let quiz = QuizFile::parse("").unwrap();
        assert!(quiz.questions.is_empty());
    }
}
