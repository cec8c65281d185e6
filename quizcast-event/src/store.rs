//! Collaborator interfaces for rosters, answers and quiz content.
//!
//! The traits are the seams the hub consumes; `MemoryStore` and
//! `QuestionBank` are in-process implementations used by the daemon and by
//! tests.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::error::{EventError, Result};
use crate::models::{Answer, Question, Role, Team, User};

pub trait UserStore: Send + Sync {
    fn all_users(&self) -> Result<Vec<User>>;
    fn user_by_id(&self, id: u64) -> Result<Option<User>>;
    fn update_connection_status(&self, id: u64, connected: bool) -> Result<()>;
}

pub trait TeamStore: Send + Sync {
    fn all_teams_with_members(&self) -> Result<Vec<Team>>;
}

pub trait AnswerStore: Send + Sync {
    fn answer_by_user_and_question(&self, user_id: u64, question_number: u32)
        -> Result<Option<Answer>>;
    fn answers_for_question(&self, question_number: u32) -> Result<Vec<Answer>>;
    /// Forget every recorded answer, e.g. when the run is reset.
    fn clear_answers(&self) -> Result<()>;
}

/// Read access to quiz content.
pub trait QuestionSource: Send + Sync {
    /// Question by 1-based number.
    fn question(&self, number: u32) -> Option<Question>;
    fn total_questions(&self) -> u32;
}

#[derive(Debug, Default)]
struct StoreData {
    users: BTreeMap<u64, User>,
    teams: BTreeMap<u64, String>,
    answers: Vec<Answer>,
}

/// In-memory user, team and answer store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace a user.
    pub fn add_user(&self, user: User) {
        self.write().users.insert(user.id, user);
    }

    /// Convenience constructor for a participant without a team.
    pub fn add_participant(&self, id: u64, name: &str) {
        self.add_user(User {
            id,
            name: name.to_string(),
            role: Role::Participant,
            team_id: None,
            connected: false,
        });
    }

    pub fn add_team(&self, id: u64, name: &str) {
        self.write().teams.insert(id, name.to_string());
    }

    /// Put a user on a team. Fails if the user does not exist.
    pub fn assign_team(&self, user_id: u64, team_id: u64) -> Result<()> {
        let mut data = self.write();
        let user = data
            .users
            .get_mut(&user_id)
            .ok_or(EventError::UserNotFound(user_id))?;
        user.team_id = Some(team_id);
        Ok(())
    }

    /// Record an answer, replacing any earlier answer by the same user to
    /// the same question.
    pub fn submit_answer(&self, user_id: u64, question_number: u32, answer_index: u32) -> Result<Answer> {
        let mut data = self.write();
        if !data.users.contains_key(&user_id) {
            return Err(EventError::UserNotFound(user_id));
        }

        data.answers
            .retain(|a| !(a.user_id == user_id && a.question_number == question_number));
        let answer = Answer {
            user_id,
            question_number,
            answer_index,
            answered_at: Utc::now(),
        };
        data.answers.push(answer.clone());
        debug!("User {} answered question {} with {}", user_id, question_number, answer_index);
        Ok(answer)
    }
}

impl UserStore for MemoryStore {
    fn all_users(&self) -> Result<Vec<User>> {
        Ok(self.read().users.values().cloned().collect())
    }

    fn user_by_id(&self, id: u64) -> Result<Option<User>> {
        Ok(self.read().users.get(&id).cloned())
    }

    fn update_connection_status(&self, id: u64, connected: bool) -> Result<()> {
        let mut data = self.write();
        let user = data.users.get_mut(&id).ok_or(EventError::UserNotFound(id))?;
        user.connected = connected;
        Ok(())
    }
}

impl TeamStore for MemoryStore {
    fn all_teams_with_members(&self) -> Result<Vec<Team>> {
        let data = self.read();
        Ok(data
            .teams
            .iter()
            .map(|(id, name)| Team {
                id: *id,
                name: name.clone(),
                members: data
                    .users
                    .values()
                    .filter(|u| u.team_id == Some(*id))
                    .cloned()
                    .collect(),
            })
            .collect())
    }
}

impl AnswerStore for MemoryStore {
    fn answer_by_user_and_question(
        &self,
        user_id: u64,
        question_number: u32,
    ) -> Result<Option<Answer>> {
        Ok(self
            .read()
            .answers
            .iter()
            .find(|a| a.user_id == user_id && a.question_number == question_number)
            .cloned())
    }

    fn answers_for_question(&self, question_number: u32) -> Result<Vec<Answer>> {
        Ok(self
            .read()
            .answers
            .iter()
            .filter(|a| a.question_number == question_number)
            .cloned()
            .collect())
    }

    fn clear_answers(&self) -> Result<()> {
        let mut data = self.write();
        debug!("Clearing {} recorded answers", data.answers.len());
        data.answers.clear();
        Ok(())
    }
}

/// Ordered list of questions; question `n` is `questions[n - 1]`.
#[derive(Debug, Clone, Default)]
pub struct QuestionBank {
    questions: Vec<Question>,
}

impl QuestionBank {
    pub fn new(questions: Vec<Question>) -> Self {
        Self { questions }
    }
}

impl QuestionSource for QuestionBank {
    fn question(&self, number: u32) -> Option<Question> {
        let index = usize::try_from(number).ok()?.checked_sub(1)?;
        self.questions.get(index).cloned()
    }

    fn total_questions(&self) -> u32 {
        u32::try_from(self.questions.len()).unwrap_or(u32::MAX)
    }
}
