//! Authoritative event snapshot and the role-scoped views derived from it.

use quizcast_event::{
    AnswerStore, EventState, EventStateMachine, InMemoryStateMachine, MemoryStore, Question,
    QuestionBank, QuestionSource, Role, Team, TeamStore, User, UserStore,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything known about the event at one point in time, answer key
/// included. Never sent as-is; see [`EventSnapshot::view_for`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventSnapshot {
    pub event_state: EventState,
    pub question_number: u32,
    pub total_questions: u32,
    pub question: Option<Question>,
    pub teams: Vec<Team>,
    pub participants: Vec<User>,
    /// user id -> answer index for the current question.
    pub answers: BTreeMap<u64, u32>,
}

/// Body of an `initial_sync` frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SyncPayload {
    pub event_state: EventState,
    pub question_number: u32,
    pub question: Option<Question>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<Vec<Team>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_data: Option<Vec<User>>,
    #[serde(default)]
    pub answer_data: BTreeMap<u64, u32>,
}

impl EventSnapshot {
    /// Build the view a connection with `role` (and `user_id`) may see.
    ///
    /// Admins get everything. Screens get the redacted question only.
    /// Participants get the redacted question plus their own record and
    /// answer.
    pub fn view_for(&self, role: Role, user_id: u64) -> SyncPayload {
        let question = self.question.as_ref().map(|q| {
            if role.sees_answer_key() {
                q.clone()
            } else {
                q.redacted()
            }
        });

        match role {
            Role::Admin => SyncPayload {
                event_state: self.event_state,
                question_number: self.question_number,
                question,
                team: Some(self.teams.clone()),
                participant_data: Some(self.participants.clone()),
                answer_data: self.answers.clone(),
            },
            Role::Screen => SyncPayload {
                event_state: self.event_state,
                question_number: self.question_number,
                question,
                team: None,
                participant_data: None,
                answer_data: BTreeMap::new(),
            },
            Role::Participant => SyncPayload {
                event_state: self.event_state,
                question_number: self.question_number,
                question,
                team: None,
                participant_data: Some(
                    self.participants
                        .iter()
                        .filter(|p| p.id == user_id)
                        .cloned()
                        .collect(),
                ),
                answer_data: self
                    .answers
                    .get(&user_id)
                    .map(|answer| BTreeMap::from([(user_id, *answer)]))
                    .unwrap_or_default(),
            },
        }
    }
}

/// Handles to every external collaborator the hub reads from or drives.
#[derive(Clone)]
pub struct Collaborators {
    pub state: Arc<dyn EventStateMachine>,
    pub questions: Arc<dyn QuestionSource>,
    pub users: Arc<dyn UserStore>,
    pub teams: Arc<dyn TeamStore>,
    pub answers: Arc<dyn AnswerStore>,
}

impl Collaborators {
    /// Wire up the in-memory implementations.
    pub fn in_memory(
        state: Arc<InMemoryStateMachine>,
        store: Arc<MemoryStore>,
        questions: Arc<QuestionBank>,
    ) -> Self {
        Self {
            state,
            questions,
            users: store.clone(),
            teams: store.clone(),
            answers: store,
        }
    }

    /// Assemble a fresh snapshot from the state machine and repositories.
    pub fn build_snapshot(&self) -> quizcast_event::Result<EventSnapshot> {
        let event_state = self.state.current_state();
        let question_number = self.state.question_number();

        let question = if question_number > 0 {
            self.questions.question(question_number)
        } else {
            None
        };

        let answers = if question_number > 0 {
            self.answers
                .answers_for_question(question_number)?
                .into_iter()
                .map(|a| (a.user_id, a.answer_index))
                .collect()
        } else {
            BTreeMap::new()
        };

        let participants = self
            .users
            .all_users()?
            .into_iter()
            .filter(|u| u.role == Role::Participant)
            .collect();

        Ok(EventSnapshot {
            event_state,
            question_number,
            total_questions: self.state.total_questions(),
            question,
            teams: self.teams.all_teams_with_members()?,
            participants,
            answers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quizcast_event::models::CORRECT_SENTINEL;

    fn user(id: u64, name: &str) -> User {
        User {
            id,
            name: name.to_string(),
            role: Role::Participant,
            team_id: Some(1),
            connected: true,
        }
    }

    fn snapshot() -> EventSnapshot {
        EventSnapshot {
            event_state: EventState::QuestionActive,
            question_number: 1,
            total_questions: 3,
            question: Some(Question {
                question_type: "choice".to_string(),
                text: "Largest planet?".to_string(),
                image: None,
                choices: vec!["Mars".into(), "Jupiter".into(), "Venus".into()],
                correct: 2,
            }),
            teams: vec![Team {
                id: 1,
                name: "Owls".to_string(),
                members: vec![user(10, "Ada"), user(11, "Grace")],
            }],
            participants: vec![user(10, "Ada"), user(11, "Grace")],
            answers: BTreeMap::from([(10, 2), (11, 1)]),
        }
    }

    #[test]
    fn test_admin_view_keeps_answer_key() {
        let view = snapshot().view_for(Role::Admin, 0);
        assert_eq!(view.question.unwrap().correct, 2);
        assert_eq!(view.team.unwrap().len(), 1);
        assert_eq!(view.participant_data.unwrap().len(), 2);
        assert_eq!(view.answer_data.len(), 2);
    }

    #[test]
    fn test_screen_view_is_public_subset() {
        let view = snapshot().view_for(Role::Screen, 0);
        assert_eq!(view.question.unwrap().correct, CORRECT_SENTINEL);
        assert!(view.team.is_none());
        assert!(view.participant_data.is_none());
        assert!(view.answer_data.is_empty());
    }

    #[test]
    fn test_participant_view_only_contains_self() {
        let view = snapshot().view_for(Role::Participant, 11);
        assert_eq!(view.question.as_ref().unwrap().correct, CORRECT_SENTINEL);
        assert!(view.team.is_none());

        let own = view.participant_data.unwrap();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].id, 11);
        assert_eq!(view.answer_data, BTreeMap::from([(11, 1)]));
    }

    #[test]
    fn test_screen_payload_omits_admin_fields_on_the_wire() {
        let json = serde_json::to_value(snapshot().view_for(Role::Screen, 0)).unwrap();
        assert!(json.get("team").is_none());
        assert!(json.get("participant_data").is_none());
        assert_eq!(json["question"]["correct"], 0);
        assert_eq!(json["event_state"], "question_active");
    }

    #[test]
    fn test_build_snapshot_from_memory_collaborators() {
        let machine = Arc::new(InMemoryStateMachine::new(1));
        let store = Arc::new(MemoryStore::new());
        store.add_participant(10, "Ada");
        store.add_user(User {
            id: 1,
            name: "host".to_string(),
            role: Role::Admin,
            team_id: None,
            connected: false,
        });
        let bank = Arc::new(QuestionBank::new(vec![snapshot().question.unwrap()]));
        let collaborators = Collaborators::in_memory(machine.clone(), store.clone(), bank);

        let before = collaborators.build_snapshot().unwrap();
        assert_eq!(before.event_state, EventState::Waiting);
        assert!(before.question.is_none());
        assert_eq!(before.participants.len(), 1);

        machine.transition_to(EventState::Started).unwrap();
        machine.transition_to(EventState::QuestionActive).unwrap();
        store.submit_answer(10, 1, 3).unwrap();

        let after = collaborators.build_snapshot().unwrap();
        assert_eq!(after.question_number, 1);
        assert_eq!(after.question.unwrap().correct, 2);
        assert_eq!(after.answers.get(&10), Some(&3));
        assert_eq!(after.total_questions, 1);
    }
}
