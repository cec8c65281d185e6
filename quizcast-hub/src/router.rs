//! Typed broadcast calls on top of the hub.
//!
//! Each domain event picks its audience here; redaction of the answer key
//! happens before anything reaches a non-admin scope.

use quizcast_event::{EventState, Question, Role, Team};

use crate::connection::ConnectionId;
use crate::error::Result;
use crate::events::{Envelope, ServerMessage};
use crate::guard::RecoveryAction;
use crate::hub::{ConnectionHub, Scope};
use crate::latency::LatencyReport;

#[derive(Clone)]
pub struct BroadcastRouter {
    hub: ConnectionHub,
}

impl BroadcastRouter {
    pub fn new(hub: ConnectionHub) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    pub async fn broadcast_to_all(&self, message: ServerMessage) -> Result<()> {
        self.hub.broadcast(&Envelope::new(message), Scope::All).await
    }

    /// Send to every connection with `role`; the envelope carries the role
    /// as its `target`.
    pub async fn broadcast_to_type(&self, role: Role, message: ServerMessage) -> Result<()> {
        self.hub
            .broadcast(&Envelope::targeted(message, role), Scope::Role(role))
            .await
    }

    /// Send to every connection of one user. User id 0 reaches nobody.
    pub async fn broadcast_to_user(&self, user_id: u64, message: ServerMessage) -> Result<()> {
        self.hub
            .broadcast(&Envelope::new(message), Scope::User(user_id))
            .await
    }

    pub async fn send_to_connection(&self, id: ConnectionId, message: ServerMessage) -> Result<()> {
        self.hub
            .broadcast(&Envelope::new(message), Scope::Connection(id))
            .await
    }

    pub async fn broadcast_event_state(&self, event_state: EventState, question_number: u32) -> Result<()> {
        tracing::info!("Broadcasting state {} (question {})", event_state, question_number);
        self.broadcast_to_all(ServerMessage::StateChanged {
            event_state,
            question_number,
        })
        .await
    }

    /// Admins get the question as-is, everyone else the redacted copy.
    pub async fn broadcast_question_started(&self, question_number: u32, question: &Question) -> Result<()> {
        self.broadcast_to_type(
            Role::Admin,
            ServerMessage::QuestionStarted {
                question_number,
                question: question.clone(),
            },
        )
        .await?;

        let redacted = question.redacted();
        for role in [Role::Participant, Role::Screen] {
            self.broadcast_to_type(
                role,
                ServerMessage::QuestionStarted {
                    question_number,
                    question: redacted.clone(),
                },
            )
            .await?;
        }
        Ok(())
    }

    pub async fn broadcast_countdown(&self, question_number: u32, seconds_remaining: u32) -> Result<()> {
        for role in [Role::Admin, Role::Screen] {
            self.broadcast_to_type(
                role,
                ServerMessage::Countdown {
                    question_number,
                    seconds_remaining,
                },
            )
            .await?;
        }
        Ok(())
    }

    pub async fn broadcast_answer_submitted(&self, user_id: u64, question_number: u32, answer_index: u32) -> Result<()> {
        self.broadcast_to_type(
            Role::Admin,
            ServerMessage::AnswerSubmitted {
                user_id,
                question_number,
                answer_index,
            },
        )
        .await
    }

    pub async fn broadcast_answer_stats(&self, question_number: u32, counts: Vec<u32>) -> Result<()> {
        let total_answers = counts.iter().sum();
        self.broadcast_to_all(ServerMessage::AnswerStats {
            question_number,
            counts,
            total_answers,
        })
        .await
    }

    pub async fn broadcast_answer_reveal(&self, question_number: u32, correct: u32) -> Result<()> {
        self.broadcast_to_all(ServerMessage::AnswerReveal {
            question_number,
            correct,
        })
        .await
    }

    /// Full roster to admins and screens; each participant only sees the
    /// team they belong to.
    pub async fn broadcast_team_assignment(&self, teams: &[Team]) -> Result<()> {
        for role in [Role::Admin, Role::Screen] {
            self.broadcast_to_type(
                role,
                ServerMessage::TeamAssignment {
                    teams: teams.to_vec(),
                },
            )
            .await?;
        }

        for team in teams {
            for member in &team.members {
                self.broadcast_to_user(
                    member.id,
                    ServerMessage::TeamAssignment {
                        teams: vec![team.clone()],
                    },
                )
                .await?;
            }
        }
        Ok(())
    }

    pub async fn broadcast_emergency_reset(&self, event_state: EventState, question_number: u32) -> Result<()> {
        tracing::warn!("Broadcasting emergency reset");
        self.broadcast_to_all(ServerMessage::EmergencyReset {
            event_state,
            question_number,
        })
        .await
    }

    pub async fn report_recovery(&self, action: &RecoveryAction) -> Result<()> {
        self.broadcast_to_type(Role::Admin, ServerMessage::RecoveryAction(action.clone()))
            .await
    }

    pub async fn report_latency(&self, report: &LatencyReport) -> Result<()> {
        self.broadcast_to_type(Role::Admin, ServerMessage::LatencyReport(report.clone()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionIo;
    use crate::hub::HubConfig;
    use crate::sync::{StateSynchronizer, SyncConfig};
    use quizcast_event::models::CORRECT_SENTINEL;
    use quizcast_event::{MemoryStore, User};
    use std::sync::Arc;

    fn frames(io: &mut ConnectionIo) -> Vec<serde_json::Value> {
        std::iter::from_fn(|| io.try_next())
            .map(|frame| serde_json::from_str(&frame).unwrap())
            .collect()
    }

    async fn setup() -> (BroadcastRouter, ConnectionIo, ConnectionIo, ConnectionIo) {
        let store = Arc::new(MemoryStore::new());
        store.add_participant(10, "Ada");
        let synchronizer = Arc::new(StateSynchronizer::new(SyncConfig::default()));
        let config = HubConfig {
            initial_sync_delay_ms: 60_000,
            ..HubConfig::default()
        };
        let (hub, _task) = ConnectionHub::start(config, synchronizer, store);

        let (_, mut admin) = hub.register(Role::Admin, 0, "a".into()).await.unwrap();
        let (_, participant) = hub.register(Role::Participant, 10, "p".into()).await.unwrap();
        let (_, screen) = hub.register(Role::Screen, 0, "s".into()).await.unwrap();
        hub.flush().await;

        // Drop the user_connection notice for participant 10.
        frames(&mut admin);
        (BroadcastRouter::new(hub), admin, participant, screen)
    }

    fn question() -> Question {
        Question {
            question_type: "choice".into(),
            text: "2 + 2?".into(),
            image: None,
            choices: vec!["3".into(), "4".into()],
            correct: 2,
        }
    }

    #[tokio::test]
    async fn test_broadcast_to_type_admin_never_reaches_others() {
        let (router, mut admin, mut participant, mut screen) = setup().await;

        router
            .broadcast_answer_submitted(10, 1, 2)
            .await
            .unwrap();
        router.hub().flush().await;

        let seen = frames(&mut admin);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["type"], "answer_submitted");
        assert_eq!(seen[0]["target"], "admin");
        assert!(frames(&mut participant).is_empty());
        assert!(frames(&mut screen).is_empty());
    }

    #[tokio::test]
    async fn test_question_started_redacts_for_non_admins() {
        let (router, mut admin, mut participant, mut screen) = setup().await;

        router.broadcast_question_started(1, &question()).await.unwrap();
        router.hub().flush().await;

        assert_eq!(frames(&mut admin)[0]["data"]["question"]["correct"], 2);
        assert_eq!(
            frames(&mut participant)[0]["data"]["question"]["correct"],
            CORRECT_SENTINEL
        );
        assert_eq!(
            frames(&mut screen)[0]["data"]["question"]["correct"],
            CORRECT_SENTINEL
        );
    }

    #[tokio::test]
    async fn test_countdown_skips_participants() {
        let (router, mut admin, mut participant, mut screen) = setup().await;

        router.broadcast_countdown(1, 10).await.unwrap();
        router.hub().flush().await;

        assert_eq!(frames(&mut admin).len(), 1);
        assert_eq!(frames(&mut screen)[0]["data"]["seconds_remaining"], 10);
        assert!(frames(&mut participant).is_empty());
    }

    #[tokio::test]
    async fn test_team_assignment_gives_participants_their_own_team() {
        let (router, mut admin, mut participant, _screen) = setup().await;
        let member = |id: u64, name: &str| User {
            id,
            name: name.into(),
            role: Role::Participant,
            team_id: None,
            connected: false,
        };
        let teams = vec![
            Team {
                id: 1,
                name: "Owls".into(),
                members: vec![member(10, "Ada")],
            },
            Team {
                id: 2,
                name: "Foxes".into(),
                members: vec![member(11, "Grace")],
            },
        ];

        router.broadcast_team_assignment(&teams).await.unwrap();
        router.hub().flush().await;

        assert_eq!(frames(&mut admin)[0]["data"]["teams"].as_array().unwrap().len(), 2);
        let own = frames(&mut participant);
        assert_eq!(own.len(), 1);
        assert_eq!(own[0]["data"]["teams"][0]["name"], "Owls");
        assert_eq!(own[0]["data"]["teams"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_answer_stats_totals() {
        let (router, mut admin, _participant, _screen) = setup().await;

        router.broadcast_answer_stats(3, vec![1, 4, 0]).await.unwrap();
        router.hub().flush().await;

        let seen = frames(&mut admin);
        assert_eq!(seen[0]["data"]["total_answers"], 5);
        assert_eq!(seen[0]["data"]["question_number"], 3);
    }
}
