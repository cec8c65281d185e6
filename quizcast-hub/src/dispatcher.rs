//! Inbound frame routing. Only probe acknowledgements are acted on.

use quizcast_event::Role;
use std::sync::Arc;

use crate::connection::ConnectionInfo;
use crate::error::{HubError, Result};
use crate::events::{decode_frame, ClientMessage};
use crate::latency::{LatencyMonitor, PongOutcome};

/// What happened to an accepted frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Pong(PongOutcome),
    /// Valid but not actionable (unknown type, repeated hello).
    Ignored,
}

pub struct MessageDispatcher {
    latency: Arc<LatencyMonitor>,
}

impl MessageDispatcher {
    pub fn new(latency: Arc<LatencyMonitor>) -> Self {
        Self { latency }
    }

    /// Decode and route one inbound line from connection `info`.
    pub async fn dispatch(&self, info: &ConnectionInfo, raw: &str) -> Result<Dispatched> {
        match decode_frame(raw)? {
            ClientMessage::Pong { ping_id } => {
                if info.role != Role::Participant {
                    return Err(HubError::UnauthorizedFrame {
                        kind: "pong".to_string(),
                        role: info.role,
                    });
                }
                let outcome = self.latency.handle_pong(&ping_id, info.user_id).await;
                Ok(Dispatched::Pong(outcome))
            }
            ClientMessage::Hello(_) => {
                tracing::debug!("Ignoring repeated hello from {}", info.id);
                Ok(Dispatched::Ignored)
            }
            ClientMessage::Unknown(kind) => {
                tracing::debug!("Discarding '{}' frame from {}", kind, info.id);
                Ok(Dispatched::Ignored)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionId;
    use crate::hub::{ConnectionHub, HubConfig};
    use crate::latency::LatencyConfig;
    use crate::router::BroadcastRouter;
    use crate::sync::{StateSynchronizer, SyncConfig};
    use chrono::Utc;
    use quizcast_event::MemoryStore;

    fn dispatcher() -> MessageDispatcher {
        let store = Arc::new(MemoryStore::new());
        let synchronizer = Arc::new(StateSynchronizer::new(SyncConfig::default()));
        let (hub, _task) = ConnectionHub::start(HubConfig::default(), synchronizer, store);
        let latency = LatencyMonitor::new(BroadcastRouter::new(hub), LatencyConfig::default());
        MessageDispatcher::new(Arc::new(latency))
    }

    fn info(role: Role) -> ConnectionInfo {
        ConnectionInfo {
            id: ConnectionId(1),
            role,
            user_id: 5,
            session_id: "s".to_string(),
            connected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_pong_routed_to_latency_monitor() {
        let d = dispatcher();
        let outcome = d
            .dispatch(&info(Role::Participant), r#"{"type":"pong","data":{"ping_id":"x"}}"#)
            .await
            .unwrap();
        assert_eq!(outcome, Dispatched::Pong(PongOutcome::Unknown));
    }

    #[tokio::test]
    async fn test_pong_from_non_participant_rejected() {
        let d = dispatcher();
        for role in [Role::Admin, Role::Screen] {
            let err = d
                .dispatch(&info(role), r#"{"type":"pong","data":{"ping_id":"x"}}"#)
                .await
                .unwrap_err();
            assert!(matches!(err, HubError::UnauthorizedFrame { .. }));
        }
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames() {
        let d = dispatcher();
        let participant = info(Role::Participant);
        assert!(d.dispatch(&participant, r#"{"type":"pong","data":{}}"#).await.is_err());
        assert!(d.dispatch(&participant, "{").await.is_err());
        assert_eq!(
            d.dispatch(&participant, r#"{"type":"answer","data":{"index":2}}"#)
                .await
                .unwrap(),
            Dispatched::Ignored
        );
    }
}
