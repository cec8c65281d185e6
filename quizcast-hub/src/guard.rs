//! Consistency guard: periodic anomaly detection and corrective actions.
//!
//! Each tick captures a [`GuardSnapshot`] from the state machine and the hub,
//! compares it with the previous tick and runs the checks in order:
//!
//! 1. state consistency (state change re-broadcast, question index clamp)
//! 2. snapshot drift between the synchronizer and the state machine
//! 3. connection health
//! 4. participant population drift
//!
//! Actions are executed as soon as they are produced and never retried.
//! Connection health and population drift only raise operator-visible flags.

use chrono::{DateTime, Utc};
use quizcast_event::{EventState, EventStateMachine};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::hub::HubStats;
use crate::latency::{LatencyMonitor, LatencyQuality};
use crate::router::BroadcastRouter;
use crate::snapshot::{Collaborators, EventSnapshot};
use crate::sync::{StateSynchronizer, SyncReason, SyncRequest, SyncTarget};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub enabled: bool,
    pub check_interval_ms: u64,
    /// Participant-count change per tick above which drift is flagged.
    pub population_drift_threshold: usize,
    /// Pause before a panicked guard loop is started again.
    pub restart_delay_ms: u64,
    pub history_limit: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 30_000,
            population_drift_threshold: 5,
            restart_delay_ms: 5_000,
            history_limit: 50,
        }
    }
}

impl GuardConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    StateResync,
    QuestionClamp,
    SnapshotRefresh,
    ConnectionAlert,
    PopulationDrift,
    EmergencyReset,
}

/// One corrective action (or flag) produced by the guard.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RecoveryAction {
    pub action_type: RecoveryKind,
    pub description: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

impl RecoveryAction {
    fn new(action_type: RecoveryKind, description: impl Into<String>, payload: serde_json::Value, success: bool) -> Self {
        Self {
            action_type,
            description: description.into(),
            payload,
            timestamp: Utc::now(),
            success,
        }
    }
}

/// Derived health figures.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthMetrics {
    /// Tracked clients whose last push differs from the authoritative state.
    pub out_of_sync_clients: usize,
    pub pending_probes: usize,
    /// Users whose latest probe was classified bad.
    pub bad_latency_users: usize,
}

/// What the guard saw on one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardSnapshot {
    pub event_state: EventState,
    pub question_number: u32,
    pub total_questions: u32,
    pub connections: HubStats,
    pub metrics: HealthMetrics,
    pub taken_at: DateTime<Utc>,
}

pub struct ConsistencyGuard {
    collaborators: Collaborators,
    synchronizer: Arc<StateSynchronizer>,
    router: BroadcastRouter,
    latency: Arc<LatencyMonitor>,
    previous: Mutex<Option<GuardSnapshot>>,
    history: Mutex<VecDeque<RecoveryAction>>,
    config: GuardConfig,
}

impl ConsistencyGuard {
    pub fn new(
        collaborators: Collaborators,
        synchronizer: Arc<StateSynchronizer>,
        router: BroadcastRouter,
        latency: Arc<LatencyMonitor>,
        config: GuardConfig,
    ) -> Self {
        Self {
            collaborators,
            synchronizer,
            router,
            latency,
            previous: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
            config,
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    fn capture(&self) -> GuardSnapshot {
        let state = &self.collaborators.state;
        let metrics = HealthMetrics {
            out_of_sync_clients: self
                .synchronizer
                .client_sync_status()
                .iter()
                .filter(|c| !c.in_sync)
                .count(),
            pending_probes: self.latency.pending_count(),
            bad_latency_users: self
                .latency
                .latest_reports()
                .iter()
                .filter(|r| r.quality == LatencyQuality::Bad)
                .count(),
        };

        GuardSnapshot {
            event_state: state.current_state(),
            question_number: state.question_number(),
            total_questions: state.total_questions(),
            connections: self.router.hub().stats(),
            metrics,
            taken_at: Utc::now(),
        }
    }

    /// Snapshot taken on the most recent tick.
    pub fn last_snapshot(&self) -> Option<GuardSnapshot> {
        self.previous
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run every check once and return the actions taken.
    pub async fn check(&self) -> Vec<RecoveryAction> {
        let current = self.capture();
        let previous = self
            .previous
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(current.clone());

        let mut actions = Vec::new();
        let state_changed = previous.as_ref().is_some_and(|prev| {
            prev.event_state != current.event_state || prev.question_number != current.question_number
        });

        if state_changed {
            actions.push(self.resync_state_change(&current).await);
        }
        if let Some(action) = self.clamp_question(&current).await {
            actions.push(action);
        }
        if let Some(action) = self.check_snapshot_drift().await {
            actions.push(action);
        }
        if let Some(prev) = &previous {
            actions.extend(self.check_connection_health(prev, &current));
            if !state_changed {
                actions.extend(self.check_population_drift(prev, &current));
            }
        }

        for action in &actions {
            self.record(action.clone()).await;
        }
        debug!(
            "Consistency check: {} q{}/{} ({} connections), {} actions",
            current.event_state,
            current.question_number,
            current.total_questions,
            current.connections.total,
            actions.len()
        );
        actions
    }

    /// Rebuild the snapshot, re-broadcast the state and resync everyone.
    async fn resync_all(&self, reason: SyncReason) -> Result<EventSnapshot> {
        let snapshot = self.synchronizer.refresh(&self.collaborators)?;
        self.router
            .broadcast_event_state(snapshot.event_state, snapshot.question_number)
            .await?;
        self.router.hub().request_sync(SyncRequest {
            target: SyncTarget::All,
            reason,
        });
        Ok(snapshot)
    }

    async fn resync_state_change(&self, current: &GuardSnapshot) -> RecoveryAction {
        let outcome = self.resync_all(SyncReason::StateChange).await;
        if let Err(e) = &outcome {
            error!("State change resync failed: {}", e);
        }
        RecoveryAction::new(
            RecoveryKind::StateResync,
            format!("State changed to {}, re-broadcast to all clients", current.event_state),
            json!({
                "event_state": current.event_state,
                "question_number": current.question_number,
            }),
            outcome.is_ok(),
        )
    }

    async fn clamp_question(&self, current: &GuardSnapshot) -> Option<RecoveryAction> {
        let number = current.question_number;
        let total = current.total_questions;
        if !current.event_state.is_question_phase() || (1..=total).contains(&number) {
            return None;
        }

        if total == 0 {
            warn!("In {} without any questions loaded", current.event_state);
            return Some(RecoveryAction::new(
                RecoveryKind::QuestionClamp,
                "Question index out of range and no questions are loaded",
                json!({ "question_number": number, "total_questions": total }),
                false,
            ));
        }

        let clamped = number.clamp(1, total);
        warn!("Question {} outside 1..={}, clamping to {}", number, total, clamped);
        let outcome = match self.collaborators.state.set_question_number(clamped) {
            Ok(()) => self.resync_all(SyncReason::Recovery).await.map(|_| ()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = &outcome {
            error!("Question clamp failed: {}", e);
        }

        Some(RecoveryAction::new(
            RecoveryKind::QuestionClamp,
            format!("Clamped question {} to {}", number, clamped),
            json!({ "from": number, "to": clamped, "total_questions": total }),
            outcome.is_ok(),
        ))
    }

    async fn check_snapshot_drift(&self) -> Option<RecoveryAction> {
        let machine = (
            self.collaborators.state.current_state(),
            self.collaborators.state.question_number(),
        );
        let held = self.synchronizer.authoritative();
        if held == machine {
            return None;
        }

        warn!(
            "Snapshot holds {} q{} but state machine is at {} q{}",
            held.0, held.1, machine.0, machine.1
        );
        let outcome = self.resync_all(SyncReason::Drift).await;
        Some(RecoveryAction::new(
            RecoveryKind::SnapshotRefresh,
            "Authoritative snapshot rebuilt from state machine",
            json!({
                "held": { "event_state": held.0, "question_number": held.1 },
                "actual": { "event_state": machine.0, "question_number": machine.1 },
            }),
            outcome.is_ok(),
        ))
    }

    fn check_connection_health(&self, prev: &GuardSnapshot, current: &GuardSnapshot) -> Vec<RecoveryAction> {
        let mut flags = Vec::new();
        let (before, after) = (&prev.connections, &current.connections);

        if before.total > 0 && after.total == 0 {
            warn!("All {} connections lost since last check", before.total);
            flags.push(RecoveryAction::new(
                RecoveryKind::ConnectionAlert,
                "All client connections lost",
                json!({ "previous_total": before.total }),
                true,
            ));
        }
        if before.admins > 0 && after.admins == 0 {
            warn!("No admin connected anymore");
            flags.push(RecoveryAction::new(
                RecoveryKind::ConnectionAlert,
                "No admin connection left",
                json!({ "previous_admins": before.admins }),
                true,
            ));
        }
        flags
    }

    fn check_population_drift(&self, prev: &GuardSnapshot, current: &GuardSnapshot) -> Option<RecoveryAction> {
        let before = prev.connections.participants;
        let after = current.connections.participants;
        if before.abs_diff(after) <= self.config.population_drift_threshold {
            return None;
        }

        warn!(
            "Participant count moved {} -> {} while state stayed {}",
            before, after, current.event_state
        );
        Some(RecoveryAction::new(
            RecoveryKind::PopulationDrift,
            format!("Participant count changed from {} to {}", before, after),
            json!({ "before": before, "after": after, "event_state": current.event_state }),
            true,
        ))
    }

    /// Force the event back to `waiting` with no current question.
    pub async fn emergency_reset(&self) -> RecoveryAction {
        warn!("Emergency reset requested");
        let outcome = self.apply_reset().await;
        if let Err(e) = &outcome {
            error!("Emergency reset incomplete: {}", e);
        }

        let action = RecoveryAction::new(
            RecoveryKind::EmergencyReset,
            "Event forced back to waiting",
            json!({ "event_state": EventState::Waiting, "question_number": 0 }),
            outcome.is_ok(),
        );
        self.record(action.clone()).await;
        action
    }

    async fn apply_reset(&self) -> Result<()> {
        let state = &self.collaborators.state;
        state.jump_to_state(EventState::Waiting);
        state.set_question_number(0)?;
        self.collaborators.answers.clear_answers()?;

        let snapshot = self.synchronizer.refresh(&self.collaborators)?;
        self.router
            .broadcast_emergency_reset(snapshot.event_state, snapshot.question_number)
            .await?;
        self.router.hub().request_sync(SyncRequest {
            target: SyncTarget::All,
            reason: SyncReason::Recovery,
        });
        Ok(())
    }

    async fn record(&self, action: RecoveryAction) {
        if action.success {
            info!("Recovery action {:?}: {}", action.action_type, action.description);
        } else {
            error!("Recovery action {:?} failed: {}", action.action_type, action.description);
        }

        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.push_back(action.clone());
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }

        if let Err(e) = self.router.report_recovery(&action).await {
            warn!("Failed to report recovery action: {}", e);
        }
    }

    /// Recorded actions, oldest first.
    pub fn history(&self) -> Vec<RecoveryAction> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Check loop; meant to run under [`crate::supervisor::supervise`].
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Consistency guard started (interval {:?})", self.config.check_interval());
        let mut ticker = tokio::time::interval(self.config.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Consistency guard stopped");
    }
}
