//! The live system: owns every component and the background loops.

use chrono::{DateTime, Utc};
use quizcast_event::{EventState, EventStateMachine, Role};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::connection::{spawn_pumps, ConnectionInfo, FrameReader};
use crate::dispatcher::MessageDispatcher;
use crate::error::{HubError, Result};
use crate::events::Hello;
use crate::guard::{ConsistencyGuard, GuardConfig, GuardSnapshot, RecoveryAction};
use crate::hub::{ConnectionHub, HubConfig, HubStats};
use crate::latency::{LatencyConfig, LatencyMonitor, LatencyReport};
use crate::router::BroadcastRouter;
use crate::snapshot::{Collaborators, EventSnapshot};
use crate::supervisor::supervise;
use crate::sync::{ClientSyncStatus, StateSynchronizer, SyncConfig, SyncReason, SyncRequest, SyncTarget};

/// Recovery actions included in a status report.
const RECENT_RECOVERY_ACTIONS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub hub: HubConfig,
    pub sync: SyncConfig,
    pub latency: LatencyConfig,
    pub guard: GuardConfig,
    /// Below this uptime the connections-per-hour rate is not reported.
    pub min_uptime_for_rate_secs: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            hub: HubConfig::default(),
            sync: SyncConfig::default(),
            latency: LatencyConfig::default(),
            guard: GuardConfig::default(),
            min_uptime_for_rate_secs: 60,
        }
    }
}

/// Operator-facing overview of the running system.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub event_state: EventState,
    pub question_number: u32,
    pub total_questions: u32,
    pub connections: HubStats,
    /// `None` until the system has been up long enough for a stable rate.
    pub avg_connections_per_hour: Option<f64>,
    pub tracked_clients: usize,
    pub pending_probes: usize,
    pub latency: Vec<LatencyReport>,
    pub recent_recovery_actions: Vec<RecoveryAction>,
    pub last_check: Option<GuardSnapshot>,
}

/// Connections per hour over `uptime`, or `None` below `min_uptime`.
pub fn connections_per_hour(served: u64, uptime: Duration, min_uptime: Duration) -> Option<f64> {
    if uptime < min_uptime || uptime.is_zero() {
        return None;
    }
    Some(served as f64 * 3600.0 / uptime.as_secs_f64())
}

pub struct LiveSystem {
    config: SystemConfig,
    collaborators: Collaborators,
    hub: ConnectionHub,
    synchronizer: Arc<StateSynchronizer>,
    router: BroadcastRouter,
    latency: Arc<LatencyMonitor>,
    dispatcher: Arc<MessageDispatcher>,
    guard: Arc<ConsistencyGuard>,
    started: Instant,
    started_at: DateTime<Utc>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LiveSystem {
    /// Build every component, load the initial snapshot and start the hub
    /// and the background loops.
    pub fn start(config: SystemConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        let synchronizer = Arc::new(StateSynchronizer::new(config.sync.clone()));
        synchronizer.refresh(&collaborators)?;

        let (hub, hub_task) = ConnectionHub::start(
            config.hub.clone(),
            Arc::clone(&synchronizer),
            Arc::clone(&collaborators.users),
        );
        let router = BroadcastRouter::new(hub.clone());
        let latency = Arc::new(LatencyMonitor::new(router.clone(), config.latency.clone()));
        let dispatcher = Arc::new(MessageDispatcher::new(Arc::clone(&latency)));
        let guard = Arc::new(ConsistencyGuard::new(
            collaborators.clone(),
            Arc::clone(&synchronizer),
            router.clone(),
            Arc::clone(&latency),
            config.guard.clone(),
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![hub_task];

        tasks.push(tokio::spawn(
            Arc::clone(&synchronizer).run_sweeps(hub.clone(), shutdown_rx.clone()),
        ));

        if config.latency.enabled {
            tasks.push(tokio::spawn(Arc::clone(&latency).run(shutdown_rx.clone())));
        }

        if config.guard.enabled {
            let guard = Arc::clone(&guard);
            let delay = config.guard.restart_delay();
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                let restarts = supervise("consistency guard", delay, rx.clone(), move || {
                    Arc::clone(&guard).run(rx.clone())
                })
                .await;
                info!("Consistency guard supervisor exited after {} restarts", restarts);
            }));
        }

        info!(
            "Live system started ({} questions, latency probes {}, guard {})",
            collaborators.state.total_questions(),
            if config.latency.enabled { "on" } else { "off" },
            if config.guard.enabled { "on" } else { "off" }
        );

        Ok(Arc::new(Self {
            config,
            collaborators,
            hub,
            synchronizer,
            router,
            latency,
            dispatcher,
            guard,
            started: Instant::now(),
            started_at: Utc::now(),
            shutdown,
            tasks: Mutex::new(tasks),
        }))
    }

    /// Register a client that completed its hello and start its pumps.
    pub async fn connect<R, W>(&self, hello: Hello, reader: FrameReader<R>, writer: W) -> Result<ConnectionInfo>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if hello.role == Role::Participant && hello.user_id == 0 {
            return Err(HubError::Handshake(
                "participant connections must carry a user_id".to_string(),
            ));
        }
        if hello.user_id != 0 && self.collaborators.users.user_by_id(hello.user_id)?.is_none() {
            return Err(HubError::Handshake(format!("unknown user {}", hello.user_id)));
        }

        let session_id = hello
            .session_id
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let (info, io) = self.hub.register(hello.role, hello.user_id, session_id).await?;
        spawn_pumps(
            info.clone(),
            reader,
            writer,
            io,
            Arc::clone(&self.dispatcher),
            self.hub.clone(),
        );
        Ok(info)
    }

    /// Install an externally built snapshot and resync every client if
    /// the state label or question changed.
    pub fn update_event_state(&self, snapshot: EventSnapshot) {
        let before = self.synchronizer.authoritative();
        let after = (snapshot.event_state, snapshot.question_number);
        self.synchronizer.update_event_state(snapshot);
        if before != after {
            self.request_sync(SyncTarget::All, SyncReason::StateChange);
        }
    }

    /// Rebuild the snapshot from the collaborators.
    pub fn refresh_snapshot(&self) -> Result<EventSnapshot> {
        Ok(self.synchronizer.refresh(&self.collaborators)?)
    }

    /// Move the event along the state graph and tell every client.
    pub async fn transition_to(&self, next: EventState) -> Result<EventSnapshot> {
        self.collaborators.state.transition_to(next)?;
        let snapshot = self.refresh_snapshot()?;

        self.router
            .broadcast_event_state(snapshot.event_state, snapshot.question_number)
            .await?;
        self.announce(&snapshot).await?;
        self.request_sync(SyncTarget::All, SyncReason::StateChange);
        Ok(snapshot)
    }

    /// Start the next question. Returns its number.
    pub async fn next_question(&self) -> Result<u32> {
        let snapshot = self.transition_to(EventState::QuestionActive).await?;
        Ok(snapshot.question_number)
    }

    /// State-specific broadcast that accompanies a transition.
    async fn announce(&self, snapshot: &EventSnapshot) -> Result<()> {
        let number = snapshot.question_number;
        match (snapshot.event_state, &snapshot.question) {
            (EventState::QuestionActive, Some(question)) => {
                self.router.broadcast_question_started(number, question).await
            }
            (EventState::AnswerStats, Some(question)) => {
                let mut counts = vec![0u32; question.choices.len()];
                for index in snapshot.answers.values() {
                    if let Some(slot) = (*index as usize).checked_sub(1).and_then(|i| counts.get_mut(i)) {
                        *slot += 1;
                    }
                }
                self.router.broadcast_answer_stats(number, counts).await
            }
            (EventState::AnswerReveal, Some(question)) => {
                self.router.broadcast_answer_reveal(number, question.correct).await
            }
            (EventState::TeamAssignment, _) => self.router.broadcast_team_assignment(&snapshot.teams).await,
            _ => Ok(()),
        }
    }

    /// Note that an answer was stored: tell admins and refresh the snapshot.
    pub async fn answer_recorded(&self, user_id: u64, question_number: u32, answer_index: u32) -> Result<()> {
        self.refresh_snapshot()?;
        self.router
            .broadcast_answer_submitted(user_id, question_number, answer_index)
            .await
    }

    /// Broadcast a countdown from `seconds` to zero, one tick per second.
    pub fn start_countdown(self: &Arc<Self>, seconds: u32) -> JoinHandle<()> {
        let system = Arc::clone(self);
        tokio::spawn(async move {
            let question_number = system.collaborators.state.question_number();
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            for remaining in (0..=seconds).rev() {
                ticker.tick().await;
                if let Err(e) = system.router.broadcast_countdown(question_number, remaining).await {
                    warn!("Countdown broadcast failed: {}", e);
                    return;
                }
            }
        })
    }

    fn request_sync(&self, target: SyncTarget, reason: SyncReason) -> bool {
        self.hub.request_sync(SyncRequest { target, reason })
    }

    /// Queue a resync of every connection of `user_id` (all connections
    /// for user 0). Returns false if the sync queue was full.
    pub fn request_client_sync(&self, user_id: u64, reason: SyncReason) -> bool {
        let target = if user_id == 0 {
            SyncTarget::All
        } else {
            SyncTarget::User(user_id)
        };
        self.request_sync(target, reason)
    }

    pub fn client_sync_status(&self) -> Vec<ClientSyncStatus> {
        self.synchronizer.client_sync_status()
    }

    pub fn system_status(&self) -> SystemStatus {
        let uptime = self.started.elapsed();
        let connections = self.hub.stats();
        let history = self.guard.history();
        let recent = history
            .iter()
            .rev()
            .take(RECENT_RECOVERY_ACTIONS)
            .rev()
            .cloned()
            .collect();
        let state = &self.collaborators.state;

        SystemStatus {
            started_at: self.started_at,
            uptime_secs: uptime.as_secs(),
            event_state: state.current_state(),
            question_number: state.question_number(),
            total_questions: state.total_questions(),
            avg_connections_per_hour: connections_per_hour(
                connections.total_served,
                uptime,
                Duration::from_secs(self.config.min_uptime_for_rate_secs),
            ),
            connections,
            tracked_clients: self.synchronizer.tracked_clients(),
            pending_probes: self.latency.pending_count(),
            latency: self.latency.latest_reports(),
            recent_recovery_actions: recent,
            last_check: self.guard.last_snapshot(),
        }
    }

    pub async fn emergency_reset(&self) -> RecoveryAction {
        self.guard.emergency_reset().await
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    pub fn router(&self) -> &BroadcastRouter {
        &self.router
    }

    pub fn synchronizer(&self) -> &Arc<StateSynchronizer> {
        &self.synchronizer
    }

    pub fn latency(&self) -> &Arc<LatencyMonitor> {
        &self.latency
    }

    pub fn guard(&self) -> &Arc<ConsistencyGuard> {
        &self.guard
    }

    /// Stop the background loops and close every connection.
    pub async fn shutdown(&self) {
        info!("Shutting down live system");
        let _ = self.shutdown.send(true);
        self.hub.shutdown().await;

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
    }
}
