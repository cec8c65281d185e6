//! State synchronizer: the authoritative snapshot and per-client sync state.
//!
//! The synchronizer never touches connections itself. The hub coordinator
//! asks it to [`prepare_push`](StateSynchronizer::prepare_push) a frame for a
//! connection, enqueues it, and only then calls
//! [`record_push`](StateSynchronizer::record_push).

use chrono::{DateTime, Utc};
use quizcast_event::{EventState, Role};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::connection::{ConnectionId, ConnectionInfo};
use crate::error::Result;
use crate::events::{Envelope, ServerMessage};
use crate::hub::ConnectionHub;
use crate::snapshot::{Collaborators, EventSnapshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Period of the drift/staleness sweep over participant connections.
    pub sweep_interval_ms: u64,
    /// A participant not synced for longer than this is re-synced.
    pub staleness_threshold_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 10_000,
            staleness_threshold_ms: 30_000,
        }
    }
}

impl SyncConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_millis(self.staleness_threshold_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncReason {
    /// First sync after a connection registered.
    Initial,
    /// First sync after a known user connected again.
    Reconnect,
    /// Requested by an operator or an external caller.
    Manual,
    StateChange,
    /// Client state differs from the authoritative snapshot.
    Drift,
    Recovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTarget {
    Connection(ConnectionId),
    /// Every connection of a user.
    User(u64),
    All,
    /// Every participant connection that drifted or went stale.
    Sweep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRequest {
    pub target: SyncTarget,
    pub reason: SyncReason,
}

/// What the synchronizer knows about one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSyncState {
    pub role: Role,
    pub user_id: u64,
    pub last_state: Option<EventState>,
    pub last_question: u32,
    pub last_sync: Option<Instant>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_reason: Option<SyncReason>,
    pub initialized: bool,
    pub version: u64,
}

impl ClientSyncState {
    fn new(info: &ConnectionInfo) -> Self {
        Self {
            role: info.role,
            user_id: info.user_id,
            last_state: None,
            last_question: 0,
            last_sync: None,
            last_sync_at: None,
            last_reason: None,
            initialized: false,
            version: 0,
        }
    }

    /// Whether this client must be pushed again: its recorded state or
    /// progress differs from the authoritative values, or its last sync is
    /// older than `threshold`.
    pub fn is_out_of_date(
        &self,
        event_state: EventState,
        question_number: u32,
        now: Instant,
        threshold: Duration,
    ) -> bool {
        if self.last_state != Some(event_state) || self.last_question != question_number {
            return true;
        }
        match self.last_sync {
            Some(at) => now.saturating_duration_since(at) > threshold,
            None => true,
        }
    }
}

/// Sync state of one connection, as reported to operators.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSyncStatus {
    pub connection_id: ConnectionId,
    pub role: Role,
    pub user_id: u64,
    pub last_state: Option<EventState>,
    pub last_question: u32,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_reason: Option<SyncReason>,
    pub initialized: bool,
    pub version: u64,
    pub in_sync: bool,
}

/// A prepared `initial_sync` frame and the values it carries.
#[derive(Debug, Clone)]
pub struct SyncPush {
    pub frame: Arc<str>,
    pub event_state: EventState,
    pub question_number: u32,
}

pub struct StateSynchronizer {
    snapshot: RwLock<EventSnapshot>,
    clients: Mutex<HashMap<ConnectionId, ClientSyncState>>,
    config: SyncConfig,
}

impl StateSynchronizer {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            snapshot: RwLock::new(EventSnapshot::default()),
            clients: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<ConnectionId, ClientSyncState>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the authoritative snapshot (last writer wins).
    pub fn update_event_state(&self, snapshot: EventSnapshot) {
        let mut slot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        if slot.event_state != snapshot.event_state || slot.question_number != snapshot.question_number {
            info!(
                "Authoritative state: {} q{} -> {} q{}",
                slot.event_state, slot.question_number, snapshot.event_state, snapshot.question_number
            );
        }
        *slot = snapshot;
    }

    /// Rebuild the snapshot from the collaborators and install it.
    pub fn refresh(&self, collaborators: &Collaborators) -> quizcast_event::Result<EventSnapshot> {
        let snapshot = collaborators.build_snapshot()?;
        self.update_event_state(snapshot.clone());
        Ok(snapshot)
    }

    /// Copy of the authoritative snapshot.
    pub fn snapshot(&self) -> EventSnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Authoritative state label and progress index.
    pub fn authoritative(&self) -> (EventState, u32) {
        let slot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        (slot.event_state, slot.question_number)
    }

    /// Start tracking a freshly registered connection.
    pub fn register_client(&self, info: &ConnectionInfo) {
        self.clients().insert(info.id, ClientSyncState::new(info));
    }

    /// Stop tracking a connection. Returns whether it was tracked.
    pub fn unregister_client(&self, id: ConnectionId) -> bool {
        self.clients().remove(&id).is_some()
    }

    pub fn client_state(&self, id: ConnectionId) -> Option<ClientSyncState> {
        self.clients().get(&id).cloned()
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients().len()
    }

    /// Build the role-scoped `initial_sync` frame for a connection.
    ///
    /// The snapshot lock is released before the view is derived and encoded.
    pub fn prepare_push(&self, info: &ConnectionInfo) -> Result<SyncPush> {
        let snapshot = self.snapshot();
        let payload = snapshot.view_for(info.role, info.user_id);
        let frame = Envelope::new(ServerMessage::InitialSync(payload)).encode()?;
        Ok(SyncPush {
            frame,
            event_state: snapshot.event_state,
            question_number: snapshot.question_number,
        })
    }

    /// Record that `push` was enqueued for connection `id`.
    pub fn record_push(&self, id: ConnectionId, push: &SyncPush, reason: SyncReason) {
        let mut clients = self.clients();
        let Some(state) = clients.get_mut(&id) else {
            return;
        };
        state.last_state = Some(push.event_state);
        state.last_question = push.question_number;
        state.last_sync = Some(Instant::now());
        state.last_sync_at = Some(Utc::now());
        state.last_reason = Some(reason);
        state.initialized = true;
        state.version += 1;
        debug!(
            "Synced {} ({:?}) to {} q{} v{}",
            id, reason, push.event_state, push.question_number, state.version
        );
    }

    /// Sweep policy for one connection.
    pub fn needs_resync(&self, id: ConnectionId, now: Instant) -> bool {
        let (event_state, question_number) = self.authoritative();
        self.clients().get(&id).is_some_and(|state| {
            state.is_out_of_date(event_state, question_number, now, self.config.staleness_threshold())
        })
    }

    pub fn client_sync_status(&self) -> Vec<ClientSyncStatus> {
        let (event_state, question_number) = self.authoritative();
        let mut status: Vec<ClientSyncStatus> = self
            .clients()
            .iter()
            .map(|(id, state)| ClientSyncStatus {
                connection_id: *id,
                role: state.role,
                user_id: state.user_id,
                last_state: state.last_state,
                last_question: state.last_question,
                last_sync_at: state.last_sync_at,
                last_reason: state.last_reason,
                initialized: state.initialized,
                version: state.version,
                in_sync: state.last_state == Some(event_state)
                    && state.last_question == question_number,
            })
            .collect();
        status.sort_by_key(|s| s.connection_id);
        status
    }

    /// Periodically ask the hub to sweep participants for drift.
    pub async fn run_sweeps(self: Arc<Self>, hub: ConnectionHub, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    hub.request_sync(SyncRequest {
                        target: SyncTarget::Sweep,
                        reason: SyncReason::Drift,
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Sync sweep loop stopped");
    }
}
