//! Connection hub: the single task that owns the connection registry.
//!
//! Every structural change (register, unregister) and every fan-out runs
//! inside one coordinator loop, fed by a command channel and a separate
//! bounded sync-request queue. Callers outside the loop only ever see the
//! read-only [`HubStats`] / connection list published behind an `RwLock`.

use chrono::Utc;
use quizcast_event::{Role, UserStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connection::{self, ConnectionHandle, ConnectionId, ConnectionInfo, ConnectionIo, EnqueueError, IdGenerator};
use crate::error::{HubError, Result};
use crate::events::{Envelope, ServerMessage};
use crate::sync::{StateSynchronizer, SyncReason, SyncRequest, SyncTarget};

/// Hub tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Frames a single connection may have queued before it is dropped.
    pub outbound_queue_capacity: usize,
    pub command_queue_capacity: usize,
    pub sync_queue_capacity: usize,
    /// Delay between registration and the first sync push.
    pub initial_sync_delay_ms: u64,
    /// How long a new client has to send its hello frame.
    pub handshake_timeout_ms: u64,
    /// Longest inbound line accepted; a longer one closes the connection.
    pub max_frame_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
            command_queue_capacity: 1024,
            sync_queue_capacity: 64,
            initial_sync_delay_ms: 500,
            handshake_timeout_ms: 5_000,
            max_frame_bytes: 4096,
        }
    }
}

impl HubConfig {
    pub fn initial_sync_delay(&self) -> Duration {
        Duration::from_millis(self.initial_sync_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Audience of a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    All,
    Role(Role),
    User(u64),
    Connection(ConnectionId),
}

impl Scope {
    fn matches(&self, info: &ConnectionInfo) -> bool {
        match self {
            Scope::All => true,
            Scope::Role(role) => info.role == *role,
            Scope::User(user_id) => *user_id != 0 && info.user_id == *user_id,
            Scope::Connection(id) => info.id == *id,
        }
    }
}

/// Connection counts published for external readers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HubStats {
    pub total: usize,
    pub admins: usize,
    pub participants: usize,
    pub screens: usize,
    /// Connections registered since start.
    pub total_served: u64,
    /// Connections dropped because their outbound queue overflowed.
    pub overflow_disconnects: u64,
}

impl HubStats {
    pub fn count_for(&self, role: Role) -> usize {
        match role {
            Role::Admin => self.admins,
            Role::Participant => self.participants,
            Role::Screen => self.screens,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryView {
    connections: BTreeMap<ConnectionId, ConnectionInfo>,
    stats: HubStats,
}

pub(crate) enum HubCommand {
    Register(ConnectionHandle),
    Unregister(ConnectionId),
    Broadcast { frame: Arc<str>, scope: Scope },
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Cloneable handle to the hub coordinator.
#[derive(Clone)]
pub struct ConnectionHub {
    commands: mpsc::Sender<HubCommand>,
    sync_requests: mpsc::Sender<SyncRequest>,
    view: Arc<RwLock<RegistryView>>,
    ids: Arc<IdGenerator>,
    config: HubConfig,
}

impl ConnectionHub {
    /// Spawn the coordinator loop and return a handle to it.
    pub fn start(
        config: HubConfig,
        synchronizer: Arc<StateSynchronizer>,
        users: Arc<dyn UserStore>,
    ) -> (Self, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(config.command_queue_capacity.max(1));
        let (sync_tx, sync_rx) = mpsc::channel(config.sync_queue_capacity.max(1));
        let view = Arc::new(RwLock::new(RegistryView::default()));

        let coordinator = HubLoop {
            connections: HashMap::new(),
            seen_users: HashSet::new(),
            view: Arc::clone(&view),
            synchronizer,
            users,
            sync_tx: sync_tx.clone(),
            config: config.clone(),
            total_served: 0,
            overflow_disconnects: 0,
        };
        let task = tokio::spawn(coordinator.run(command_rx, sync_rx));

        let hub = Self {
            commands: command_tx,
            sync_requests: sync_tx,
            view,
            ids: Arc::new(IdGenerator::new()),
            config,
        };
        (hub, task)
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Register a new connection. The returned I/O half feeds the pumps.
    pub async fn register(
        &self,
        role: Role,
        user_id: u64,
        session_id: String,
    ) -> Result<(ConnectionInfo, ConnectionIo)> {
        let info = ConnectionInfo {
            id: self.ids.next_id(),
            role,
            user_id,
            session_id,
            connected_at: Utc::now(),
        };
        let (handle, io) = connection::channel(info.clone(), self.config.outbound_queue_capacity);
        self.commands
            .send(HubCommand::Register(handle))
            .await
            .map_err(|_| HubError::HubClosed)?;
        Ok((info, io))
    }

    /// Remove a connection. Unknown or already removed ids are ignored.
    pub async fn unregister(&self, id: ConnectionId) {
        if self.commands.send(HubCommand::Unregister(id)).await.is_err() {
            debug!("Hub stopped before {} was unregistered", id);
        }
    }

    /// Encode `envelope` and hand it to the coordinator for fan-out.
    ///
    /// Only encoding failures are reported; delivery problems are handled
    /// per connection by the hub.
    pub async fn broadcast(&self, envelope: &Envelope, scope: Scope) -> Result<()> {
        let frame = envelope.encode()?;
        if self
            .commands
            .send(HubCommand::Broadcast { frame, scope })
            .await
            .is_err()
        {
            warn!("Hub stopped, dropping {} broadcast", envelope.message.kind());
        }
        Ok(())
    }

    /// Queue a sync request without waiting. Returns false if it was dropped.
    pub fn request_sync(&self, request: SyncRequest) -> bool {
        match self.sync_requests.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(request)) => {
                warn!(
                    "Sync queue full, dropping {:?} request for {:?}",
                    request.reason, request.target
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Hub stopped, sync request dropped");
                false
            }
        }
    }

    /// Wait until every command sent before this call has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(HubCommand::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop the coordinator; every connection is closed.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(HubCommand::Shutdown).await;
    }

    pub fn stats(&self) -> HubStats {
        self.view
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .stats
            .clone()
    }

    pub fn connection_count(&self) -> usize {
        self.stats().total
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.view
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .values()
            .cloned()
            .collect()
    }

    pub fn connections_with_role(&self, role: Role) -> Vec<ConnectionInfo> {
        self.view
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .values()
            .filter(|c| c.role == role)
            .cloned()
            .collect()
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.view
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .contains_key(&id)
    }
}

/// State owned by the coordinator task.
struct HubLoop {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    /// Users that have connected at least once, to tell reconnects apart.
    seen_users: HashSet<u64>,
    view: Arc<RwLock<RegistryView>>,
    synchronizer: Arc<StateSynchronizer>,
    users: Arc<dyn UserStore>,
    sync_tx: mpsc::Sender<SyncRequest>,
    config: HubConfig,
    total_served: u64,
    overflow_disconnects: u64,
}

impl HubLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<HubCommand>,
        mut sync_requests: mpsc::Receiver<SyncRequest>,
    ) {
        info!("Connection hub started");
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(HubCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(request) = sync_requests.recv() => self.handle_sync(request),
            }
        }

        let open = self.connections.len();
        for id in self.connections.keys().copied().collect::<Vec<_>>() {
            self.remove(id, false);
        }
        info!("Connection hub stopped ({} connections closed)", open);
    }

    fn handle_command(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register(handle) => self.register(handle),
            HubCommand::Unregister(id) => self.remove(id, false),
            HubCommand::Broadcast { frame, scope } => {
                let delivered = self.fan_out(&frame, scope);
                debug!("Broadcast to {:?} reached {} connections", scope, delivered);
            }
            HubCommand::Flush(done) => {
                let _ = done.send(());
            }
            HubCommand::Shutdown => {}
        }
    }

    fn register(&mut self, handle: ConnectionHandle) {
        let info = handle.info.clone();
        let first_for_user = info.user_id != 0 && !self.user_has_connection(info.user_id);
        let reconnect = info.user_id != 0 && !self.seen_users.insert(info.user_id);

        self.connections.insert(info.id, handle);
        self.synchronizer.register_client(&info);
        self.total_served += 1;
        self.publish_view();

        info!(
            "Registered {} (role={}, user={}, session={}). Total: {}",
            info.id,
            info.role,
            info.user_id,
            info.session_id,
            self.connections.len()
        );

        if first_for_user {
            self.set_user_connected(&info, true);
        }

        let reason = if reconnect {
            SyncReason::Reconnect
        } else {
            SyncReason::Initial
        };
        self.schedule_initial_sync(info.id, reason);
    }

    /// Remove a connection if present; a no-op otherwise.
    fn remove(&mut self, id: ConnectionId, overflow: bool) {
        let Some(handle) = self.connections.remove(&id) else {
            debug!("{} already unregistered", id);
            return;
        };

        if overflow {
            self.overflow_disconnects += 1;
        }
        let info = handle.info.clone();
        drop(handle);

        self.synchronizer.unregister_client(id);
        info!(
            "Unregistered {} (role={}, user={}). Remaining: {}",
            id,
            info.role,
            info.user_id,
            self.connections.len()
        );

        if info.user_id != 0 && !self.user_has_connection(info.user_id) {
            self.set_user_connected(&info, false);
        }
        self.publish_view();
    }

    fn user_has_connection(&self, user_id: u64) -> bool {
        self.connections.values().any(|c| c.info.user_id == user_id)
    }

    fn set_user_connected(&mut self, info: &ConnectionInfo, connected: bool) {
        if let Err(e) = self.users.update_connection_status(info.user_id, connected) {
            warn!("Failed to update connection status of user {}: {}", info.user_id, e);
        }

        let envelope = Envelope::targeted(
            ServerMessage::UserConnection {
                user_id: info.user_id,
                role: info.role,
                connected,
            },
            Role::Admin,
        );
        match envelope.encode() {
            Ok(frame) => {
                self.fan_out(&frame, Scope::Role(Role::Admin));
            }
            Err(e) => error!("Failed to encode user_connection: {}", e),
        }
    }

    fn schedule_initial_sync(&self, id: ConnectionId, reason: SyncReason) {
        let sync_tx = self.sync_tx.clone();
        let delay = self.config.initial_sync_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let request = SyncRequest {
                target: SyncTarget::Connection(id),
                reason,
            };
            if let Err(e) = sync_tx.try_send(request) {
                warn!("Initial sync for {} dropped: {}", id, e);
            }
        });
    }

    /// Enqueue `frame` on every matching connection. Connections whose
    /// queue is full or closed are removed afterwards.
    fn fan_out(&mut self, frame: &Arc<str>, scope: Scope) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();

        for (id, handle) in &self.connections {
            if !scope.matches(&handle.info) {
                continue;
            }
            match handle.enqueue(Arc::clone(frame)) {
                Ok(()) => delivered += 1,
                Err(EnqueueError::Full) => {
                    warn!("Outbound queue of {} is full, disconnecting", id);
                    failed.push((*id, true));
                }
                Err(EnqueueError::Closed) => failed.push((*id, false)),
            }
        }

        for (id, overflow) in failed {
            self.remove(id, overflow);
        }
        delivered
    }

    fn handle_sync(&mut self, request: SyncRequest) {
        let targets: Vec<ConnectionId> = match request.target {
            SyncTarget::Connection(id) => self
                .connections
                .contains_key(&id)
                .then_some(id)
                .into_iter()
                .collect(),
            SyncTarget::User(user_id) => self
                .connections
                .values()
                .filter(|c| Scope::User(user_id).matches(&c.info))
                .map(|c| c.info.id)
                .collect(),
            SyncTarget::All => self.connections.keys().copied().collect(),
            SyncTarget::Sweep => {
                let now = tokio::time::Instant::now();
                self.connections
                    .values()
                    .filter(|c| c.info.role == Role::Participant)
                    .filter(|c| self.synchronizer.needs_resync(c.info.id, now))
                    .map(|c| c.info.id)
                    .collect()
            }
        };

        if targets.is_empty() {
            debug!("Sync {:?} for {:?} matched no connections", request.reason, request.target);
            return;
        }

        for id in targets {
            self.push_sync(id, request.reason);
        }
    }

    fn push_sync(&mut self, id: ConnectionId, reason: SyncReason) {
        let Some(handle) = self.connections.get(&id) else {
            return;
        };

        let push = match self.synchronizer.prepare_push(&handle.info) {
            Ok(push) => push,
            Err(e) => {
                error!("Failed to build sync for {}: {}", id, e);
                return;
            }
        };

        match handle.enqueue(Arc::clone(&push.frame)) {
            Ok(()) => self.synchronizer.record_push(id, &push, reason),
            Err(EnqueueError::Full) => {
                warn!("Outbound queue of {} is full during sync, disconnecting", id);
                self.remove(id, true);
            }
            Err(EnqueueError::Closed) => self.remove(id, false),
        }
    }

    fn publish_view(&self) {
        let mut stats = HubStats {
            total: self.connections.len(),
            total_served: self.total_served,
            overflow_disconnects: self.overflow_disconnects,
            ..HubStats::default()
        };
        for handle in self.connections.values() {
            match handle.info.role {
                Role::Admin => stats.admins += 1,
                Role::Participant => stats.participants += 1,
                Role::Screen => stats.screens += 1,
            }
        }

        let mut view = self.view.write().unwrap_or_else(PoisonError::into_inner);
        view.connections = self
            .connections
            .iter()
            .map(|(id, handle)| (*id, handle.info.clone()))
            .collect();
        view.stats = stats;
    }
}
