//! Live sync hub for quizcast
//!
//! Keeps the admin console, the public screen and every participant device
//! in step with a running quiz. Clients speak newline-delimited JSON over any
//! byte stream; the daemon binds it to TCP.
//!
//! # Components
//!
//! - [`ConnectionHub`] - single coordinator task owning the connection
//!   registry; serializes register / unregister / broadcast / sync
//! - [`StateSynchronizer`] - authoritative snapshot and per-client sync state
//! - [`BroadcastRouter`] - typed, role-scoped domain broadcasts
//! - [`LatencyMonitor`] - ping/pong probes with exactly-once settlement
//! - [`ConsistencyGuard`] - periodic anomaly checks and recovery actions
//! - [`MessageDispatcher`] - inbound frame routing
//! - [`LiveSystem`] - owns all of the above plus the background loops
//!
//! # Protocol
//!
//! ```text
//! client -> {"type":"hello","data":{"role":"participant","user_id":7}}
//! server -> {"type":"initial_sync","data":{"event_state":"waiting",...}}
//! server -> {"type":"ping","data":{"ping_id":"..."}}
//! client -> {"type":"pong","data":{"ping_id":"..."}}
//! ```
//!
//! Non-admin connections never see the answer key: `correct` is replaced
//! with `0` in every question they receive.

pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod guard;
pub mod hub;
pub mod latency;
pub mod router;
pub mod snapshot;
pub mod supervisor;
pub mod sync;
pub mod system;
pub mod transport;

// Re-exports
pub use connection::{ConnectionId, ConnectionInfo};
pub use dispatcher::{Dispatched, MessageDispatcher};
pub use error::{HubError, Result};
pub use events::{ClientMessage, Envelope, Hello, ServerMessage};
pub use guard::{ConsistencyGuard, GuardConfig, RecoveryAction, RecoveryKind};
pub use hub::{ConnectionHub, HubConfig, HubStats, Scope};
pub use latency::{LatencyConfig, LatencyMonitor, LatencyQuality, LatencyReport, PongOutcome};
pub use router::BroadcastRouter;
pub use snapshot::{Collaborators, EventSnapshot, SyncPayload};
pub use sync::{ClientSyncStatus, StateSynchronizer, SyncConfig, SyncReason};
pub use system::{LiveSystem, SystemConfig, SystemStatus};
pub use transport::serve_stream;
