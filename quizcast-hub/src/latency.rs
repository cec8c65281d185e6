//! Round-trip latency probing of participant connections.
//!
//! Every probe is settled exactly once: by the matching pong or by its
//! timeout, whichever removes the tracker from the pending map first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::{ConnectionId, ConnectionInfo};
use crate::events::ServerMessage;
use crate::router::BroadcastRouter;
use quizcast_event::Role;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    pub enabled: bool,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_interval_ms: 10_000,
            probe_timeout_ms: 1_000,
        }
    }
}

impl LatencyConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyQuality {
    Good,
    Slow,
    Bad,
}

impl LatencyQuality {
    /// `< 300ms` good, `[300, 1000)ms` slow, anything slower bad.
    pub fn classify(latency: Duration) -> Self {
        match latency.as_millis() {
            0..=299 => LatencyQuality::Good,
            300..=999 => LatencyQuality::Slow,
            _ => LatencyQuality::Bad,
        }
    }
}

/// Result of one probe, as sent to admins.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LatencyReport {
    pub user_id: u64,
    pub ping_id: String,
    /// Absent when the probe timed out.
    pub latency_ms: Option<u64>,
    pub quality: LatencyQuality,
    pub timed_out: bool,
    pub measured_at: DateTime<Utc>,
}

struct PingTracker {
    user_id: u64,
    connection: ConnectionId,
    issued_at: Instant,
    timeout: JoinHandle<()>,
}

/// What became of an inbound pong.
#[derive(Debug, Clone, PartialEq)]
pub enum PongOutcome {
    Reported(LatencyReport),
    /// No pending probe with that id (never issued, or already settled).
    Unknown,
    /// The probe belongs to another user; it stays pending.
    UserMismatch,
}

pub struct LatencyMonitor {
    pending: Mutex<HashMap<String, PingTracker>>,
    latest: Mutex<HashMap<u64, LatencyReport>>,
    router: BroadcastRouter,
    config: LatencyConfig,
}

impl LatencyMonitor {
    pub fn new(router: BroadcastRouter, config: LatencyConfig) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            latest: Mutex::new(HashMap::new()),
            router,
            config,
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PingTracker>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send one probe to `info`'s connection.
    ///
    /// Returns the probe id, or `None` if the user already has a probe in
    /// flight or the ping could not be handed to the hub.
    pub async fn probe(self: &Arc<Self>, info: &ConnectionInfo) -> Option<String> {
        let ping_id = {
            let mut pending = self.pending();
            if pending.values().any(|t| t.user_id == info.user_id) {
                debug!("User {} still has a probe in flight", info.user_id);
                return None;
            }

            let ping_id = Uuid::new_v4().to_string();
            let timeout = self.arm_timeout(ping_id.clone());
            pending.insert(
                ping_id.clone(),
                PingTracker {
                    user_id: info.user_id,
                    connection: info.id,
                    issued_at: Instant::now(),
                    timeout,
                },
            );
            ping_id
        };

        let ping = ServerMessage::Ping {
            ping_id: ping_id.clone(),
        };
        if let Err(e) = self.router.send_to_connection(info.id, ping).await {
            warn!("Failed to send ping to {}: {}", info.id, e);
            if let Some(tracker) = self.pending().remove(&ping_id) {
                tracker.timeout.abort();
            }
            return None;
        }

        debug!("Probe {} sent to {} (user {})", ping_id, info.id, info.user_id);
        Some(ping_id)
    }

    fn arm_timeout(self: &Arc<Self>, ping_id: String) -> JoinHandle<()> {
        let monitor: Weak<Self> = Arc::downgrade(self);
        let timeout = self.config.probe_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(monitor) = monitor.upgrade() {
                monitor.expire(&ping_id).await;
            }
        })
    }

    /// Settle a probe as timed out. No-op if it was already settled.
    async fn expire(&self, ping_id: &str) {
        let Some(tracker) = self.pending().remove(ping_id) else {
            return;
        };

        debug!("Probe {} to {} timed out", ping_id, tracker.connection);
        let report = LatencyReport {
            user_id: tracker.user_id,
            ping_id: ping_id.to_string(),
            latency_ms: None,
            quality: LatencyQuality::Bad,
            timed_out: true,
            measured_at: Utc::now(),
        };
        self.publish(report).await;
    }

    /// Settle a probe from a pong sent by `user_id`.
    pub async fn handle_pong(&self, ping_id: &str, user_id: u64) -> PongOutcome {
        let tracker = {
            let mut pending = self.pending();
            let Some(owner) = pending.get(ping_id).map(|t| t.user_id) else {
                debug!("Pong for unknown or settled probe {}", ping_id);
                return PongOutcome::Unknown;
            };
            if owner != user_id {
                warn!(
                    "Pong for probe {} came from user {}, expected user {}",
                    ping_id, user_id, owner
                );
                return PongOutcome::UserMismatch;
            }
            match pending.remove(ping_id) {
                Some(tracker) => tracker,
                None => return PongOutcome::Unknown,
            }
        };
        tracker.timeout.abort();

        let elapsed = tracker.issued_at.elapsed();
        let report = LatencyReport {
            user_id,
            ping_id: ping_id.to_string(),
            latency_ms: Some(elapsed.as_millis() as u64),
            quality: LatencyQuality::classify(elapsed),
            timed_out: false,
            measured_at: Utc::now(),
        };
        self.publish(report.clone()).await;
        PongOutcome::Reported(report)
    }

    async fn publish(&self, report: LatencyReport) {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(report.user_id, report.clone());

        if let Err(e) = self.router.report_latency(&report).await {
            warn!("Failed to report latency of user {}: {}", report.user_id, e);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Most recent result per user, ordered by user id.
    pub fn latest_reports(&self) -> Vec<LatencyReport> {
        let mut reports: Vec<LatencyReport> = self
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        reports.sort_by_key(|r| r.user_id);
        reports
    }

    /// Probe every participant connection at a fixed cadence.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Latency monitor started (interval {:?}, timeout {:?})",
            self.config.probe_interval(),
            self.config.probe_timeout()
        );
        let mut ticker = tokio::time::interval(self.config.probe_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for info in self.router.hub().connections_with_role(Role::Participant) {
                        self.probe(&info).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        for (_, tracker) in self.pending().drain() {
            tracker.timeout.abort();
        }
        info!("Latency monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionIo;
    use crate::hub::{ConnectionHub, HubConfig};
    use crate::sync::{StateSynchronizer, SyncConfig};
    use quizcast_event::MemoryStore;
    use std::collections::HashSet;

    fn latency_frames(io: &mut ConnectionIo) -> Vec<serde_json::Value> {
        std::iter::from_fn(|| io.try_next())
            .map(|frame| serde_json::from_str::<serde_json::Value>(&frame).unwrap())
            .filter(|v| v["type"] == "latency_report")
            .collect()
    }

    async fn setup() -> (Arc<LatencyMonitor>, ConnectionInfo, ConnectionIo, ConnectionIo) {
        let store = Arc::new(MemoryStore::new());
        store.add_participant(10, "Ada");
        let synchronizer = Arc::new(StateSynchronizer::new(SyncConfig::default()));
        let (hub, _task) = ConnectionHub::start(HubConfig::default(), synchronizer, store);

        let (_, admin) = hub.register(Role::Admin, 0, "a".into()).await.unwrap();
        let (participant, participant_io) = hub
            .register(Role::Participant, 10, "p".into())
            .await
            .unwrap();
        hub.flush().await;

        let monitor = Arc::new(LatencyMonitor::new(
            BroadcastRouter::new(hub),
            LatencyConfig::default(),
        ));
        (monitor, participant, admin, participant_io)
    }

    #[test]
    fn test_latency_classification() {
        let ms = Duration::from_millis;
        assert_eq!(LatencyQuality::classify(ms(250)), LatencyQuality::Good);
        assert_eq!(LatencyQuality::classify(ms(299)), LatencyQuality::Good);
        assert_eq!(LatencyQuality::classify(ms(300)), LatencyQuality::Slow);
        assert_eq!(LatencyQuality::classify(ms(500)), LatencyQuality::Slow);
        assert_eq!(LatencyQuality::classify(ms(999)), LatencyQuality::Slow);
        assert_eq!(LatencyQuality::classify(ms(1000)), LatencyQuality::Bad);
        assert_eq!(LatencyQuality::classify(ms(1500)), LatencyQuality::Bad);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_settles_once() {
        let (monitor, participant, mut admin, _participant_io) = setup().await;

        let ping_id = monitor.probe(&participant).await.unwrap();
        assert_eq!(monitor.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        let outcome = monitor.handle_pong(&ping_id, 10).await;
        match outcome {
            PongOutcome::Reported(report) => {
                assert_eq!(report.quality, LatencyQuality::Good);
                assert_eq!(report.latency_ms, Some(250));
                assert!(!report.timed_out);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        // Duplicate pong and the (aborted) timeout are both no-ops.
        assert_eq!(monitor.handle_pong(&ping_id, 10).await, PongOutcome::Unknown);
        tokio::time::sleep(Duration::from_secs(2)).await;
        monitor.router.hub().flush().await;

        assert_eq!(monitor.pending_count(), 0);
        assert_eq!(latency_frames(&mut admin).len(), 1);
        assert_eq!(monitor.latest_reports().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_after_timeout_is_ignored() {
        let (monitor, participant, mut admin, _participant_io) = setup().await;

        let ping_id = monitor.probe(&participant).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(monitor.pending_count(), 0);

        assert_eq!(monitor.handle_pong(&ping_id, 10).await, PongOutcome::Unknown);
        monitor.router.hub().flush().await;

        let reports = latency_frames(&mut admin);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0]["data"]["quality"], "bad");
        assert_eq!(reports[0]["data"]["timed_out"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_user_is_dropped() {
        let (monitor, participant, mut admin, _participant_io) = setup().await;

        let ping_id = monitor.probe(&participant).await.unwrap();
        assert_eq!(monitor.handle_pong(&ping_id, 99).await, PongOutcome::UserMismatch);
        assert_eq!(monitor.handle_pong("no-such-probe", 10).await, PongOutcome::Unknown);
        assert_eq!(monitor.pending_count(), 1);

        monitor.router.hub().flush().await;
        assert!(latency_frames(&mut admin).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_probe_in_flight_per_user() {
        let (monitor, participant, _admin, _participant_io) = setup().await;

        assert!(monitor.probe(&participant).await.is_some());
        assert!(monitor.probe(&participant).await.is_none());
        assert_eq!(monitor.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_probes_each_time_out_once() {
        let (monitor, participant, mut admin, mut participant_io) = setup().await;

        let mut issued = HashSet::new();
        for _ in 0..100 {
            let ping_id = monitor.probe(&participant).await.unwrap();
            assert!(issued.insert(ping_id));
            tokio::time::sleep(Duration::from_millis(1100)).await;
            // Keep the participant queue from filling up.
            while participant_io.try_next().is_some() {}
        }
        monitor.router.hub().flush().await;

        let reports = latency_frames(&mut admin);
        assert_eq!(reports.len(), 100);
        let reported: HashSet<String> = reports
            .iter()
            .map(|r| r["data"]["ping_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(reported, issued);
        assert!(reports.iter().all(|r| r["data"]["quality"] == "bad"));
        assert_eq!(monitor.pending_count(), 0);
    }
}
