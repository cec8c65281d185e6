use chrono::{DateTime, Utc};
use quizcast_event::Role;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::dispatcher::MessageDispatcher;
use crate::hub::ConnectionHub;

/// Unique identifier of a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable facts about a connection, established at handshake.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub role: Role,
    /// 0 when the connection is not tied to a user.
    pub user_id: u64,
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
}

/// Why a frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnqueueError {
    /// Outbound queue at capacity; the connection must be dropped.
    Full,
    /// Outbound pump already gone.
    Closed,
}

/// Hub-side half of a connection. Dropping it closes the outbound queue
/// and signals the inbound pump to stop.
pub(crate) struct ConnectionHandle {
    pub(crate) info: ConnectionInfo,
    outbound: mpsc::Sender<Arc<str>>,
    _closed: watch::Sender<bool>,
}

impl ConnectionHandle {
    /// Queue a frame without waiting.
    pub(crate) fn enqueue(&self, frame: Arc<str>) -> Result<(), EnqueueError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}

/// Pump-side half of a connection.
pub struct ConnectionIo {
    outbound: mpsc::Receiver<Arc<str>>,
    closed: watch::Receiver<bool>,
}

#[cfg(test)]
impl ConnectionIo {
    /// Frame waiting in the outbound queue, if any.
    pub(crate) fn try_next(&mut self) -> Option<Arc<str>> {
        self.outbound.try_recv().ok()
    }
}

/// Inbound side of a connection: newline-delimited frames, length capped.
pub type FrameReader<R> = FramedRead<R, LinesCodec>;

/// Wrap `reader` so that no frame longer than `max_frame_bytes` is buffered.
pub fn frame_reader<R: AsyncRead>(reader: R, max_frame_bytes: usize) -> FrameReader<R> {
    FramedRead::new(reader, LinesCodec::new_with_max_length(max_frame_bytes.max(1)))
}

/// Create both halves of a connection with an outbound queue of `capacity`.
pub(crate) fn channel(info: ConnectionInfo, capacity: usize) -> (ConnectionHandle, ConnectionIo) {
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));
    let (closed_tx, closed_rx) = watch::channel(false);
    (
        ConnectionHandle {
            info,
            outbound: outbound_tx,
            _closed: closed_tx,
        },
        ConnectionIo {
            outbound: outbound_rx,
            closed: closed_rx,
        },
    )
}

/// Spawn the inbound and outbound pumps of a registered connection.
///
/// Either pump ending unregisters the connection; the hub dropping its
/// handle ends both.
pub fn spawn_pumps<R, W>(
    info: ConnectionInfo,
    reader: FrameReader<R>,
    writer: W,
    io: ConnectionIo,
    dispatcher: Arc<MessageDispatcher>,
    hub: ConnectionHub,
) -> (JoinHandle<()>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let ConnectionIo { outbound, closed } = io;

    let outbound_task = {
        let hub = hub.clone();
        let id = info.id;
        tokio::spawn(async move {
            outbound_pump(id, writer, outbound).await;
            hub.unregister(id).await;
        })
    };

    let inbound_task = tokio::spawn(async move {
        inbound_pump(&info, reader, closed, &dispatcher).await;
        hub.unregister(info.id).await;
    });

    (inbound_task, outbound_task)
}

async fn outbound_pump<W>(id: ConnectionId, mut writer: W, mut outbound: mpsc::Receiver<Arc<str>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = writer.write_all(frame.as_bytes()).await {
            tracing::warn!("Write to {} failed: {}", id, e);
            return;
        }
        if let Err(e) = writer.flush().await {
            tracing::warn!("Flush to {} failed: {}", id, e);
            return;
        }
    }
    tracing::debug!("Outbound queue of {} closed", id);
    let _ = writer.shutdown().await;
}

async fn inbound_pump<R>(
    info: &ConnectionInfo,
    mut frames: FrameReader<R>,
    mut closed: watch::Receiver<bool>,
    dispatcher: &MessageDispatcher,
) where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Err(e) = dispatcher.dispatch(info, &line).await {
                        tracing::warn!("Rejected frame from {} ({}): {}", info.id, info.role, e);
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    tracing::warn!("Oversized frame from {} ({}), closing", info.id, info.role);
                    return;
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    tracing::warn!("Read from {} failed: {}", info.id, e);
                    return;
                }
                None => {
                    tracing::debug!("{} closed by peer", info.id);
                    return;
                }
            },
            _ = closed.changed() => {
                tracing::debug!("{} closed by hub", info.id);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;

    fn info(id: u64) -> ConnectionInfo {
        ConnectionInfo {
            id: ConnectionId(id),
            role: Role::Participant,
            user_id: 42,
            session_id: "s".to_string(),
            connected_at: Utc::now(),
        }
    }

    #[test]
    fn test_connection_id_uniqueness() {
        let ids = IdGenerator::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        assert_eq!(a.0 + 1, b.0);
        assert_eq!(a.to_string(), "conn-1");
    }

    #[test]
    fn test_enqueue_full_then_closed() {
        let (handle, io) = channel(info(1), 2);
        assert_eq!(handle.enqueue(Arc::from("a\n")), Ok(()));
        assert_eq!(handle.enqueue(Arc::from("b\n")), Ok(()));
        assert_eq!(handle.enqueue(Arc::from("c\n")), Err(EnqueueError::Full));

        drop(io);
        assert_eq!(handle.enqueue(Arc::from("d\n")), Err(EnqueueError::Closed));
    }

    #[tokio::test]
    async fn test_outbound_pump_preserves_order() {
        let (handle, io) = channel(info(1), 8);
        let (client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(outbound_pump(ConnectionId(1), server, io.outbound));

        for n in 0..5 {
            handle.enqueue(Arc::from(format!("{}\n", n))).unwrap();
        }
        drop(handle);
        task.await.unwrap();

        let mut lines = tokio::io::BufReader::new(client).lines();
        let mut seen = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            seen.push(line);
        }
        assert_eq!(seen, vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_outbound_pump_writes_frames_verbatim() {
        let (handle, io) = channel(info(3), 4);
        let writer = tokio_test::io::Builder::new()
            .write(b"{\"type\":\"ping\"}\n")
            .write(b"{\"type\":\"countdown\"}\n")
            .build();

        handle.enqueue(Arc::from("{\"type\":\"ping\"}\n")).unwrap();
        handle.enqueue(Arc::from("{\"type\":\"countdown\"}\n")).unwrap();
        drop(handle);

        outbound_pump(ConnectionId(3), writer, io.outbound).await;
    }
}
