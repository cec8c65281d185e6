//! Stream handshake: read the hello line, then hand the stream to the hub.

use futures::StreamExt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::connection::{frame_reader, ConnectionInfo};
use crate::error::{HubError, Result};
use crate::events::{decode_frame, ClientMessage};
use crate::system::LiveSystem;

/// Serve one client stream.
///
/// The first line must be a `hello` frame, received within the handshake
/// timeout and no longer than the frame limit. On success the connection
/// is registered and its pumps are running when this returns.
pub async fn serve_stream<S>(system: Arc<LiveSystem>, stream: S) -> Result<ConnectionInfo>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let config = system.hub().config();
    let mut frames = frame_reader(read_half, config.max_frame_bytes);

    let timeout = config.handshake_timeout();
    let line = match tokio::time::timeout(timeout, frames.next()).await {
        Err(_) => return Err(HubError::Handshake(format!("no hello within {:?}", timeout))),
        Ok(None) => return Err(HubError::Handshake("stream closed before hello".to_string())),
        Ok(Some(Err(e))) => return Err(HubError::Handshake(format!("unreadable hello: {}", e))),
        Ok(Some(Ok(line))) => line,
    };

    let hello = match decode_frame(&line)? {
        ClientMessage::Hello(hello) => hello,
        ClientMessage::Pong { .. } => {
            return Err(HubError::Handshake("expected hello, got pong".to_string()))
        }
        ClientMessage::Unknown(kind) => {
            return Err(HubError::Handshake(format!("expected hello, got '{}'", kind)))
        }
    };

    tracing::debug!(
        "Hello from {} (user {}, session {:?})",
        hello.role,
        hello.user_id,
        hello.session_id
    );
    system.connect(hello, frames, write_half).await
}
