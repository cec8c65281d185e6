//! TCP accept loop for quiz clients

use quizcast_hub::LiveSystem;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Accept client connections until `shutdown` flips.
///
/// Each accepted socket performs its handshake on its own task, so a slow
/// client never holds up the accept loop.
pub async fn run(listener: TcpListener, system: Arc<LiveSystem>, mut shutdown: watch::Receiver<bool>) {
    match listener.local_addr() {
        Ok(addr) => info!("Accepting quiz clients on {}", addr),
        Err(e) => warn!("Listener has no local address: {}", e),
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                    }
                    let system = system.clone();
                    tokio::spawn(async move {
                        match quizcast_hub::serve_stream(system, stream).await {
                            Ok(info) => debug!(
                                "{} connected as {} {} (user {})",
                                peer, info.role, info.id, info.user_id
                            ),
                            Err(e) => warn!("Rejected client {}: {}", peer, e),
                        }
                    });
                }
                Err(e) => error!("Failed to accept client: {}", e),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Client listener stopped");
}
