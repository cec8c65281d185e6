//! Restart-on-panic wrapper for background loops.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Run the loop built by `make` until it returns normally or `shutdown`
/// fires. A panicking run is restarted after `restart_delay`.
///
/// Returns the number of restarts performed.
pub async fn supervise<F, Fut>(
    name: &str,
    restart_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut make: F,
) -> u32
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut restarts = 0;
    loop {
        let mut task = tokio::spawn(make());

        let outcome = loop {
            tokio::select! {
                outcome = &mut task => break outcome,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        task.abort();
                        info!("{} stopped by shutdown", name);
                        return restarts;
                    }
                }
            }
        };

        match outcome {
            Ok(()) => {
                info!("{} finished", name);
                return restarts;
            }
            Err(e) if e.is_panic() => {
                error!("{} panicked, restarting in {:?}", name, restart_delay);
            }
            Err(e) => {
                warn!("{} was cancelled: {}", name, e);
                return restarts;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(restart_delay) => {}
            _ = shutdown.changed() => {
                info!("{} stopped by shutdown during restart delay", name);
                return restarts;
            }
        }
        restarts += 1;
    }
}
