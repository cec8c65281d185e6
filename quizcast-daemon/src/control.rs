//! Unix socket control server for the quiz operator

use anyhow::{Context, Result};
use quizcast_event::EventState;
use quizcast_hub::{LiveSystem, SyncReason};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Operator command, one per control connection
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Status,
    SyncStatus,
    Transition(EventState),
    Next,
    Sync(u64),
    Countdown(u32),
    Reset,
    Quit,
}

impl ControlCommand {
    pub fn parse(s: &str) -> Result<Self> {
        let mut words = s.split_whitespace();
        let verb = words.next().unwrap_or_default().to_lowercase();
        let arg = words.next();

        match (verb.as_str(), arg) {
            ("status", None) => Ok(Self::Status),
            ("sync-status", None) => Ok(Self::SyncStatus),
            ("transition", Some(state)) => Ok(Self::Transition(
                state.parse().with_context(|| format!("Unknown state: {}", state))?,
            )),
            ("next", None) => Ok(Self::Next),
            ("sync", None) => Ok(Self::Sync(0)),
            ("sync", Some(user)) => Ok(Self::Sync(
                user.parse().with_context(|| format!("Invalid user id: {}", user))?,
            )),
            ("countdown", Some(secs)) => Ok(Self::Countdown(
                secs.parse().with_context(|| format!("Invalid seconds: {}", secs))?,
            )),
            ("reset", None) => Ok(Self::Reset),
            ("quit" | "exit" | "shutdown", None) => Ok(Self::Quit),
            _ => anyhow::bail!("Unknown command: {}", s.trim()),
        }
    }
}

/// Run a command against the live system and render the reply.
pub async fn execute(
    command: ControlCommand,
    system: &Arc<LiveSystem>,
    quit: &watch::Sender<bool>,
) -> String {
    let reply = match command {
        ControlCommand::Status => serde_json::to_string_pretty(&system.system_status()),
        ControlCommand::SyncStatus => serde_json::to_string_pretty(&system.client_sync_status()),
        ControlCommand::Transition(next) => match system.transition_to(next).await {
            Ok(snapshot) => serde_json::to_string(&json!({
                "event_state": snapshot.event_state,
                "question_number": snapshot.question_number,
            })),
            Err(e) => return format!("Error: {}", e),
        },
        ControlCommand::Next => match system.next_question().await {
            Ok(number) => serde_json::to_string(&json!({ "question_number": number })),
            Err(e) => return format!("Error: {}", e),
        },
        ControlCommand::Sync(user_id) => {
            if system.request_client_sync(user_id, SyncReason::Manual) {
                return format!("Sync queued for {}", describe_target(user_id));
            }
            return "Error: sync queue is full".to_string();
        }
        ControlCommand::Countdown(seconds) => {
            system.start_countdown(seconds);
            return format!("Countdown started: {}s", seconds);
        }
        ControlCommand::Reset => serde_json::to_string_pretty(&system.emergency_reset().await),
        ControlCommand::Quit => {
            info!("Received quit command");
            let _ = quit.send(true);
            return "Shutting down".to_string();
        }
    };

    reply.unwrap_or_else(|e| format!("Error: {}", e))
}

fn describe_target(user_id: u64) -> String {
    if user_id == 0 {
        "all clients".to_string()
    } else {
        format!("user {}", user_id)
    }
}

/// Unix socket control server
pub struct ControlServer {
    listener: UnixListener,
    socket_path: PathBuf,
    system: Arc<LiveSystem>,
    quit: watch::Sender<bool>,
}

impl ControlServer {
    /// Bind the control socket, replacing a stale one.
    pub fn new(socket_path: &Path, system: Arc<LiveSystem>, quit: watch::Sender<bool>) -> Result<Self> {
        quizcast_paths::validate_socket_path(socket_path)?;

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
        }

        // Remove existing socket if it exists
        let _ = std::fs::remove_file(socket_path);

        let listener = UnixListener::bind(socket_path).context("Failed to bind control socket")?;
        quizcast_paths::secure_socket_permissions(socket_path)?;

        info!("Control server listening on {}", socket_path.display());

        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            system,
            quit,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept control connections until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let system = self.system.clone();
                        let quit = self.quit.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, system, quit).await {
                                error!("Control connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept control connection: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        debug!("Control server stopped");
    }
}

/// Handle a single control connection
pub async fn handle_connection(
    mut stream: UnixStream,
    system: Arc<LiveSystem>,
    quit: watch::Sender<bool>,
) -> Result<()> {
    let mut buffer = [0u8; 1024];
    let n = stream.read(&mut buffer).await?;

    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..n]);
    debug!("Received control command: {}", request.trim());

    let response = match ControlCommand::parse(&request) {
        Ok(command) => execute(command, &system, &quit).await,
        Err(e) => format!("Error: {:#}", e),
    };

    stream.write_all(response.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;

    Ok(())
}
