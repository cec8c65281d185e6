//! quizcast daemon - live quiz sync hub
//!
//! Quiz clients connect over TCP and speak newline-delimited JSON.
//! The operator drives the quiz through the Unix control socket.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use quizcast_daemon::{listener, ControlServer, DaemonConfig, QuizFile};
use quizcast_hub::LiveSystem;

#[derive(Debug, Parser)]
#[command(name = "quizcast-daemon", version, about = "Live quiz sync hub")]
struct Args {
    /// Configuration file (default: platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// TCP address for quiz clients
    #[arg(long)]
    listen: Option<String>,

    /// Operator control socket
    #[arg(long)]
    control_socket: Option<PathBuf>,

    /// Quiz content file
    #[arg(long)]
    quiz: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "quizcast_hub=trace"
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DaemonConfig::load_from(path),
        None => DaemonConfig::load(),
    }
    .context("Failed to load configuration")?;

    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(socket) = args.control_socket {
        config.control_socket = Some(socket);
    }
    if let Some(quiz) = args.quiz {
        config.quiz_path = Some(quiz);
    }

    // Initialize logging: --log-level, then RUST_LOG, then the config file
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();

    info!("Starting quizcast daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from {}", config.config_path.display());

    let quiz_path = config.quiz_file_path()?;
    let quiz = if quiz_path.exists() {
        QuizFile::load(&quiz_path)?
    } else {
        warn!("No quiz file at {}, starting with an empty quiz", quiz_path.display());
        QuizFile::default()
    };

    let system = LiveSystem::start(config.system.clone(), quiz.into_collaborators())
        .context("Failed to start live system")?;

    let (quit_tx, mut quit_rx) = watch::channel(false);

    let tcp = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    let clients = tokio::spawn(listener::run(tcp, system.clone(), quit_rx.clone()));

    let socket_path = config.control_socket_path()?;
    let control = ControlServer::new(&socket_path, system.clone(), quit_tx.clone())
        .context("Failed to start control server")?;
    let control = tokio::spawn(control.run(quit_rx.clone()));

    info!("quizcast daemon ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = quit_rx.changed() => {
            info!("Shutdown requested over control socket");
        }
    }

    info!("Shutting down...");
    let _ = quit_tx.send(true);
    for (name, task) in [("client listener", clients), ("control server", control)] {
        if let Err(e) = task.await {
            error!("{} task failed: {}", name, e);
        }
    }
    system.shutdown().await;
    info!("quizcast daemon stopped");

    Ok(())
}
