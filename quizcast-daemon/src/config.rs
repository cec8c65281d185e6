//! Configuration management

use anyhow::{Context, Result};
use quizcast_hub::SystemConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path the configuration was loaded from
    #[serde(skip)]
    pub config_path: PathBuf,

    /// TCP address client connections are accepted on
    pub listen_addr: String,

    /// Operator control socket (default: platform socket directory)
    pub control_socket: Option<PathBuf>,

    /// Quiz content file (default: platform data directory)
    pub quiz_path: Option<PathBuf>,

    /// Default log filter, overridden by `RUST_LOG` and `--log-level`
    pub log_level: String,

    /// Hub, sync, latency and guard tunables
    pub system: SystemConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            listen_addr: "0.0.0.0:7300".to_string(),
            control_socket: None,
            quiz_path: None,
            log_level: "info".to_string(),
            system: SystemConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the default location, or create it
    pub fn load() -> Result<Self> {
        let path = quizcast_paths::get_config_path().context("Failed to resolve config path")?;
        Self::load_from(&path)
    }

    /// Load configuration from `path`, writing defaults there if missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;

            let mut config: DaemonConfig = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;

            config.config_path = path.to_path_buf();
            Ok(config)
        } else {
            let config = Self {
                config_path: path.to_path_buf(),
                ..Self::default()
            };
            config.save().context("Failed to save default config")?;
            Ok(config)
        }
    }

    /// Save configuration to its file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&self.config_path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Control socket path, falling back to the platform default
    pub fn control_socket_path(&self) -> Result<PathBuf> {
        match &self.control_socket {
            Some(path) => Ok(path.clone()),
            None => quizcast_paths::get_control_socket_path(),
        }
    }

    /// Quiz file path, falling back to the platform default
    pub fn quiz_file_path(&self) -> Result<PathBuf> {
        match &self.quiz_path {
            Some(path) => Ok(path.clone()),
            None => quizcast_paths::get_quiz_path(),
        }
    }
}
