//! Cross-platform path utilities for quizcast.
//!
//! Single source of truth for where the daemon keeps its configuration,
//! quiz files and the operator control socket.
//!
//! # Platform Behavior
//!
//! | Platform | Data Directory | Socket Directory |
//! |----------|----------------|------------------|
//! | Linux    | `~/.local/share/quizcast` | `$XDG_RUNTIME_DIR` or data dir |
//! | macOS    | `~/Library/Application Support/quizcast` | Same as data dir |
//! | Windows  | `%APPDATA%/quizcast` | Same as data dir |

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;

/// Errors specific to path operations.
#[derive(Error, Debug)]
pub enum PathError {
    #[error("Could not determine data directory")]
    NoDataDirectory,

    #[error("Could not determine config directory")]
    NoConfigDirectory,

    #[error("Invalid socket path: {0}")]
    InvalidSocketPath(String),
}

/// Application identifier used in path construction.
const APP_NAME: &str = "quizcast";

/// Socket file name for the operator control channel.
const CONTROL_SOCKET_NAME: &str = "quizcast.sock";

/// Configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default quiz content file name.
const QUIZ_FILE_NAME: &str = "quiz.toml";

/// Create `dir` (and parents) with owner-only permissions if it is missing.
fn ensure_private_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        return Ok(());
    }

    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o700);
        fs::set_permissions(dir, perms)
            .with_context(|| format!("Failed to set permissions on {}", dir.display()))?;
    }

    Ok(())
}

/// Get the application data directory, creating it on first use.
///
/// # Errors
/// Returns an error if the directory cannot be determined or created.
pub fn get_data_dir() -> Result<PathBuf> {
    let base_dir = dirs::data_dir().ok_or(PathError::NoDataDirectory)?;
    let data_dir = base_dir.join(APP_NAME);
    ensure_private_dir(&data_dir)?;
    Ok(data_dir)
}

/// Get the configuration directory.
///
/// # Platform Behavior
/// - **Linux**: `~/.config/quizcast`
/// - **macOS / Windows**: the data directory
pub fn get_config_dir() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let config_base = dirs::config_dir().ok_or(PathError::NoConfigDirectory)?;
        let config_dir = config_base.join(APP_NAME);
        ensure_private_dir(&config_dir)?;
        Ok(config_dir)
    }

    #[cfg(not(target_os = "linux"))]
    {
        get_data_dir()
    }
}

/// Get the socket directory for the control socket.
///
/// On Linux `$XDG_RUNTIME_DIR` is preferred; everything else uses the data
/// directory.
pub fn get_socket_dir() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        if let Some(runtime_dir) = dirs::runtime_dir() {
            if runtime_dir.exists() {
                return Ok(runtime_dir);
            }
        }
    }

    get_data_dir()
}

/// Path of the default configuration file.
pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}

/// Path of the default quiz content file.
pub fn get_quiz_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join(QUIZ_FILE_NAME))
}

/// Path of the operator control socket.
pub fn get_control_socket_path() -> Result<PathBuf> {
    Ok(control_socket_in(&get_socket_dir()?))
}

/// Control socket path inside an arbitrary directory.
pub fn control_socket_in(dir: &Path) -> PathBuf {
    dir.join(CONTROL_SOCKET_NAME)
}

/// Reject socket paths that cannot be bound as a Unix domain socket.
///
/// `sun_path` is 108 bytes on Linux (104 on macOS) including the trailing NUL.
pub fn validate_socket_path(path: &Path) -> Result<(), PathError> {
    let raw = path.to_string_lossy();
    if raw.is_empty() {
        return Err(PathError::InvalidSocketPath("empty path".to_string()));
    }
    if raw.len() >= 104 {
        return Err(PathError::InvalidSocketPath(format!(
            "{} is too long ({} bytes)",
            raw,
            raw.len()
        )));
    }
    Ok(())
}

/// Set secure Unix socket permissions (0o600).
#[cfg(unix)]
pub fn secure_socket_permissions(socket_path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if socket_path.exists() {
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(socket_path, perms).with_context(|| {
            format!(
                "Failed to set socket permissions: {}",
                socket_path.display()
            )
        })?;
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn secure_socket_permissions(_socket_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_control_socket_in_dir() {
        let dir = tempdir().unwrap();
        let path = control_socket_in(dir.path());
        assert!(path.ends_with("quizcast.sock"));
        assert!(path.starts_with(dir.path()));
    }

    #[test]
    fn test_ensure_private_dir_creates_nested() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_private_dir(&nested).unwrap();
        assert!(nested.is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&nested).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[test]
    fn test_validate_socket_path() {
        assert!(validate_socket_path(Path::new("/tmp/quizcast.sock")).is_ok());
        assert!(validate_socket_path(Path::new("")).is_err());

        let long = format!("/tmp/{}.sock", "x".repeat(120));
        assert!(matches!(
            validate_socket_path(Path::new(&long)),
            Err(PathError::InvalidSocketPath(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_secure_socket_permissions_on_plain_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("fake.sock");
        fs::write(&path, b"").unwrap();
        secure_socket_permissions(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
