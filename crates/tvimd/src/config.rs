//! Daemon configuration.
//!
//! Read from an optional TOML file; every field has a default. The
//! environment variables `TVIM_SOCKET`, `TVIM_STATE_DIR` and
//! `TVIM_PROVIDERS_DIR` override the file.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use tvim_core::UserId;

/// Default socket path for the daemon.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/tvim.sock";

pub const ENV_SOCKET: &str = "TVIM_SOCKET";
pub const ENV_STATE_DIR: &str = "TVIM_STATE_DIR";
pub const ENV_PROVIDERS_DIR: &str = "TVIM_PROVIDERS_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub socket_path: PathBuf,
    /// Settings documents and watch logs.
    pub state_dir: PathBuf,
    /// Provider manifests.
    pub providers_dir: PathBuf,
    /// The user active at startup.
    pub current_user: UserId,
}

impl Default for Config {
    fn default() -> Self {
        let state_dir = dirs::state_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("tvim");
        let providers_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("tvim")
            .join("providers");
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            state_dir,
            providers_dir,
            current_user: UserId::SYSTEM,
        }
    }
}

impl Config {
    /// Default location of the config file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tvim").join("tvimd.toml"))
    }

    /// Loads `path` if it exists, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                debug!(path = %path.display(), "No config file, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(socket) = lookup(ENV_SOCKET) {
            self.socket_path = PathBuf::from(socket);
        }
        if let Some(dir) = lookup(ENV_STATE_DIR) {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_PROVIDERS_DIR) {
            self.providers_dir = PathBuf::from(dir);
        }
    }
}
