//! Configuration management for nosd
//!
//! Settings layer environment over an optional TOML file over defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Environment variable overriding the config file path.
pub const CONFIG_FILE_ENV: &str = "NOSD_CONFIG";
/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "NOSD_DATA_DIR";

/// Main configuration for the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NosdConfig {
    /// Listen address for the HTTP API.
    pub listen: String,
    /// State directory: auth stores, audit log, backup state.
    pub data_dir: PathBuf,
    /// The agent's Unix socket.
    pub agent_socket: PathBuf,
    /// Session lifetime in hours.
    pub session_hours: i64,
    /// Elevated window after a second-factor check, in minutes.
    pub elevation_minutes: i64,
    /// SSH known_hosts file used by replication transports.
    pub known_hosts: PathBuf,
}

impl Default for NosdConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8440".to_string(),
            data_dir: PathBuf::from("/var/lib/nos/nosd"),
            agent_socket: PathBuf::from("/run/nos-agent.sock"),
            session_hours: 24,
            elevation_minutes: 15,
            known_hosts: PathBuf::from("/var/lib/nos/nosd/known_hosts"),
        }
    }
}

impl NosdConfig {
    /// Load configuration: defaults, then the TOML file, then env.
    pub fn load() -> Self {
        let path = std::env::var(CONFIG_FILE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/etc/nos/nosd.toml"));

        let mut config = match std::fs::read_to_string(&path) {
            Ok(raw) => match toml::from_str::<NosdConfig>(&raw) {
                Ok(c) => c,
                Err(e) => {
                    warn!("ignoring malformed config {}: {}", path.display(), e);
                    NosdConfig::default()
                }
            },
            Err(_) => NosdConfig::default(),
        };

        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            config.data_dir = PathBuf::from(dir);
        }

        config
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.data_dir.join("audit")
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }

    /// Verify the data directory is usable; nosd refuses to start
    /// otherwise.
    pub fn ensure_writable(&self) -> nos_common::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let probe = self.data_dir.join(".writable");
        std::fs::write(&probe, b"probe").map_err(|e| {
            nos_common::Error::Internal(format!(
                "data directory {} is not writable: {}",
                self.data_dir.display(),
                e
            ))
        })?;
        std::fs::remove_file(&probe)?;
        Ok(())
    }
}
