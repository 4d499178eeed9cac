//! Configuration management for the NOS agent
//!
//! Settings are resolved from environment variables first, then an optional
//! TOML file, then built-in defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Environment variable overriding the tar snapshot base directory.
pub const SNAPSHOT_DIR_ENV: &str = "NOS_SNAPSHOT_DIR";
/// Environment variable overriding the snapshot targets YAML path.
pub const SNAPSHOT_TARGETS_ENV: &str = "NOS_SNAPSHOT_TARGETS";
/// Environment variable overriding the agent config file path.
pub const CONFIG_FILE_ENV: &str = "NOS_AGENT_CONFIG";

/// Main configuration for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Unix socket the HTTP API is served on.
    pub socket_path: PathBuf,
    /// Base directory for tar-mode snapshots.
    pub snapshot_base_dir: PathBuf,
    /// Snapshot targets YAML path.
    pub snapshot_targets_path: PathBuf,
    /// Firewall working state (pending/backup rulesets).
    pub firewall_state_dir: PathBuf,
    /// Drop-in directory for persisted rulesets.
    pub firewall_persist_dir: PathBuf,
    /// Directory holding fstab/crypttab. A test seam; production is `/etc`.
    pub etc_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/nos-agent.sock"),
            snapshot_base_dir: PathBuf::from("/var/lib/nos/snapshots"),
            snapshot_targets_path: PathBuf::from("/etc/nos/snapshots.yaml"),
            firewall_state_dir: PathBuf::from("/etc/nos/firewall"),
            firewall_persist_dir: PathBuf::from("/etc/nftables.d"),
            etc_dir: PathBuf::from("/etc"),
        }
    }
}

impl AgentConfig {
    /// Load configuration: defaults, then the TOML file when present, then
    /// environment overrides.
    pub fn load() -> Self {
        let path = std::env::var(CONFIG_FILE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/etc/nos/agent.toml"));

        let mut config = match std::fs::read_to_string(&path) {
            Ok(raw) => match toml::from_str::<AgentConfig>(&raw) {
                Ok(c) => c,
                Err(e) => {
                    warn!("ignoring malformed config {}: {}", path.display(), e);
                    AgentConfig::default()
                }
            },
            Err(_) => AgentConfig::default(),
        };

        if let Ok(dir) = std::env::var(SNAPSHOT_DIR_ENV) {
            config.snapshot_base_dir = PathBuf::from(dir);
        }
        if let Ok(p) = std::env::var(SNAPSHOT_TARGETS_ENV) {
            config.snapshot_targets_path = PathBuf::from(p);
        }

        config
    }
}

/// Backend requested for a snapshot target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    #[default]
    Auto,
    Subvol,
    Tar,
}

/// One entry of the targets YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotTarget {
    pub id: String,
    pub path: PathBuf,
    #[serde(default, rename = "type")]
    pub target_type: TargetType,
    #[serde(default)]
    pub stop_services: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TargetsFile {
    version: u32,
    #[serde(default)]
    targets: Vec<SnapshotTarget>,
}

/// Load snapshot targets, dropping entries that are not absolute paths or do
/// not exist on disk.
pub fn load_targets(path: &Path) -> nos_common::Result<Vec<SnapshotTarget>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let file: TargetsFile = serde_yaml::from_str(&raw)
        .map_err(|e| nos_common::Error::InvalidInput(format!("targets yaml: {}", e)))?;
    if file.version != 1 {
        return Err(nos_common::Error::InvalidInput(format!(
            "unsupported targets version {}",
            file.version
        )));
    }

    let targets = file
        .targets
        .into_iter()
        .filter(|t| {
            if !t.path.is_absolute() {
                warn!("skipping target {}: path is not absolute", t.id);
                return false;
            }
            if !t.path.exists() {
                warn!("skipping target {}: {} does not exist", t.id, t.path.display());
                return false;
            }
            true
        })
        .collect();

    Ok(targets)
}
