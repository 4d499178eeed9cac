//! Wire contract between nosd and nos-agent.
//!
//! Every body accepted or produced by the agent's `/v1/*` endpoints lives
//! here so the server handlers and the control-plane client share one set
//! of types.

use serde::{Deserialize, Serialize};

/// Error body returned by the agent on any failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// One command step for `/v1/run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStep {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub steps: Vec<RunStep>,
}

/// Result of an executed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub results: Vec<StepResult>,
}

/// Snapshot backend selection on create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMode {
    Auto,
    Subvol,
    Tar,
}

impl Default for SnapshotMode {
    fn default() -> Self {
        SnapshotMode::Auto
    }
}

/// Resolved snapshot backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotBackend {
    Subvol,
    Tar,
}

impl std::fmt::Display for SnapshotBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotBackend::Subvol => write!(f, "subvol"),
            SnapshotBackend::Tar => write!(f, "tar"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotCreateRequest {
    pub path: String,
    #[serde(default)]
    pub mode: SnapshotMode,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub stop_services: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotCreateResponse {
    pub id: String,
    pub backend: SnapshotBackend,
    pub location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotListRequest {
    pub path: String,
}

/// One snapshot as enumerated by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub id: String,
    pub backend: SnapshotBackend,
    pub location: String,
    /// Leading `YYYYMMDD-HHMMSS` of the id when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotListResponse {
    pub snapshots: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPruneRequest {
    #[serde(default = "default_keep_per_target")]
    pub keep_per_target: usize,
    #[serde(default)]
    pub paths: Vec<String>,
}

fn default_keep_per_target() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPruneResponse {
    pub deleted: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRollbackRequest {
    pub path: String,
    pub snapshot_id: String,
    #[serde(rename = "type")]
    pub backend: SnapshotBackend,
    #[serde(default)]
    pub stop_services: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRollbackResponse {
    pub ok: bool,
    /// Safety artifact created before the rollback touched anything.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDeleteRequest {
    pub location: String,
    pub backend: SnapshotBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallApplyRequest {
    pub ruleset_text: String,
    #[serde(default)]
    pub persist: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallApplyResponse {
    pub ok: bool,
    pub backup_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineRequest {
    pub line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveLineRequest {
    pub contains: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

/// RAID profile for pool creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidProfile {
    Single,
    Raid1,
    Raid10,
}

impl RaidProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            RaidProfile::Single => "single",
            RaidProfile::Raid1 => "raid1",
            RaidProfile::Raid10 => "raid10",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BtrfsCreateRequest {
    pub devices: Vec<String>,
    pub raid: RaidProfile,
    pub label: String,
    #[serde(default)]
    pub encrypt: bool,
    #[serde(default)]
    pub dry_run: bool,
}

/// One planned (or executed) step of a pool creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub cmd: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BtrfsCreateResponse {
    pub plan: Vec<PlanStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BtrfsMountRequest {
    pub target: String,
    pub uuid_or_device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BtrfsSnapshotRequest {
    pub path: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BtrfsSnapshotResponse {
    pub ok: bool,
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub read_only: bool,
}

/// Normalized `btrfs balance status` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<String>,
    pub raw: String,
}

/// Normalized `btrfs replace status` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaceStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<String>,
    pub raw: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MkdirRequest {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileRequest {
    pub path: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// One available package update from the updates plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageUpdate {
    pub name: String,
    pub current: String,
    pub candidate: String,
    pub arch: String,
    pub repo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatesPlanResponse {
    pub updates: Vec<PackageUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatesApplyResponse {
    pub ok: bool,
    pub output: String,
}

/// Normalized SMART health for one device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmartHealth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_on_hours: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reallocated: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_errors: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_mode_wire_names() {
        assert_eq!(
            serde_json::from_str::<SnapshotMode>("\"auto\"").unwrap(),
            SnapshotMode::Auto
        );
        assert_eq!(
            serde_json::to_string(&SnapshotBackend::Subvol).unwrap(),
            "\"subvol\""
        );
    }

    #[test]
    fn test_rollback_request_uses_type_key() {
        let req: SnapshotRollbackRequest = serde_json::from_str(
            r#"{"path":"/srv/data","snapshot_id":"20250820-123456-snap","type":"tar"}"#,
        )
        .unwrap();
        assert_eq!(req.backend, SnapshotBackend::Tar);
        assert!(req.stop_services.is_empty());
    }

    #[test]
    fn test_prune_defaults() {
        let req: SnapshotPruneRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.keep_per_target, 5);
        assert!(req.paths.is_empty());
    }
}
