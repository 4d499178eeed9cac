//! Pool lifecycle surface: creation planning, mounting, subvolume
//! snapshots, and progress probes.
//!
//! Pool creation is expressed as a plan of allowlisted steps; `dry_run`
//! returns the plan without touching the host, otherwise the same steps
//! run through the batch executor.

use chrono::Utc;
use nos_common::agent::{
    BalanceStatus, BtrfsCreateRequest, BtrfsCreateResponse, BtrfsMountRequest,
    BtrfsSnapshotRequest, BtrfsSnapshotResponse, PlanStep, RaidProfile, ReplaceStatus, RunStep,
};
use nos_common::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::allowlist;
use crate::exec;
use crate::parsers;

fn validate_label(label: &str) -> Result<()> {
    if label.is_empty()
        || !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidInput(format!("invalid label {:?}", label)));
    }
    Ok(())
}

fn min_devices(raid: RaidProfile) -> usize {
    match raid {
        RaidProfile::Single => 1,
        RaidProfile::Raid1 => 2,
        RaidProfile::Raid10 => 4,
    }
}

fn step(cmd: &str, args: Vec<String>, description: impl Into<String>) -> PlanStep {
    PlanStep {
        cmd: cmd.to_string(),
        args,
        description: Some(description.into()),
    }
}

/// Build the step plan for a pool creation.
pub fn plan_create(req: &BtrfsCreateRequest) -> Result<Vec<PlanStep>> {
    validate_label(&req.label)?;
    if req.devices.is_empty() {
        return Err(Error::InvalidInput("at least one device required".to_string()));
    }
    if req.devices.len() < min_devices(req.raid) {
        return Err(Error::InvalidInput(format!(
            "{} requires at least {} devices",
            req.raid.as_str(),
            min_devices(req.raid)
        )));
    }
    for dev in &req.devices {
        if !allowlist::is_device_path(dev) {
            return Err(Error::InvalidInput(format!("{} is not a device path", dev)));
        }
    }

    let mut plan = Vec::new();

    for dev in &req.devices {
        plan.push(step(
            "wipefs",
            vec!["-a".to_string(), dev.clone()],
            format!("wipe signatures on {}", dev),
        ));
    }

    // With encryption the filesystem is laid over the opened mappings.
    let fs_devices: Vec<String> = if req.encrypt {
        let key = format!("/etc/nos/keys/{}.key", req.label);
        let mut mapped = Vec::new();
        for (i, dev) in req.devices.iter().enumerate() {
            let name = format!("luks-{}-{}", req.label, i);
            plan.push(step(
                "cryptsetup",
                vec![
                    "luksFormat".to_string(),
                    "--type".to_string(),
                    "luks2".to_string(),
                    "--batch-mode".to_string(),
                    dev.clone(),
                ],
                format!("format {} as LUKS2", dev),
            ));
            plan.push(step(
                "cryptsetup",
                vec![
                    "open".to_string(),
                    "--key-file".to_string(),
                    key.clone(),
                    dev.clone(),
                    name.clone(),
                ],
                format!("open {} as {}", dev, name),
            ));
            mapped.push(format!("/dev/mapper/{}", name));
        }
        mapped
    } else {
        req.devices.clone()
    };

    let profile = req.raid.as_str().to_string();
    let mut mkfs_args = vec![
        "-L".to_string(),
        req.label.clone(),
        "-d".to_string(),
        profile.clone(),
        "-m".to_string(),
        profile,
    ];
    mkfs_args.extend(fs_devices.iter().cloned());
    plan.push(step("mkfs.btrfs", mkfs_args, "create the filesystem"));

    let mountpoint = format!("/srv/{}", req.label);
    plan.push(step(
        "mount",
        vec![
            "-t".to_string(),
            "btrfs".to_string(),
            "-o".to_string(),
            "noatime,compress=zstd".to_string(),
            fs_devices[0].clone(),
            mountpoint.clone(),
        ],
        format!("mount at {}", mountpoint),
    ));

    plan.push(step(
        "blkid",
        vec![
            "-s".to_string(),
            "UUID".to_string(),
            "-o".to_string(),
            "value".to_string(),
            fs_devices[0].clone(),
        ],
        "read the filesystem UUID",
    ));

    Ok(plan)
}

/// Plan a pool creation and, unless `dry_run`, execute it.
pub async fn create(req: &BtrfsCreateRequest) -> Result<BtrfsCreateResponse> {
    let plan = plan_create(req)?;

    if !req.dry_run {
        // The mountpoint must exist before the mount step runs.
        std::fs::create_dir_all(format!("/srv/{}", req.label))?;
        let steps: Vec<RunStep> = plan
            .iter()
            .map(|s| RunStep {
                cmd: s.cmd.clone(),
                args: s.args.clone(),
            })
            .collect();
        let results = exec::run_batch(&steps).await?;
        if let Some(failed) = results.iter().find(|r| r.code != 0) {
            return Err(Error::Internal(format!(
                "pool creation failed: {}",
                failed.stderr.trim()
            )));
        }
        info!(label = %req.label, devices = req.devices.len(), "pool created");
    }

    Ok(BtrfsCreateResponse { plan })
}

/// Mount a filesystem by UUID or device at an allowlisted target.
pub async fn mount(req: &BtrfsMountRequest) -> Result<()> {
    let args = vec![
        "-t".to_string(),
        "btrfs".to_string(),
        req.uuid_or_device.clone(),
        req.target.clone(),
    ];
    allowlist::validate("mount", &args)?;
    std::fs::create_dir_all(&req.target)?;
    let result = exec::run_allowlisted_step("mount", &args).await?;
    if result.code != 0 {
        return Err(Error::Internal(format!("mount failed: {}", result.stderr.trim())));
    }
    Ok(())
}

/// Create a read-only subvolume snapshot of `path` at `name`.
///
/// Relative names resolve against the parent of `path`, which is where
/// the scheduler's `@snapshots/...` layout lives.
pub async fn snapshot(req: &BtrfsSnapshotRequest) -> Result<BtrfsSnapshotResponse> {
    let src = Path::new(&req.path);
    if !src.is_absolute() {
        return Err(Error::InvalidInput(format!("{} is not absolute", req.path)));
    }
    if req.name.is_empty() || req.name.contains("..") {
        return Err(Error::InvalidInput(format!("invalid snapshot name {:?}", req.name)));
    }

    let dst: PathBuf = if req.name.starts_with('/') {
        PathBuf::from(&req.name)
    } else {
        src.parent()
            .ok_or_else(|| Error::InvalidInput("path has no parent".to_string()))?
            .join(&req.name)
    };
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let src_s = src.to_string_lossy();
    let dst_s = dst.to_string_lossy();
    exec::run_tool_checked(
        "btrfs",
        &["subvolume", "snapshot", "-r", &src_s, &dst_s],
        exec::MUTATE_TIMEOUT,
    )
    .await?;

    let size_bytes = std::fs::metadata(&dst).ok().map(|m| m.len());
    info!(src = %src.display(), dst = %dst.display(), "subvolume snapshot created");
    Ok(BtrfsSnapshotResponse {
        ok: true,
        location: dst.to_string_lossy().into_owned(),
        size_bytes,
        created_at: Utc::now(),
        read_only: true,
    })
}

fn validate_mount_query(mount: &str) -> Result<()> {
    if !allowlist::is_mount_path(mount) {
        return Err(Error::InvalidInput(format!("{} is not a mount path", mount)));
    }
    Ok(())
}

/// Probe balance progress for a mount.
pub async fn balance_status(mount: &str) -> Result<BalanceStatus> {
    validate_mount_query(mount)?;
    let args = vec!["balance".to_string(), "status".to_string(), mount.to_string()];
    let result = exec::run_allowlisted_step("btrfs", &args).await?;
    Ok(parsers::parse_balance_status(&result.stdout))
}

/// Probe replace progress for a mount.
pub async fn replace_status(mount: &str) -> Result<ReplaceStatus> {
    validate_mount_query(mount)?;
    let args = vec!["replace".to_string(), "status".to_string(), mount.to_string()];
    let result = exec::run_allowlisted_step("btrfs", &args).await?;
    Ok(parsers::parse_replace_status(&result.stdout))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(devices: &[&str], raid: RaidProfile, encrypt: bool) -> BtrfsCreateRequest {
        BtrfsCreateRequest {
            devices: devices.iter().map(|s| s.to_string()).collect(),
            raid,
            label: "pool".to_string(),
            encrypt,
            dry_run: true,
        }
    }

    #[test]
    fn test_plan_single_device() {
        let plan = plan_create(&req(&["/dev/sda"], RaidProfile::Single, false)).unwrap();
        let cmds: Vec<&str> = plan.iter().map(|s| s.cmd.as_str()).collect();
        assert_eq!(cmds, vec!["wipefs", "mkfs.btrfs", "mount", "blkid"]);

        // Every planned step must itself pass the allowlist.
        for step in &plan {
            assert!(
                allowlist::allowed(&step.cmd, &step.args),
                "step not allowlisted: {} {:?}",
                step.cmd,
                step.args
            );
        }
    }

    #[test]
    fn test_plan_encrypted_raid1() {
        let plan = plan_create(&req(&["/dev/sda", "/dev/sdb"], RaidProfile::Raid1, true)).unwrap();

        let luks_formats = plan
            .iter()
            .filter(|s| s.cmd == "cryptsetup" && s.args.first().map(String::as_str) == Some("luksFormat"))
            .count();
        assert_eq!(luks_formats, 2);

        // mkfs runs over the mapper devices, not the raw disks.
        let mkfs = plan.iter().find(|s| s.cmd == "mkfs.btrfs").unwrap();
        assert!(mkfs.args.iter().any(|a| a.starts_with("/dev/mapper/luks-pool-")));

        for step in &plan {
            assert!(allowlist::allowed(&step.cmd, &step.args));
        }
    }

    #[test]
    fn test_plan_rejects_bad_inputs() {
        assert!(plan_create(&req(&[], RaidProfile::Single, false)).is_err());
        assert!(plan_create(&req(&["/dev/sda"], RaidProfile::Raid1, false)).is_err());
        assert!(plan_create(&req(&["/dev/sda", "/dev/sdb"], RaidProfile::Raid10, false)).is_err());
        assert!(plan_create(&req(&["/tmp/loop"], RaidProfile::Single, false)).is_err());

        let mut bad_label = req(&["/dev/sda"], RaidProfile::Single, false);
        bad_label.label = "bad label!".to_string();
        assert!(plan_create(&bad_label).is_err());
    }

    #[tokio::test]
    async fn test_snapshot_rejects_traversal() {
        let err = snapshot(&BtrfsSnapshotRequest {
            path: "/srv/data".to_string(),
            name: "../escape".to_string(),
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_status_probes_reject_non_mount_paths() {
        assert!(balance_status("/etc").await.is_err());
        assert!(replace_status("relative").await.is_err());
    }
}
