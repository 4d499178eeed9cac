//! Replication pipelines.
//!
//! Local and ssh destinations receive a native incremental send piped
//! into a receiver; ssh wraps the pipe in a non-interactive invocation
//! pinned to a known_hosts file, optionally throttled through `pv`.
//! Rclone destinations synchronize the read-only snapshot directory to a
//! named remote. Pipelines are built as explicit argv vectors; no shell
//! is involved anywhere.

use nos_common::{Error, Result};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::destinations::{Destination, DestinationKind};

/// Bound for a full replication run.
pub const REPLICATION_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Build the argv pipeline for one snapshot transfer.
///
/// `key_path` is resolved from the destination's `key_ref` by the caller.
pub fn build_pipeline(
    snapshot_location: &str,
    parent_location: Option<&str>,
    dest: &Destination,
    known_hosts: &Path,
    key_path: Option<&Path>,
) -> Result<Vec<Vec<String>>> {
    let mut send = vec!["btrfs".to_string(), "send".to_string()];
    if let Some(parent) = parent_location {
        send.push("-p".to_string());
        send.push(parent.to_string());
    }
    send.push(snapshot_location.to_string());

    match dest.kind {
        DestinationKind::Local => {
            let receive = vec![
                "btrfs".to_string(),
                "receive".to_string(),
                dest.path.clone(),
            ];
            Ok(vec![send, receive])
        }
        DestinationKind::Ssh => {
            let host = dest
                .host
                .as_deref()
                .ok_or_else(|| Error::InvalidInput("ssh destination has no host".to_string()))?;
            let user = dest
                .user
                .as_deref()
                .ok_or_else(|| Error::InvalidInput("ssh destination has no user".to_string()))?;

            let mut pipeline = vec![send];
            if let Some(mbps) = dest.bwlimit_mbps {
                pipeline.push(vec![
                    "pv".to_string(),
                    "-q".to_string(),
                    "-L".to_string(),
                    format!("{}m", mbps),
                ]);
            }

            let mut ssh = vec![
                "ssh".to_string(),
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=yes".to_string(),
                "-o".to_string(),
                format!("UserKnownHostsFile={}", known_hosts.display()),
            ];
            if let Some(key) = key_path {
                ssh.push("-i".to_string());
                ssh.push(key.display().to_string());
            }
            if let Some(port) = dest.port {
                ssh.push("-p".to_string());
                ssh.push(port.to_string());
            }
            ssh.push(format!("{}@{}", user, host));
            ssh.push("btrfs".to_string());
            ssh.push("receive".to_string());
            ssh.push(dest.path.clone());
            pipeline.push(ssh);
            Ok(pipeline)
        }
        DestinationKind::Rclone => {
            let remote = dest
                .remote
                .as_deref()
                .ok_or_else(|| Error::InvalidInput("rclone destination has no remote".to_string()))?;
            let mut rclone = vec![
                "rclone".to_string(),
                "sync".to_string(),
                snapshot_location.to_string(),
                format!("{}:{}", remote, dest.path),
            ];
            if let Some(transfers) = dest.transfers {
                rclone.push("--transfers".to_string());
                rclone.push(transfers.to_string());
            }
            if let Some(mbps) = dest.bwlimit_mbps {
                rclone.push("--bwlimit".to_string());
                rclone.push(format!("{}M", mbps));
            }
            Ok(vec![rclone])
        }
    }
}

/// Build the connectivity-probe command for a destination.
pub fn build_probe(dest: &Destination, known_hosts: &Path, key_path: Option<&Path>) -> Vec<String> {
    match dest.kind {
        DestinationKind::Local => vec![
            "test".to_string(),
            "-d".to_string(),
            dest.path.clone(),
        ],
        DestinationKind::Ssh => {
            let mut ssh = vec![
                "ssh".to_string(),
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                format!("UserKnownHostsFile={}", known_hosts.display()),
            ];
            if let Some(key) = key_path {
                ssh.push("-i".to_string());
                ssh.push(key.display().to_string());
            }
            if let Some(port) = dest.port {
                ssh.push("-p".to_string());
                ssh.push(port.to_string());
            }
            ssh.push(format!(
                "{}@{}",
                dest.user.as_deref().unwrap_or("root"),
                dest.host.as_deref().unwrap_or("")
            ));
            ssh.push("true".to_string());
            ssh
        }
        DestinationKind::Rclone => vec![
            "rclone".to_string(),
            "lsd".to_string(),
            format!("{}:{}", dest.remote.as_deref().unwrap_or(""), dest.path),
        ],
    }
}

/// Execute an argv pipeline, wiring each stage's stdout into the next
/// stage's stdin. Fails when any stage exits non-zero.
pub async fn execute_pipeline(stages: &[Vec<String>], timeout: Duration) -> Result<()> {
    tokio::time::timeout(timeout, execute_pipeline_inner(stages))
        .await
        .map_err(|_| Error::Internal("replication pipeline timed out".to_string()))?
}

async fn execute_pipeline_inner(stages: &[Vec<String>]) -> Result<()> {
    if stages.is_empty() {
        return Err(Error::InvalidInput("empty pipeline".to_string()));
    }

    let mut children = Vec::with_capacity(stages.len());
    let mut prev_stdout: Option<std::process::Stdio> = None;

    for (i, argv) in stages.iter().enumerate() {
        let last = i == stages.len() - 1;
        debug!(stage = i, command = %argv.join(" "), "spawning pipeline stage");

        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..]).kill_on_drop(true);
        if let Some(stdin) = prev_stdout.take() {
            cmd.stdin(stdin);
        }
        if !last {
            cmd.stdout(std::process::Stdio::piped());
        }
        // Stderr is not collected; an unread pipe would stall a noisy stage.
        cmd.stderr(std::process::Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Internal(format!("failed to spawn {}: {}", argv[0], e)))?;

        if !last {
            let stdout = child.stdout.take().ok_or_else(|| {
                Error::Internal(format!("{} produced no stdout pipe", argv[0]))
            })?;
            prev_stdout = Some(stdout.try_into().map_err(|e| {
                Error::Internal(format!("pipe handoff failed: {}", e))
            })?);
        }
        children.push((argv[0].clone(), child));
    }

    for (name, child) in &mut children {
        let status = child
            .wait()
            .await
            .map_err(|e| Error::Internal(format!("waiting for {}: {}", name, e)))?;
        if !status.success() {
            return Err(Error::Internal(format!(
                "pipeline stage {} exited {}",
                name,
                status.code().unwrap_or(-1)
            )));
        }
    }

    info!(stages = stages.len(), "pipeline completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::destinations::DestinationKind;

    fn dest(kind: DestinationKind) -> Destination {
        Destination {
            id: "d1".to_string(),
            name: "offsite".to_string(),
            kind,
            path: "/backups/nos".to_string(),
            host: Some("backup.example.com".to_string()),
            port: Some(2222),
            user: Some("nos".to_string()),
            remote: Some("b2".to_string()),
            key_ref: None,
            bwlimit_mbps: Some(50),
            transfers: Some(4),
        }
    }

    #[test]
    fn test_local_pipeline_with_parent() {
        let mut d = dest(DestinationKind::Local);
        d.bwlimit_mbps = None;
        let pipeline = build_pipeline(
            "/srv/@snapshots/data/20250820-020000",
            Some("/srv/@snapshots/data/20250819-020000"),
            &d,
            Path::new("/kh"),
            None,
        )
        .unwrap();

        assert_eq!(pipeline.len(), 2);
        assert_eq!(
            pipeline[0],
            vec![
                "btrfs",
                "send",
                "-p",
                "/srv/@snapshots/data/20250819-020000",
                "/srv/@snapshots/data/20250820-020000"
            ]
        );
        assert_eq!(pipeline[1], vec!["btrfs", "receive", "/backups/nos"]);
    }

    #[test]
    fn test_ssh_pipeline_has_pv_and_known_hosts() {
        let d = dest(DestinationKind::Ssh);
        let pipeline = build_pipeline(
            "/srv/@snapshots/data/20250820-020000",
            None,
            &d,
            Path::new("/var/lib/nos/known_hosts"),
            Some(Path::new("/var/lib/nos/keys/k1")),
        )
        .unwrap();

        assert_eq!(pipeline.len(), 3);
        // No -p without a parent.
        assert!(!pipeline[0].contains(&"-p".to_string()));
        assert_eq!(pipeline[1], vec!["pv", "-q", "-L", "50m"]);

        let ssh = &pipeline[2];
        assert_eq!(ssh[0], "ssh");
        assert!(ssh.contains(&"BatchMode=yes".to_string()));
        assert!(ssh
            .iter()
            .any(|a| a == "UserKnownHostsFile=/var/lib/nos/known_hosts"));
        assert!(ssh.iter().any(|a| a == "/var/lib/nos/keys/k1"));
        assert!(ssh.contains(&"nos@backup.example.com".to_string()));
        let receive_pos = ssh.iter().position(|a| a == "receive").unwrap();
        assert_eq!(ssh[receive_pos + 1], "/backups/nos");
    }

    #[test]
    fn test_rclone_command() {
        let d = dest(DestinationKind::Rclone);
        let pipeline = build_pipeline(
            "/srv/@snapshots/data/20250820-020000",
            None,
            &d,
            Path::new("/kh"),
            None,
        )
        .unwrap();

        assert_eq!(pipeline.len(), 1);
        let rclone = &pipeline[0];
        assert_eq!(rclone[0], "rclone");
        assert_eq!(rclone[1], "sync");
        assert!(rclone.contains(&"b2:/backups/nos".to_string()));
        assert!(rclone.contains(&"--transfers".to_string()));
        assert!(rclone.contains(&"--bwlimit".to_string()));
        assert!(rclone.contains(&"50M".to_string()));
    }

    #[test]
    fn test_probe_shapes() {
        let probe = build_probe(&dest(DestinationKind::Local), Path::new("/kh"), None);
        assert_eq!(probe[0], "test");

        let probe = build_probe(&dest(DestinationKind::Ssh), Path::new("/kh"), None);
        assert_eq!(probe[0], "ssh");
        assert_eq!(probe.last().unwrap(), "true");

        let probe = build_probe(&dest(DestinationKind::Rclone), Path::new("/kh"), None);
        assert_eq!(probe[0], "rclone");
        assert_eq!(probe[1], "lsd");
    }

    #[tokio::test]
    async fn test_execute_pipeline_success_and_failure() {
        let ok = vec![
            vec!["echo".to_string(), "payload".to_string()],
            vec!["cat".to_string()],
        ];
        execute_pipeline(&ok, Duration::from_secs(10)).await.unwrap();

        let failing = vec![vec!["false".to_string()]];
        assert!(execute_pipeline(&failing, Duration::from_secs(10))
            .await
            .is_err());

        assert!(execute_pipeline(&[], Duration::from_secs(10)).await.is_err());
    }
}
