//! Host tooling behind the snapshot engine.
//!
//! The engine never spawns processes itself; it goes through this trait so
//! the flows (quiesce bracketing, safety copies, failure policy) are
//! unit-testable without root or a copy-on-write filesystem.

use async_trait::async_trait;
use nos_common::{Error, Result};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::exec;

/// Bound for archive create/extract on large trees.
const ARCHIVE_TIMEOUT: Duration = Duration::from_secs(600);

#[async_trait]
pub trait SnapshotHost: Send + Sync {
    /// True when `path` is a copy-on-write subvolume.
    async fn is_subvolume(&self, path: &Path) -> bool;

    /// Create a subvolume snapshot of `src` at `dst`.
    async fn subvol_snapshot(&self, src: &Path, dst: &Path, readonly: bool) -> Result<()>;

    /// Delete the subvolume at `path`.
    async fn subvol_delete(&self, path: &Path) -> Result<()>;

    /// Archive the contents of `src` into `archive`.
    ///
    /// With `preserve_extended` the archive carries xattrs and ACLs.
    async fn tar_create(&self, src: &Path, archive: &Path, preserve_extended: bool) -> Result<()>;

    /// Extract `archive` over `dst`.
    async fn tar_extract(&self, archive: &Path, dst: &Path) -> Result<()>;

    /// Stop a system service.
    async fn stop_service(&self, name: &str) -> Result<()>;

    /// Start a system service.
    async fn start_service(&self, name: &str) -> Result<()>;
}

/// Production host backed by btrfs/tar/systemctl.
#[derive(Clone, Default)]
pub struct SystemHost;

#[async_trait]
impl SnapshotHost for SystemHost {
    async fn is_subvolume(&self, path: &Path) -> bool {
        let path = path.to_string_lossy();
        exec::run_tool(
            "btrfs",
            &["subvolume", "show", &path],
            exec::PROBE_TIMEOUT,
        )
        .await
        .map(|r| r.code == 0)
        .unwrap_or(false)
    }

    async fn subvol_snapshot(&self, src: &Path, dst: &Path, readonly: bool) -> Result<()> {
        let src = src.to_string_lossy();
        let dst = dst.to_string_lossy();
        let args: Vec<&str> = if readonly {
            vec!["subvolume", "snapshot", "-r", &src, &dst]
        } else {
            vec!["subvolume", "snapshot", &src, &dst]
        };
        exec::run_tool_checked("btrfs", &args, exec::MUTATE_TIMEOUT).await?;
        Ok(())
    }

    async fn subvol_delete(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        exec::run_tool_checked(
            "btrfs",
            &["subvolume", "delete", &path],
            exec::MUTATE_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn tar_create(&self, src: &Path, archive: &Path, preserve_extended: bool) -> Result<()> {
        let src = src.to_string_lossy();
        let archive = archive.to_string_lossy();
        let args: Vec<&str> = if preserve_extended {
            vec!["--xattrs", "--acls", "-czf", &archive, "-C", &src, "."]
        } else {
            vec!["-czf", &archive, "-C", &src, "."]
        };
        let result = exec::run_tool("tar", &args, ARCHIVE_TIMEOUT).await?;
        if result.code != 0 {
            // Leave no partial archive behind.
            let _ = std::fs::remove_file(archive.as_ref());
            return Err(Error::Internal(format!(
                "tar failed ({}): {}",
                result.code,
                result.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn tar_extract(&self, archive: &Path, dst: &Path) -> Result<()> {
        let archive = archive.to_string_lossy();
        let dst = dst.to_string_lossy();
        exec::run_tool_checked(
            "tar",
            &["--xattrs", "--acls", "-xzf", &archive, "-C", &dst],
            ARCHIVE_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn stop_service(&self, name: &str) -> Result<()> {
        exec::run_tool_checked("systemctl", &["stop", name], exec::MUTATE_TIMEOUT).await?;
        Ok(())
    }

    async fn start_service(&self, name: &str) -> Result<()> {
        if let Err(e) =
            exec::run_tool_checked("systemctl", &["start", name], exec::MUTATE_TIMEOUT).await
        {
            warn!(service = name, "failed to restart service: {}", e);
            return Err(e);
        }
        Ok(())
    }
}
