//! Firewall ruleset swap.
//!
//! The only path to the live ruleset: validate the candidate, back up the
//! running rules, apply, and restore the backup when the apply fails.
//! None of the steps may be skipped, even when the tooling claims the
//! operation is idempotent.

use async_trait::async_trait;
use nos_common::agent::{FirewallApplyRequest, FirewallApplyResponse};
use nos_common::{fsatomic, Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::exec;

/// Candidate rulesets larger than this are rejected outright.
pub const MAX_RULESET_BYTES: usize = 200 * 1024;

/// Persisted drop-in file name.
const PERSIST_NAME: &str = "nos.nft";

const NFT_TIMEOUT: Duration = Duration::from_secs(30);

/// nft invocations behind the swap, as a seam for tests.
#[async_trait]
pub trait NftRunner: Send + Sync {
    /// Check-only parse of a ruleset file. Err carries the tool's stderr.
    async fn check_file(&self, path: &Path) -> Result<()>;

    /// Dump the live ruleset.
    async fn list_ruleset(&self) -> Result<String>;

    /// Apply a ruleset file, replacing the live rules.
    async fn apply_file(&self, path: &Path) -> Result<()>;

    /// Enable the host firewall service so persisted rules load on boot.
    async fn enable_service(&self) -> Result<()>;
}

/// Production runner shelling out to nft/systemctl.
#[derive(Clone, Default)]
pub struct SystemNft;

#[async_trait]
impl NftRunner for SystemNft {
    async fn check_file(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        let result = exec::run_tool("nft", &["-c", "-f", &path], NFT_TIMEOUT).await?;
        if result.code != 0 {
            return Err(Error::PreconditionFailed(result.stderr));
        }
        Ok(())
    }

    async fn list_ruleset(&self) -> Result<String> {
        let result = exec::run_tool_checked("nft", &["list", "ruleset"], NFT_TIMEOUT).await?;
        Ok(result.stdout)
    }

    async fn apply_file(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        let result = exec::run_tool("nft", &["-f", &path], NFT_TIMEOUT).await?;
        if result.code != 0 {
            return Err(Error::Internal(result.stderr));
        }
        Ok(())
    }

    async fn enable_service(&self) -> Result<()> {
        exec::run_tool_checked("systemctl", &["enable", "--now", "nftables"], NFT_TIMEOUT)
            .await?;
        Ok(())
    }
}

/// Firewall swap manager.
pub struct FirewallManager {
    state_dir: PathBuf,
    persist_dir: PathBuf,
    nft: Arc<dyn NftRunner>,
}

impl FirewallManager {
    pub fn new(state_dir: PathBuf, persist_dir: PathBuf, nft: Arc<dyn NftRunner>) -> Self {
        Self {
            state_dir,
            persist_dir,
            nft,
        }
    }

    /// Validate → snapshot-live → apply → auto-restore.
    pub async fn apply(&self, req: &FirewallApplyRequest) -> Result<FirewallApplyResponse> {
        if req.ruleset_text.len() > MAX_RULESET_BYTES {
            return Err(Error::PayloadTooLarge(format!(
                "ruleset exceeds {} bytes",
                MAX_RULESET_BYTES
            )));
        }
        // Scan before anything touches disk.
        if req.ruleset_text.contains('`') || req.ruleset_text.contains("$(") {
            return Err(Error::InvalidInput(
                "ruleset contains shell metacharacters".to_string(),
            ));
        }

        std::fs::create_dir_all(&self.state_dir)?;
        let pending = self.state_dir.join("pending.nft");
        fsatomic::write_atomic(&pending, req.ruleset_text.as_bytes())?;

        self.nft.check_file(&pending).await?;

        let live = self.nft.list_ruleset().await?;
        let ts = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        let backup = self.state_dir.join(format!("backup-{}.nft", ts));
        fsatomic::write_atomic(&backup, live.as_bytes())?;

        if let Err(apply_err) = self.nft.apply_file(&pending).await {
            error!("ruleset apply failed, restoring backup: {}", apply_err);
            if let Err(restore_err) = self.nft.apply_file(&backup).await {
                // Both candidate and backup failed to load; the host is in
                // an undefined state and the operator must intervene.
                error!("backup restore also failed: {}", restore_err);
            }
            return Err(apply_err);
        }

        if req.persist {
            std::fs::create_dir_all(&self.persist_dir)?;
            let persisted = self.persist_dir.join(PERSIST_NAME);
            fsatomic::write_atomic(&persisted, req.ruleset_text.as_bytes())?;
            self.nft.enable_service().await?;
            info!(path = %persisted.display(), "ruleset persisted");
        }

        info!(backup = %backup.display(), "ruleset swapped");
        Ok(FirewallApplyResponse {
            ok: true,
            backup_path: backup.to_string_lossy().into_owned(),
        })
    }
}
