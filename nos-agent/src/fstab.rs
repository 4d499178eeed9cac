//! fstab and crypttab line management.
//!
//! Lines are added and removed through the atomic-write primitive so the
//! system tables are never observable half-written. The directory is a
//! parameter so tests never touch `/etc`.

use nos_common::{fsatomic, Error, Result};
use std::path::PathBuf;
use tracing::info;

/// Manager for the small system tables under one directory.
pub struct SystemTables {
    etc_dir: PathBuf,
}

impl SystemTables {
    pub fn new(etc_dir: PathBuf) -> Self {
        Self { etc_dir }
    }

    fn validate_line(line: &str) -> Result<()> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("line must not be empty".to_string()));
        }
        if trimmed.contains('\n') || line.contains('\n') {
            return Err(Error::InvalidInput("line must be a single line".to_string()));
        }
        Ok(())
    }

    fn validate_needle(needle: &str) -> Result<()> {
        if needle.trim().is_empty() {
            return Err(Error::InvalidInput("match string must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn fstab_ensure(&self, line: &str) -> Result<bool> {
        Self::validate_line(line)?;
        let changed = fsatomic::ensure_line(&self.etc_dir.join("fstab"), line.trim())?;
        if changed {
            info!("fstab entry added");
        }
        Ok(changed)
    }

    pub fn fstab_remove(&self, needle: &str) -> Result<bool> {
        Self::validate_needle(needle)?;
        let changed = fsatomic::remove_line_containing(&self.etc_dir.join("fstab"), needle)?;
        if changed {
            info!("fstab entry removed");
        }
        Ok(changed)
    }

    pub fn crypttab_ensure(&self, line: &str) -> Result<bool> {
        Self::validate_line(line)?;
        let changed = fsatomic::ensure_line(&self.etc_dir.join("crypttab"), line.trim())?;
        if changed {
            info!("crypttab entry added");
        }
        Ok(changed)
    }

    pub fn crypttab_remove(&self, needle: &str) -> Result<bool> {
        Self::validate_needle(needle)?;
        let changed = fsatomic::remove_line_containing(&self.etc_dir.join("crypttab"), needle)?;
        if changed {
            info!("crypttab entry removed");
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(dir: &std::path::Path) -> SystemTables {
        SystemTables::new(dir.to_path_buf())
    }

    #[test]
    fn test_fstab_ensure_and_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let t = tables(tmp.path());

        let line = "UUID=abcd /srv/pool btrfs defaults,noatime 0 0";
        assert!(t.fstab_ensure(line).unwrap());
        assert!(!t.fstab_ensure(line).unwrap());

        let content = std::fs::read_to_string(tmp.path().join("fstab")).unwrap();
        assert_eq!(content.lines().count(), 1);

        assert!(t.fstab_remove("/srv/pool").unwrap());
        let content = std::fs::read_to_string(tmp.path().join("fstab")).unwrap();
        assert!(content.is_empty());
    }

    #[test]
    fn test_crypttab_preserves_other_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let t = tables(tmp.path());

        t.crypttab_ensure("luks-a /dev/sda2 /etc/nos/keys/a.key luks").unwrap();
        t.crypttab_ensure("luks-b /dev/sdb2 /etc/nos/keys/b.key luks").unwrap();
        t.crypttab_remove("luks-a").unwrap();

        let content = std::fs::read_to_string(tmp.path().join("crypttab")).unwrap();
        assert!(!content.contains("luks-a"));
        assert!(content.contains("luks-b"));
    }

    #[test]
    fn test_rejects_empty_and_multiline() {
        let tmp = tempfile::tempdir().unwrap();
        let t = tables(tmp.path());

        assert!(t.fstab_ensure("").is_err());
        assert!(t.fstab_ensure("a\nb").is_err());
        assert!(t.fstab_remove("  ").is_err());
    }
}
