//! Atomic small-file persistence.
//!
//! Every mutation of a shared config fragment (fstab, crypttab, state
//! documents) goes through the same durable sequence: write a sibling
//! temp file, fsync it, rename over the target, fsync the parent
//! directory. A reader observes either the old content or the new one,
//! never a partial file.

use crate::{Error, Result};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Filesystem operations behind the atomic write sequence.
///
/// Production code uses [`RealFs`]; tests substitute a fake to inject
/// faults and assert the ordering of the durability steps.
pub trait DurableFs: Send + Sync {
    /// Write the full payload to a temporary file, creating the parent first.
    fn write_tmp(&self, path: &Path, data: &[u8], mode: u32) -> Result<()>;

    /// Fsync a file so the payload is durable.
    fn fsync_file(&self, path: &Path) -> Result<()>;

    /// Atomically rename the temp file over the target.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Fsync the directory so the rename is durable.
    fn fsync_dir(&self, path: &Path) -> Result<()>;
}

/// Production filesystem backend.
#[derive(Clone, Default)]
pub struct RealFs;

impl DurableFs for RealFs {
    fn write_tmp(&self, path: &Path, data: &[u8], mode: u32) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut opts = std::fs::OpenOptions::new();
        opts.create(true).truncate(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        let mut file = opts.open(path)?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(())
    }

    fn fsync_file(&self, path: &Path) -> Result<()> {
        File::open(path)?.sync_all()?;
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to)?;
        Ok(())
    }

    fn fsync_dir(&self, path: &Path) -> Result<()> {
        File::open(path)?.sync_all()?;
        Ok(())
    }
}

fn tmp_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    target.with_file_name(name)
}

/// Write `data` to `target` through the durable sequence with the given mode.
pub fn write_atomic_with(fs: &dyn DurableFs, target: &Path, data: &[u8], mode: u32) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| Error::InvalidInput(format!("{} has no parent directory", target.display())))?;
    let tmp = tmp_path(target);

    fs.write_tmp(&tmp, data, mode)?;
    fs.fsync_file(&tmp)?;
    fs.fsync_dir(parent)?;
    fs.rename(&tmp, target)?;
    fs.fsync_dir(parent)?;
    Ok(())
}

/// Write `data` to `target` atomically with the default 0644 mode.
pub fn write_atomic(target: &Path, data: &[u8]) -> Result<()> {
    write_atomic_with(&RealFs, target, data, 0o644)
}

/// Write `data` to `target` atomically with an explicit mode.
pub fn write_atomic_mode(target: &Path, data: &[u8], mode: u32) -> Result<()> {
    write_atomic_with(&RealFs, target, data, mode)
}

/// Read a file, treating a missing file as empty.
pub fn read_or_empty(target: &Path) -> Result<String> {
    match std::fs::read_to_string(target) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

/// Ensure `line` is present in the file, appending it when absent.
///
/// Returns true when the file was modified. A separating newline is
/// inserted when the existing content does not end with one.
pub fn ensure_line(target: &Path, line: &str) -> Result<bool> {
    let current = read_or_empty(target)?;
    if current.lines().any(|l| l == line) {
        return Ok(false);
    }

    let mut next = current;
    if !next.is_empty() && !next.ends_with('\n') {
        next.push('\n');
    }
    next.push_str(line);
    next.push('\n');

    write_atomic(target, next.as_bytes())?;
    Ok(true)
}

/// Remove every line containing `needle`, writing the result back durably.
///
/// Returns true when at least one line was removed.
pub fn remove_line_containing(target: &Path, needle: &str) -> Result<bool> {
    let current = read_or_empty(target)?;
    let kept: Vec<&str> = current.lines().filter(|l| !l.contains(needle)).collect();
    if kept.len() == current.lines().count() {
        return Ok(false);
    }

    let mut next = kept.join("\n");
    if !next.is_empty() {
        next.push('\n');
    }
    write_atomic(target, next.as_bytes())?;
    Ok(true)
}
