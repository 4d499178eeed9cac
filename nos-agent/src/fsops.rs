//! Filesystem materialization: directories and files with explicit
//! mode/owner/group, used to lay out shares and exports.

use nos_common::agent::{MkdirRequest, WriteFileRequest};
use nos_common::{fsatomic, Error, Result};
use std::path::Path;
use tracing::info;

fn validate_target(path: &str) -> Result<&Path> {
    let p = Path::new(path);
    if !p.is_absolute() {
        return Err(Error::InvalidInput(format!("{} is not absolute", path)));
    }
    if p.components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(Error::InvalidInput(format!(
            "{} contains parent traversal",
            path
        )));
    }
    Ok(p)
}

#[cfg(unix)]
fn resolve_owner(owner: Option<&str>, group: Option<&str>) -> Result<(Option<nix::unistd::Uid>, Option<nix::unistd::Gid>)> {
    let uid = match owner {
        Some(name) => Some(
            nix::unistd::User::from_name(name)
                .map_err(|e| Error::Internal(format!("user lookup: {}", e)))?
                .ok_or_else(|| Error::InvalidInput(format!("unknown user {}", name)))?
                .uid,
        ),
        None => None,
    };
    let gid = match group {
        Some(name) => Some(
            nix::unistd::Group::from_name(name)
                .map_err(|e| Error::Internal(format!("group lookup: {}", e)))?
                .ok_or_else(|| Error::InvalidInput(format!("unknown group {}", name)))?
                .gid,
        ),
        None => None,
    };
    Ok((uid, gid))
}

fn apply_attrs(path: &Path, mode: Option<u32>, owner: Option<&str>, group: Option<&str>) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = mode {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        }
        if owner.is_some() || group.is_some() {
            let (uid, gid) = resolve_owner(owner, group)?;
            nix::unistd::chown(path, uid, gid)
                .map_err(|e| Error::Internal(format!("chown {}: {}", path.display(), e)))?;
        }
    }
    #[cfg(not(unix))]
    let _ = (path, mode, owner, group);
    Ok(())
}

/// Create a directory (and parents) with the requested attributes.
pub fn mkdir(req: &MkdirRequest) -> Result<()> {
    let path = validate_target(&req.path)?;
    std::fs::create_dir_all(path)?;
    apply_attrs(path, req.mode, req.owner.as_deref(), req.group.as_deref())?;
    info!(path = %path.display(), "directory materialized");
    Ok(())
}

/// Write a file atomically with the requested attributes.
pub fn write_file(req: &WriteFileRequest) -> Result<()> {
    let path = validate_target(&req.path)?;
    fsatomic::write_atomic_mode(path, req.content.as_bytes(), req.mode.unwrap_or(0o644))?;
    apply_attrs(path, req.mode, req.owner.as_deref(), req.group.as_deref())?;
    info!(path = %path.display(), bytes = req.content.len(), "file written");
    Ok(())
}
