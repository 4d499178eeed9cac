//! Snapshot engine.
//!
//! Create/list/prune/rollback over two backends: copy-on-write subvolume
//! snapshots under `<path>/.snapshots/`, and gzip tar archives under
//! `<baseDir>/<slug(path)>/`. Service quiesce brackets every mutating
//! operation; rollback always takes a safety copy first.

pub mod host;

pub use host::{SnapshotHost, SystemHost};

use chrono::{DateTime, NaiveDateTime, Utc};
use nos_common::agent::{
    SnapshotBackend, SnapshotCreateRequest, SnapshotCreateResponse, SnapshotEntry,
    SnapshotListResponse, SnapshotMode, SnapshotPruneRequest, SnapshotPruneResponse,
    SnapshotRollbackRequest, SnapshotRollbackResponse,
};
use nos_common::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{info, warn};

const TS_FORMAT: &str = "%Y%m%d-%H%M%S";
const TS_LEN: usize = 15;

/// Lowercase-alphanumeric slug with runs of other characters collapsed to
/// a single `-`. Empty input slugs to `snap`.
pub fn slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if out.is_empty() {
        "snap".to_string()
    } else {
        out
    }
}

/// Format a UTC instant as the id timestamp prefix.
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.format(TS_FORMAT).to_string()
}

/// Extract the leading `YYYYMMDD-HHMMSS` of a snapshot id, if present.
pub fn parse_timestamp(id: &str) -> Option<String> {
    if id.len() < TS_LEN {
        return None;
    }
    let prefix = &id[..TS_LEN];
    NaiveDateTime::parse_from_str(prefix, TS_FORMAT).ok()?;
    Some(prefix.to_string())
}

/// Compose a snapshot id from an instant and a reason.
pub fn make_id(t: DateTime<Utc>, reason: &str) -> String {
    let reason = if reason.is_empty() { "manual" } else { reason };
    format!("{}-{}", format_timestamp(t), slug(reason))
}

/// Tar archive directory for a source path.
pub fn tar_dir(base: &Path, path: &Path) -> PathBuf {
    base.join(slug(&path.to_string_lossy()))
}

/// Tar archive location for a source path and id.
pub fn tar_location(base: &Path, path: &Path, id: &str) -> PathBuf {
    tar_dir(base, path).join(format!("{}.tar.gz", id))
}

/// Pick the entries to delete: everything but the `keep` newest by
/// modification time, returned oldest-first.
pub fn prune_selection(entries: &[(String, SystemTime)], keep: usize) -> Vec<String> {
    let mut sorted: Vec<&(String, SystemTime)> = entries.iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1));
    let mut doomed: Vec<String> = sorted
        .iter()
        .skip(keep)
        .map(|(name, _)| name.clone())
        .collect();
    doomed.reverse();
    doomed
}

/// Snapshot engine over a host-tooling backend.
pub struct SnapshotEngine {
    base_dir: PathBuf,
    prune_roots: Vec<PathBuf>,
    host: Arc<dyn SnapshotHost>,
}

impl SnapshotEngine {
    pub fn new(base_dir: PathBuf, host: Arc<dyn SnapshotHost>) -> Self {
        Self {
            base_dir,
            prune_roots: vec![PathBuf::from("/srv"), PathBuf::from("/mnt")],
            host,
        }
    }

    /// Override the discovery roots used by prune (test seam).
    pub fn with_prune_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.prune_roots = roots;
        self
    }

    fn validate_source(path: &str) -> Result<PathBuf> {
        let p = PathBuf::from(path);
        if !p.is_absolute() {
            return Err(Error::InvalidInput(format!("{} is not absolute", path)));
        }
        if !p.is_dir() {
            return Err(Error::NotFound(format!(
                "{} does not exist or is not a directory",
                path
            )));
        }
        Ok(p)
    }

    /// Stop the listed services, returning those that actually stopped.
    async fn stop_services(&self, names: &[String]) -> Vec<String> {
        let mut stopped = Vec::new();
        for name in names {
            match self.host.stop_service(name).await {
                Ok(()) => stopped.push(name.clone()),
                Err(e) => warn!(service = %name, "failed to stop service: {}", e),
            }
        }
        stopped
    }

    /// Restart every service that was stopped. Runs on all exit paths.
    async fn restart_services(&self, stopped: &[String]) {
        for name in stopped {
            if let Err(e) = self.host.start_service(name).await {
                warn!(service = %name, "failed to restart service: {}", e);
            }
        }
    }

    async fn resolve_backend(&self, path: &Path, mode: SnapshotMode) -> SnapshotBackend {
        match mode {
            SnapshotMode::Subvol => SnapshotBackend::Subvol,
            SnapshotMode::Tar => SnapshotBackend::Tar,
            SnapshotMode::Auto => {
                if self.host.is_subvolume(path).await {
                    SnapshotBackend::Subvol
                } else {
                    SnapshotBackend::Tar
                }
            }
        }
    }

    /// Create a snapshot: quiesce, resolve the backend, snapshot, then
    /// restart whatever was stopped even when the middle steps fail.
    pub async fn create(&self, req: &SnapshotCreateRequest) -> Result<SnapshotCreateResponse> {
        let path = Self::validate_source(&req.path)?;

        let stopped = self.stop_services(&req.stop_services).await;
        let result = self.create_inner(&path, req).await;
        self.restart_services(&stopped).await;

        result
    }

    async fn create_inner(
        &self,
        path: &Path,
        req: &SnapshotCreateRequest,
    ) -> Result<SnapshotCreateResponse> {
        let backend = self.resolve_backend(path, req.mode).await;
        let id = make_id(Utc::now(), &req.reason);

        let location = match backend {
            SnapshotBackend::Subvol => {
                let snapdir = path.join(".snapshots");
                if !snapdir.exists() {
                    std::fs::create_dir_all(&snapdir)?;
                    mirror_ownership(path, &snapdir);
                }
                let dst = snapdir.join(&id);
                self.host.subvol_snapshot(path, &dst, true).await?;
                dst
            }
            SnapshotBackend::Tar => {
                let dir = tar_dir(&self.base_dir, path);
                std::fs::create_dir_all(&dir)?;
                let archive = tar_location(&self.base_dir, path, &id);
                if let Err(e) = self.host.tar_create(path, &archive, true).await {
                    warn!("extended archive failed, retrying plain: {}", e);
                    self.host.tar_create(path, &archive, false).await?;
                }
                archive
            }
        };

        info!(id = %id, backend = %backend, "snapshot created");
        Ok(SnapshotCreateResponse {
            id,
            backend,
            location: location.to_string_lossy().into_owned(),
        })
    }

    /// Enumerate both backends' snapshots for a source path.
    pub fn list(&self, path: &str) -> Result<SnapshotListResponse> {
        let path = PathBuf::from(path);
        if !path.is_absolute() {
            return Err(Error::InvalidInput(format!(
                "{} is not absolute",
                path.display()
            )));
        }

        let mut snapshots = Vec::new();

        let snapdir = path.join(".snapshots");
        if let Ok(entries) = std::fs::read_dir(&snapdir) {
            for entry in entries.flatten() {
                if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let id = entry.file_name().to_string_lossy().into_owned();
                snapshots.push(SnapshotEntry {
                    timestamp: parse_timestamp(&id),
                    id,
                    backend: SnapshotBackend::Subvol,
                    location: entry.path().to_string_lossy().into_owned(),
                    size_bytes: None,
                });
            }
        }

        let tdir = tar_dir(&self.base_dir, &path);
        if let Ok(entries) = std::fs::read_dir(&tdir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                let Some(id) = name.strip_suffix(".tar.gz") else {
                    continue;
                };
                let size_bytes = entry.metadata().ok().map(|m| m.len());
                snapshots.push(SnapshotEntry {
                    timestamp: parse_timestamp(id),
                    id: id.to_string(),
                    backend: SnapshotBackend::Tar,
                    location: entry.path().to_string_lossy().into_owned(),
                    size_bytes,
                });
            }
        }

        snapshots.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(SnapshotListResponse { snapshots })
    }

    /// Prune each target down to its newest `keep_per_target` entries.
    pub async fn prune(&self, req: &SnapshotPruneRequest) -> Result<SnapshotPruneResponse> {
        let targets = if req.paths.is_empty() {
            self.discover_targets()
        } else {
            let mut targets = Vec::new();
            for p in &req.paths {
                let p = PathBuf::from(p);
                let snapdir = p.join(".snapshots");
                if snapdir.is_dir() {
                    targets.push((snapdir, SnapshotBackend::Subvol));
                }
                let tdir = tar_dir(&self.base_dir, &p);
                if tdir.is_dir() {
                    targets.push((tdir, SnapshotBackend::Tar));
                }
            }
            targets
        };

        let mut deleted = Vec::new();
        for (dir, backend) in targets {
            let entries = collect_entries(&dir, backend)?;
            for name in prune_selection(&entries, req.keep_per_target) {
                let victim = dir.join(&name);
                let result = match backend {
                    SnapshotBackend::Subvol => self.host.subvol_delete(&victim).await,
                    SnapshotBackend::Tar => {
                        std::fs::remove_file(&victim).map_err(Error::from)
                    }
                };
                match result {
                    Ok(()) => deleted.push(victim.to_string_lossy().into_owned()),
                    Err(e) => warn!(path = %victim.display(), "prune delete failed: {}", e),
                }
            }
        }

        Ok(SnapshotPruneResponse { deleted })
    }

    /// Delete one snapshot by location.
    ///
    /// Only locations inside a recognized snapshot layout are accepted:
    /// a `.snapshots` or `@snapshots` directory, a `.rollback` artifact,
    /// or the tar base directory.
    pub async fn delete(&self, location: &str, backend: SnapshotBackend) -> Result<()> {
        let path = PathBuf::from(location);
        if !path.is_absolute() {
            return Err(Error::InvalidInput(format!("{} is not absolute", location)));
        }
        let in_layout = path.starts_with(&self.base_dir)
            || path.components().any(|c| {
                matches!(
                    c.as_os_str().to_str(),
                    Some(".snapshots") | Some("@snapshots") | Some(".rollback")
                )
            });
        if !in_layout {
            return Err(Error::NotAllowed(format!(
                "{} is not a snapshot location",
                location
            )));
        }

        match backend {
            SnapshotBackend::Subvol => {
                if !path.is_dir() {
                    return Err(Error::NotFound(format!("{} not found", location)));
                }
                self.host.subvol_delete(&path).await
            }
            SnapshotBackend::Tar => {
                if !path.is_file() {
                    return Err(Error::NotFound(format!("{} not found", location)));
                }
                std::fs::remove_file(&path).map_err(Error::from)
            }
        }
    }

    /// Walk the prune roots (depth 2) for `.snapshots` directories and the
    /// tar base for per-path archive directories.
    fn discover_targets(&self) -> Vec<(PathBuf, SnapshotBackend)> {
        let mut targets = Vec::new();

        for root in &self.prune_roots {
            walk_for_snapdirs(root, 0, &mut targets);
        }

        if let Ok(entries) = std::fs::read_dir(&self.base_dir) {
            for entry in entries.flatten() {
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    targets.push((entry.path(), SnapshotBackend::Tar));
                }
            }
        }

        targets
    }

    /// Roll a path back to a snapshot, bracketed by service quiesce.
    ///
    /// The subvol sequence is delete-then-resnapshot and is not atomic: a
    /// crash between the delete and the re-snapshot leaves the original
    /// path absent. The safety copy in `.rollback/` is the recovery lever.
    pub async fn rollback(
        &self,
        req: &SnapshotRollbackRequest,
    ) -> Result<SnapshotRollbackResponse> {
        if req.path == "/" {
            return Err(Error::InvalidInput("refuse to operate on rootfs".to_string()));
        }
        let path = Self::validate_source(&req.path)?;

        let stopped = self.stop_services(&req.stop_services).await;
        let result = self.rollback_inner(&path, req).await;
        self.restart_services(&stopped).await;

        result
    }

    async fn rollback_inner(
        &self,
        path: &Path,
        req: &SnapshotRollbackRequest,
    ) -> Result<SnapshotRollbackResponse> {
        // The rollback directory sits beside the target so safety copies
        // survive the subvolume delete and stay out of new archives.
        let parent = path
            .parent()
            .ok_or_else(|| Error::InvalidInput("path has no parent".to_string()))?;
        let rollback_dir = parent.join(".rollback");
        let ts = format_timestamp(Utc::now());

        match req.backend {
            SnapshotBackend::Subvol => {
                if !self.host.is_subvolume(path).await {
                    return Err(Error::InvalidInput(format!(
                        "{} is not a subvolume",
                        path.display()
                    )));
                }
                let snap = path.join(".snapshots").join(&req.snapshot_id);
                if !snap.is_dir() {
                    return Err(Error::NotFound(format!(
                        "snapshot {} not found",
                        req.snapshot_id
                    )));
                }

                std::fs::create_dir_all(&rollback_dir)?;
                let safety = rollback_dir.join(format!("current-{}", ts));
                self.host.subvol_snapshot(path, &safety, true).await?;

                let restore = rollback_dir.join(format!("tmp-restore-{}", ts));
                self.host.subvol_snapshot(&snap, &restore, false).await?;
                self.host.subvol_delete(path).await?;
                self.host.subvol_snapshot(&restore, path, false).await?;
                self.host.subvol_delete(&restore).await?;

                info!(path = %path.display(), snapshot = %req.snapshot_id, "subvolume rolled back");
                Ok(SnapshotRollbackResponse {
                    ok: true,
                    safety_path: Some(safety.to_string_lossy().into_owned()),
                })
            }
            SnapshotBackend::Tar => {
                let archive = tar_location(&self.base_dir, path, &req.snapshot_id);
                if !archive.is_file() {
                    return Err(Error::NotFound(format!(
                        "snapshot {} not found",
                        req.snapshot_id
                    )));
                }

                std::fs::create_dir_all(&rollback_dir)?;
                let safety = rollback_dir.join(format!("current-{}.tar.gz", ts));
                if let Err(e) = self.host.tar_create(path, &safety, true).await {
                    warn!("extended safety archive failed, retrying plain: {}", e);
                    self.host.tar_create(path, &safety, false).await?;
                }

                self.host.tar_extract(&archive, path).await?;

                info!(path = %path.display(), snapshot = %req.snapshot_id, "archive rolled back");
                Ok(SnapshotRollbackResponse {
                    ok: true,
                    safety_path: Some(safety.to_string_lossy().into_owned()),
                })
            }
        }
    }
}

fn walk_for_snapdirs(dir: &Path, depth: usize, out: &mut Vec<(PathBuf, SnapshotBackend)>) {
    if depth > 2 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        if entry.file_name() == ".snapshots" {
            out.push((entry.path(), SnapshotBackend::Subvol));
        } else {
            walk_for_snapdirs(&entry.path(), depth + 1, out);
        }
    }
}

fn collect_entries(dir: &Path, backend: SnapshotBackend) -> Result<Vec<(String, SystemTime)>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)?.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let keep = match backend {
            SnapshotBackend::Subvol => meta.is_dir(),
            SnapshotBackend::Tar => meta.is_file() && name.ends_with(".tar.gz"),
        };
        if !keep {
            continue;
        }
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push((name, mtime));
    }
    Ok(entries)
}

/// Best-effort copy of the parent directory's ownership onto a fresh
/// `.snapshots` directory.
fn mirror_ownership(parent: &Path, dir: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Ok(meta) = std::fs::metadata(parent) {
            let uid = nix::unistd::Uid::from_raw(meta.uid());
            let gid = nix::unistd::Gid::from_raw(meta.gid());
            if let Err(e) = nix::unistd::chown(dir, Some(uid), Some(gid)) {
                warn!(dir = %dir.display(), "could not mirror ownership: {}", e);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (parent, dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_slug() {
        assert_eq!(slug("pre-update"), "pre-update");
        assert_eq!(slug("Pre Update!! now"), "pre-update-now");
        assert_eq!(slug("///"), "snap");
        assert_eq!(slug(""), "snap");
        assert_eq!(slug("--hello--"), "hello");
    }

    #[test]
    fn test_timestamp_round_trip() {
        let t = DateTime::parse_from_rfc3339("2025-08-20T12:34:56Z")
            .unwrap()
            .with_timezone(&Utc);
        let formatted = format_timestamp(t);
        assert_eq!(formatted, "20250820-123456");

        let id = format!("{}-{}", formatted, slug("pre-update"));
        assert_eq!(parse_timestamp(&id).as_deref(), Some(formatted.as_str()));
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        assert!(parse_timestamp("short").is_none());
        assert!(parse_timestamp("2025082x-123456-snap").is_none());
        assert!(parse_timestamp("99999999-999999-snap").is_none());
    }

    #[test]
    fn test_prune_selection_invariants() {
        let base = SystemTime::UNIX_EPOCH;
        let at = |secs: u64| base + Duration::from_secs(secs);
        let entries = vec![
            ("a".to_string(), at(1)),
            ("b".to_string(), at(2)),
            ("c".to_string(), at(5)),
            ("d".to_string(), at(10)),
        ];

        let doomed = prune_selection(&entries, 2);
        assert_eq!(doomed, vec!["a".to_string(), "b".to_string()]);

        assert!(prune_selection(&entries, 4).is_empty());
        assert!(prune_selection(&entries, 10).is_empty());
        assert_eq!(prune_selection(&entries, 0).len(), 4);
    }

    #[test]
    fn test_tar_location_shape() {
        let loc = tar_location(
            Path::new("/var/lib/nos/snapshots"),
            Path::new("/srv/app data"),
            "20250820-123456-pre-update",
        );
        assert_eq!(
            loc,
            PathBuf::from("/var/lib/nos/snapshots/srv-app-data/20250820-123456-pre-update.tar.gz")
        );
    }

    /// Fake host recording operations; tar_create materializes an empty
    /// file so list/prune can see it.
    struct FakeHost {
        ops: Mutex<Vec<String>>,
        fail_tar_create: bool,
        subvol_paths: Vec<PathBuf>,
    }

    impl FakeHost {
        fn new() -> Self {
            Self {
                ops: Mutex::new(Vec::new()),
                fail_tar_create: false,
                subvol_paths: Vec::new(),
            }
        }

        fn record(&self, op: String) {
            self.ops.lock().unwrap().push(op);
        }

        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SnapshotHost for FakeHost {
        async fn is_subvolume(&self, path: &Path) -> bool {
            self.subvol_paths.iter().any(|p| p == path)
        }

        async fn subvol_snapshot(&self, src: &Path, dst: &Path, readonly: bool) -> Result<()> {
            self.record(format!(
                "snapshot {} -> {} ro={}",
                src.display(),
                dst.display(),
                readonly
            ));
            std::fs::create_dir_all(dst)?;
            Ok(())
        }

        async fn subvol_delete(&self, path: &Path) -> Result<()> {
            self.record(format!("delete {}", path.display()));
            std::fs::remove_dir_all(path)?;
            Ok(())
        }

        async fn tar_create(&self, src: &Path, archive: &Path, extended: bool) -> Result<()> {
            self.record(format!(
                "tar {} -> {} ext={}",
                src.display(),
                archive.display(),
                extended
            ));
            if self.fail_tar_create {
                return Err(Error::Internal("tar exploded".to_string()));
            }
            std::fs::write(archive, b"")?;
            Ok(())
        }

        async fn tar_extract(&self, archive: &Path, dst: &Path) -> Result<()> {
            self.record(format!("untar {} -> {}", archive.display(), dst.display()));
            Ok(())
        }

        async fn stop_service(&self, name: &str) -> Result<()> {
            if name == "unstoppable" {
                return Err(Error::Internal("unit busy".to_string()));
            }
            self.record(format!("stop {}", name));
            Ok(())
        }

        async fn start_service(&self, name: &str) -> Result<()> {
            self.record(format!("start {}", name));
            Ok(())
        }
    }

    fn engine(base: &Path, host: FakeHost) -> SnapshotEngine {
        SnapshotEngine::new(base.to_path_buf(), Arc::new(host))
    }

    #[tokio::test]
    async fn test_create_tar_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("data");
        std::fs::create_dir(&src).unwrap();
        let base = tmp.path().join("base");

        let e = engine(&base, FakeHost::new());
        let resp = e
            .create(&SnapshotCreateRequest {
                path: src.to_string_lossy().into_owned(),
                mode: SnapshotMode::Tar,
                reason: "pre-update".to_string(),
                stop_services: vec![],
            })
            .await
            .unwrap();

        assert_eq!(resp.backend, SnapshotBackend::Tar);
        assert!(resp.id.ends_with("-pre-update"));
        assert!(resp.location.ends_with(&format!("{}.tar.gz", resp.id)));
        assert!(PathBuf::from(&resp.location).is_file());

        let listed = e.list(&src.to_string_lossy()).unwrap();
        assert_eq!(listed.snapshots.len(), 1);
        assert_eq!(listed.snapshots[0].id, resp.id);
        assert!(listed.snapshots[0].timestamp.is_some());
    }

    #[tokio::test]
    async fn test_quiesce_bracketing() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("data");
        std::fs::create_dir(&src).unwrap();

        let host = Arc::new(FakeHost::new());
        let e = SnapshotEngine::new(tmp.path().join("base"), host.clone());

        e.create(&SnapshotCreateRequest {
            path: src.to_string_lossy().into_owned(),
            mode: SnapshotMode::Tar,
            reason: "r".to_string(),
            stop_services: vec!["smbd".to_string(), "unstoppable".to_string()],
        })
        .await
        .unwrap();

        let ops = host.ops();
        assert_eq!(ops.first().map(String::as_str), Some("stop smbd"));
        assert_eq!(ops.last().map(String::as_str), Some("start smbd"));
        assert!(!ops.contains(&"start unstoppable".to_string()));
    }

    #[tokio::test]
    async fn test_quiesce_restart_on_failure_path() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("data");
        std::fs::create_dir(&src).unwrap();

        let host = Arc::new(FakeHost {
            ops: Mutex::new(Vec::new()),
            fail_tar_create: true,
            subvol_paths: Vec::new(),
        });
        let e = SnapshotEngine::new(tmp.path().join("base"), host.clone());

        // Plain retry also fails, so create errors; smbd must still restart.
        let result = e
            .create(&SnapshotCreateRequest {
                path: src.to_string_lossy().into_owned(),
                mode: SnapshotMode::Tar,
                reason: String::new(),
                stop_services: vec!["smbd".to_string()],
            })
            .await;
        assert!(result.is_err());
        assert!(host.ops().contains(&"start smbd".to_string()));
    }

    #[tokio::test]
    async fn test_rollback_refuses_rootfs() {
        let tmp = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::new());
        let e = SnapshotEngine::new(tmp.path().join("base"), host.clone());

        let err = e
            .rollback(&SnapshotRollbackRequest {
                path: "/".to_string(),
                snapshot_id: "x".to_string(),
                backend: SnapshotBackend::Tar,
                stop_services: vec![],
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("refuse to operate on rootfs"));
        // No safety artifact, no service churn.
        assert!(host.ops().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_tar_missing_archive_creates_no_safety() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("data");
        std::fs::create_dir(&src).unwrap();

        let host = Arc::new(FakeHost::new());
        let e = SnapshotEngine::new(tmp.path().join("base"), host.clone());

        let err = e
            .rollback(&SnapshotRollbackRequest {
                path: src.to_string_lossy().into_owned(),
                snapshot_id: "20250101-000000-gone".to_string(),
                backend: SnapshotBackend::Tar,
                stop_services: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(host.ops().iter().all(|op| !op.starts_with("tar ")));
    }

    #[tokio::test]
    async fn test_rollback_tar_takes_safety_then_extracts() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("data");
        std::fs::create_dir(&src).unwrap();
        let base = tmp.path().join("base");

        let host = Arc::new(FakeHost::new());
        let e = SnapshotEngine::new(base.clone(), host.clone());

        // Seed an archive to roll back to.
        let id = "20250101-000000-seed";
        std::fs::create_dir_all(tar_dir(&base, &src)).unwrap();
        std::fs::write(tar_location(&base, &src, id), b"").unwrap();

        let resp = e
            .rollback(&SnapshotRollbackRequest {
                path: src.to_string_lossy().into_owned(),
                snapshot_id: id.to_string(),
                backend: SnapshotBackend::Tar,
                stop_services: vec![],
            })
            .await
            .unwrap();

        assert!(resp.ok);
        let safety = resp.safety_path.unwrap();
        assert!(safety.contains(".rollback/current-"));

        let ops = host.ops();
        let tar_idx = ops.iter().position(|o| o.starts_with("tar ")).unwrap();
        let untar_idx = ops.iter().position(|o| o.starts_with("untar ")).unwrap();
        assert!(tar_idx < untar_idx, "safety archive must precede extract");
    }

    #[tokio::test]
    async fn test_rollback_subvol_sequence() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("vol");
        std::fs::create_dir(&src).unwrap();
        std::fs::create_dir_all(src.join(".snapshots/20250101-000000-seed")).unwrap();

        let host = Arc::new(FakeHost {
            ops: Mutex::new(Vec::new()),
            fail_tar_create: false,
            subvol_paths: vec![src.clone()],
        });
        let e = SnapshotEngine::new(tmp.path().join("base"), host.clone());

        let resp = e
            .rollback(&SnapshotRollbackRequest {
                path: src.to_string_lossy().into_owned(),
                snapshot_id: "20250101-000000-seed".to_string(),
                backend: SnapshotBackend::Subvol,
                stop_services: vec![],
            })
            .await
            .unwrap();
        assert!(resp.ok);

        let ops = host.ops();
        // safety snapshot, writable restore, delete original, re-snapshot,
        // delete restore: five host calls in that order.
        assert_eq!(ops.len(), 5);
        assert!(ops[0].contains("ro=true"));
        assert!(ops[1].contains("tmp-restore-") && ops[1].contains("ro=false"));
        assert!(ops[2].starts_with("delete ") && ops[2].contains("vol"));
        assert!(ops[3].contains("ro=false"));
        assert!(ops[4].starts_with("delete ") && ops[4].contains("tmp-restore-"));
    }

    #[tokio::test]
    async fn test_prune_deletes_oldest_tar_archives() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("base");
        let src = tmp.path().join("data");
        std::fs::create_dir(&src).unwrap();
        let dir = tar_dir(&base, &src);
        std::fs::create_dir_all(&dir).unwrap();

        let names = ["one", "two", "three", "four"];
        for (i, name) in names.iter().enumerate() {
            let p = dir.join(format!("{}.tar.gz", name));
            std::fs::write(&p, b"").unwrap();
            let f = std::fs::File::options().write(true).open(&p).unwrap();
            f.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs([1, 2, 5, 10][i]))
                .unwrap();
        }

        let host = Arc::new(FakeHost::new());
        let e = SnapshotEngine::new(base, host);

        let resp = e
            .prune(&SnapshotPruneRequest {
                keep_per_target: 2,
                paths: vec![src.to_string_lossy().into_owned()],
            })
            .await
            .unwrap();

        assert_eq!(resp.deleted.len(), 2);
        assert!(resp.deleted[0].ends_with("one.tar.gz"));
        assert!(resp.deleted[1].ends_with("two.tar.gz"));
        assert!(dir.join("three.tar.gz").exists());
        assert!(dir.join("four.tar.gz").exists());
    }

    #[tokio::test]
    async fn test_prune_discovers_snapdirs_under_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("srv");
        let snapdir = root.join("pool").join(".snapshots");
        std::fs::create_dir_all(snapdir.join("a")).unwrap();
        std::fs::create_dir_all(snapdir.join("b")).unwrap();

        let host = Arc::new(FakeHost::new());
        let e = SnapshotEngine::new(tmp.path().join("base"), host.clone())
            .with_prune_roots(vec![root]);

        let resp = e
            .prune(&SnapshotPruneRequest {
                keep_per_target: 1,
                paths: vec![],
            })
            .await
            .unwrap();
        assert_eq!(resp.deleted.len(), 1);
        assert!(host.ops().iter().any(|o| o.starts_with("delete ")));
    }
}
