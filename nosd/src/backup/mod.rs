//! Backup orchestration: schedules, retention, replication.

pub mod destinations;
pub mod replication;
pub mod retention;
pub mod scheduler;

use chrono::{DateTime, Utc};
use nos_common::{fsatomic, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// How often a schedule fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frequency {
    Cron { cron: String },
    Hourly { minute: u8 },
    Daily { minute: u8, hour: u8 },
    Weekly { minute: u8, hour: u8, weekday: u8 },
    Monthly { minute: u8, hour: u8, day: u8 },
}

/// GFS retention knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Retention {
    pub min_keep: usize,
    pub days: usize,
    pub weeks: usize,
    pub months: usize,
    pub years: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            min_keep: 3,
            days: 7,
            weeks: 4,
            months: 12,
            years: 2,
        }
    }
}

/// A snapshot schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub subvolumes: Vec<String>,
    pub frequency: Frequency,
    pub retention: Retention,
    #[serde(default)]
    pub pre_hooks: Vec<String>,
    #[serde(default)]
    pub post_hooks: Vec<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
}

/// One snapshot produced by a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub subvolume: String,
    pub location: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub read_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub schedule_id: String,
}

/// The single persisted document of schedules and snapshot records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupState {
    #[serde(default)]
    pub schedules: Vec<Schedule>,
    #[serde(default)]
    pub snapshots: Vec<SnapshotRecord>,
}

/// Store for the schedule/snapshot document.
pub struct BackupStore {
    path: PathBuf,
    state: RwLock<BackupState>,
}

impl BackupStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("backup.json");
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BackupState::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    fn persist(&self, state: &BackupState) -> Result<()> {
        let data = serde_json::to_vec_pretty(state)?;
        fsatomic::write_atomic_with(&fsatomic::RealFs, &self.path, &data, 0o600)
    }

    pub async fn schedules(&self) -> Vec<Schedule> {
        self.state.read().await.schedules.clone()
    }

    pub async fn get_schedule(&self, id: &str) -> Option<Schedule> {
        self.state
            .read()
            .await
            .schedules
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub async fn add_schedule(&self, schedule: Schedule) -> Result<()> {
        let mut state = self.state.write().await;
        if state.schedules.iter().any(|s| s.id == schedule.id) {
            return Err(Error::Conflict(format!(
                "schedule {} already exists",
                schedule.id
            )));
        }
        state.schedules.push(schedule);
        self.persist(&state)
    }

    pub async fn update_schedule(&self, schedule: Schedule) -> Result<()> {
        let mut state = self.state.write().await;
        let slot = state
            .schedules
            .iter_mut()
            .find(|s| s.id == schedule.id)
            .ok_or_else(|| Error::NotFound(format!("schedule {} not found", schedule.id)))?;
        *slot = schedule;
        self.persist(&state)
    }

    pub async fn remove_schedule(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let before = state.schedules.len();
        state.schedules.retain(|s| s.id != id);
        if state.schedules.len() == before {
            return Err(Error::NotFound(format!("schedule {} not found", id)));
        }
        self.persist(&state)
    }

    pub async fn snapshots(&self) -> Vec<SnapshotRecord> {
        self.state.read().await.snapshots.clone()
    }

    /// Snapshot records of one schedule and subvolume, newest first.
    pub async fn snapshots_for(&self, schedule_id: &str, subvolume: &str) -> Vec<SnapshotRecord> {
        let mut records: Vec<SnapshotRecord> = self
            .state
            .read()
            .await
            .snapshots
            .iter()
            .filter(|r| r.schedule_id == schedule_id && r.subvolume == subvolume)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    pub async fn add_snapshot(&self, record: SnapshotRecord) -> Result<()> {
        let mut state = self.state.write().await;
        state.snapshots.push(record);
        self.persist(&state)
    }

    pub async fn remove_snapshot(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.snapshots.retain(|r| r.id != id);
        self.persist(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(id: &str) -> Schedule {
        Schedule {
            id: id.to_string(),
            name: format!("schedule {}", id),
            enabled: true,
            subvolumes: vec!["/srv/data".to_string()],
            frequency: Frequency::Daily { minute: 30, hour: 2 },
            retention: Retention::default(),
            pre_hooks: vec![],
            post_hooks: vec![],
            tag: None,
            last_run: None,
            next_run: None,
        }
    }

    #[tokio::test]
    async fn test_schedule_crud_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackupStore::open(tmp.path()).unwrap();

        store.add_schedule(schedule("s1")).await.unwrap();
        assert!(store.add_schedule(schedule("s1")).await.is_err());

        let mut s = store.get_schedule("s1").await.unwrap();
        s.enabled = false;
        store.update_schedule(s).await.unwrap();
        assert!(!store.get_schedule("s1").await.unwrap().enabled);

        // Reopen from disk.
        drop(store);
        let store = BackupStore::open(tmp.path()).unwrap();
        assert_eq!(store.schedules().await.len(), 1);

        store.remove_schedule("s1").await.unwrap();
        assert!(store.remove_schedule("s1").await.is_err());
    }

    #[tokio::test]
    async fn test_snapshots_for_sorted_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackupStore::open(tmp.path()).unwrap();

        for (i, offset) in [(1, 10), (2, 5), (3, 20)] {
            store
                .add_snapshot(SnapshotRecord {
                    id: format!("snap-{}", i),
                    subvolume: "/srv/data".to_string(),
                    location: format!("/srv/@snapshots/data/snap-{}", i),
                    created_at: Utc::now() - chrono::Duration::days(offset),
                    size_bytes: None,
                    read_only: true,
                    tag: None,
                    schedule_id: "s1".to_string(),
                })
                .await
                .unwrap();
        }

        let records = store.snapshots_for("s1", "/srv/data").await;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].id, "snap-2");
        assert!(store.snapshots_for("s1", "/other").await.is_empty());
    }
}
