//! Cron-driven snapshot scheduling.
//!
//! Schedules are projected onto 5-field cron expressions; a single timer
//! task scans for due schedules and fires each on its own task. At most
//! one fire per schedule runs at a time; an overlapping fire is dropped
//! and the timer picks the schedule up again at the next slot.

use chrono::{DateTime, Datelike, Timelike, Utc};
use nos_common::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use crate::agent::AgentClient;
use crate::audit::{AuditEvent, AuditLog, Severity};
use crate::jobs::{JobManager, JobState, JobType, LogLevel};
use nos_common::agent::{BtrfsSnapshotRequest, SnapshotBackend};

use super::retention::{deletion_candidates, select_retention};
use super::{BackupStore, Frequency, Schedule, SnapshotRecord};

/// How often the timer scans for due schedules.
pub const TICK_INTERVAL: Duration = Duration::from_secs(30);

const HOOK_TIMEOUT: Duration = Duration::from_secs(60);

/// Parsed 5-field cron expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    minutes: Vec<u8>,
    hours: Vec<u8>,
    days: Vec<u8>,
    months: Vec<u8>,
    weekdays: Vec<u8>,
}

impl CronSchedule {
    /// Parse `minute hour day month weekday`.
    pub fn parse(expr: &str) -> Result<Self> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(Error::InvalidInput(format!(
                "invalid cron expression '{}': expected 5 fields",
                expr
            )));
        }

        Ok(Self {
            minutes: Self::parse_field(parts[0], 0, 59)?,
            hours: Self::parse_field(parts[1], 0, 23)?,
            days: Self::parse_field(parts[2], 1, 31)?,
            months: Self::parse_field(parts[3], 1, 12)?,
            weekdays: Self::parse_field(parts[4], 0, 6)?,
        })
    }

    fn parse_field(field: &str, min: u8, max: u8) -> Result<Vec<u8>> {
        let mut values = Vec::new();

        for part in field.split(',') {
            let (range_part, step) = match part.split_once('/') {
                Some((r, s)) => (
                    r,
                    s.parse::<u8>().map_err(|_| {
                        Error::InvalidInput(format!("invalid step value: {}", s))
                    })?,
                ),
                None => (part, 1),
            };
            if step == 0 {
                return Err(Error::InvalidInput("step must be positive".to_string()));
            }

            let range: Vec<u8> = if range_part == "*" {
                (min..=max).collect()
            } else if let Some((start, end)) = range_part.split_once('-') {
                let start = start.parse::<u8>().map_err(|_| {
                    Error::InvalidInput(format!("invalid range start: {}", start))
                })?;
                let end = end
                    .parse::<u8>()
                    .map_err(|_| Error::InvalidInput(format!("invalid range end: {}", end)))?;
                if start > end || start < min || end > max {
                    return Err(Error::InvalidInput(format!(
                        "invalid range {}-{} (must be {}-{})",
                        start, end, min, max
                    )));
                }
                (start..=end).collect()
            } else {
                let val = range_part
                    .parse::<u8>()
                    .map_err(|_| Error::InvalidInput(format!("invalid value: {}", range_part)))?;
                if val < min || val > max {
                    return Err(Error::InvalidInput(format!(
                        "value {} out of range {}-{}",
                        val, min, max
                    )));
                }
                vec![val]
            };

            for (i, v) in range.into_iter().enumerate() {
                if i % step as usize == 0 && !values.contains(&v) {
                    values.push(v);
                }
            }
        }

        values.sort_unstable();
        Ok(values)
    }

    /// Does the expression match this minute?
    pub fn matches(&self, dt: &DateTime<Utc>) -> bool {
        self.minutes.contains(&(dt.minute() as u8))
            && self.hours.contains(&(dt.hour() as u8))
            && self.days.contains(&(dt.day() as u8))
            && self.months.contains(&(dt.month() as u8))
            && self
                .weekdays
                .contains(&(dt.weekday().num_days_from_sunday() as u8))
    }

    /// Next matching minute strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut current = (*after + chrono::Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;

        // Two years of minutes bounds the search.
        for _ in 0..(366 * 24 * 60 * 2) {
            if self.matches(&current) {
                return Some(current);
            }
            current += chrono::Duration::minutes(1);
        }
        None
    }
}

/// Project a frequency record onto its cron expression.
pub fn frequency_to_cron(freq: &Frequency) -> String {
    match freq {
        Frequency::Cron { cron } => cron.clone(),
        Frequency::Hourly { minute } => format!("{} * * * *", minute),
        Frequency::Daily { minute, hour } => format!("{} {} * * *", minute, hour),
        Frequency::Weekly {
            minute,
            hour,
            weekday,
        } => format!("{} {} * * {}", minute, hour, weekday),
        Frequency::Monthly { minute, hour, day } => format!("{} {} {} * *", minute, hour, day),
    }
}

/// Next fire time for a frequency.
pub fn next_fire(freq: &Frequency, after: &DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let cron = CronSchedule::parse(&frequency_to_cron(freq))?;
    Ok(cron.next_after(after))
}

/// The scheduler.
pub struct BackupScheduler {
    pub store: Arc<BackupStore>,
    pub jobs: Arc<JobManager>,
    pub agent: Arc<AgentClient>,
    pub audit: Arc<AuditLog>,
    running: Mutex<HashSet<String>>,
}

impl BackupScheduler {
    pub fn new(
        store: Arc<BackupStore>,
        jobs: Arc<JobManager>,
        agent: Arc<AgentClient>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            store,
            jobs,
            agent,
            audit,
            running: Mutex::new(HashSet::new()),
        }
    }

    fn running_lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        match self.running.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Claim a schedule for execution; false means a fire is in flight
    /// and this one is dropped.
    pub fn try_begin(&self, schedule_id: &str) -> bool {
        self.running_lock().insert(schedule_id.to_string())
    }

    pub fn finish(&self, schedule_id: &str) {
        self.running_lock().remove(schedule_id);
    }

    /// Spawn the timer loop.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                self.tick(Utc::now()).await;
            }
        })
    }

    /// One scan: fire every due schedule.
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) {
        for mut schedule in self.store.schedules().await {
            if !schedule.enabled {
                continue;
            }

            let due = match schedule.next_run {
                Some(next) => next <= now,
                None => false,
            };

            if schedule.next_run.is_none() || due {
                // Always (re)project the next slot first so a dropped or
                // failed fire does not stall the schedule.
                match next_fire(&schedule.frequency, &now) {
                    Ok(next) => schedule.next_run = next,
                    Err(e) => {
                        warn!(schedule = %schedule.id, "bad frequency: {}", e);
                        continue;
                    }
                }
                if due {
                    schedule.last_run = Some(now);
                }
                if let Err(e) = self.store.update_schedule(schedule.clone()).await {
                    warn!(schedule = %schedule.id, "could not persist schedule: {}", e);
                }
            }

            if !due {
                continue;
            }

            if !self.try_begin(&schedule.id) {
                warn!(schedule = %schedule.id, "previous fire still running, dropping");
                continue;
            }

            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.run_schedule(&schedule).await;
                this.finish(&schedule.id);
            });
        }
    }

    /// Fire a schedule manually, bypassing the timer but not the
    /// overlap guard. Returns the job id immediately; the fire runs on
    /// its own task.
    pub async fn run_now(self: &Arc<Self>, schedule_id: &str) -> Result<String> {
        let schedule = self
            .store
            .get_schedule(schedule_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("schedule {} not found", schedule_id)))?;
        if !self.try_begin(&schedule.id) {
            return Err(Error::Conflict("schedule is already running".to_string()));
        }

        let job_id = self.new_job(&schedule);
        let this = Arc::clone(self);
        let spawned_id = job_id.clone();
        tokio::spawn(async move {
            this.execute(&schedule, &spawned_id).await;
            this.finish(&schedule.id);
        });
        Ok(job_id)
    }

    async fn run_schedule(self: &Arc<Self>, schedule: &Schedule) {
        let job_id = self.new_job(schedule);
        self.execute(schedule, &job_id).await;
    }

    fn new_job(&self, schedule: &Schedule) -> String {
        let mut meta = HashMap::new();
        meta.insert("schedule_id".to_string(), schedule.id.clone());
        self.jobs.add_job(JobType::Snapshot, meta).id
    }

    /// Execute one fire: pre-hooks, snapshots, post-hooks, retention.
    async fn execute(&self, schedule: &Schedule, job_id: &str) {
        let job_id = job_id.to_string();
        self.jobs
            .update_job(&job_id, |j| j.state = JobState::Running);

        info!(schedule = %schedule.name, job = %job_id, "snapshot schedule fired");

        // Pre-hooks abort the job on failure.
        for hook in &schedule.pre_hooks {
            if let Err(e) = run_hook(hook).await {
                self.jobs
                    .add_log_entry(&job_id, LogLevel::Error, &format!("pre-hook failed: {}", e));
                self.jobs.update_job(&job_id, |j| {
                    j.state = JobState::Failed;
                    j.error = Some(format!("pre-hook failed: {}", e));
                    j.finished_at = Some(Utc::now());
                });
                self.audit.log(
                    AuditEvent::new(
                        "backup.schedule.run",
                        "backup",
                        Severity::Warning,
                        false,
                        "schedule aborted by pre-hook",
                    )
                    .target(&schedule.name),
                );
                return;
            }
        }

        let total = schedule.subvolumes.len().max(1);
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let suffix = match &schedule.tag {
            Some(tag) => format!("{}-{}", stamp, tag),
            None => stamp.to_string(),
        };

        let mut failed = false;
        for (done, subvolume) in schedule.subvolumes.iter().enumerate() {
            if self.jobs.is_canceled(&job_id) {
                self.jobs
                    .add_log_entry(&job_id, LogLevel::Warning, "canceled, stopping");
                return;
            }

            let name = format!("@snapshots/{}/{}", subvol_name(subvolume), suffix);
            match self
                .agent
                .btrfs_snapshot(&BtrfsSnapshotRequest {
                    path: subvolume.clone(),
                    name: name.clone(),
                })
                .await
            {
                Ok(resp) => {
                    self.jobs.add_log_entry(
                        &job_id,
                        LogLevel::Info,
                        &format!("snapshot {} created", resp.location),
                    );
                    let record = SnapshotRecord {
                        id: format!("{}:{}", schedule.id, name),
                        subvolume: subvolume.clone(),
                        location: resp.location,
                        created_at: resp.created_at,
                        size_bytes: resp.size_bytes,
                        read_only: resp.read_only,
                        tag: schedule.tag.clone(),
                        schedule_id: schedule.id.clone(),
                    };
                    if let Err(e) = self.store.add_snapshot(record).await {
                        warn!("could not persist snapshot record: {}", e);
                    }
                }
                Err(e) => {
                    failed = true;
                    self.jobs.add_log_entry(
                        &job_id,
                        LogLevel::Error,
                        &format!("snapshot of {} failed: {}", subvolume, e),
                    );
                }
            }

            let progress = (((done + 1) * 100) / total) as u8;
            self.jobs.update_job(&job_id, |j| j.progress = progress);
        }

        // Post-hook failures are logged, never fatal.
        for hook in &schedule.post_hooks {
            if let Err(e) = run_hook(hook).await {
                self.jobs
                    .add_log_entry(&job_id, LogLevel::Warning, &format!("post-hook failed: {}", e));
            }
        }

        self.apply_retention(schedule).await;

        self.jobs.update_job(&job_id, |j| {
            j.state = if failed {
                JobState::Failed
            } else {
                JobState::Succeeded
            };
            j.progress = 100;
            j.finished_at = Some(Utc::now());
        });
        self.audit.log(
            AuditEvent::new(
                "backup.schedule.run",
                "backup",
                if failed { Severity::Warning } else { Severity::Info },
                !failed,
                "schedule fire completed",
            )
            .target(&schedule.name)
            .detail("job_id", job_id.clone()),
        );
    }

    /// Delete everything outside the keep set. Failures leave the record
    /// in place for the next pass.
    pub async fn apply_retention(&self, schedule: &Schedule) {
        let now = Utc::now();
        for subvolume in &schedule.subvolumes {
            let records = self.store.snapshots_for(&schedule.id, subvolume).await;
            let keep = select_retention(&records, &schedule.retention, now);
            for doomed in deletion_candidates(&records, &keep) {
                match self
                    .agent
                    .snapshot_delete(&doomed.location, SnapshotBackend::Subvol)
                    .await
                {
                    Ok(_) => {
                        if let Err(e) = self.store.remove_snapshot(&doomed.id).await {
                            warn!("could not drop snapshot record: {}", e);
                        }
                        info!(snapshot = %doomed.id, "retention deleted snapshot");
                    }
                    Err(e) => {
                        warn!(snapshot = %doomed.id, "retention delete failed, will retry: {}", e);
                    }
                }
            }
        }
    }
}

fn subvol_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string())
}

/// Run a hook command (no shell, whitespace-split argv).
async fn run_hook(hook: &str) -> Result<()> {
    let mut parts = hook.split_whitespace();
    let Some(cmd) = parts.next() else {
        return Ok(());
    };
    let args: Vec<&str> = parts.collect();

    let output = tokio::time::timeout(
        HOOK_TIMEOUT,
        tokio::process::Command::new(cmd)
            .args(&args)
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| Error::Internal(format!("hook '{}' timed out", hook)))?
    .map_err(|e| Error::Internal(format!("hook '{}' failed to start: {}", hook, e)))?;

    if !output.status.success() {
        return Err(Error::Internal(format!(
            "hook '{}' exited {}: {}",
            hook,
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_frequency_projection() {
        assert_eq!(
            frequency_to_cron(&Frequency::Hourly { minute: 15 }),
            "15 * * * *"
        );
        assert_eq!(
            frequency_to_cron(&Frequency::Daily { minute: 30, hour: 2 }),
            "30 2 * * *"
        );
        assert_eq!(
            frequency_to_cron(&Frequency::Weekly {
                minute: 0,
                hour: 3,
                weekday: 1
            }),
            "0 3 * * 1"
        );
        assert_eq!(
            frequency_to_cron(&Frequency::Monthly {
                minute: 45,
                hour: 4,
                day: 15
            }),
            "45 4 15 * *"
        );
    }

    #[test]
    fn test_cron_parse_and_match() {
        let cron = CronSchedule::parse("30 2 * * *").unwrap();
        let hit = Utc.with_ymd_and_hms(2025, 8, 20, 2, 30, 0).unwrap();
        let miss = Utc.with_ymd_and_hms(2025, 8, 20, 2, 31, 0).unwrap();
        assert!(cron.matches(&hit));
        assert!(!cron.matches(&miss));

        assert!(CronSchedule::parse("61 * * * *").is_err());
        assert!(CronSchedule::parse("* * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
    }

    #[test]
    fn test_cron_steps_and_ranges() {
        let cron = CronSchedule::parse("*/15 8-17 * * 1-5").unwrap();
        let weekday_morning = Utc.with_ymd_and_hms(2025, 8, 20, 9, 45, 0).unwrap();
        assert!(cron.matches(&weekday_morning));
        let sunday = Utc.with_ymd_and_hms(2025, 8, 24, 9, 45, 0).unwrap();
        assert!(!cron.matches(&sunday));
    }

    #[test]
    fn test_next_fire_daily() {
        let freq = Frequency::Daily { minute: 30, hour: 2 };
        let after = Utc.with_ymd_and_hms(2025, 8, 20, 3, 0, 0).unwrap();
        let next = next_fire(&freq, &after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 8, 21, 2, 30, 0).unwrap());

        let before = Utc.with_ymd_and_hms(2025, 8, 20, 1, 0, 0).unwrap();
        let next = next_fire(&freq, &before).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 8, 20, 2, 30, 0).unwrap());
    }

    #[test]
    fn test_next_fire_weekly_lands_on_weekday() {
        let freq = Frequency::Weekly {
            minute: 0,
            hour: 3,
            weekday: 0,
        };
        let after = Utc.with_ymd_and_hms(2025, 8, 20, 0, 0, 0).unwrap();
        let next = next_fire(&freq, &after).unwrap().unwrap();
        assert_eq!(next.weekday().num_days_from_sunday(), 0);
        assert_eq!(next.hour(), 3);
    }

    #[test]
    fn test_overlap_guard() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = BackupScheduler::new(
            Arc::new(BackupStore::open(tmp.path()).unwrap()),
            Arc::new(JobManager::new()),
            Arc::new(AgentClient::new(tmp.path().join("agent.sock"))),
            Arc::new(crate::audit::AuditLog::new(tmp.path().join("audit")).unwrap()),
        );

        assert!(scheduler.try_begin("s1"));
        assert!(!scheduler.try_begin("s1"));
        assert!(scheduler.try_begin("s2"));
        scheduler.finish("s1");
        assert!(scheduler.try_begin("s1"));
    }

    #[test]
    fn test_subvol_name() {
        assert_eq!(subvol_name("/srv/data"), "data");
        assert_eq!(subvol_name("/"), "root");
    }

    #[tokio::test]
    async fn test_run_hook_success_and_failure() {
        run_hook("true").await.unwrap();
        assert!(run_hook("false").await.is_err());
        assert!(run_hook("/definitely/not/a/binary").await.is_err());
        run_hook("").await.unwrap();
    }
}
