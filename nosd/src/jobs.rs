//! Job manager
//!
//! In-memory table of background job records behind a single lock.
//! Executors update progress and logs through it; cancellation flips the
//! state and the executing task is expected to observe it and return.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Entries kept per job log ring.
pub const LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Snapshot,
    Replicate,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Canceled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// One background job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub state: JobState,
    /// 0..=100
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_done: Option<u64>,
    pub logs: Vec<JobLogEntry>,
    /// Type-specific fields (schedule id, destination id, paths).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub meta: HashMap<String, String>,
}

impl Job {
    fn new(job_type: JobType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_type,
            state: JobState::Pending,
            progress: 0,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            bytes_total: None,
            bytes_done: None,
            logs: Vec::new(),
            meta: HashMap::new(),
        }
    }
}

/// Thread-safe job table.
pub struct JobManager {
    jobs: Mutex<HashMap<String, Job>>,
}

impl JobManager {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Job>> {
        match self.jobs.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Create a job and return its id.
    pub fn add_job(&self, job_type: JobType, meta: HashMap<String, String>) -> Job {
        let mut job = Job::new(job_type);
        job.meta = meta;
        self.lock().insert(job.id.clone(), job.clone());
        job
    }

    /// Apply a mutation to a job under the lock.
    pub fn update_job<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.lock();
        match jobs.get_mut(id) {
            Some(job) => {
                f(job);
                true
            }
            None => false,
        }
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.lock().get(id).cloned()
    }

    pub fn list_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.lock().values().cloned().collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs
    }

    pub fn list_recent(&self, limit: usize) -> Vec<Job> {
        self.list_jobs().into_iter().take(limit).collect()
    }

    /// Cancel a pending or running job. Terminal jobs are left alone.
    pub fn cancel_job(&self, id: &str) -> bool {
        let mut jobs = self.lock();
        match jobs.get_mut(id) {
            Some(job) if !job.state.is_terminal() => {
                job.state = JobState::Canceled;
                job.finished_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// True once a job has been canceled; executors poll this at their
    /// child-process boundaries.
    pub fn is_canceled(&self, id: &str) -> bool {
        self.lock()
            .get(id)
            .map(|j| j.state == JobState::Canceled)
            .unwrap_or(false)
    }

    /// Append a log line with ring-trim semantics (newest kept).
    pub fn add_log_entry(&self, id: &str, level: LogLevel, message: &str) {
        self.update_job(id, |job| {
            if job.logs.len() == LOG_CAPACITY {
                job.logs.remove(0);
            }
            job.logs.push(JobLogEntry {
                ts: Utc::now(),
                level,
                message: message.to_string(),
            });
        });
    }

    /// Drop completed jobs older than the retention window.
    pub fn prune_completed(&self, older_than: Duration) {
        let cutoff = Utc::now() - older_than;
        self.lock().retain(|_, job| {
            !(job.state.is_terminal()
                && job.finished_at.map(|t| t < cutoff).unwrap_or(false))
        });
    }
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}
