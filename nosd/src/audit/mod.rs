//! Audit logging
//!
//! Append-only, day-rotated JSONL files with an in-memory tail for recent
//! queries. Events are redacted before they ever reach disk. Writes are
//! best-effort: a failed append is logged to the process logger and the
//! event is dropped, never blocking the caller.

mod redact;

pub use redact::redact_map;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Days a day-file is kept before the housekeeper deletes it.
pub const RETENTION_DAYS: i64 = 90;

/// Events held in the in-memory tail.
pub const TAIL_CAPACITY: usize = 1000;

/// Audit severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// One immutable audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub code: String,
    pub category: String,
    pub severity: Severity,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub old_values: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub new_values: HashMap<String, Value>,
}

impl AuditEvent {
    /// Start an event; the remaining fields default to empty.
    pub fn new(code: &str, category: &str, severity: Severity, success: bool, message: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            user_id: None,
            username: None,
            session_id: None,
            ip: None,
            user_agent: None,
            code: code.to_string(),
            category: category.to_string(),
            severity,
            success,
            target: None,
            message: message.to_string(),
            details: HashMap::new(),
            old_values: HashMap::new(),
            new_values: HashMap::new(),
        }
    }

    pub fn user(mut self, user_id: &str, username: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self.username = Some(username.to_string());
        self
    }

    pub fn ip(mut self, ip: &str) -> Self {
        self.ip = Some(ip.to_string());
        self
    }

    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Query filters; all optional and combined with AND.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub ip: Option<String>,
    pub code: Option<String>,
    pub category: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl AuditQuery {
    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(ref user_id) = self.user_id {
            if event.user_id.as_deref() != Some(user_id.as_str()) {
                return false;
            }
        }
        if let Some(ref username) = self.username {
            let needle = username.to_lowercase();
            match event.username {
                Some(ref u) if u.to_lowercase().contains(&needle) => {}
                _ => return false,
            }
        }
        if let Some(ref ip) = self.ip {
            match event.ip {
                Some(ref i) if i.contains(ip.as_str()) => {}
                _ => return false,
            }
        }
        if let Some(ref code) = self.code {
            if !event.code.starts_with(code.as_str()) {
                return false;
            }
        }
        if let Some(ref category) = self.category {
            if event.category != *category {
                return false;
            }
        }
        if let Some(from) = self.from {
            if event.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if event.timestamp > to {
                return false;
            }
        }
        true
    }
}

/// Aggregated counts over a query window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditStats {
    pub total: usize,
    pub failures: usize,
    pub by_category: HashMap<String, usize>,
    pub by_severity: HashMap<String, usize>,
}

struct Inner {
    current: Option<(NaiveDate, File)>,
    tail: VecDeque<AuditEvent>,
}

/// The audit log.
pub struct AuditLog {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl AuditLog {
    pub fn new(dir: PathBuf) -> nos_common::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            inner: Mutex::new(Inner {
                current: None,
                tail: VecDeque::with_capacity(TAIL_CAPACITY),
            }),
        })
    }

    fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("audit-{}.json", date.format("%Y-%m-%d")))
    }

    /// Append one event. Redaction happens here, before persistence or the
    /// tail see the event.
    pub fn log(&self, mut event: AuditEvent) {
        redact::redact_event(&mut event);

        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Err(e) = self.append_locked(&mut inner, &event) {
            error!(code = %event.code, "audit append failed, dropping event: {}", e);
        }

        if inner.tail.len() == TAIL_CAPACITY {
            inner.tail.pop_front();
        }
        inner.tail.push_back(event);
    }

    fn append_locked(&self, inner: &mut Inner, event: &AuditEvent) -> nos_common::Result<()> {
        let today = event.timestamp.date_naive();

        let needs_open = match inner.current {
            Some((date, _)) => date != today,
            None => true,
        };
        if needs_open {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.file_for(today))?;
            inner.current = Some((today, file));
        }

        let (_, file) = inner.current.as_mut().ok_or_else(|| {
            nos_common::Error::Internal("audit file handle missing".to_string())
        })?;
        let line = serde_json::to_string(event)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        Ok(())
    }

    /// Most recent events from the in-memory tail, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.tail.iter().rev().take(limit).cloned().collect()
    }

    /// Query the persisted log.
    ///
    /// Day files that cannot overlap the requested range (with a one-day
    /// margin) are skipped without being read.
    pub fn query(&self, q: &AuditQuery) -> nos_common::Result<Vec<AuditEvent>> {
        let mut events = Vec::new();

        let mut dates: Vec<NaiveDate> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)?.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(date) = parse_file_date(&name) {
                dates.push(date);
            }
        }
        dates.sort();

        for date in dates {
            if let Some(from) = q.from {
                if date < (from - Duration::days(1)).date_naive() {
                    continue;
                }
            }
            if let Some(to) = q.to {
                if date > (to + Duration::days(1)).date_naive() {
                    continue;
                }
            }

            let raw = match std::fs::read_to_string(self.file_for(date)) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("skipping unreadable audit file for {}: {}", date, e);
                    continue;
                }
            };
            for line in raw.lines() {
                match serde_json::from_str::<AuditEvent>(line) {
                    Ok(event) if q.matches(&event) => events.push(event),
                    Ok(_) => {}
                    Err(e) => warn!("skipping malformed audit line: {}", e),
                }
            }
        }

        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let offset = q.offset.unwrap_or(0);
        let limit = q.limit.unwrap_or(100);
        Ok(events.into_iter().skip(offset).take(limit).collect())
    }

    /// Aggregate counts over a window; an empty window yields zeroes.
    pub fn stats(&self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> nos_common::Result<AuditStats> {
        let q = AuditQuery {
            from,
            to,
            limit: Some(usize::MAX),
            ..AuditQuery::default()
        };
        let events = self.query(&q)?;

        let mut stats = AuditStats {
            total: events.len(),
            ..AuditStats::default()
        };
        for event in &events {
            if !event.success {
                stats.failures += 1;
            }
            *stats.by_category.entry(event.category.clone()).or_insert(0) += 1;
            let sev = match event.severity {
                Severity::Info => "info",
                Severity::Warning => "warning",
                Severity::Critical => "critical",
            };
            *stats.by_severity.entry(sev.to_string()).or_insert(0) += 1;
        }
        Ok(stats)
    }

    /// Export a query result as CSV with a fixed column order.
    pub fn export_csv(&self, q: &AuditQuery) -> nos_common::Result<String> {
        let events = self.query(q)?;
        let mut out =
            String::from("timestamp,user,ip,code,category,severity,success,target,message\n");
        for e in events {
            let severity = match e.severity {
                Severity::Info => "info",
                Severity::Warning => "warning",
                Severity::Critical => "critical",
            };
            let row = [
                e.timestamp.to_rfc3339(),
                e.username.unwrap_or_default(),
                e.ip.unwrap_or_default(),
                e.code,
                e.category,
                severity.to_string(),
                e.success.to_string(),
                e.target.unwrap_or_default(),
                e.message,
            ];
            let escaped: Vec<String> = row.iter().map(|field| csv_escape(field)).collect();
            out.push_str(&escaped.join(","));
            out.push('\n');
        }
        Ok(out)
    }

    /// Housekeeping tick: force a handle rotation check and delete files
    /// past retention. Run hourly.
    pub fn housekeep(&self) {
        {
            let mut inner = match self.inner.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            let today = Utc::now().date_naive();
            if let Some((date, _)) = inner.current {
                if date != today {
                    inner.current = None;
                }
            }
        }

        let cutoff = Utc::now().date_naive() - Duration::days(RETENTION_DAYS);
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) => {
                warn!("audit housekeeping cannot read dir: {}", e);
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(date) = parse_file_date(&name) {
                if date < cutoff {
                    match std::fs::remove_file(entry.path()) {
                        Ok(()) => info!(file = %name, "expired audit file removed"),
                        Err(e) => warn!(file = %name, "could not remove audit file: {}", e),
                    }
                }
            }
        }
    }
}

fn parse_file_date(name: &str) -> Option<NaiveDate> {
    let date = name.strip_prefix("audit-")?.strip_suffix(".json")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_in(dir: &std::path::Path) -> AuditLog {
        AuditLog::new(dir.to_path_buf()).unwrap()
    }

    fn event(code: &str, username: &str) -> AuditEvent {
        AuditEvent::new(code, "auth", Severity::Info, true, "test event")
            .user("u1", username)
            .ip("192.168.1.50")
    }

    #[test]
    fn test_log_persists_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        let log = log_in(tmp.path());

        log.log(event("auth.login", "alice"));
        log.log(event("auth.login", "bob"));

        let file = tmp
            .path()
            .join(format!("audit-{}.json", Utc::now().format("%Y-%m-%d")));
        let content = std::fs::read_to_string(file).unwrap();
        assert_eq!(content.lines().count(), 2);
        for line in content.lines() {
            serde_json::from_str::<AuditEvent>(line).unwrap();
        }
    }

    #[test]
    fn test_recent_is_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let log = log_in(tmp.path());

        log.log(event("auth.login", "first"));
        log.log(event("auth.login", "second"));

        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].username.as_deref(), Some("second"));
    }

    #[test]
    fn test_query_filters() {
        let tmp = tempfile::tempdir().unwrap();
        let log = log_in(tmp.path());

        log.log(event("auth.login", "alice"));
        log.log(event("auth.failed", "alice"));
        log.log(event("snapshot.create", "bob"));

        let q = AuditQuery {
            code: Some("auth.".to_string()),
            ..AuditQuery::default()
        };
        let events = log.query(&q).unwrap();
        assert_eq!(events.len(), 2);

        let q = AuditQuery {
            username: Some("ALI".to_string()),
            ..AuditQuery::default()
        };
        assert_eq!(log.query(&q).unwrap().len(), 2);

        let q = AuditQuery {
            ip: Some("192.168".to_string()),
            limit: Some(1),
            ..AuditQuery::default()
        };
        assert_eq!(log.query(&q).unwrap().len(), 1);

        let q = AuditQuery {
            from: Some(Utc::now() + Duration::days(2)),
            ..AuditQuery::default()
        };
        assert!(log.query(&q).unwrap().is_empty());
    }

    #[test]
    fn test_redaction_applies_before_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let log = log_in(tmp.path());

        let mut e = event("user.update", "alice");
        e.details
            .insert("new_password".to_string(), Value::from("hunter2hunter2"));
        e.details
            .insert("email".to_string(), Value::from("alice@example.com"));
        log.log(e);

        let file = tmp
            .path()
            .join(format!("audit-{}.json", Utc::now().format("%Y-%m-%d")));
        let content = std::fs::read_to_string(file).unwrap();
        assert!(!content.contains("hunter2hunter2"));
        assert!(content.contains("***REDACTED***"));
        assert!(content.contains("al***@example.com"));
    }

    #[test]
    fn test_csv_export_column_order() {
        let tmp = tempfile::tempdir().unwrap();
        let log = log_in(tmp.path());
        log.log(event("auth.login", "alice"));

        let csv = log.export_csv(&AuditQuery::default()).unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "timestamp,user,ip,code,category,severity,success,target,message"
        );
        let row = lines.next().unwrap();
        assert!(row.contains("alice"));
        assert!(row.contains("auth.login"));
    }

    #[test]
    fn test_stats_empty_range_is_zeroed() {
        let tmp = tempfile::tempdir().unwrap();
        let log = log_in(tmp.path());
        log.log(event("auth.login", "alice"));

        let stats = log
            .stats(
                Some(Utc::now() + Duration::days(10)),
                Some(Utc::now() + Duration::days(11)),
            )
            .unwrap();
        assert_eq!(stats.total, 0);
        assert!(stats.by_category.is_empty());
    }

    #[test]
    fn test_housekeep_deletes_expired_files() {
        let tmp = tempfile::tempdir().unwrap();
        let log = log_in(tmp.path());

        let old = tmp.path().join("audit-2020-01-01.json");
        std::fs::write(&old, "{}\n").unwrap();
        log.housekeep();
        assert!(!old.exists());
    }
}
