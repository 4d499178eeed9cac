//! GFS retention selection.
//!
//! Given one subvolume's snapshots (newest first), the keep set is the
//! union of the daily, weekly, monthly, and yearly buckets, with a
//! `min_keep` floor of the newest regardless of age. Everything outside
//! the keep set is a deletion candidate.

use super::{Retention, SnapshotRecord};
use chrono::{DateTime, Datelike, Duration, Utc};
use std::collections::HashSet;

/// Compute the ids to keep. `records` must be sorted newest first.
pub fn select_retention(
    records: &[SnapshotRecord],
    policy: &Retention,
    now: DateTime<Utc>,
) -> HashSet<String> {
    let mut keep: HashSet<String> = HashSet::new();

    // Daily bucket: the newest `days` snapshots younger than days*24h.
    let day_cutoff = now - Duration::hours(24 * policy.days as i64);
    for record in records
        .iter()
        .filter(|r| r.created_at > day_cutoff)
        .take(policy.days)
    {
        keep.insert(record.id.clone());
    }

    // Weekly bucket: one per ISO week label within weeks*7d.
    let week_cutoff = now - Duration::hours(24 * 7 * policy.weeks as i64);
    let mut week_labels: HashSet<String> = HashSet::new();
    for record in records.iter().filter(|r| r.created_at > week_cutoff) {
        let iso = record.created_at.iso_week();
        let label = format!("{}-W{:02}", iso.year(), iso.week());
        if week_labels.len() >= policy.weeks && !week_labels.contains(&label) {
            continue;
        }
        if week_labels.insert(label) {
            keep.insert(record.id.clone());
        }
    }

    // Monthly bucket: one per calendar month within months*30d.
    let month_cutoff = now - Duration::hours(24 * 30 * policy.months as i64);
    let mut month_labels: HashSet<String> = HashSet::new();
    for record in records.iter().filter(|r| r.created_at > month_cutoff) {
        let label = format!("{}-{:02}", record.created_at.year(), record.created_at.month());
        if month_labels.len() >= policy.months && !month_labels.contains(&label) {
            continue;
        }
        if month_labels.insert(label) {
            keep.insert(record.id.clone());
        }
    }

    // Yearly bucket: one per year within years*365d.
    let year_cutoff = now - Duration::hours(24 * 365 * policy.years as i64);
    let mut year_labels: HashSet<i32> = HashSet::new();
    for record in records.iter().filter(|r| r.created_at > year_cutoff) {
        let label = record.created_at.year();
        if year_labels.len() >= policy.years && !year_labels.contains(&label) {
            continue;
        }
        if year_labels.insert(label) {
            keep.insert(record.id.clone());
        }
    }

    // Floor: the newest min_keep snapshots survive regardless of age.
    for record in records.iter().take(policy.min_keep) {
        keep.insert(record.id.clone());
    }

    keep
}

/// Deletion candidates, oldest first.
pub fn deletion_candidates<'a>(
    records: &'a [SnapshotRecord],
    keep: &HashSet<String>,
) -> Vec<&'a SnapshotRecord> {
    let mut doomed: Vec<&SnapshotRecord> =
        records.iter().filter(|r| !keep.contains(&r.id)).collect();
    doomed.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    doomed
}
