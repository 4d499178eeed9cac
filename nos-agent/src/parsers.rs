//! Parsers for external tool output.
//!
//! The host tools report progress as human-oriented text; these functions
//! normalize the handful of lines the API exposes. Raw output is always
//! carried alongside the parsed fields.

use nos_common::agent::{BalanceStatus, PackageUpdate, ReplaceStatus};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

fn balance_chunks_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d+) out of (?:about )?(\d+) chunks balanced").expect("static regex")
    })
}

fn percent_left_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([0-9.]+)%\s+left").expect("static regex"))
}

fn percent_done_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([0-9.]+)%\s+done").expect("static regex"))
}

/// Parse `btrfs balance status <mount>` output.
pub fn parse_balance_status(raw: &str) -> BalanceStatus {
    let running = raw.lines().next().is_some_and(|l| l.contains("running"));

    let total = balance_chunks_re()
        .captures(raw)
        .map(|c| c[2].to_string());

    let percent = percent_done_re()
        .captures(raw)
        .and_then(|c| c[1].parse::<f64>().ok());

    // "88% left" against the chunk total gives the absolute remainder.
    let left = match (&total, percent_left_re().captures(raw)) {
        (Some(total), Some(c)) => {
            let pct: f64 = c[1].parse().unwrap_or(0.0);
            total
                .parse::<f64>()
                .ok()
                .map(|t| format!("{}", (t * pct / 100.0).round() as u64))
        }
        _ => None,
    };

    BalanceStatus {
        running,
        percent,
        left,
        total,
        raw: raw.to_string(),
    }
}

/// Parse `btrfs replace status <mount>` output.
pub fn parse_replace_status(raw: &str) -> ReplaceStatus {
    let finished = raw.contains("finished") || raw.contains("Never started");
    let percent = percent_done_re()
        .captures(raw)
        .and_then(|c| c[1].parse::<f64>().ok());
    let running = !finished && percent.is_some();

    static COPIED: OnceLock<Regex> = OnceLock::new();
    let copied_re =
        COPIED.get_or_init(|| Regex::new(r"(\d+)\s+out of\s+(\d+)").expect("static regex"));
    let (completed, total) = match copied_re.captures(raw) {
        Some(c) => (Some(c[1].to_string()), Some(c[2].to_string())),
        None => (None, None),
    };

    ReplaceStatus {
        running,
        percent,
        completed,
        total,
        raw: raw.to_string(),
    }
}

/// Parse `btrfs scrub status <mount>` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrubStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    pub raw: String,
}

pub fn parse_scrub_status(raw: &str) -> ScrubStatus {
    let running = raw.contains("running");
    let percent = percent_done_re()
        .captures(raw)
        .and_then(|c| c[1].parse::<f64>().ok());
    ScrubStatus {
        running,
        percent,
        raw: raw.to_string(),
    }
}

/// Parse package-manager simulate output into the pending update list.
///
/// Only `Inst` lines carry upgrades; `Conf`/`Remv` lines are ignored.
pub fn parse_updates_plan(raw: &str) -> Vec<PackageUpdate> {
    static INST: OnceLock<Regex> = OnceLock::new();
    let re = INST.get_or_init(|| {
        Regex::new(r"^Inst\s+(\S+)\s+\[([^\]]+)\]\s+\((\S+)\s+(.+?)\s+\[([^\]]+)\]\)")
            .expect("static regex")
    });

    raw.lines()
        .filter_map(|line| re.captures(line))
        .map(|c| PackageUpdate {
            name: c[1].to_string(),
            current: c[2].to_string(),
            candidate: c[3].to_string(),
            repo: c[4].to_string(),
            arch: c[5].to_string(),
        })
        .collect()
}

/// Parsed `btrfs filesystem usage` summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsUsage {
    pub size_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

/// Parse a size with binary suffix ("1.50GiB") into bytes.
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value.find(|c: char| c.is_ascii_alphabetic())?;
    let (num, unit) = value.split_at(split);
    let num: f64 = num.trim().parse().ok()?;
    let factor: f64 = match unit {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0_f64.powi(4),
        "PiB" => 1024.0_f64.powi(5),
        _ => return None,
    };
    Some((num * factor) as u64)
}

/// Parse `btrfs filesystem usage -b`-style overview lines.
pub fn parse_fs_usage(raw: &str) -> Option<FsUsage> {
    let mut size = None;
    let mut used = None;
    let mut free = None;

    for line in raw.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Device size:") {
            size = parse_field(rest);
        } else if let Some(rest) = line.strip_prefix("Used:") {
            used = parse_field(rest);
        } else if let Some(rest) = line.strip_prefix("Free (estimated):") {
            free = parse_field(rest.split("(min:").next().unwrap_or(rest));
        }
    }

    Some(FsUsage {
        size_bytes: size?,
        used_bytes: used?,
        free_bytes: free.unwrap_or(0),
    })
}

fn parse_field(rest: &str) -> Option<u64> {
    let token = rest.trim().split_whitespace().next()?;
    token.parse::<u64>().ok().or_else(|| parse_size(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BALANCE_RUNNING: &str = "Balance on '/mnt/p': running\n  120 out of about 1000 chunks balanced (123 considered),  88% left\n  12% done, 0 errors\n";

    #[test]
    fn test_balance_running() {
        let status = parse_balance_status(BALANCE_RUNNING);
        assert!(status.running);
        assert_eq!(status.total.as_deref(), Some("1000"));
        assert_eq!(status.left.as_deref(), Some("880"));
        let percent = status.percent.unwrap();
        assert!((percent - 12.0).abs() < 0.01);
        assert_eq!(status.raw, BALANCE_RUNNING);
    }

    #[test]
    fn test_balance_not_running() {
        let status = parse_balance_status("No balance found on '/mnt/p'\n");
        assert!(!status.running);
        assert!(status.percent.is_none());
        assert!(status.total.is_none());
    }

    #[test]
    fn test_replace_status_running() {
        let raw = "Status: 37.5% done, 0 write errs, 0 uncorr. read errs\n";
        let status = parse_replace_status(raw);
        assert!(status.running);
        assert!((status.percent.unwrap() - 37.5).abs() < 0.01);
    }

    #[test]
    fn test_replace_status_finished() {
        let raw = "Started on 20.May 10:00:00, finished on 20.May 11:00:00, 0 write errs\n";
        let status = parse_replace_status(raw);
        assert!(!status.running);
    }

    #[test]
    fn test_updates_plan_parses_inst_lines_only() {
        let raw = "Inst nosd [0.1.0] (0.2.0 stable [amd64])\nConf nos-web (1.0.0 stable [all])\n";
        let updates = parse_updates_plan(raw);
        assert_eq!(updates.len(), 1);
        let u = &updates[0];
        assert_eq!(u.name, "nosd");
        assert_eq!(u.current, "0.1.0");
        assert_eq!(u.candidate, "0.2.0");
        assert_eq!(u.arch, "amd64");
        assert_eq!(u.repo, "stable");
    }

    #[test]
    fn test_updates_plan_multiword_repo() {
        let raw = "Inst libfoo [1.0] (1.1 Debian:stable-security/stable-security [amd64])\n";
        let updates = parse_updates_plan(raw);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].repo, "Debian:stable-security/stable-security");
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("100B"), Some(100));
        assert_eq!(parse_size("1.00KiB"), Some(1024));
        assert_eq!(parse_size("2GiB"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("garbage"), None);
    }

    #[test]
    fn test_parse_fs_usage() {
        let raw = "Overall:\n    Device size:         107374182400\n    Used:                21474836480\n    Free (estimated):    85899345920  (min: 85899345920)\n";
        let usage = parse_fs_usage(raw).unwrap();
        assert_eq!(usage.size_bytes, 107374182400);
        assert_eq!(usage.used_bytes, 21474836480);
        assert_eq!(usage.free_bytes, 85899345920);
    }

    #[test]
    fn test_scrub_status() {
        let raw = "UUID: x\nStatus: running\n  33.00% done\n";
        let status = parse_scrub_status(raw);
        assert!(status.running);
        assert!((status.percent.unwrap() - 33.0).abs() < 0.01);
    }
}
