//! SMART health probe.
//!
//! Normalizes `smartctl -j` output into the few fields the control plane
//! surfaces. Attribute layouts differ between ATA and NVMe devices; both
//! are handled, anything else comes back as empty options.

use nos_common::agent::SmartHealth;
use nos_common::{Error, Result};
use serde_json::Value;
use tracing::debug;

use crate::allowlist;
use crate::exec;

/// Query SMART health for one device.
pub async fn smart_health(device: &str) -> Result<SmartHealth> {
    if !allowlist::is_device_path(device) {
        return Err(Error::InvalidInput(format!("{} is not a device path", device)));
    }

    let result = exec::run_tool("smartctl", &["-j", "-a", device], exec::PROBE_TIMEOUT)
        .await
        .map_err(|e| match e {
            Error::Internal(msg) if msg.contains("failed to spawn") => {
                Error::NotImplemented("smartctl not available".to_string())
            }
            other => other,
        })?;

    // smartctl uses non-zero exits for advisory bits; only a missing or
    // unreadable device produces empty output.
    if result.stdout.trim().is_empty() {
        return Err(Error::NotFound(format!("no SMART data for {}", device)));
    }

    let json: Value = serde_json::from_str(&result.stdout)
        .map_err(|e| Error::Internal(format!("smartctl output: {}", e)))?;

    Ok(normalize(&json))
}

fn normalize(json: &Value) -> SmartHealth {
    let passed = json
        .pointer("/smart_status/passed")
        .and_then(Value::as_bool);
    let temperature_c = json
        .pointer("/temperature/current")
        .and_then(Value::as_i64);
    let power_on_hours = json
        .pointer("/power_on_time/hours")
        .and_then(Value::as_i64);

    // ATA: attribute 5 is the reallocated sector count.
    let reallocated = json
        .pointer("/ata_smart_attributes/table")
        .and_then(Value::as_array)
        .and_then(|table| {
            table
                .iter()
                .find(|attr| attr.get("id").and_then(Value::as_i64) == Some(5))
        })
        .and_then(|attr| attr.pointer("/raw/value"))
        .and_then(Value::as_i64);

    // NVMe: the health log carries media errors directly.
    let media_errors = json
        .pointer("/nvme_smart_health_information_log/media_errors")
        .and_then(Value::as_i64);

    debug!(?passed, ?temperature_c, "smart data normalized");
    SmartHealth {
        passed,
        temperature_c,
        power_on_hours,
        reallocated,
        media_errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_ata() {
        let json: Value = serde_json::from_str(
            r#"{
                "smart_status": {"passed": true},
                "temperature": {"current": 34},
                "power_on_time": {"hours": 12345},
                "ata_smart_attributes": {"table": [
                    {"id": 1, "raw": {"value": 0}},
                    {"id": 5, "raw": {"value": 7}}
                ]}
            }"#,
        )
        .unwrap();

        let health = normalize(&json);
        assert_eq!(health.passed, Some(true));
        assert_eq!(health.temperature_c, Some(34));
        assert_eq!(health.power_on_hours, Some(12345));
        assert_eq!(health.reallocated, Some(7));
        assert_eq!(health.media_errors, None);
    }

    #[test]
    fn test_normalize_nvme() {
        let json: Value = serde_json::from_str(
            r#"{
                "smart_status": {"passed": false},
                "nvme_smart_health_information_log": {"media_errors": 3}
            }"#,
        )
        .unwrap();

        let health = normalize(&json);
        assert_eq!(health.passed, Some(false));
        assert_eq!(health.media_errors, Some(3));
        assert_eq!(health.reallocated, None);
    }

    #[tokio::test]
    async fn test_rejects_non_device_path() {
        let err = smart_health("/etc/passwd").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
