//! Redaction of sensitive material before events are persisted.

use serde_json::Value;
use std::collections::HashMap;

const REDACTED: &str = "***REDACTED***";

const SENSITIVE_MARKERS: [&str; 5] = ["password", "token", "secret", "key", "credential"];

fn key_is_sensitive(key: &str) -> bool {
    let key = key.to_lowercase();
    SENSITIVE_MARKERS.iter().any(|m| key.contains(m))
}

/// Mask an email, keeping two characters of the local part and the domain.
fn mask_email(value: &str) -> String {
    match value.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
            let kept: String = local.chars().take(2).collect();
            format!("{}***@{}", kept, domain)
        }
        _ => value.to_string(),
    }
}

fn looks_like_email(value: &str) -> bool {
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.contains(' ')
        }
        None => false,
    }
}

/// Redact one key/value map in place.
pub fn redact_map(map: &mut HashMap<String, Value>) {
    for (key, value) in map.iter_mut() {
        if key_is_sensitive(key) {
            *value = Value::from(REDACTED);
            continue;
        }
        if let Value::String(s) = value {
            if looks_like_email(s) {
                *value = Value::from(mask_email(s));
            }
        }
    }
}

/// Redact every value-carrying map of an event.
pub fn redact_event(event: &mut super::AuditEvent) {
    redact_map(&mut event.details);
    redact_map(&mut event.old_values);
    redact_map(&mut event.new_values);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn test_sensitive_keys_redacted() {
        let mut m = map(&[
            ("password", "x"),
            ("newPassword", "y"),
            ("api_token", "z"),
            ("SecretValue", "s"),
            ("ssh_key", "k"),
            ("credential_id", "c"),
            ("harmless", "visible"),
        ]);
        redact_map(&mut m);

        for key in [
            "password",
            "newPassword",
            "api_token",
            "SecretValue",
            "ssh_key",
            "credential_id",
        ] {
            assert_eq!(m[key], Value::from(REDACTED), "key {} must be redacted", key);
        }
        assert_eq!(m["harmless"], Value::from("visible"));
    }

    #[test]
    fn test_email_masking() {
        assert_eq!(mask_email("alice@example.com"), "al***@example.com");
        assert_eq!(mask_email("a@example.com"), "a***@example.com");
        assert_eq!(mask_email("not-an-email"), "not-an-email");
    }

    #[test]
    fn test_email_values_masked_in_place() {
        let mut m = map(&[("contact", "robert@example.org"), ("note", "plain text")]);
        redact_map(&mut m);
        assert_eq!(m["contact"], Value::from("ro***@example.org"));
        assert_eq!(m["note"], Value::from("plain text"));
    }

    #[test]
    fn test_non_string_values_survive() {
        let mut m = HashMap::new();
        m.insert("count".to_string(), Value::from(42));
        redact_map(&mut m);
        assert_eq!(m["count"], Value::from(42));
    }
}
