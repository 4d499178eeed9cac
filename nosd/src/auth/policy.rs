//! Password policy
//!
//! Violations carry a specific reason so the UI can tell the user what to
//! fix rather than echoing a generic rejection.

use nos_common::{Error, Result};

/// Minimum password length.
pub const MIN_LENGTH: usize = 12;

/// Policy knobs beyond the fixed composition rules.
#[derive(Debug, Clone, Default)]
pub struct PasswordPolicy {
    /// Require at least one special character.
    pub require_special: bool,
    /// Maximum password age in days, enforced by the caller on login.
    pub max_age_days: Option<u32>,
    /// How many previous hashes a new password is checked against.
    pub reuse_window: usize,
}

impl PasswordPolicy {
    /// Check a candidate password for `username` against the policy.
    pub fn check(&self, username: &str, password: &str) -> Result<()> {
        if password.len() < MIN_LENGTH {
            return Err(Error::InvalidInput(format!(
                "password must be at least {} characters",
                MIN_LENGTH
            )));
        }
        if !password.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(Error::InvalidInput(
                "password must contain an uppercase letter".to_string(),
            ));
        }
        if !password.chars().any(|c| c.is_ascii_lowercase()) {
            return Err(Error::InvalidInput(
                "password must contain a lowercase letter".to_string(),
            ));
        }
        if !password.chars().any(|c| c.is_ascii_digit()) {
            return Err(Error::InvalidInput(
                "password must contain a digit".to_string(),
            ));
        }
        if self.require_special && password.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::InvalidInput(
                "password must contain a special character".to_string(),
            ));
        }
        if !username.is_empty()
            && password.to_lowercase().contains(&username.to_lowercase())
        {
            return Err(Error::InvalidInput(
                "password must not contain the username".to_string(),
            ));
        }
        Ok(())
    }

    /// Check a candidate against the reuse window of previous hashes.
    pub fn check_reuse(&self, password: &str, previous_hashes: &[String]) -> Result<()> {
        for hash in previous_hashes.iter().take(self.reuse_window) {
            if super::password::verify_password(password, hash)? {
                return Err(Error::InvalidInput(
                    "password was used recently".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PasswordPolicy {
        PasswordPolicy::default()
    }

    #[test]
    fn test_accepts_compliant_password() {
        policy().check("alice", "Sufficient1Length").unwrap();
    }

    #[test]
    fn test_rejects_with_specific_reasons() {
        let p = policy();

        let err = p.check("alice", "Short1A").unwrap_err();
        assert!(err.to_string().contains("at least 12"));

        let err = p.check("alice", "nouppercase123456").unwrap_err();
        assert!(err.to_string().contains("uppercase"));

        let err = p.check("alice", "NOLOWERCASE123456").unwrap_err();
        assert!(err.to_string().contains("lowercase"));

        let err = p.check("alice", "NoDigitsHereAtAll").unwrap_err();
        assert!(err.to_string().contains("digit"));

        let err = p.check("alice", "ContainsAlice123").unwrap_err();
        assert!(err.to_string().contains("username"));
    }

    #[test]
    fn test_special_requirement_is_optional() {
        let mut p = policy();
        p.check("u", "AllAlnum12345").unwrap();

        p.require_special = true;
        let err = p.check("u", "AllAlnum12345").unwrap_err();
        assert!(err.to_string().contains("special"));
        p.check("u", "WithSpecial12345!").unwrap();
    }

    #[test]
    fn test_username_match_is_case_insensitive() {
        let err = policy().check("Admin", "GreatADMINpass12").unwrap_err();
        assert!(err.to_string().contains("username"));
    }

    #[test]
    fn test_reuse_window() {
        let p = PasswordPolicy {
            reuse_window: 2,
            ..PasswordPolicy::default()
        };
        let old = super::super::password::hash_password("OldPassword1234").unwrap();
        assert!(p.check_reuse("OldPassword1234", &[old.clone()]).is_err());
        assert!(p.check_reuse("FreshPassword123", &[old]).is_ok());
    }
}
