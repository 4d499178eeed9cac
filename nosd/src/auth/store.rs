//! On-disk auth state.
//!
//! Users, password hashes, TOTP secrets, reset tokens, and lockouts live
//! in separate JSON documents under the data directory (0700), each file
//! 0600 and rewritten atomically on every mutation. Password material is
//! never stored in the same document as the user record.

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use nos_common::{fsatomic, Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;

use super::totp::{RecoveryCode, TotpSecret};

/// Failures before a lockout engages.
pub const LOCKOUT_THRESHOLD: u32 = 5;
/// Lockout duration.
pub const LOCKOUT_MINUTES: i64 = 30;
/// Reset token lifetime.
pub const RESET_TOKEN_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Operator,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Operator => "operator",
            Role::Viewer => "viewer",
        }
    }
}

/// A user record. The password hash lives in a separate document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub role: Role,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login_ip: Option<String>,
    pub password_changed_at: DateTime<Utc>,
    pub force_password_change: bool,
    pub two_factor_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub two_factor_setup_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_logins: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PasswordRecord {
    hash: String,
    #[serde(default)]
    history: Vec<String>,
}

fn load_doc<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

fn save_doc<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    fsatomic::write_atomic_with(&fsatomic::RealFs, path, &data, 0o600)
}

/// Make the state directory private to the daemon user.
pub fn ensure_secure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// User records plus the separate password-hash document.
pub struct UserStore {
    users_path: PathBuf,
    passwords_path: PathBuf,
    users: RwLock<HashMap<String, User>>,
    passwords: RwLock<HashMap<String, PasswordRecord>>,
}

impl UserStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        ensure_secure_dir(data_dir)?;
        let users_path = data_dir.join("users.json");
        let passwords_path = data_dir.join("passwords.json");
        Ok(Self {
            users: RwLock::new(load_doc(&users_path)?),
            passwords: RwLock::new(load_doc(&passwords_path)?),
            users_path,
            passwords_path,
        })
    }

    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }

    pub async fn get(&self, id: &str) -> Option<User> {
        self.users.read().await.get(id).cloned()
    }

    pub async fn get_by_username(&self, username: &str) -> Option<User> {
        let needle = username.to_lowercase();
        self.users
            .read()
            .await
            .values()
            .find(|u| u.username.to_lowercase() == needle)
            .cloned()
    }

    pub async fn list(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.read().await.values().cloned().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    /// Create a user; usernames are unique case-insensitively.
    pub async fn create(
        &self,
        username: &str,
        email: Option<String>,
        role: Role,
        password_hash: String,
        force_password_change: bool,
    ) -> Result<User> {
        if username.is_empty()
            || !username
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(Error::InvalidInput(format!("invalid username {:?}", username)));
        }
        if self.get_by_username(username).await.is_some() {
            return Err(Error::Conflict(format!("user {} already exists", username)));
        }

        let now = Utc::now();
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            email,
            role,
            enabled: true,
            created_at: now,
            updated_at: now,
            last_login_at: None,
            last_login_ip: None,
            password_changed_at: now,
            force_password_change,
            two_factor_enabled: false,
            two_factor_setup_at: None,
            locked_until: None,
            failed_logins: 0,
        };

        {
            let mut users = self.users.write().await;
            users.insert(user.id.clone(), user.clone());
            save_doc(&self.users_path, &*users)?;
        }
        {
            let mut passwords = self.passwords.write().await;
            passwords.insert(
                user.id.clone(),
                PasswordRecord {
                    hash: password_hash,
                    history: Vec::new(),
                },
            );
            save_doc(&self.passwords_path, &*passwords)?;
        }
        Ok(user)
    }

    /// Replace a user record wholesale.
    pub async fn update(&self, user: User) -> Result<()> {
        let mut users = self.users.write().await;
        if !users.contains_key(&user.id) {
            return Err(Error::NotFound(format!("user {} not found", user.id)));
        }
        let mut user = user;
        user.updated_at = Utc::now();
        users.insert(user.id.clone(), user);
        save_doc(&self.users_path, &*users)
    }

    async fn enabled_admins_excluding(&self, exclude_id: &str) -> usize {
        self.users
            .read()
            .await
            .values()
            .filter(|u| u.enabled && u.role == Role::Admin && u.id != exclude_id)
            .count()
    }

    /// Disable or enable a user; the last enabled admin cannot be disabled.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<User> {
        let user = self
            .get(id)
            .await
            .ok_or_else(|| Error::NotFound(format!("user {} not found", id)))?;
        if !enabled
            && user.role == Role::Admin
            && user.enabled
            && self.enabled_admins_excluding(id).await == 0
        {
            return Err(Error::Conflict(
                "cannot disable the last enabled admin".to_string(),
            ));
        }
        let mut user = user;
        user.enabled = enabled;
        self.update(user.clone()).await?;
        Ok(user)
    }

    /// Delete a user and its password record.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let user = self
            .get(id)
            .await
            .ok_or_else(|| Error::NotFound(format!("user {} not found", id)))?;
        if user.role == Role::Admin
            && user.enabled
            && self.enabled_admins_excluding(id).await == 0
        {
            return Err(Error::Conflict(
                "cannot delete the last enabled admin".to_string(),
            ));
        }

        {
            let mut users = self.users.write().await;
            users.remove(id);
            save_doc(&self.users_path, &*users)?;
        }
        {
            let mut passwords = self.passwords.write().await;
            passwords.remove(id);
            save_doc(&self.passwords_path, &*passwords)?;
        }
        Ok(())
    }

    pub async fn password_hash(&self, id: &str) -> Option<String> {
        self.passwords.read().await.get(id).map(|r| r.hash.clone())
    }

    pub async fn password_history(&self, id: &str) -> Vec<String> {
        self.passwords
            .read()
            .await
            .get(id)
            .map(|r| r.history.clone())
            .unwrap_or_default()
    }

    /// Store a new password hash, pushing the old one into history.
    pub async fn set_password(&self, id: &str, hash: String) -> Result<()> {
        {
            let mut passwords = self.passwords.write().await;
            let record = passwords.entry(id.to_string()).or_default();
            if !record.hash.is_empty() {
                record.history.insert(0, record.hash.clone());
                record.history.truncate(10);
            }
            record.hash = hash;
            save_doc(&self.passwords_path, &*passwords)?;
        }

        if let Some(mut user) = self.get(id).await {
            user.password_changed_at = Utc::now();
            user.force_password_change = false;
            self.update(user).await?;
        }
        Ok(())
    }
}

/// Per-user failure counters and lockouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lockout {
    pub failed_logins: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Lockout {
    fn default() -> Self {
        Self {
            failed_logins: 0,
            locked_until: None,
            updated_at: Utc::now(),
        }
    }
}

pub struct LockoutStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, Lockout>>,
}

impl LockoutStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        ensure_secure_dir(data_dir)?;
        let path = data_dir.join("lockouts.json");
        Ok(Self {
            entries: RwLock::new(load_doc(&path)?),
            path,
        })
    }

    /// Active lockout deadline for a user, if any.
    pub async fn locked_until(&self, username: &str) -> Option<DateTime<Utc>> {
        let entries = self.entries.read().await;
        entries
            .get(username)
            .and_then(|l| l.locked_until)
            .filter(|until| *until > Utc::now())
    }

    pub async fn failed_logins(&self, username: &str) -> u32 {
        self.entries
            .read()
            .await
            .get(username)
            .map(|l| l.failed_logins)
            .unwrap_or(0)
    }

    /// Record a failure; at the threshold the account locks.
    pub async fn record_failure(&self, username: &str) -> Result<Option<DateTime<Utc>>> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(username.to_string()).or_default();
        entry.failed_logins += 1;
        entry.updated_at = Utc::now();
        if entry.failed_logins >= LOCKOUT_THRESHOLD {
            entry.locked_until = Some(Utc::now() + Duration::minutes(LOCKOUT_MINUTES));
        }
        let locked = entry.locked_until;
        save_doc(&self.path, &*entries)?;
        Ok(locked)
    }

    /// Reset the counter and lockout (successful login or admin unlock).
    pub async fn clear(&self, username: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.remove(username).is_some() {
            save_doc(&self.path, &*entries)?;
        }
        Ok(())
    }

    /// Drop entries untouched for a day.
    pub async fn sweep(&self) -> Result<()> {
        let cutoff = Utc::now() - Duration::hours(24);
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, l| l.updated_at > cutoff);
        if entries.len() != before {
            save_doc(&self.path, &*entries)?;
        }
        Ok(())
    }
}

/// Password reset tokens; at most one live token per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetToken {
    pub id: String,
    pub user_id: String,
    pub token_hash: String,
    pub method: ResetMethod,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
    pub request_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_ip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetMethod {
    Email,
    Console,
}

pub struct ResetTokenStore {
    path: PathBuf,
    tokens: RwLock<HashMap<String, ResetToken>>,
}

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

impl ResetTokenStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        ensure_secure_dir(data_dir)?;
        let path = data_dir.join("reset_tokens.json");
        Ok(Self {
            tokens: RwLock::new(load_doc(&path)?),
            path,
        })
    }

    /// Issue a token for a user, superseding any live one. Returns the
    /// plaintext exactly once.
    pub async fn create(
        &self,
        user_id: &str,
        method: ResetMethod,
        request_ip: &str,
    ) -> Result<(String, ResetToken)> {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let plaintext = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);

        let now = Utc::now();
        let token = ResetToken {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            token_hash: hash_token(&plaintext),
            method,
            created_at: now,
            expires_at: now + Duration::minutes(RESET_TOKEN_MINUTES),
            used_at: None,
            request_ip: request_ip.to_string(),
            reset_ip: None,
        };

        let mut tokens = self.tokens.write().await;
        tokens.retain(|_, t| {
            !(t.user_id == user_id && t.used_at.is_none() && t.expires_at > now)
        });
        tokens.insert(token.id.clone(), token.clone());
        save_doc(&self.path, &*tokens)?;
        Ok((plaintext, token))
    }

    /// Consume a token, marking it used.
    pub async fn consume(&self, plaintext: &str, reset_ip: &str) -> Result<ResetToken> {
        let hash = hash_token(plaintext);
        let now = Utc::now();

        let mut tokens = self.tokens.write().await;
        let token = tokens
            .values_mut()
            .find(|t| {
                t.token_hash.as_bytes().ct_eq(hash.as_bytes()).into()
                    && t.used_at.is_none()
                    && t.expires_at > now
            })
            .ok_or_else(|| Error::NotFound("invalid or expired reset token".to_string()))?;

        token.used_at = Some(now);
        token.reset_ip = Some(reset_ip.to_string());
        let consumed = token.clone();
        save_doc(&self.path, &*tokens)?;
        Ok(consumed)
    }

    /// Drop expired tokens.
    pub async fn sweep(&self) -> Result<()> {
        let now = Utc::now();
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, t| t.expires_at > now && t.used_at.is_none());
        if tokens.len() != before {
            save_doc(&self.path, &*tokens)?;
        }
        Ok(())
    }
}

/// Verified TOTP secrets plus in-memory pending enrollments.
pub struct TotpStore {
    path: PathBuf,
    secrets: RwLock<HashMap<String, TotpSecret>>,
    pending: Mutex<HashMap<String, TotpSecret>>,
}

impl TotpStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        ensure_secure_dir(data_dir)?;
        let path = data_dir.join("totp.json");
        Ok(Self {
            secrets: RwLock::new(load_doc(&path)?),
            path,
            pending: Mutex::new(HashMap::new()),
        })
    }

    fn pending_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TotpSecret>> {
        match self.pending.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Stage an enrollment; nothing is persisted yet.
    pub fn begin_enrollment(&self, user_id: &str, secret: TotpSecret) {
        self.pending_lock().insert(user_id.to_string(), secret);
    }

    pub fn pending_secret(&self, user_id: &str) -> Option<TotpSecret> {
        self.pending_lock().get(user_id).cloned()
    }

    /// Move a pending enrollment into the permanent store.
    pub async fn promote(&self, user_id: &str) -> Result<TotpSecret> {
        let mut staged = self
            .pending_lock()
            .remove(user_id)
            .ok_or_else(|| Error::NotFound("no pending 2FA enrollment".to_string()))?;
        staged.verified = true;

        let mut secrets = self.secrets.write().await;
        secrets.insert(user_id.to_string(), staged.clone());
        save_doc(&self.path, &*secrets)?;
        Ok(staged)
    }

    pub async fn get(&self, user_id: &str) -> Option<TotpSecret> {
        self.secrets.read().await.get(user_id).cloned()
    }

    /// Erase secret and codes (2FA disable).
    pub async fn remove(&self, user_id: &str) -> Result<()> {
        self.pending_lock().remove(user_id);
        let mut secrets = self.secrets.write().await;
        if secrets.remove(user_id).is_some() {
            save_doc(&self.path, &*secrets)?;
        }
        Ok(())
    }

    /// Try a recovery code; a hit marks it used forever.
    pub async fn use_recovery_code(&self, user_id: &str, code: &str) -> Result<bool> {
        let mut secrets = self.secrets.write().await;
        let Some(secret) = secrets.get_mut(user_id) else {
            return Ok(false);
        };

        let hit = secret.backup_codes.iter_mut().find(|rc| {
            rc.used_at.is_none() && rc.code.as_bytes().ct_eq(code.as_bytes()).into()
        });
        match hit {
            Some(rc) => {
                rc.used_at = Some(Utc::now());
                save_doc(&self.path, &*secrets)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace the whole recovery-code set.
    pub async fn replace_codes(&self, user_id: &str, codes: Vec<RecoveryCode>) -> Result<Vec<RecoveryCode>> {
        let mut secrets = self.secrets.write().await;
        let secret = secrets
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound("2FA not enabled".to_string()))?;
        secret.backup_codes = codes.clone();
        save_doc(&self.path, &*secrets)?;
        Ok(codes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::totp;

    async fn user_store(dir: &Path) -> UserStore {
        UserStore::open(dir).unwrap()
    }

    #[tokio::test]
    async fn test_create_unique_usernames_ci() {
        let tmp = tempfile::tempdir().unwrap();
        let store = user_store(tmp.path()).await;

        store
            .create("Alice", None, Role::Admin, "plain:x".into(), false)
            .await
            .unwrap();
        let err = store
            .create("alice", None, Role::Viewer, "plain:y".into(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        assert!(store.get_by_username("ALICE").await.is_some());
    }

    #[tokio::test]
    async fn test_password_separate_from_user_doc() {
        let tmp = tempfile::tempdir().unwrap();
        let store = user_store(tmp.path()).await;
        let user = store
            .create("bob", None, Role::Operator, "plain:sekret".into(), false)
            .await
            .unwrap();

        let users_raw = std::fs::read_to_string(tmp.path().join("users.json")).unwrap();
        assert!(!users_raw.contains("sekret"));

        let hash = store.password_hash(&user.id).await.unwrap();
        assert_eq!(hash, "plain:sekret");
    }

    #[tokio::test]
    async fn test_last_admin_protected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = user_store(tmp.path()).await;
        let admin = store
            .create("root", None, Role::Admin, "plain:x".into(), false)
            .await
            .unwrap();

        assert!(store.set_enabled(&admin.id, false).await.is_err());
        assert!(store.delete(&admin.id).await.is_err());

        let admin2 = store
            .create("root2", None, Role::Admin, "plain:y".into(), false)
            .await
            .unwrap();
        store.set_enabled(&admin.id, false).await.unwrap();
        assert!(store.set_enabled(&admin2.id, false).await.is_err());
    }

    #[tokio::test]
    async fn test_set_password_keeps_history() {
        let tmp = tempfile::tempdir().unwrap();
        let store = user_store(tmp.path()).await;
        let user = store
            .create("eve", None, Role::Viewer, "plain:first".into(), true)
            .await
            .unwrap();

        store.set_password(&user.id, "plain:second".into()).await.unwrap();
        assert_eq!(store.password_hash(&user.id).await.unwrap(), "plain:second");
        assert_eq!(store.password_history(&user.id).await, vec!["plain:first"]);

        // A successful change clears the forced-change flag.
        assert!(!store.get(&user.id).await.unwrap().force_password_change);
    }

    #[tokio::test]
    async fn test_store_reload_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = user_store(tmp.path()).await;
            store
                .create("persist", None, Role::Admin, "plain:x".into(), false)
                .await
                .unwrap();
        }
        let store = user_store(tmp.path()).await;
        assert!(store.get_by_username("persist").await.is_some());
    }

    #[tokio::test]
    async fn test_lockout_threshold_and_clear() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LockoutStore::open(tmp.path()).unwrap();

        for _ in 0..LOCKOUT_THRESHOLD - 1 {
            assert!(store.record_failure("alice").await.unwrap().is_none());
        }
        let locked = store.record_failure("alice").await.unwrap();
        assert!(locked.is_some());
        assert!(store.locked_until("alice").await.is_some());

        store.clear("alice").await.unwrap();
        assert!(store.locked_until("alice").await.is_none());
        assert_eq!(store.failed_logins("alice").await, 0);
    }

    #[tokio::test]
    async fn test_reset_token_single_live_and_one_shot() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ResetTokenStore::open(tmp.path()).unwrap();

        let (first, _) = store
            .create("u1", ResetMethod::Console, "10.0.0.1")
            .await
            .unwrap();
        let (second, _) = store
            .create("u1", ResetMethod::Console, "10.0.0.1")
            .await
            .unwrap();

        // The first token was superseded.
        assert!(store.consume(&first, "10.0.0.2").await.is_err());

        let consumed = store.consume(&second, "10.0.0.2").await.unwrap();
        assert!(consumed.used_at.is_some());
        assert_eq!(consumed.reset_ip.as_deref(), Some("10.0.0.2"));

        // One-shot.
        assert!(store.consume(&second, "10.0.0.3").await.is_err());
    }

    #[tokio::test]
    async fn test_totp_pending_to_verified() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TotpStore::open(tmp.path()).unwrap();

        let staged = TotpSecret {
            secret: totp::generate_secret(),
            verified: false,
            backup_codes: totp::generate_recovery_codes(),
        };
        store.begin_enrollment("u1", staged);

        assert!(store.get("u1").await.is_none());
        let promoted = store.promote("u1").await.unwrap();
        assert!(promoted.verified);
        assert!(store.get("u1").await.is_some());

        // Promote twice: the pending slot is gone.
        let err = store.promote("u1").await.unwrap_err();
        assert!(err.to_string().contains("no pending 2FA enrollment"));
    }

    #[tokio::test]
    async fn test_recovery_code_single_use() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TotpStore::open(tmp.path()).unwrap();

        let staged = TotpSecret {
            secret: totp::generate_secret(),
            verified: false,
            backup_codes: totp::generate_recovery_codes(),
        };
        let code = staged.backup_codes[0].code.clone();
        store.begin_enrollment("u1", staged);
        store.promote("u1").await.unwrap();

        assert!(store.use_recovery_code("u1", &code).await.unwrap());
        assert!(!store.use_recovery_code("u1", &code).await.unwrap());
    }
}
