//! Session and token lifecycle.
//!
//! Session ids are 32 random bytes, refresh tokens 64, both
//! base64url-encoded. The refresh token never leaves the process; the
//! browser carries an AES-GCM-sealed cookie holding only the session id,
//! plus a CSRF value echoed as a header on mutating requests.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use nos_common::{fsatomic, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;

use super::store::Role;

const B64: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::URL_SAFE_NO_PAD;

fn random_token(bytes: usize) -> String {
    use rand::RngCore;
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    B64.encode(buf)
}

/// One authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub username: String,
    pub role: Role,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub ip: String,
    pub user_agent: String,
    pub two_factor_verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevated_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Never serialized to clients; lives only in the store document.
    pub refresh_token: String,
    pub token_version: u32,
    pub csrf_token: String,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_elevated(&self, now: DateTime<Utc>) -> bool {
        self.elevated_until.map(|t| t > now).unwrap_or(false)
    }
}

/// Session table with on-disk persistence.
pub struct SessionStore {
    path: PathBuf,
    sessions: RwLock<HashMap<String, Session>>,
    session_hours: i64,
    elevation_minutes: i64,
}

impl SessionStore {
    pub fn open(data_dir: &Path, session_hours: i64, elevation_minutes: i64) -> Result<Self> {
        super::store::ensure_secure_dir(data_dir)?;
        let path = data_dir.join("sessions.json");
        let sessions: HashMap<String, Session> = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            sessions: RwLock::new(sessions),
            session_hours,
            elevation_minutes,
        })
    }

    fn persist(&self, sessions: &HashMap<String, Session>) -> Result<()> {
        let data = serde_json::to_vec_pretty(sessions)?;
        fsatomic::write_atomic_with(&fsatomic::RealFs, &self.path, &data, 0o600)
    }

    /// Create a session after a successful authentication.
    pub async fn create(
        &self,
        user_id: &str,
        username: &str,
        role: Role,
        ip: &str,
        user_agent: &str,
        two_factor_verified: bool,
    ) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            id: random_token(32),
            user_id: user_id.to_string(),
            username: username.to_string(),
            role,
            issued_at: now,
            expires_at: now + Duration::hours(self.session_hours),
            last_seen_at: now,
            ip: ip.to_string(),
            user_agent: user_agent.to_string(),
            two_factor_verified,
            elevated_until: two_factor_verified
                .then(|| now + Duration::minutes(self.elevation_minutes)),
            scopes: Vec::new(),
            refresh_token: random_token(64),
            token_version: 1,
            csrf_token: random_token(32),
        };

        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id.clone(), session.clone());
        self.persist(&sessions)?;
        Ok(session)
    }

    /// Validate a session id, bumping `last_seen_at`.
    pub async fn validate(&self, id: &str) -> Result<Session> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or(Error::NotFound("session not found".to_string()))?;
        if session.is_expired(now) {
            let expired_id = session.id.clone();
            sessions.remove(&expired_id);
            self.persist(&sessions)?;
            return Err(Error::NotAllowed("session expired".to_string()));
        }
        session.last_seen_at = now;
        Ok(session.clone())
    }

    /// Rotate the refresh token. Refusal for disabled users is enforced by
    /// the caller, which looks the user up first.
    pub async fn refresh(&self, id: &str, refresh_token: &str) -> Result<Session> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or(Error::NotFound("session not found".to_string()))?;
        if session.is_expired(now) {
            return Err(Error::NotAllowed("session expired".to_string()));
        }
        let matches: bool = session
            .refresh_token
            .as_bytes()
            .ct_eq(refresh_token.as_bytes())
            .into();
        if !matches {
            return Err(Error::NotAllowed("refresh token mismatch".to_string()));
        }

        session.refresh_token = random_token(64);
        session.token_version += 1;
        session.expires_at = now + Duration::hours(self.session_hours);
        session.last_seen_at = now;
        let rotated = session.clone();
        self.persist(&sessions)?;
        Ok(rotated)
    }

    /// Mark the second factor verified and start the elevated window.
    pub async fn elevate(&self, id: &str) -> Result<Session> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or(Error::NotFound("session not found".to_string()))?;
        session.two_factor_verified = true;
        session.elevated_until = Some(now + Duration::minutes(self.elevation_minutes));
        let elevated = session.clone();
        self.persist(&sessions)?;
        Ok(elevated)
    }

    pub async fn revoke(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(id).is_some() {
            self.persist(&sessions)?;
        }
        Ok(())
    }

    /// Destroy every session of one user (disable, password reset).
    pub async fn revoke_user(&self, user_id: &str) -> Result<usize> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.user_id != user_id);
        let removed = before - sessions.len();
        if removed > 0 {
            self.persist(&sessions)?;
        }
        Ok(removed)
    }

    /// Drop expired sessions.
    pub async fn sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        let removed = before - sessions.len();
        if removed > 0 {
            self.persist(&sessions)?;
        }
        Ok(removed)
    }

    pub async fn list_for_user(&self, user_id: &str) -> Vec<Session> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }
}

/// Seals session ids into an encrypted, authenticated cookie value.
pub struct CookieSealer {
    cipher: Aes256Gcm,
}

impl CookieSealer {
    /// Load (or create) the cookie key under the data directory.
    pub fn open(data_dir: &Path) -> Result<Self> {
        super::store::ensure_secure_dir(data_dir)?;
        let key_path = data_dir.join("cookie.key");
        let key_bytes: Vec<u8> = match std::fs::read(&key_path) {
            Ok(bytes) if bytes.len() == 32 => bytes,
            Ok(_) => return Err(Error::Internal("cookie key has wrong length".to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                use rand::RngCore;
                let mut bytes = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                fsatomic::write_atomic_with(&fsatomic::RealFs, &key_path, &bytes, 0o600)?;
                bytes
            }
            Err(e) => return Err(e.into()),
        };

        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Seal a session id: base64url(nonce || ciphertext).
    pub fn seal(&self, session_id: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, session_id.as_bytes())
            .map_err(|_| Error::Internal("cookie seal failed".to_string()))?;
        let mut out = nonce.to_vec();
        out.extend(ciphertext);
        Ok(B64.encode(out))
    }

    /// Open a sealed cookie back into a session id.
    pub fn open_sealed(&self, cookie: &str) -> Result<String> {
        let raw = B64
            .decode(cookie)
            .map_err(|_| Error::NotAllowed("malformed session cookie".to_string()))?;
        if raw.len() < 12 {
            return Err(Error::NotAllowed("malformed session cookie".to_string()));
        }
        let (nonce, ciphertext) = raw.split_at(12);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::NotAllowed("session cookie rejected".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|_| Error::NotAllowed("session cookie rejected".to_string()))
    }
}

/// Constant-time CSRF comparison.
pub fn csrf_matches(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(dir: &Path) -> SessionStore {
        SessionStore::open(dir, 24, 15).unwrap()
    }

    #[tokio::test]
    async fn test_create_token_shapes() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path()).await;
        let session = s
            .create("u1", "alice", Role::Admin, "10.0.0.1", "curl", false)
            .await
            .unwrap();

        // 32 bytes → 43 chars base64url, 64 bytes → 86.
        assert_eq!(session.id.len(), 43);
        assert_eq!(session.refresh_token.len(), 86);
        assert!(!session.two_factor_verified);
        assert!(session.elevated_until.is_none());
        assert_eq!(session.token_version, 1);
    }

    #[tokio::test]
    async fn test_two_factor_login_starts_elevated() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path()).await;
        let session = s
            .create("u1", "alice", Role::Admin, "ip", "ua", true)
            .await
            .unwrap();
        assert!(session.is_elevated(Utc::now()));
    }

    #[tokio::test]
    async fn test_refresh_rotates_and_bumps_version() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path()).await;
        let session = s
            .create("u1", "alice", Role::Viewer, "ip", "ua", false)
            .await
            .unwrap();

        let rotated = s.refresh(&session.id, &session.refresh_token).await.unwrap();
        assert_ne!(rotated.refresh_token, session.refresh_token);
        assert_eq!(rotated.token_version, 2);

        // The old token is dead.
        assert!(s.refresh(&session.id, &session.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn test_validate_rejects_expired() {
        let tmp = tempfile::tempdir().unwrap();
        let s = SessionStore::open(tmp.path(), 0, 15).unwrap();
        let session = s
            .create("u1", "alice", Role::Viewer, "ip", "ua", false)
            .await
            .unwrap();
        assert!(s.validate(&session.id).await.is_err());
    }

    #[tokio::test]
    async fn test_revoke_user_destroys_all() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path()).await;
        s.create("u1", "a", Role::Viewer, "ip", "ua", false).await.unwrap();
        s.create("u1", "a", Role::Viewer, "ip", "ua", false).await.unwrap();
        s.create("u2", "b", Role::Viewer, "ip", "ua", false).await.unwrap();

        assert_eq!(s.revoke_user("u1").await.unwrap(), 2);
        assert_eq!(s.list_for_user("u1").await.len(), 0);
        assert_eq!(s.list_for_user("u2").await.len(), 1);
    }

    #[tokio::test]
    async fn test_sessions_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let id = {
            let s = store(tmp.path()).await;
            s.create("u1", "a", Role::Admin, "ip", "ua", false)
                .await
                .unwrap()
                .id
        };
        let s = store(tmp.path()).await;
        assert!(s.validate(&id).await.is_ok());
    }

    #[test]
    fn test_cookie_seal_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let sealer = CookieSealer::open(tmp.path()).unwrap();

        let sealed = sealer.seal("session-id-123").unwrap();
        assert_ne!(sealed, "session-id-123");
        assert_eq!(sealer.open_sealed(&sealed).unwrap(), "session-id-123");
    }

    #[test]
    fn test_cookie_tamper_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let sealer = CookieSealer::open(tmp.path()).unwrap();

        let sealed = sealer.seal("session-id-123").unwrap();
        let mut raw = B64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = B64.encode(raw);
        assert!(sealer.open_sealed(&tampered).is_err());
        assert!(sealer.open_sealed("garbage!").is_err());
    }

    #[test]
    fn test_csrf_compare() {
        assert!(csrf_matches("abc", "abc"));
        assert!(!csrf_matches("abc", "abd"));
        assert!(!csrf_matches("abc", "ab"));
    }
}
