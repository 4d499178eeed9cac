//! Authentication and authorization core.
//!
//! `AuthManager` owns the login flow end to end: per-IP rate limiting,
//! per-user lockouts, password verification, the second factor, session
//! issuance, and the audit trail. Every success produces exactly one
//! `auth.login` event; every failure exactly one `auth.failed`.

pub mod password;
pub mod policy;
pub mod ratelimit;
pub mod sessions;
pub mod store;
pub mod totp;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditLog, Severity};
use crate::error::{codes, ApiError, ApiResult};
use policy::PasswordPolicy;
use ratelimit::LoginRateLimiter;
use sessions::{Session, SessionStore};
use store::{LockoutStore, ResetMethod, ResetTokenStore, Role, TotpStore, User, UserStore};
use totp::TotpSecret;

/// One login attempt as received from the transport.
#[derive(Debug, Clone)]
pub struct LoginAttempt {
    pub username: String,
    pub password: String,
    pub totp_code: Option<String>,
    pub ip: String,
    pub user_agent: String,
}

/// Result of a successful login.
#[derive(Debug, Clone, Serialize)]
pub struct LoginOutcome {
    pub session_id: String,
    pub csrf_token: String,
    pub username: String,
    pub role: Role,
    pub force_password_change: bool,
    pub two_factor_verified: bool,
}

/// TOTP enrollment material shown to the user once.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentSetup {
    pub secret: String,
    pub qr_code_uri: String,
    pub backup_codes: Vec<String>,
}

/// Well-formed hash verified for unknown usernames so the failure path
/// costs the same as a real mismatch.
const DUMMY_HASH: &str = "$argon2id$v=19$m=65536,t=1,p=4$AAAAAAAAAAAAAAAAAAAAAA$AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

pub struct AuthManager {
    pub users: Arc<UserStore>,
    pub sessions: Arc<SessionStore>,
    pub totp: Arc<TotpStore>,
    pub reset_tokens: Arc<ResetTokenStore>,
    pub lockouts: Arc<LockoutStore>,
    pub limiter: Arc<LoginRateLimiter>,
    pub audit: Arc<AuditLog>,
    pub policy: PasswordPolicy,
}

impl AuthManager {
    fn audit_failure(&self, attempt: &LoginAttempt, reason: &str) {
        self.audit.log(
            AuditEvent::new(
                "auth.failed",
                "auth",
                Severity::Warning,
                false,
                "authentication failed",
            )
            .ip(&attempt.ip)
            .detail("username", attempt.username.clone())
            .detail("reason", reason),
        );
    }

    /// Authenticate and create a session.
    pub async fn login(&self, attempt: LoginAttempt) -> ApiResult<LoginOutcome> {
        if let Err(retry_after_sec) = self.limiter.check(&attempt.ip) {
            self.audit_failure(&attempt, "rate_limited");
            return Err(ApiError::RateLimited { retry_after_sec });
        }

        let Some(user) = self.users.get_by_username(&attempt.username).await else {
            // Burn the same verification cost for unknown users.
            let _ = password::verify_password(&attempt.password, DUMMY_HASH);
            self.audit_failure(&attempt, "unknown_user");
            return Err(ApiError::Unauthorized(codes::INVALID_CREDENTIALS));
        };

        if let Some(until) = self.lockouts.locked_until(&user.username).await {
            self.audit_failure(&attempt, "locked");
            warn!(username = %user.username, until = %until, "login attempt on locked account");
            return Err(ApiError::Unauthorized(codes::ACCOUNT_LOCKED));
        }

        if !user.enabled {
            self.audit_failure(&attempt, "disabled");
            return Err(ApiError::Unauthorized(codes::INVALID_CREDENTIALS));
        }

        let hash = self.users.password_hash(&user.id).await.unwrap_or_default();
        if !password::verify_password(&attempt.password, &hash).map_err(ApiError::from)? {
            let locked = self
                .lockouts
                .record_failure(&user.username)
                .await
                .map_err(ApiError::from)?;
            self.audit_failure(
                &attempt,
                if locked.is_some() {
                    "bad_password_locked"
                } else {
                    "bad_password"
                },
            );
            return Err(ApiError::Unauthorized(codes::INVALID_CREDENTIALS));
        }

        let mut two_factor_verified = false;
        if user.two_factor_enabled {
            let Some(code) = attempt.totp_code.as_deref() else {
                // Not a failed credential: the client must present the
                // second factor. No lockout increment, but one audit line.
                self.audit_failure(&attempt, "2fa_required");
                return Err(ApiError::Unauthorized(codes::TWO_FACTOR_REQUIRED));
            };
            if !self.verify_second_factor(&user.id, code).await? {
                let _ = self.lockouts.record_failure(&user.username).await;
                self.audit_failure(&attempt, "bad_2fa");
                return Err(ApiError::Unauthorized(codes::INVALID_CREDENTIALS));
            }
            two_factor_verified = true;
        }

        self.lockouts
            .clear(&user.username)
            .await
            .map_err(ApiError::from)?;
        self.limiter.clear(&attempt.ip);

        let session = self
            .sessions
            .create(
                &user.id,
                &user.username,
                user.role,
                &attempt.ip,
                &attempt.user_agent,
                two_factor_verified,
            )
            .await
            .map_err(ApiError::from)?;

        let mut updated = user.clone();
        updated.last_login_at = Some(Utc::now());
        updated.last_login_ip = Some(attempt.ip.clone());
        updated.failed_logins = 0;
        self.users.update(updated).await.map_err(ApiError::from)?;

        self.audit.log(
            AuditEvent::new("auth.login", "auth", Severity::Info, true, "user logged in")
                .user(&user.id, &user.username)
                .session(&session.id)
                .ip(&attempt.ip),
        );
        info!(username = %user.username, "login succeeded");

        // An aged-out password turns into a forced change at login.
        let password_expired = self
            .policy
            .max_age_days
            .map(|days| user.password_changed_at + chrono::Duration::days(days as i64) < Utc::now())
            .unwrap_or(false);

        Ok(LoginOutcome {
            session_id: session.id,
            csrf_token: session.csrf_token,
            username: user.username,
            role: user.role,
            force_password_change: user.force_password_change || password_expired,
            two_factor_verified,
        })
    }

    /// A TOTP code or a one-shot recovery code.
    async fn verify_second_factor(&self, user_id: &str, code: &str) -> ApiResult<bool> {
        if let Some(secret) = self.totp.get(user_id).await {
            if totp::verify_totp(&secret.secret, code) {
                return Ok(true);
            }
        }
        self.totp
            .use_recovery_code(user_id, code)
            .await
            .map_err(ApiError::from)
    }

    /// Validate a session id from the sealed cookie.
    pub async fn validate_session(&self, session_id: &str) -> ApiResult<Session> {
        self.sessions
            .validate(session_id)
            .await
            .map_err(|_| ApiError::Unauthorized(codes::SESSION_EXPIRED))
    }

    /// Rotate the refresh token; refused when the user was disabled.
    pub async fn refresh(&self, session_id: &str, refresh_token: &str) -> ApiResult<Session> {
        let session = self
            .sessions
            .validate(session_id)
            .await
            .map_err(|_| ApiError::Unauthorized(codes::SESSION_EXPIRED))?;
        let user = self
            .users
            .get(&session.user_id)
            .await
            .ok_or(ApiError::Unauthorized(codes::SESSION_EXPIRED))?;
        if !user.enabled {
            self.sessions
                .revoke_user(&user.id)
                .await
                .map_err(ApiError::from)?;
            return Err(ApiError::Unauthorized(codes::SESSION_EXPIRED));
        }
        self.sessions
            .refresh(session_id, refresh_token)
            .await
            .map_err(|_| ApiError::Unauthorized(codes::SESSION_EXPIRED))
    }

    /// Second-factor check on an existing session; starts the elevated
    /// window for privileged actions.
    pub async fn elevate(&self, session_id: &str, code: &str) -> ApiResult<Session> {
        let session = self.validate_session(session_id).await?;
        if !self.verify_second_factor(&session.user_id, code).await? {
            self.audit.log(
                AuditEvent::new(
                    "auth.elevate",
                    "auth",
                    Severity::Warning,
                    false,
                    "elevation rejected",
                )
                .user(&session.user_id, &session.username)
                .session(session_id),
            );
            return Err(ApiError::Unauthorized(codes::INVALID_CREDENTIALS));
        }
        let elevated = self
            .sessions
            .elevate(session_id)
            .await
            .map_err(ApiError::from)?;
        self.audit.log(
            AuditEvent::new("auth.elevate", "auth", Severity::Info, true, "session elevated")
                .user(&session.user_id, &session.username)
                .session(session_id),
        );
        Ok(elevated)
    }

    pub async fn logout(&self, session: &Session) -> ApiResult<()> {
        self.sessions
            .revoke(&session.id)
            .await
            .map_err(ApiError::from)?;
        self.audit.log(
            AuditEvent::new("auth.logout", "auth", Severity::Info, true, "user logged out")
                .user(&session.user_id, &session.username)
                .session(&session.id),
        );
        Ok(())
    }

    /// Stage TOTP enrollment; nothing becomes active until verification.
    pub async fn enroll_totp(&self, user: &User) -> ApiResult<EnrollmentSetup> {
        if user.two_factor_enabled {
            return Err(ApiError::Conflict("2FA already enabled".to_string()));
        }

        let secret = totp::generate_secret();
        let backup_codes = totp::generate_recovery_codes();
        let codes_plain: Vec<String> = backup_codes.iter().map(|c| c.code.clone()).collect();

        self.totp.begin_enrollment(
            &user.id,
            TotpSecret {
                secret: secret.clone(),
                verified: false,
                backup_codes,
            },
        );

        Ok(EnrollmentSetup {
            qr_code_uri: totp::provisioning_uri(&user.username, &secret),
            secret,
            backup_codes: codes_plain,
        })
    }

    /// Verify the staged enrollment, flipping the user to 2FA-enabled.
    pub async fn verify_totp_enrollment(&self, user: &User, code: &str) -> ApiResult<()> {
        let staged = self
            .totp
            .pending_secret(&user.id)
            .ok_or_else(|| ApiError::NotFound("no pending 2FA enrollment".to_string()))?;
        if !totp::verify_totp(&staged.secret, code) {
            return Err(ApiError::InvalidInput("invalid verification code".to_string()));
        }

        self.totp.promote(&user.id).await.map_err(ApiError::from)?;

        let mut updated = user.clone();
        updated.two_factor_enabled = true;
        updated.two_factor_setup_at = Some(Utc::now());
        self.users.update(updated).await.map_err(ApiError::from)?;

        self.audit.log(
            AuditEvent::new("auth.2fa.enabled", "auth", Severity::Info, true, "2FA enabled")
                .user(&user.id, &user.username),
        );
        Ok(())
    }

    /// Disable 2FA: requires the current password and, when provided, a
    /// valid code. Secret and recovery codes are erased.
    pub async fn disable_totp(
        &self,
        user: &User,
        current_password: &str,
        code: Option<&str>,
    ) -> ApiResult<()> {
        self.require_password(user, current_password).await?;
        if let Some(code) = code {
            if !self.verify_second_factor(&user.id, code).await? {
                return Err(ApiError::Unauthorized(codes::INVALID_CREDENTIALS));
            }
        }

        self.totp.remove(&user.id).await.map_err(ApiError::from)?;
        let mut updated = user.clone();
        updated.two_factor_enabled = false;
        updated.two_factor_setup_at = None;
        self.users.update(updated).await.map_err(ApiError::from)?;

        self.audit.log(
            AuditEvent::new(
                "auth.2fa.disabled",
                "auth",
                Severity::Warning,
                true,
                "2FA disabled",
            )
            .user(&user.id, &user.username),
        );
        Ok(())
    }

    /// Regenerate the recovery-code set; requires reauthentication.
    pub async fn regenerate_recovery_codes(
        &self,
        user: &User,
        current_password: &str,
    ) -> ApiResult<Vec<String>> {
        self.require_password(user, current_password).await?;
        let codes = totp::generate_recovery_codes();
        let plain: Vec<String> = codes.iter().map(|c| c.code.clone()).collect();
        self.totp
            .replace_codes(&user.id, codes)
            .await
            .map_err(ApiError::from)?;
        self.audit.log(
            AuditEvent::new(
                "auth.2fa.codes_regenerated",
                "auth",
                Severity::Info,
                true,
                "recovery codes regenerated",
            )
            .user(&user.id, &user.username),
        );
        Ok(plain)
    }

    async fn require_password(&self, user: &User, presented: &str) -> ApiResult<()> {
        let hash = self.users.password_hash(&user.id).await.unwrap_or_default();
        if !password::verify_password(presented, &hash).map_err(ApiError::from)? {
            return Err(ApiError::Unauthorized(codes::INVALID_CREDENTIALS));
        }
        Ok(())
    }

    /// Change the password of a logged-in user.
    pub async fn change_password(
        &self,
        user: &User,
        current: &str,
        new_password: &str,
    ) -> ApiResult<()> {
        self.require_password(user, current).await?;
        self.policy
            .check(&user.username, new_password)
            .map_err(ApiError::from)?;
        let history = self.users.password_history(&user.id).await;
        self.policy
            .check_reuse(new_password, &history)
            .map_err(ApiError::from)?;

        let hash = password::hash_password(new_password).map_err(ApiError::from)?;
        self.users
            .set_password(&user.id, hash)
            .await
            .map_err(ApiError::from)?;

        self.audit.log(
            AuditEvent::new(
                "auth.password.changed",
                "auth",
                Severity::Info,
                true,
                "password changed",
            )
            .user(&user.id, &user.username),
        );
        Ok(())
    }

    /// Issue a password-reset token. The plaintext is returned for the
    /// console method; email delivery is outside this daemon.
    pub async fn request_password_reset(
        &self,
        username: &str,
        method: ResetMethod,
        ip: &str,
    ) -> ApiResult<Option<String>> {
        let Some(user) = self.users.get_by_username(username).await else {
            // Do not reveal whether the account exists.
            return Ok(None);
        };

        let (plaintext, _) = self
            .reset_tokens
            .create(&user.id, method, ip)
            .await
            .map_err(ApiError::from)?;

        self.audit.log(
            AuditEvent::new(
                "auth.password.reset_requested",
                "auth",
                Severity::Info,
                true,
                "password reset requested",
            )
            .user(&user.id, &user.username)
            .ip(ip),
        );

        Ok(match method {
            ResetMethod::Console => Some(plaintext),
            ResetMethod::Email => None,
        })
    }

    /// Consume a reset token and set a new password. All of the user's
    /// sessions are destroyed.
    pub async fn reset_password(&self, token: &str, new_password: &str, ip: &str) -> ApiResult<()> {
        let consumed = self
            .reset_tokens
            .consume(token, ip)
            .await
            .map_err(|_| ApiError::Unauthorized(codes::INVALID_CREDENTIALS))?;
        let user = self
            .users
            .get(&consumed.user_id)
            .await
            .ok_or_else(|| ApiError::NotFound("user not found".to_string()))?;

        self.policy
            .check(&user.username, new_password)
            .map_err(ApiError::from)?;
        let hash = password::hash_password(new_password).map_err(ApiError::from)?;
        self.users
            .set_password(&user.id, hash)
            .await
            .map_err(ApiError::from)?;
        self.sessions
            .revoke_user(&user.id)
            .await
            .map_err(ApiError::from)?;
        self.lockouts
            .clear(&user.username)
            .await
            .map_err(ApiError::from)?;

        self.audit.log(
            AuditEvent::new(
                "auth.password.reset",
                "auth",
                Severity::Warning,
                true,
                "password reset via token",
            )
            .user(&user.id, &user.username)
            .ip(ip),
        );
        Ok(())
    }

    /// Admin-only lockout clear.
    pub async fn unlock_user(&self, actor: &Session, username: &str) -> ApiResult<()> {
        if actor.role != Role::Admin {
            return Err(ApiError::Forbidden("admin role required".to_string()));
        }
        self.lockouts
            .clear(username)
            .await
            .map_err(ApiError::from)?;
        self.audit.log(
            AuditEvent::new("auth.unlock", "auth", Severity::Warning, true, "lockout cleared")
                .user(&actor.user_id, &actor.username)
                .target(username),
        );
        Ok(())
    }

    /// Disable a user and destroy their sessions.
    pub async fn disable_user(&self, actor: &Session, user_id: &str) -> ApiResult<User> {
        if actor.role != Role::Admin {
            return Err(ApiError::Forbidden("admin role required".to_string()));
        }
        let user = self
            .users
            .set_enabled(user_id, false)
            .await
            .map_err(ApiError::from)?;
        self.sessions
            .revoke_user(user_id)
            .await
            .map_err(ApiError::from)?;
        self.audit.log(
            AuditEvent::new("user.disabled", "user", Severity::Warning, true, "user disabled")
                .user(&actor.user_id, &actor.username)
                .target(&user.username),
        );
        Ok(user)
    }

    /// Hourly sweep: expired sessions, reset tokens, stale lockouts and
    /// login-attempt entries.
    pub async fn sweep(&self) {
        if let Ok(n) = self.sessions.sweep().await {
            if n > 0 {
                info!(expired = n, "sessions swept");
            }
        }
        if let Err(e) = self.reset_tokens.sweep().await {
            warn!("reset token sweep failed: {}", e);
        }
        if let Err(e) = self.lockouts.sweep().await {
            warn!("lockout sweep failed: {}", e);
        }
        self.limiter.sweep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditQuery;

    async fn manager(dir: &std::path::Path) -> AuthManager {
        AuthManager {
            users: Arc::new(UserStore::open(dir).unwrap()),
            sessions: Arc::new(SessionStore::open(dir, 24, 15).unwrap()),
            totp: Arc::new(TotpStore::open(dir).unwrap()),
            reset_tokens: Arc::new(ResetTokenStore::open(dir).unwrap()),
            lockouts: Arc::new(LockoutStore::open(dir).unwrap()),
            limiter: Arc::new(LoginRateLimiter::new()),
            audit: Arc::new(AuditLog::new(dir.join("audit")).unwrap()),
            policy: PasswordPolicy::default(),
        }
    }

    async fn seed_user(m: &AuthManager, username: &str, password: &str) -> User {
        let hash = password::hash_password(password).unwrap();
        m.users
            .create(username, None, Role::Admin, hash, false)
            .await
            .unwrap()
    }

    fn attempt(username: &str, password: &str) -> LoginAttempt {
        LoginAttempt {
            username: username.to_string(),
            password: password.to_string(),
            totp_code: None,
            ip: "10.1.2.3".to_string(),
            user_agent: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_login_success_emits_one_login_event() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path()).await;
        seed_user(&m, "alice", "CorrectHorse12").await;

        let outcome = m.login(attempt("alice", "CorrectHorse12")).await.unwrap();
        assert_eq!(outcome.username, "alice");
        assert!(!outcome.two_factor_verified);

        let events = m
            .audit
            .query(&AuditQuery {
                code: Some("auth.login".to_string()),
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].success);
    }

    #[tokio::test]
    async fn test_login_failure_emits_one_failed_event() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path()).await;
        seed_user(&m, "alice", "CorrectHorse12").await;

        let err = m.login(attempt("alice", "wrong")).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));

        let events = m
            .audit
            .query(&AuditQuery {
                code: Some("auth.failed".to_string()),
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].success);
    }

    #[tokio::test]
    async fn test_lockout_after_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path()).await;
        seed_user(&m, "alice", "CorrectHorse12").await;

        for _ in 0..store::LOCKOUT_THRESHOLD {
            let _ = m.login(attempt("alice", "wrong")).await;
        }
        let err = m.login(attempt("alice", "CorrectHorse12")).await.unwrap_err();
        match err {
            ApiError::Unauthorized(code) => assert_eq!(code, codes::ACCOUNT_LOCKED),
            other => panic!("expected lockout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_per_ip() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path()).await;
        seed_user(&m, "alice", "CorrectHorse12").await;

        // Different usernames, same IP, so the lockout never engages but
        // the window does.
        for i in 0..ratelimit::MAX_ATTEMPTS {
            let _ = m.login(attempt(&format!("ghost{}", i), "pw")).await;
        }
        let err = m.login(attempt("alice", "CorrectHorse12")).await.unwrap_err();
        assert!(matches!(err, ApiError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_2fa_required_then_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path()).await;
        let user = seed_user(&m, "alice", "CorrectHorse12").await;

        let setup = m.enroll_totp(&user).await.unwrap();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let code = totp::generate_totp(&setup.secret, now / totp::TIME_STEP).unwrap();
        m.verify_totp_enrollment(&user, &code).await.unwrap();

        // Without a code: explicit 2fa_required.
        let err = m.login(attempt("alice", "CorrectHorse12")).await.unwrap_err();
        match err {
            ApiError::Unauthorized(code) => assert_eq!(code, codes::TWO_FACTOR_REQUIRED),
            other => panic!("expected 2fa_required, got {:?}", other),
        }

        // With the current code the login elevates immediately.
        let mut with_code = attempt("alice", "CorrectHorse12");
        let code = totp::generate_totp(&setup.secret, now / totp::TIME_STEP).unwrap();
        with_code.totp_code = Some(code);
        let outcome = m.login(with_code).await.unwrap();
        assert!(outcome.two_factor_verified);
    }

    #[tokio::test]
    async fn test_enrollment_is_single_shot() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path()).await;
        let user = seed_user(&m, "alice", "CorrectHorse12").await;

        let setup = m.enroll_totp(&user).await.unwrap();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let code = totp::generate_totp(&setup.secret, now / totp::TIME_STEP).unwrap();
        m.verify_totp_enrollment(&user, &code).await.unwrap();

        let user = m.users.get(&user.id).await.unwrap();
        assert!(user.two_factor_enabled);

        // A second verify finds no pending enrollment.
        let err = m.verify_totp_enrollment(&user, "000000").await.unwrap_err();
        match err {
            ApiError::NotFound(msg) => assert!(msg.contains("no pending 2FA enrollment")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_recovery_code_login_consumes_code() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path()).await;
        let user = seed_user(&m, "alice", "CorrectHorse12").await;

        let setup = m.enroll_totp(&user).await.unwrap();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let code = totp::generate_totp(&setup.secret, now / totp::TIME_STEP).unwrap();
        m.verify_totp_enrollment(&user, &code).await.unwrap();

        let recovery = setup.backup_codes[0].clone();
        let mut with_recovery = attempt("alice", "CorrectHorse12");
        with_recovery.totp_code = Some(recovery.clone());
        m.login(with_recovery).await.unwrap();

        // The same recovery code never works twice.
        let mut again = attempt("alice", "CorrectHorse12");
        again.totp_code = Some(recovery);
        assert!(m.login(again).await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_refused_for_disabled_user() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path()).await;
        seed_user(&m, "admin2", "OtherAdminPw12").await;
        let user = seed_user(&m, "alice", "CorrectHorse12").await;

        let outcome = m.login(attempt("alice", "CorrectHorse12")).await.unwrap();
        let session = m.sessions.validate(&outcome.session_id).await.unwrap();

        m.users.set_enabled(&user.id, false).await.unwrap();
        let err = m
            .refresh(&session.id, &session.refresh_token)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_password_reset_flow() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path()).await;
        seed_user(&m, "alice", "CorrectHorse12").await;
        m.login(attempt("alice", "CorrectHorse12")).await.unwrap();

        let token = m
            .request_password_reset("alice", ResetMethod::Console, "10.0.0.9")
            .await
            .unwrap()
            .expect("console method returns the token");

        m.reset_password(&token, "BrandNewSecret34", "10.0.0.9")
            .await
            .unwrap();

        // Old sessions are gone, the new password works.
        let user = m.users.get_by_username("alice").await.unwrap();
        assert!(m.sessions.list_for_user(&user.id).await.is_empty());
        m.login(attempt("alice", "BrandNewSecret34")).await.unwrap();
    }
}
