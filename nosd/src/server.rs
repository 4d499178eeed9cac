//! HTTP surface of the control plane.
//!
//! One handler per action. Handlers authenticate from the sealed session
//! cookie, enforce CSRF on mutating requests, validate the body, emit
//! exactly one audit event per privileged action, and delegate the work.
//! Long-running operations return a job id immediately.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use crate::audit::{AuditEvent, AuditQuery, Severity};
use crate::auth::sessions::{csrf_matches, Session};
use crate::auth::store::{ResetMethod, Role, User};
use crate::auth::{LoginAttempt, LoginOutcome};
use crate::error::{codes, ApiError, ApiResult};
use crate::jobs::{JobState, JobType, LogLevel};
use crate::state::AppState;
use crate::backup::destinations::NewDestination;
use crate::backup::replication;
use crate::backup::{Frequency, Retention, Schedule};
use nos_common::agent::{
    FirewallApplyRequest, SnapshotCreateRequest, SnapshotPruneRequest, SnapshotRollbackRequest,
};

const SESSION_COOKIE: &str = "nos_session";
const CSRF_COOKIE: &str = "nos_csrf";
const CSRF_HEADER: &str = "x-csrf-token";

/// Build the route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Auth
        .route("/api/v1/auth/login", post(login))
        .route("/api/v1/auth/logout", post(logout))
        .route("/api/v1/auth/me", get(me))
        .route("/api/v1/auth/refresh", post(refresh))
        .route("/api/v1/auth/elevate", post(elevate))
        .route("/api/v1/auth/password/change", post(change_password))
        .route("/api/v1/auth/password/reset/request", post(reset_request))
        .route("/api/v1/auth/password/reset/confirm", post(reset_confirm))
        .route("/api/v1/auth/totp/enroll", post(totp_enroll))
        .route("/api/v1/auth/totp/verify", post(totp_verify))
        .route("/api/v1/auth/totp/disable", post(totp_disable))
        .route("/api/v1/auth/totp/recovery/regenerate", post(totp_regenerate))
        .route("/api/v1/auth/unlock", post(unlock))
        // Users
        .route("/api/v1/users", get(list_users).post(create_user))
        .route("/api/v1/users/{id}/enabled", post(set_user_enabled))
        // Audit
        .route("/api/v1/audit", get(audit_query))
        .route("/api/v1/audit/recent", get(audit_recent))
        .route("/api/v1/audit/stats", get(audit_stats))
        .route("/api/v1/audit/export", get(audit_export))
        // Snapshots (delegated to the agent)
        .route("/api/v1/snapshots/create", post(snapshot_create))
        .route("/api/v1/snapshots/list", post(snapshot_list))
        .route("/api/v1/snapshots/prune", post(snapshot_prune))
        .route("/api/v1/snapshots/rollback", post(snapshot_rollback))
        // Firewall
        .route("/api/v1/firewall/apply", post(firewall_apply))
        // Backup schedules
        .route("/api/v1/backup/schedules", get(list_schedules).post(create_schedule))
        .route(
            "/api/v1/backup/schedules/{id}",
            post(update_schedule).delete(delete_schedule),
        )
        .route("/api/v1/backup/schedules/{id}/run", post(run_schedule_now))
        // Destinations
        .route(
            "/api/v1/backup/destinations",
            get(list_destinations).post(create_destination),
        )
        .route("/api/v1/backup/destinations/{id}", axum::routing::delete(delete_destination))
        .route("/api/v1/backup/destinations/{id}/test", post(test_destination))
        // Replication
        .route("/api/v1/backup/replicate", post(replicate))
        // Jobs
        .route("/api/v1/jobs", get(list_jobs))
        .route("/api/v1/jobs/{id}", get(get_job))
        .route("/api/v1/jobs/{id}/cancel", post(cancel_job))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

// ---- session plumbing ----

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let (k, v) = pair.trim().split_once('=')?;
        if k == name {
            return Some(v.to_string());
        }
    }
    None
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .unwrap_or("127.0.0.1")
        .trim()
        .to_string()
}

fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

async fn require_session(state: &AppState, headers: &HeaderMap) -> ApiResult<Session> {
    let sealed = cookie_value(headers, SESSION_COOKIE)
        .ok_or(ApiError::Unauthorized(codes::SESSION_EXPIRED))?;
    let session_id = state
        .sealer
        .open_sealed(&sealed)
        .map_err(|_| ApiError::Unauthorized(codes::SESSION_EXPIRED))?;
    state.auth.validate_session(&session_id).await
}

/// Mutating requests must echo the CSRF cookie in a custom header.
fn require_csrf(session: &Session, headers: &HeaderMap) -> ApiResult<()> {
    let presented = headers
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized(codes::CSRF_MISSING))?;
    if !csrf_matches(&session.csrf_token, presented) {
        return Err(ApiError::Unauthorized(codes::CSRF_INVALID));
    }
    Ok(())
}

fn role_rank(role: Role) -> u8 {
    match role {
        Role::Viewer => 0,
        Role::Operator => 1,
        Role::Admin => 2,
    }
}

fn require_role(session: &Session, minimum: Role) -> ApiResult<()> {
    if role_rank(session.role) < role_rank(minimum) {
        return Err(ApiError::Forbidden("insufficient role".to_string()));
    }
    Ok(())
}

/// Privileged actions require a live elevated window when the account
/// has a second factor enrolled.
async fn require_elevated(state: &AppState, session: &Session) -> ApiResult<()> {
    let user = state
        .auth
        .users
        .get(&session.user_id)
        .await
        .ok_or(ApiError::Unauthorized(codes::SESSION_EXPIRED))?;
    if user.two_factor_enabled && !session.is_elevated(Utc::now()) {
        return Err(ApiError::Forbidden("elevation required".to_string()));
    }
    Ok(())
}

async fn mutating_session(state: &AppState, headers: &HeaderMap) -> ApiResult<Session> {
    let session = require_session(state, headers).await?;
    require_csrf(&session, headers)?;
    Ok(session)
}

fn set_session_cookies(outcome: &LoginOutcome, state: &AppState) -> ApiResult<Response> {
    let sealed = state
        .sealer
        .seal(&outcome.session_id)
        .map_err(ApiError::from)?;

    let mut response = Json(serde_json::json!({
        "username": outcome.username,
        "role": outcome.role,
        "csrf_token": outcome.csrf_token,
        "force_password_change": outcome.force_password_change,
        "two_factor_verified": outcome.two_factor_verified,
    }))
    .into_response();

    let session_cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Strict",
        SESSION_COOKIE, sealed
    );
    let csrf_cookie = format!(
        "{}={}; Path=/; SameSite=Strict",
        CSRF_COOKIE, outcome.csrf_token
    );
    response.headers_mut().append(
        header::SET_COOKIE,
        session_cookie
            .parse()
            .map_err(|_| ApiError::Internal("cookie encoding".to_string()))?,
    );
    response.headers_mut().append(
        header::SET_COOKIE,
        csrf_cookie
            .parse()
            .map_err(|_| ApiError::Internal("cookie encoding".to_string()))?,
    );
    Ok(response)
}

/// Public view of a user record.
#[derive(Serialize)]
struct UserView {
    id: String,
    username: String,
    email: Option<String>,
    role: Role,
    enabled: bool,
    two_factor_enabled: bool,
    force_password_change: bool,
    last_login_at: Option<chrono::DateTime<Utc>>,
    locked_until: Option<chrono::DateTime<Utc>>,
    failed_logins: u32,
}

async fn user_view(state: &AppState, user: User) -> UserView {
    let locked_until = state.auth.lockouts.locked_until(&user.username).await;
    let failed_logins = state.auth.lockouts.failed_logins(&user.username).await;
    UserView {
        id: user.id,
        username: user.username,
        email: user.email,
        role: user.role,
        enabled: user.enabled,
        two_factor_enabled: user.two_factor_enabled,
        force_password_change: user.force_password_change,
        last_login_at: user.last_login_at,
        locked_until,
        failed_logins,
    }
}

// ---- auth handlers ----

#[derive(Deserialize)]
struct LoginBody {
    username: String,
    password: String,
    #[serde(default)]
    totp_code: Option<String>,
}

async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<LoginBody>,
) -> ApiResult<Response> {
    if body.username.is_empty() || body.password.is_empty() {
        return Err(ApiError::InvalidInput("username and password required".to_string()));
    }
    let outcome = state
        .auth
        .login(LoginAttempt {
            username: body.username,
            password: body.password,
            totp_code: body.totp_code,
            ip: client_ip(&headers),
            user_agent: user_agent(&headers),
        })
        .await?;
    set_session_cookies(&outcome, &state)
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<StatusCode> {
    let session = mutating_session(&state, &headers).await?;
    state.auth.logout(&session).await?;
    Ok(StatusCode::OK)
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<serde_json::Value>> {
    let session = require_session(&state, &headers).await?;
    Ok(Json(serde_json::json!({
        "username": session.username,
        "role": session.role,
        "two_factor_verified": session.two_factor_verified,
        "elevated": session.is_elevated(Utc::now()),
        "expires_at": session.expires_at,
    })))
}

async fn refresh(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<serde_json::Value>> {
    let session = mutating_session(&state, &headers).await?;
    // The refresh token never leaves the process; rotation happens against
    // the stored copy.
    let rotated = state.auth.refresh(&session.id, &session.refresh_token).await?;
    Ok(Json(serde_json::json!({
        "expires_at": rotated.expires_at,
        "token_version": rotated.token_version,
    })))
}

#[derive(Deserialize)]
struct CodeBody {
    code: String,
}

async fn elevate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CodeBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = mutating_session(&state, &headers).await?;
    let elevated = state.auth.elevate(&session.id, &body.code).await?;
    Ok(Json(serde_json::json!({
        "elevated_until": elevated.elevated_until,
    })))
}

#[derive(Deserialize)]
struct ChangePasswordBody {
    current_password: String,
    new_password: String,
}

async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChangePasswordBody>,
) -> ApiResult<StatusCode> {
    let session = mutating_session(&state, &headers).await?;
    let user = state
        .auth
        .users
        .get(&session.user_id)
        .await
        .ok_or(ApiError::Unauthorized(codes::SESSION_EXPIRED))?;
    state
        .auth
        .change_password(&user, &body.current_password, &body.new_password)
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct ResetRequestBody {
    username: String,
    method: ResetMethod,
}

async fn reset_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ResetRequestBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let token = state
        .auth
        .request_password_reset(&body.username, body.method, &client_ip(&headers))
        .await?;
    Ok(Json(serde_json::json!({ "token": token })))
}

#[derive(Deserialize)]
struct ResetConfirmBody {
    token: String,
    new_password: String,
}

async fn reset_confirm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ResetConfirmBody>,
) -> ApiResult<StatusCode> {
    state
        .auth
        .reset_password(&body.token, &body.new_password, &client_ip(&headers))
        .await?;
    Ok(StatusCode::OK)
}

async fn totp_enroll(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<crate::auth::EnrollmentSetup>> {
    let session = mutating_session(&state, &headers).await?;
    let user = state
        .auth
        .users
        .get(&session.user_id)
        .await
        .ok_or(ApiError::Unauthorized(codes::SESSION_EXPIRED))?;
    Ok(Json(state.auth.enroll_totp(&user).await?))
}

async fn totp_verify(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CodeBody>,
) -> ApiResult<StatusCode> {
    let session = mutating_session(&state, &headers).await?;
    let user = state
        .auth
        .users
        .get(&session.user_id)
        .await
        .ok_or(ApiError::Unauthorized(codes::SESSION_EXPIRED))?;
    state.auth.verify_totp_enrollment(&user, &body.code).await?;
    // Enrollment counts as a fresh second-factor check.
    state.auth.sessions.elevate(&session.id).await.map_err(ApiError::from)?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct TotpDisableBody {
    password: String,
    #[serde(default)]
    code: Option<String>,
}

async fn totp_disable(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TotpDisableBody>,
) -> ApiResult<StatusCode> {
    let session = mutating_session(&state, &headers).await?;
    let user = state
        .auth
        .users
        .get(&session.user_id)
        .await
        .ok_or(ApiError::Unauthorized(codes::SESSION_EXPIRED))?;
    state
        .auth
        .disable_totp(&user, &body.password, body.code.as_deref())
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct PasswordBody {
    password: String,
}

async fn totp_regenerate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PasswordBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = mutating_session(&state, &headers).await?;
    let user = state
        .auth
        .users
        .get(&session.user_id)
        .await
        .ok_or(ApiError::Unauthorized(codes::SESSION_EXPIRED))?;
    let codes = state
        .auth
        .regenerate_recovery_codes(&user, &body.password)
        .await?;
    Ok(Json(serde_json::json!({ "backup_codes": codes })))
}

#[derive(Deserialize)]
struct UnlockBody {
    username: String,
}

async fn unlock(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UnlockBody>,
) -> ApiResult<StatusCode> {
    let session = mutating_session(&state, &headers).await?;
    state.auth.unlock_user(&session, &body.username).await?;
    Ok(StatusCode::OK)
}

// ---- user handlers ----

async fn list_users(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Vec<UserView>>> {
    let session = require_session(&state, &headers).await?;
    require_role(&session, Role::Admin)?;
    let mut views = Vec::new();
    for user in state.auth.users.list().await {
        views.push(user_view(&state, user).await);
    }
    Ok(Json(views))
}

#[derive(Deserialize)]
struct CreateUserBody {
    username: String,
    password: String,
    #[serde(default)]
    email: Option<String>,
    role: Role,
}

async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateUserBody>,
) -> ApiResult<Json<UserView>> {
    let session = mutating_session(&state, &headers).await?;
    require_role(&session, Role::Admin)?;

    state
        .auth
        .policy
        .check(&body.username, &body.password)
        .map_err(ApiError::from)?;
    let hash = crate::auth::password::hash_password(&body.password).map_err(ApiError::from)?;
    let user = state
        .auth
        .users
        .create(&body.username, body.email, body.role, hash, true)
        .await
        .map_err(ApiError::from)?;

    state.audit.log(
        AuditEvent::new("user.created", "user", Severity::Info, true, "user created")
            .user(&session.user_id, &session.username)
            .target(&user.username),
    );
    Ok(Json(user_view(&state, user).await))
}

#[derive(Deserialize)]
struct EnabledBody {
    enabled: bool,
}

async fn set_user_enabled(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<EnabledBody>,
) -> ApiResult<Json<UserView>> {
    let session = mutating_session(&state, &headers).await?;
    require_role(&session, Role::Admin)?;

    let user = if body.enabled {
        let user = state
            .auth
            .users
            .set_enabled(&id, true)
            .await
            .map_err(ApiError::from)?;
        state.audit.log(
            AuditEvent::new("user.enabled", "user", Severity::Info, true, "user enabled")
                .user(&session.user_id, &session.username)
                .target(&user.username),
        );
        user
    } else {
        state.auth.disable_user(&session, &id).await?
    };
    Ok(Json(user_view(&state, user).await))
}

// ---- audit handlers ----

async fn audit_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<AuditQuery>,
) -> ApiResult<Json<Vec<AuditEvent>>> {
    let session = require_session(&state, &headers).await?;
    require_role(&session, Role::Operator)?;
    Ok(Json(state.audit.query(&q).map_err(ApiError::from)?))
}

#[derive(Deserialize)]
struct RecentQuery {
    #[serde(default = "default_recent_limit")]
    limit: usize,
}

fn default_recent_limit() -> usize {
    50
}

async fn audit_recent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<RecentQuery>,
) -> ApiResult<Json<Vec<AuditEvent>>> {
    let session = require_session(&state, &headers).await?;
    require_role(&session, Role::Operator)?;
    Ok(Json(state.audit.recent(q.limit)))
}

#[derive(Deserialize)]
struct StatsQuery {
    from: Option<chrono::DateTime<Utc>>,
    to: Option<chrono::DateTime<Utc>>,
}

async fn audit_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<crate::audit::AuditStats>> {
    let session = require_session(&state, &headers).await?;
    require_role(&session, Role::Operator)?;
    Ok(Json(state.audit.stats(q.from, q.to).map_err(ApiError::from)?))
}

async fn audit_export(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<AuditQuery>,
) -> ApiResult<Response> {
    let session = require_session(&state, &headers).await?;
    require_role(&session, Role::Admin)?;
    let csv = state.audit.export_csv(&q).map_err(ApiError::from)?;
    Ok((
        [(header::CONTENT_TYPE, "text/csv"), (header::CONTENT_DISPOSITION, "attachment; filename=\"audit.csv\"")],
        csv,
    )
        .into_response())
}

// ---- snapshot handlers (delegated) ----

async fn snapshot_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SnapshotCreateRequest>,
) -> ApiResult<Json<nos_common::agent::SnapshotCreateResponse>> {
    let session = mutating_session(&state, &headers).await?;
    require_role(&session, Role::Operator)?;

    let result = state.agent.snapshot_create(&req).await;
    state.audit.log(
        AuditEvent::new(
            "snapshot.create",
            "snapshot",
            Severity::Info,
            result.is_ok(),
            "snapshot requested",
        )
        .user(&session.user_id, &session.username)
        .target(&req.path),
    );
    Ok(Json(result.map_err(ApiError::from)?))
}

#[derive(Deserialize)]
struct ListBody {
    path: String,
}

async fn snapshot_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ListBody>,
) -> ApiResult<Json<nos_common::agent::SnapshotListResponse>> {
    let session = require_session(&state, &headers).await?;
    require_role(&session, Role::Viewer)?;
    Ok(Json(
        state
            .agent
            .snapshot_list(&body.path)
            .await
            .map_err(ApiError::from)?,
    ))
}

async fn snapshot_prune(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SnapshotPruneRequest>,
) -> ApiResult<Json<nos_common::agent::SnapshotPruneResponse>> {
    let session = mutating_session(&state, &headers).await?;
    require_role(&session, Role::Operator)?;

    let result = state.agent.snapshot_prune(&req).await;
    state.audit.log(
        AuditEvent::new(
            "snapshot.prune",
            "snapshot",
            Severity::Info,
            result.is_ok(),
            "snapshot prune requested",
        )
        .user(&session.user_id, &session.username)
        .detail("keep_per_target", req.keep_per_target as i64),
    );
    Ok(Json(result.map_err(ApiError::from)?))
}

/// Rollback runs as a background job; the call returns the job id.
async fn snapshot_rollback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SnapshotRollbackRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = mutating_session(&state, &headers).await?;
    require_role(&session, Role::Operator)?;
    require_elevated(&state, &session).await?;

    if req.path == "/" {
        return Err(ApiError::InvalidInput("refuse to operate on rootfs".to_string()));
    }

    let mut meta = HashMap::new();
    meta.insert("path".to_string(), req.path.clone());
    meta.insert("snapshot_id".to_string(), req.snapshot_id.clone());
    let job = state.jobs.add_job(JobType::Restore, meta);
    let job_id = job.id.clone();

    state.audit.log(
        AuditEvent::new(
            "snapshot.rollback",
            "snapshot",
            Severity::Warning,
            true,
            "rollback started",
        )
        .user(&session.user_id, &session.username)
        .target(&req.path)
        .detail("snapshot_id", req.snapshot_id.clone())
        .detail("job_id", job_id.clone()),
    );

    let jobs = state.jobs.clone();
    let agent = state.agent.clone();
    let spawned_id = job_id.clone();
    tokio::spawn(async move {
        jobs.update_job(&spawned_id, |j| j.state = JobState::Running);
        match agent.snapshot_rollback(&req).await {
            Ok(resp) => {
                if let Some(safety) = resp.safety_path {
                    jobs.add_log_entry(
                        &spawned_id,
                        LogLevel::Info,
                        &format!("safety copy at {}", safety),
                    );
                }
                jobs.update_job(&spawned_id, |j| {
                    j.state = JobState::Succeeded;
                    j.progress = 100;
                    j.finished_at = Some(Utc::now());
                });
            }
            Err(e) => {
                jobs.add_log_entry(&spawned_id, LogLevel::Error, &e.to_string());
                jobs.update_job(&spawned_id, |j| {
                    j.state = JobState::Failed;
                    j.error = Some(e.to_string());
                    j.finished_at = Some(Utc::now());
                });
            }
        }
    });

    Ok(Json(serde_json::json!({ "job_id": job_id })))
}

// ---- firewall ----

async fn firewall_apply(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<FirewallApplyRequest>,
) -> ApiResult<Json<nos_common::agent::FirewallApplyResponse>> {
    let session = mutating_session(&state, &headers).await?;
    require_role(&session, Role::Admin)?;
    require_elevated(&state, &session).await?;

    let result = state.agent.firewall_apply(&req).await;
    let mut event = AuditEvent::new(
        "firewall.apply",
        "firewall",
        Severity::Warning,
        result.is_ok(),
        "firewall ruleset swap",
    )
    .user(&session.user_id, &session.username)
    .detail("persist", req.persist);
    if let Ok(ref resp) = result {
        event = event.detail("backup_path", resp.backup_path.clone());
    }
    state.audit.log(event);

    Ok(Json(result.map_err(ApiError::from)?))
}

// ---- schedules ----

#[derive(Deserialize)]
struct ScheduleBody {
    name: String,
    #[serde(default = "default_true")]
    enabled: bool,
    subvolumes: Vec<String>,
    frequency: Frequency,
    #[serde(default)]
    retention: Option<Retention>,
    #[serde(default)]
    pre_hooks: Vec<String>,
    #[serde(default)]
    post_hooks: Vec<String>,
    #[serde(default)]
    tag: Option<String>,
}

fn default_true() -> bool {
    true
}

fn validate_schedule_body(body: &ScheduleBody) -> ApiResult<()> {
    if body.name.trim().is_empty() {
        return Err(ApiError::InvalidInput("schedule name required".to_string()));
    }
    if body.subvolumes.is_empty() {
        return Err(ApiError::InvalidInput("at least one subvolume required".to_string()));
    }
    for sv in &body.subvolumes {
        if !sv.starts_with('/') {
            return Err(ApiError::InvalidInput(format!("{} is not absolute", sv)));
        }
    }
    // Reject bad cron/frequency up front.
    crate::backup::scheduler::next_fire(&body.frequency, &Utc::now()).map_err(ApiError::from)?;
    Ok(())
}

async fn list_schedules(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Vec<Schedule>>> {
    let session = require_session(&state, &headers).await?;
    require_role(&session, Role::Viewer)?;
    Ok(Json(state.backups.schedules().await))
}

async fn create_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ScheduleBody>,
) -> ApiResult<Json<Schedule>> {
    let session = mutating_session(&state, &headers).await?;
    require_role(&session, Role::Operator)?;
    validate_schedule_body(&body)?;

    let next_run = crate::backup::scheduler::next_fire(&body.frequency, &Utc::now())
        .map_err(ApiError::from)?;
    let schedule = Schedule {
        id: uuid::Uuid::new_v4().to_string(),
        name: body.name,
        enabled: body.enabled,
        subvolumes: body.subvolumes,
        frequency: body.frequency,
        retention: body.retention.unwrap_or_default(),
        pre_hooks: body.pre_hooks,
        post_hooks: body.post_hooks,
        tag: body.tag,
        last_run: None,
        next_run,
    };
    state
        .backups
        .add_schedule(schedule.clone())
        .await
        .map_err(ApiError::from)?;

    state.audit.log(
        AuditEvent::new(
            "backup.schedule.created",
            "backup",
            Severity::Info,
            true,
            "schedule created",
        )
        .user(&session.user_id, &session.username)
        .target(&schedule.name),
    );
    Ok(Json(schedule))
}

async fn update_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ScheduleBody>,
) -> ApiResult<Json<Schedule>> {
    let session = mutating_session(&state, &headers).await?;
    require_role(&session, Role::Operator)?;
    validate_schedule_body(&body)?;

    let existing = state
        .backups
        .get_schedule(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("schedule {} not found", id)))?;
    let next_run = crate::backup::scheduler::next_fire(&body.frequency, &Utc::now())
        .map_err(ApiError::from)?;
    let schedule = Schedule {
        id: existing.id,
        name: body.name,
        enabled: body.enabled,
        subvolumes: body.subvolumes,
        frequency: body.frequency,
        retention: body.retention.unwrap_or(existing.retention),
        pre_hooks: body.pre_hooks,
        post_hooks: body.post_hooks,
        tag: body.tag,
        last_run: existing.last_run,
        next_run,
    };
    state
        .backups
        .update_schedule(schedule.clone())
        .await
        .map_err(ApiError::from)?;

    state.audit.log(
        AuditEvent::new(
            "backup.schedule.updated",
            "backup",
            Severity::Info,
            true,
            "schedule updated",
        )
        .user(&session.user_id, &session.username)
        .target(&schedule.name),
    );
    Ok(Json(schedule))
}

async fn delete_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let session = mutating_session(&state, &headers).await?;
    require_role(&session, Role::Operator)?;

    state
        .backups
        .remove_schedule(&id)
        .await
        .map_err(ApiError::from)?;
    state.audit.log(
        AuditEvent::new(
            "backup.schedule.deleted",
            "backup",
            Severity::Info,
            true,
            "schedule deleted",
        )
        .user(&session.user_id, &session.username)
        .target(&id),
    );
    Ok(StatusCode::OK)
}

async fn run_schedule_now(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = mutating_session(&state, &headers).await?;
    require_role(&session, Role::Operator)?;

    let job_id = state.scheduler.run_now(&id).await.map_err(ApiError::from)?;
    state.audit.log(
        AuditEvent::new(
            "backup.schedule.run",
            "backup",
            Severity::Info,
            true,
            "schedule triggered manually",
        )
        .user(&session.user_id, &session.username)
        .target(&id)
        .detail("job_id", job_id.clone()),
    );
    Ok(Json(serde_json::json!({ "job_id": job_id })))
}

// ---- destinations ----

async fn list_destinations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<crate::backup::destinations::Destination>>> {
    let session = require_session(&state, &headers).await?;
    require_role(&session, Role::Operator)?;
    Ok(Json(state.destinations.list().await))
}

async fn create_destination(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewDestination>,
) -> ApiResult<Json<crate::backup::destinations::Destination>> {
    let session = mutating_session(&state, &headers).await?;
    require_role(&session, Role::Admin)?;

    let destination = state.destinations.add(body).await.map_err(ApiError::from)?;
    state.audit.log(
        AuditEvent::new(
            "backup.destination.created",
            "backup",
            Severity::Info,
            true,
            "destination created",
        )
        .user(&session.user_id, &session.username)
        .target(&destination.name),
    );
    Ok(Json(destination))
}

async fn delete_destination(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let session = mutating_session(&state, &headers).await?;
    require_role(&session, Role::Admin)?;

    state.destinations.remove(&id).await.map_err(ApiError::from)?;
    state.audit.log(
        AuditEvent::new(
            "backup.destination.deleted",
            "backup",
            Severity::Warning,
            true,
            "destination deleted",
        )
        .user(&session.user_id, &session.username)
        .target(&id),
    );
    Ok(StatusCode::OK)
}

async fn test_destination(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = mutating_session(&state, &headers).await?;
    require_role(&session, Role::Operator)?;

    let destination = state
        .destinations
        .get(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("destination {} not found", id)))?;
    let key_path = destination
        .key_ref
        .as_ref()
        .map(|r| state.destinations.key_path(r));
    let probe = replication::build_probe(
        &destination,
        &state.config.known_hosts,
        key_path.as_deref(),
    );
    let ok = replication::execute_pipeline(&[probe], std::time::Duration::from_secs(30))
        .await
        .is_ok();
    Ok(Json(serde_json::json!({ "ok": ok })))
}

// ---- replication ----

#[derive(Deserialize)]
struct ReplicateBody {
    snapshot_id: String,
    destination_id: String,
    #[serde(default)]
    parent_snapshot_id: Option<String>,
}

async fn replicate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ReplicateBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = mutating_session(&state, &headers).await?;
    require_role(&session, Role::Operator)?;

    let snapshots = state.backups.snapshots().await;
    let snapshot = snapshots
        .iter()
        .find(|s| s.id == body.snapshot_id)
        .cloned()
        .ok_or_else(|| ApiError::NotFound(format!("snapshot {} not found", body.snapshot_id)))?;
    let parent = body
        .parent_snapshot_id
        .as_ref()
        .and_then(|pid| snapshots.iter().find(|s| &s.id == pid).cloned());
    let destination = state
        .destinations
        .get(&body.destination_id)
        .await
        .ok_or_else(|| {
            ApiError::NotFound(format!("destination {} not found", body.destination_id))
        })?;

    let key_path = destination
        .key_ref
        .as_ref()
        .map(|r| state.destinations.key_path(r));
    let pipeline = replication::build_pipeline(
        &snapshot.location,
        parent.as_ref().map(|p| p.location.as_str()),
        &destination,
        &state.config.known_hosts,
        key_path.as_deref(),
    )
    .map_err(ApiError::from)?;

    let mut meta = HashMap::new();
    meta.insert("snapshot_id".to_string(), snapshot.id.clone());
    meta.insert("destination_id".to_string(), destination.id.clone());
    let job = state.jobs.add_job(JobType::Replicate, meta);
    let job_id = job.id.clone();

    state.audit.log(
        AuditEvent::new(
            "backup.replicate",
            "backup",
            Severity::Info,
            true,
            "replication started",
        )
        .user(&session.user_id, &session.username)
        .target(&destination.name)
        .detail("snapshot_id", snapshot.id.clone())
        .detail("job_id", job_id.clone()),
    );

    let jobs = state.jobs.clone();
    let spawned_id = job_id.clone();
    tokio::spawn(async move {
        jobs.update_job(&spawned_id, |j| j.state = JobState::Running);
        if jobs.is_canceled(&spawned_id) {
            return;
        }
        match replication::execute_pipeline(&pipeline, replication::REPLICATION_TIMEOUT).await {
            Ok(()) => {
                jobs.update_job(&spawned_id, |j| {
                    j.state = JobState::Succeeded;
                    j.progress = 100;
                    j.finished_at = Some(Utc::now());
                });
            }
            Err(e) => {
                jobs.add_log_entry(&spawned_id, LogLevel::Error, &e.to_string());
                jobs.update_job(&spawned_id, |j| {
                    j.state = JobState::Failed;
                    j.error = Some(e.to_string());
                    j.finished_at = Some(Utc::now());
                });
            }
        }
    });

    Ok(Json(serde_json::json!({ "job_id": job_id })))
}

// ---- jobs ----

async fn list_jobs(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Vec<crate::jobs::Job>>> {
    let session = require_session(&state, &headers).await?;
    require_role(&session, Role::Viewer)?;
    Ok(Json(state.jobs.list_recent(100)))
}

async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<crate::jobs::Job>> {
    let session = require_session(&state, &headers).await?;
    require_role(&session, Role::Viewer)?;
    state
        .jobs
        .get_job(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {} not found", id)))
}

async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let session = mutating_session(&state, &headers).await?;
    require_role(&session, Role::Operator)?;

    if !state.jobs.cancel_job(&id) {
        return Err(ApiError::Conflict("job is not cancelable".to_string()));
    }
    info!(job = %id, "job canceled");
    state.audit.log(
        AuditEvent::new("job.canceled", "job", Severity::Info, true, "job canceled")
            .user(&session.user_id, &session.username)
            .target(&id),
    );
    Ok(StatusCode::OK)
}
