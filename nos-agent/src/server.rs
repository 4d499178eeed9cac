//! HTTP surface of the agent.
//!
//! One handler per action; handlers validate the envelope, delegate to
//! the engines, and map failures onto the wire taxonomy. Method
//! enforcement comes from the router (non-matching methods get 405).

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

use nos_common::agent::{
    BalanceStatus, BtrfsCreateRequest, BtrfsCreateResponse, BtrfsMountRequest,
    BtrfsSnapshotRequest, BtrfsSnapshotResponse, FirewallApplyRequest, FirewallApplyResponse,
    LineRequest, MkdirRequest, OkResponse, RemoveLineRequest, ReplaceStatus, RunRequest,
    RunResponse, SmartHealth, SnapshotCreateRequest, SnapshotCreateResponse, SnapshotListRequest,
    SnapshotListResponse, SnapshotPruneRequest, SnapshotPruneResponse, SnapshotRollbackRequest,
    SnapshotRollbackResponse, UpdatesApplyResponse, UpdatesPlanResponse, WriteFileRequest,
};

use crate::config::AgentConfig;
use crate::error::ApiResult;
use crate::firewall::FirewallManager;
use crate::fstab::SystemTables;
use crate::snapshot::SnapshotEngine;
use crate::{btrfs, exec, fsops, health, updates};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub snapshots: Arc<SnapshotEngine>,
    pub firewall: Arc<FirewallManager>,
    pub tables: Arc<SystemTables>,
}

/// Build the full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(health_probe))
        .route("/v1/run", post(run_steps))
        .route("/v1/btrfs/create", post(btrfs_create))
        .route("/v1/btrfs/mount", post(btrfs_mount))
        .route("/v1/btrfs/snapshot", post(btrfs_snapshot))
        .route("/v1/btrfs/balance/status", get(balance_status))
        .route("/v1/btrfs/replace/status", get(replace_status))
        .route("/v1/fstab/ensure", post(fstab_ensure))
        .route("/v1/fstab/remove", post(fstab_remove))
        .route("/v1/crypttab/ensure", post(crypttab_ensure))
        .route("/v1/crypttab/remove", post(crypttab_remove))
        .route("/v1/firewall/apply", post(firewall_apply))
        .route("/v1/snapshot/create", post(snapshot_create))
        .route("/v1/snapshot/list", post(snapshot_list))
        .route("/v1/snapshot/prune", post(snapshot_prune))
        .route("/v1/snapshot/rollback", post(snapshot_rollback))
        .route("/v1/snapshot/delete", post(snapshot_delete))
        .route("/v1/snapshot/targets", get(snapshot_targets))
        .route("/v1/fs/mkdir", post(fs_mkdir))
        .route("/v1/fs/write", post(fs_write))
        .route("/v1/updates/plan", post(updates_plan))
        .route("/v1/updates/apply", post(updates_apply))
        .route("/v1/health/smart", get(smart))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_probe() -> Json<OkResponse> {
    Json(OkResponse::ok())
}

async fn run_steps(Json(req): Json<RunRequest>) -> ApiResult<Json<RunResponse>> {
    let results = exec::run_batch(&req.steps).await?;
    Ok(Json(RunResponse { results }))
}

async fn btrfs_create(
    Json(req): Json<BtrfsCreateRequest>,
) -> ApiResult<Json<BtrfsCreateResponse>> {
    Ok(Json(btrfs::create(&req).await?))
}

async fn btrfs_mount(Json(req): Json<BtrfsMountRequest>) -> ApiResult<Json<OkResponse>> {
    btrfs::mount(&req).await?;
    Ok(Json(OkResponse::ok()))
}

async fn btrfs_snapshot(
    Json(req): Json<BtrfsSnapshotRequest>,
) -> ApiResult<Json<BtrfsSnapshotResponse>> {
    Ok(Json(btrfs::snapshot(&req).await?))
}

#[derive(Deserialize)]
struct MountQuery {
    mount: String,
}

async fn balance_status(Query(q): Query<MountQuery>) -> ApiResult<Json<BalanceStatus>> {
    Ok(Json(btrfs::balance_status(&q.mount).await?))
}

async fn replace_status(Query(q): Query<MountQuery>) -> ApiResult<Json<ReplaceStatus>> {
    Ok(Json(btrfs::replace_status(&q.mount).await?))
}

async fn fstab_ensure(
    State(state): State<AppState>,
    Json(req): Json<LineRequest>,
) -> ApiResult<Json<OkResponse>> {
    state.tables.fstab_ensure(&req.line)?;
    Ok(Json(OkResponse::ok()))
}

async fn fstab_remove(
    State(state): State<AppState>,
    Json(req): Json<RemoveLineRequest>,
) -> ApiResult<Json<OkResponse>> {
    state.tables.fstab_remove(&req.contains)?;
    Ok(Json(OkResponse::ok()))
}

async fn crypttab_ensure(
    State(state): State<AppState>,
    Json(req): Json<LineRequest>,
) -> ApiResult<Json<OkResponse>> {
    state.tables.crypttab_ensure(&req.line)?;
    Ok(Json(OkResponse::ok()))
}

async fn crypttab_remove(
    State(state): State<AppState>,
    Json(req): Json<RemoveLineRequest>,
) -> ApiResult<Json<OkResponse>> {
    state.tables.crypttab_remove(&req.contains)?;
    Ok(Json(OkResponse::ok()))
}

async fn firewall_apply(
    State(state): State<AppState>,
    Json(req): Json<FirewallApplyRequest>,
) -> ApiResult<Json<FirewallApplyResponse>> {
    Ok(Json(state.firewall.apply(&req).await?))
}

async fn snapshot_create(
    State(state): State<AppState>,
    Json(req): Json<SnapshotCreateRequest>,
) -> ApiResult<Json<SnapshotCreateResponse>> {
    Ok(Json(state.snapshots.create(&req).await?))
}

async fn snapshot_list(
    State(state): State<AppState>,
    Json(req): Json<SnapshotListRequest>,
) -> ApiResult<Json<SnapshotListResponse>> {
    Ok(Json(state.snapshots.list(&req.path)?))
}

async fn snapshot_prune(
    State(state): State<AppState>,
    Json(req): Json<SnapshotPruneRequest>,
) -> ApiResult<Json<SnapshotPruneResponse>> {
    Ok(Json(state.snapshots.prune(&req).await?))
}

async fn snapshot_rollback(
    State(state): State<AppState>,
    Json(req): Json<SnapshotRollbackRequest>,
) -> ApiResult<Json<SnapshotRollbackResponse>> {
    Ok(Json(state.snapshots.rollback(&req).await?))
}

async fn snapshot_targets(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<crate::config::SnapshotTarget>>> {
    Ok(Json(crate::config::load_targets(
        &state.config.snapshot_targets_path,
    )?))
}

async fn snapshot_delete(
    State(state): State<AppState>,
    Json(req): Json<nos_common::agent::SnapshotDeleteRequest>,
) -> ApiResult<Json<OkResponse>> {
    state.snapshots.delete(&req.location, req.backend).await?;
    Ok(Json(OkResponse::ok()))
}

async fn fs_mkdir(Json(req): Json<MkdirRequest>) -> ApiResult<Json<OkResponse>> {
    fsops::mkdir(&req)?;
    Ok(Json(OkResponse::ok()))
}

async fn fs_write(Json(req): Json<WriteFileRequest>) -> ApiResult<Json<OkResponse>> {
    fsops::write_file(&req)?;
    Ok(Json(OkResponse::ok()))
}

async fn updates_plan() -> ApiResult<Json<UpdatesPlanResponse>> {
    Ok(Json(updates::plan().await?))
}

async fn updates_apply() -> ApiResult<Json<UpdatesApplyResponse>> {
    Ok(Json(updates::apply().await?))
}

#[derive(Deserialize)]
struct DeviceQuery {
    device: String,
}

async fn smart(Query(q): Query<DeviceQuery>) -> ApiResult<Json<SmartHealth>> {
    Ok(Json(health::smart_health(&q.device).await?))
}
