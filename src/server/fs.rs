//! Project-confined file operations.
//!
//! Every path is resolved against the project's root; escapes are
//! `forbidden`. Writes, deletes and patches are further gated by the
//! `fs.allow` / `fs.deny` policy.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use tracing::info;

use super::error::{ApiJson, AppError};
use super::index::load_project;
use super::AppState;
use crate::fs_ops;
use crate::patch::{self, PatchSummary};

#[derive(Deserialize)]
pub struct FileRef {
    #[serde(rename = "projectID", default)]
    project_id: String,
    #[serde(default)]
    path: String,
}

/// `POST /fs/read` → `{path, content}`
pub async fn read(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<FileRef>,
) -> Result<Json<Value>, AppError> {
    let project = load_project(&state, &req.project_id).await?;
    let (target, content) = fs_ops::read_file(Path::new(&project.root_path), &req.path).await?;
    Ok(Json(json!({ "path": target.rel, "content": content })))
}

#[derive(Deserialize)]
pub struct WriteBody {
    #[serde(rename = "projectID", default)]
    project_id: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    content: String,
}

/// `POST /fs/write`
pub async fn write(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<WriteBody>,
) -> Result<Json<Value>, AppError> {
    let project = load_project(&state, &req.project_id).await?;
    let target = fs_ops::write_file(
        Path::new(&project.root_path),
        &req.path,
        &req.content,
        &state.fs_policy,
    )
    .await?;
    info!(project = %project.id, path = %target.rel, bytes = req.content.len(), "file written");
    Ok(Json(json!({ "ok": true, "path": target.rel })))
}

/// `POST /fs/delete`
pub async fn delete(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<FileRef>,
) -> Result<Json<Value>, AppError> {
    let project = load_project(&state, &req.project_id).await?;
    let target =
        fs_ops::delete_file(Path::new(&project.root_path), &req.path, &state.fs_policy).await?;
    info!(project = %project.id, path = %target.rel, "file deleted");
    Ok(Json(json!({ "ok": true, "path": target.rel })))
}

#[derive(Deserialize)]
pub struct UnifiedBody {
    #[serde(rename = "projectID", default)]
    project_id: String,
    #[serde(default, alias = "diff")]
    patch: String,
    #[serde(rename = "dryRun", default)]
    dry_run: bool,
}

/// `POST /fs/patch/unified`
pub async fn patch_unified(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<UnifiedBody>,
) -> Result<Json<PatchSummary>, AppError> {
    let project = load_project(&state, &req.project_id).await?;
    if req.patch.trim().is_empty() {
        return Err(AppError::invalid_request("patch must not be empty"));
    }
    let summary = patch::apply_unified(
        state.store.as_ref(),
        &project,
        &req.patch,
        req.dry_run,
        &state.fs_policy,
    )
    .await?;
    if let Some(id) = &summary.patch_id {
        info!(project = %project.id, patch = %id, files = summary.files.len(), "patch applied");
    }
    Ok(Json(summary))
}

#[derive(Deserialize)]
pub struct RollbackBody {
    #[serde(rename = "projectID", default)]
    project_id: String,
    #[serde(rename = "patchID", default)]
    patch_id: String,
}

/// `POST /fs/patch/unified/rollback`
pub async fn rollback(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RollbackBody>,
) -> Result<Json<Value>, AppError> {
    let project = load_project(&state, &req.project_id).await?;
    if req.patch_id.trim().is_empty() {
        return Err(AppError::invalid_request("patchID is required"));
    }
    let files =
        patch::rollback(state.store.as_ref(), &project, &req.patch_id, &state.fs_policy).await?;
    info!(project = %project.id, patch = %req.patch_id, "patch rolled back");
    Ok(Json(json!({ "ok": true, "files": files })))
}
