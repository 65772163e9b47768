//! Projects, index jobs, and lexical search.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;

use mycoder_core::models::{IndexJob, IndexMode, Project};

use super::error::{ApiJson, ApiQuery, AppError};
use super::AppState;
use crate::connector_fs::WalkOptions;
use crate::sse::{self, SseWriter};

/// Look a project up or answer `not_found`.
pub(super) async fn load_project(state: &AppState, id: &str) -> Result<Project, AppError> {
    if id.trim().is_empty() {
        return Err(AppError::invalid_request("projectID is required"));
    }
    state
        .store
        .get_project(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("project {} not found", id)))
}

// ============ Projects ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProject {
    #[serde(default)]
    name: Option<String>,
    root_path: String,
    #[serde(default)]
    ignore: Vec<String>,
}

/// `GET /projects`
pub async fn list_projects(State(state): State<AppState>) -> Result<Json<Vec<Project>>, AppError> {
    Ok(Json(state.store.list_projects().await?))
}

/// `POST /projects` with `{name, rootPath, ignore[]}`, returning `{projectID}`.
///
/// The root is canonicalized so every later path check compares against
/// the same absolute prefix.
pub async fn create_project(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<CreateProject>,
) -> Result<Json<Value>, AppError> {
    if req.root_path.trim().is_empty() {
        return Err(AppError::invalid_request("rootPath is required"));
    }
    let root = tokio::fs::canonicalize(PathBuf::from(req.root_path.trim()))
        .await
        .map_err(|e| AppError::invalid_request(format!("rootPath {}: {}", req.root_path, e)))?;
    if !root.is_dir() {
        return Err(AppError::invalid_request(format!(
            "rootPath {} is not a directory",
            root.display()
        )));
    }
    let name = req
        .name
        .filter(|n| !n.trim().is_empty())
        .or_else(|| root.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "project".to_string());

    let project = state
        .store
        .create_project(&name, &root.to_string_lossy(), &req.ignore)
        .await?;
    info!(project = %project.id, root = %project.root_path, "project created");
    Ok(Json(json!({ "projectID": project.id })))
}

/// `GET /projects/{id}`
pub async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Project>, AppError> {
    Ok(Json(load_project(&state, &id).await?))
}

/// `DELETE /projects/{id}`: documents, chunks, knowledge and vectors go too.
pub async fn delete_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    if !state.store.delete_project(&id).await? {
        return Err(AppError::not_found(format!("project {} not found", id)));
    }
    state.app.vectors.delete_by_project(&id).await?;
    info!(project = %id, "project deleted");
    Ok(Json(json!({ "ok": true })))
}

// ============ Index jobs ============

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunIndex {
    #[serde(rename = "projectID", default)]
    project_id: String,
    #[serde(default)]
    mode: String,
    max_files: Option<usize>,
    max_bytes: Option<u64>,
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
}

async fn prepare_job(
    state: &AppState,
    req: RunIndex,
) -> Result<(IndexJob, Project, WalkOptions), AppError> {
    let project = load_project(state, &req.project_id).await?;
    let mode = IndexMode::parse(req.mode.trim())
        .ok_or_else(|| AppError::invalid_request(format!("unknown mode: {}", req.mode)))?;

    let mut walk = state.app.walk_options();
    if let Some(n) = req.max_files.filter(|n| *n > 0) {
        walk.max_files = n;
    }
    if let Some(b) = req.max_bytes.filter(|b| *b > 0) {
        walk.max_file_size = b;
    }
    walk.include = req.include;
    walk.exclude = req.exclude;

    let job = state.jobs.create(&project.id, mode).await?;
    Ok((job, project, walk))
}

/// `POST /index/run`, returning `{jobID}` immediately.
pub async fn run_index(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RunIndex>,
) -> Result<Json<Value>, AppError> {
    let (job, project, walk) = prepare_job(&state, req).await?;
    let id = job.id.clone();
    state.jobs.spawn(job, project, walk);
    Ok(Json(json!({ "jobID": id })))
}

/// `POST /index/run/stream`: `job`, `progress`*, then `completed` or `error`.
pub async fn run_index_stream(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RunIndex>,
) -> Result<Response, AppError> {
    let (job, project, walk) = prepare_job(&state, req).await?;
    let (writer, rx) = SseWriter::channel(None);
    let jobs = state.jobs.clone();
    tokio::spawn(async move {
        jobs.run_stream(job, &project, &walk, writer).await;
    });
    Ok(sse::response(rx).into_response())
}

/// `GET /index/jobs/{id}`
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<IndexJob>, AppError> {
    state
        .store
        .get_job(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("job {} not found", id)))
}

// ============ Search ============

#[derive(Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    q: String,
    #[serde(rename = "projectID", default)]
    project_id: String,
    k: Option<usize>,
}

/// `GET /search?q=&projectID=&k=`
pub async fn search(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<SearchQuery>,
) -> Result<Json<Value>, AppError> {
    let q = query.q.trim();
    if q.is_empty() {
        return Err(AppError::invalid_request("q must not be empty"));
    }
    let k = query
        .k
        .filter(|k| *k > 0)
        .unwrap_or(state.config.retrieval.default_k);
    let results = state.lexical.retrieve(&query.project_id, q, k).await?;
    Ok(Json(json!({ "results": results })))
}
