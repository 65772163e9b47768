//! Knowledge curation endpoints. Trust rules live in
//! [`mycoder_core::knowledge`]; these handlers validate and delegate.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use mycoder_core::knowledge::{self, Promotion};
use mycoder_core::models::{Knowledge, SourceType};

use super::error::{ApiJson, ApiQuery, AppError};
use super::index::load_project;
use super::AppState;

const ADD_DEFAULT_TRUST: f64 = 0.5;

#[derive(Deserialize)]
pub struct ProjectRef {
    #[serde(rename = "projectID", default)]
    project_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddKnowledge {
    #[serde(rename = "projectID", default)]
    project_id: String,
    source_type: Option<String>,
    #[serde(rename = "pathOrURL")]
    path_or_url: Option<String>,
    title: Option<String>,
    #[serde(default)]
    text: String,
    trust_score: Option<f64>,
    #[serde(default, alias = "pin")]
    pinned: bool,
    commit_sha: Option<String>,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    symbols: Vec<String>,
    tags: Option<Value>,
}

/// `POST /knowledge/add` → `{id}`
pub async fn add(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<AddKnowledge>,
) -> Result<Json<Value>, AppError> {
    let project = load_project(&state, &req.project_id).await?;
    if req.text.trim().is_empty() {
        return Err(AppError::invalid_request("text must not be empty"));
    }
    let source = match req.source_type.as_deref() {
        None | Some("") => SourceType::Doc,
        Some(s) => SourceType::parse(s)
            .ok_or_else(|| AppError::invalid_request(format!("unknown sourceType: {}", s)))?,
    };

    let mut item = Knowledge::new(
        &project.id,
        source,
        &req.text,
        req.trust_score.unwrap_or(ADD_DEFAULT_TRUST),
    );
    item.path_or_url = req.path_or_url.filter(|p| !p.is_empty());
    item.title = req.title.filter(|t| !t.is_empty());
    item.pinned = req.pinned;
    item.commit_sha = req.commit_sha.filter(|c| !c.is_empty());
    item.files = req.files;
    item.symbols = req.symbols;
    item.tags = req.tags;

    let id = state.store.add_knowledge(&item).await?;
    Ok(Json(json!({ "id": id })))
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(rename = "projectID", default)]
    project_id: String,
    #[serde(rename = "minTrust", default)]
    min_trust: f64,
}

/// `GET /knowledge/list?projectID=&minTrust=`
pub async fn list(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> Result<Json<Value>, AppError> {
    let project = load_project(&state, &query.project_id).await?;
    let items = state
        .store
        .list_knowledge(&project.id, query.min_trust)
        .await?;
    Ok(Json(json!({ "items": items })))
}

/// `POST /knowledge/vet`
pub async fn vet(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ProjectRef>,
) -> Result<Json<Value>, AppError> {
    let project = load_project(&state, &req.project_id).await?;
    let n = knowledge::vet(state.store.as_ref(), &project.id, Utc::now()).await?;
    Ok(Json(json!({ "vetted": n })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoteBody {
    #[serde(rename = "projectID", default)]
    project_id: String,
    title: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(rename = "pathOrURL")]
    path_or_url: Option<String>,
    commit_sha: Option<String>,
    /// Comma-separated.
    #[serde(default)]
    files: String,
    /// Comma-separated.
    #[serde(default)]
    symbols: String,
    #[serde(default)]
    pin: bool,
}

/// `POST /knowledge/promote`: stores the item at trust 0.7.
pub async fn promote(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<PromoteBody>,
) -> Result<Json<Knowledge>, AppError> {
    let project = load_project(&state, &req.project_id).await?;
    if req.text.trim().is_empty() {
        return Err(AppError::invalid_request("text must not be empty"));
    }
    let item = knowledge::promote(
        state.store.as_ref(),
        &project.id,
        Promotion {
            title: req.title,
            text: req.text,
            path_or_url: req.path_or_url,
            commit_sha: req.commit_sha,
            files: req.files,
            symbols: req.symbols,
            pin: req.pin,
        },
    )
    .await?;
    Ok(Json(item))
}

#[derive(Deserialize)]
pub struct PromoteAutoBody {
    #[serde(rename = "projectID", default)]
    project_id: String,
    title: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    pin: bool,
}

/// `POST /knowledge/promote/auto`: promote an answer, attaching the indexed
/// paths it mentions.
pub async fn promote_auto(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<PromoteAutoBody>,
) -> Result<Json<Knowledge>, AppError> {
    let project = load_project(&state, &req.project_id).await?;
    if req.text.trim().is_empty() {
        return Err(AppError::invalid_request("text must not be empty"));
    }
    let indexed: Vec<String> = state
        .store
        .list_documents(&project.id)
        .await?
        .into_iter()
        .map(|d| d.path)
        .collect();
    let paths = knowledge::mentioned_paths(&req.text, &indexed);

    let item = knowledge::promote(
        state.store.as_ref(),
        &project.id,
        Promotion {
            title: req.title,
            path_or_url: paths.first().cloned(),
            files: paths.join(","),
            text: req.text,
            pin: req.pin,
            ..Default::default()
        },
    )
    .await?;
    Ok(Json(item))
}

/// `POST /knowledge/reverify`
pub async fn reverify(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ProjectRef>,
) -> Result<Json<Value>, AppError> {
    let project = load_project(&state, &req.project_id).await?;
    let n = knowledge::reverify(state.store.as_ref(), &project.id, Utc::now()).await?;
    Ok(Json(json!({ "reverified": n })))
}

#[derive(Deserialize)]
pub struct GcBody {
    #[serde(rename = "projectID", default)]
    project_id: String,
    #[serde(rename = "minTrust")]
    min_trust: Option<f64>,
}

/// `POST /knowledge/gc`: pinned items always survive.
pub async fn gc(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<GcBody>,
) -> Result<Json<Value>, AppError> {
    let project = load_project(&state, &req.project_id).await?;
    let min_trust = req.min_trust.unwrap_or(state.config.curator.min_trust);
    let removed = knowledge::gc(state.store.as_ref(), &project.id, min_trust).await?;
    let expired = knowledge::gc_ttl(state.store.as_ref(), &project.id, Utc::now()).await?;
    Ok(Json(json!({ "removed": removed, "expired": expired })))
}

#[derive(Deserialize)]
pub struct ApproveBody {
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    pin: bool,
    #[serde(rename = "minTrust")]
    min_trust: Option<f64>,
}

/// `POST /knowledge/approve`
pub async fn approve(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ApproveBody>,
) -> Result<Json<Value>, AppError> {
    if req.ids.is_empty() {
        return Err(AppError::invalid_request("ids must not be empty"));
    }
    let min_trust = req.min_trust.unwrap_or(state.config.curator.min_trust);
    let n = knowledge::approve(state.store.as_ref(), &req.ids, req.pin, min_trust).await?;
    Ok(Json(json!({ "approved": n })))
}

/// `GET /knowledge/pending?projectID=`
pub async fn pending(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<ProjectRef>,
) -> Result<Json<Value>, AppError> {
    let project = load_project(&state, &query.project_id).await?;
    let items = knowledge::pending(
        state.store.as_ref(),
        &project.id,
        state.config.curator.min_trust,
    )
    .await?;
    Ok(Json(json!({ "items": items })))
}

#[derive(Deserialize)]
pub struct DeleteBody {
    #[serde(default)]
    ids: Vec<String>,
}

/// `POST /knowledge/delete`
pub async fn delete(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<DeleteBody>,
) -> Result<Json<Value>, AppError> {
    if req.ids.is_empty() {
        return Err(AppError::invalid_request("ids must not be empty"));
    }
    let n = state.store.delete_knowledge(&req.ids).await?;
    Ok(Json(json!({ "deleted": n })))
}
