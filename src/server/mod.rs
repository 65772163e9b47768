//! HTTP surface.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/healthz` | Liveness, body `ok` |
//! | `GET` | `/metrics` | Prometheus text, or JSON via `?format=json` / `Accept` |
//! | `GET`/`POST` | `/projects` | List or create projects |
//! | `GET`/`DELETE` | `/projects/{id}` | Fetch or cascade-delete a project |
//! | `POST` | `/index/run` | Start a background index job |
//! | `POST` | `/index/run/stream` | Index job as SSE |
//! | `GET` | `/index/jobs/{id}` | Job state |
//! | `GET` | `/search` | Lexical search |
//! | `POST` | `/chat` | Grounded chat, JSON or SSE |
//! | `*` | `/knowledge/...` | Knowledge curation |
//! | `POST` | `/fs/...` | Project-confined file operations |
//!
//! Errors use the envelope described in [`error`].
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

pub mod chat;
pub mod error;
pub mod fs;
pub mod index;
pub mod knowledge;
pub mod middleware;
pub mod ops;

use anyhow::{Context, Result};
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use mycoder_core::search::Retriever;
use mycoder_core::store::Store;

use crate::app::App;
use crate::chat::ChatOrchestrator;
use crate::config::Config;
use crate::curator::{spawn_conversation_cleanup, spawn_curator};
use crate::fs_ops::FsPolicy;
use crate::jobs::JobRunner;
use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;

use error::AppError;

/// Shared state handed to every handler through axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub app: Arc<App>,
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub metrics: Arc<Metrics>,
    pub jobs: Arc<JobRunner>,
    pub chat: Arc<ChatOrchestrator>,
    pub lexical: Arc<dyn Retriever>,
    pub limiter: Arc<RateLimiter>,
    pub fs_policy: Arc<FsPolicy>,
}

impl AppState {
    pub fn new(app: App) -> Result<Self> {
        let fs_policy = FsPolicy::from_config(&app.config.fs)?;
        let limiter = RateLimiter::new(&app.config.rate_limit);
        let jobs = JobRunner::new(app.store.clone(), Arc::new(app.indexer()));
        let chat = app.orchestrator();
        let lexical: Arc<dyn Retriever> = app.lexical();
        Ok(Self {
            config: app.config.clone(),
            store: app.store.clone(),
            metrics: app.metrics.clone(),
            jobs: Arc::new(jobs),
            chat: Arc::new(chat),
            lexical,
            limiter: Arc::new(limiter),
            fs_policy: Arc::new(fs_policy),
            app: Arc::new(app),
        })
    }
}

async fn not_found() -> AppError {
    AppError::not_found("no such route")
}

async fn method_not_allowed() -> AppError {
    AppError::method_not_allowed()
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ============ Ops ============
        .route("/healthz", get(ops::healthz))
        .route("/metrics", get(ops::metrics))
        // ============ Projects & indexing ============
        .route("/projects", get(index::list_projects).post(index::create_project))
        .route(
            "/projects/{id}",
            get(index::get_project).delete(index::delete_project),
        )
        .route("/index/run", post(index::run_index))
        .route("/index/run/stream", post(index::run_index_stream))
        .route("/index/jobs/{id}", get(index::get_job))
        .route("/search", get(index::search))
        // ============ Chat ============
        .route("/chat", post(chat::chat))
        // ============ Knowledge ============
        .route("/knowledge/add", post(knowledge::add))
        .route("/knowledge/list", get(knowledge::list))
        .route("/knowledge/vet", post(knowledge::vet))
        .route("/knowledge/promote", post(knowledge::promote))
        .route("/knowledge/promote/auto", post(knowledge::promote_auto))
        .route("/knowledge/reverify", post(knowledge::reverify))
        .route("/knowledge/gc", post(knowledge::gc))
        .route("/knowledge/approve", post(knowledge::approve))
        .route("/knowledge/pending", get(knowledge::pending))
        .route("/knowledge/delete", post(knowledge::delete))
        // ============ Filesystem ============
        .route("/fs/read", post(fs::read))
        .route("/fs/write", post(fs::write))
        .route("/fs/delete", post(fs::delete))
        .route("/fs/patch/unified", post(fs::patch_unified))
        .route("/fs/patch/unified/rollback", post(fs::rollback))
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
        // layers run bottom-up: the last one added sees the request first
        .layer(from_fn_with_state(state.clone(), middleware::readonly))
        .layer(from_fn_with_state(state.clone(), middleware::auth))
        .layer(from_fn_with_state(state.clone(), middleware::rate_limit))
        .layer(from_fn_with_state(state.clone(), middleware::metrics))
        .layer(axum::middleware::from_fn(middleware::request_id))
        .layer(cors)
        .with_state(state)
}

/// Open everything described by `config`, start the background loops, and
/// serve until Ctrl-C.
pub async fn run_server(config: Config) -> Result<()> {
    let bind = config.server.bind.clone();
    let app = App::from_config(config).await?;
    let state = AppState::new(app)?;

    spawn_curator(state.store.clone(), &state.config.curator);
    spawn_conversation_cleanup(state.store.clone(), &state.config.conversations);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!(addr = %bind, readonly = state.config.server.readonly, "mycoder listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
