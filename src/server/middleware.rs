//! Cross-cutting request layers, outermost first:
//!
//! 1. request id: accept `X-Request-ID` or mint one, echo it, open a span
//! 2. metrics: sampled request counter and latency per normalized path
//! 3. rate limit: token buckets keyed by scope, `429` with `Retry-After`
//! 4. auth: bearer token or `?token=` when `server.api_token` is set
//! 5. read-only: mutating endpoints answer `forbidden`

use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::Instrument;

use super::error::AppError;
use super::AppState;
use crate::ratelimit::normalize_path;

pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

const REQUEST_ID_LEN: usize = 24;

/// Paths that stay reachable without a token.
const AUTH_EXEMPT: &[&str] = &["/healthz"];

/// Non-GET paths that do not mutate anything.
const READONLY_ALLOWED: &[&str] = &["/chat", "/fs/read"];

fn new_request_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(REQUEST_ID_LEN);
    id
}

pub async fn request_id(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(new_request_id);
    if let Ok(v) = HeaderValue::from_str(&id) {
        req.headers_mut().insert(X_REQUEST_ID.clone(), v);
    }

    let span = tracing::info_span!(
        "request",
        request_id = %id,
        method = %req.method(),
        path = %req.uri().path()
    );
    let mut response = next.run(req).instrument(span).await;
    if let Ok(v) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(X_REQUEST_ID.clone(), v);
    }
    response
}

pub async fn metrics(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !state.metrics.should_sample() {
        return next.run(req).await;
    }
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());
    let started = Instant::now();
    let response = next.run(req).await;
    state
        .metrics
        .record_request(&method, &path, response.status().as_u16(), started.elapsed());
    response
}

pub async fn rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !state.limiter.is_enabled() {
        return next.run(req).await;
    }
    let ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    match state.limiter.check(req.uri().path(), &ip) {
        Ok(()) => next.run(req).await,
        Err(retry_after) => {
            tracing::debug!(ip = %ip, retry_after, "rate limited");
            AppError::too_many_requests(retry_after).into_response()
        }
    }
}

#[derive(Deserialize)]
struct TokenParam {
    token: Option<String>,
}

fn presented_token(req: &Request) -> Option<String> {
    if let Some(bearer) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(bearer.trim().to_string());
    }
    Query::<TokenParam>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(param)| param.token)
}

pub async fn auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(expected) = state.config.server.api_token.as_deref() else {
        return next.run(req).await;
    };
    if req.method() == Method::OPTIONS || AUTH_EXEMPT.contains(&req.uri().path()) {
        return next.run(req).await;
    }
    match presented_token(&req) {
        Some(token) if token == expected => next.run(req).await,
        Some(_) => AppError::unauthorized("invalid token").into_response(),
        None => AppError::unauthorized("missing bearer token").into_response(),
    }
}

fn is_mutating(method: &Method, path: &str) -> bool {
    !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
        && !READONLY_ALLOWED.contains(&path)
}

pub async fn readonly(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if state.config.server.readonly && is_mutating(req.method(), req.uri().path()) {
        return AppError::forbidden("server is in read-only mode").into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_are_24_hex() {
        let id = new_request_id();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn readonly_classification() {
        assert!(!is_mutating(&Method::GET, "/projects"));
        assert!(!is_mutating(&Method::POST, "/chat"));
        assert!(!is_mutating(&Method::POST, "/fs/read"));
        assert!(is_mutating(&Method::POST, "/projects"));
        assert!(is_mutating(&Method::DELETE, "/projects/p1"));
        assert!(is_mutating(&Method::POST, "/fs/write"));
    }

    #[test]
    fn token_from_header_or_query() {
        let req = Request::builder()
            .uri("/projects")
            .header(header::AUTHORIZATION, "Bearer s3cret")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(presented_token(&req).as_deref(), Some("s3cret"));

        let req = Request::builder()
            .uri("/projects?x=1&token=abc")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(presented_token(&req).as_deref(), Some("abc"));

        let req = Request::builder()
            .uri("/projects?token=a%2Fb%26c%3Dd+e")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(presented_token(&req).as_deref(), Some("a/b&c=d e"));

        let req = Request::builder()
            .uri("/projects")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(presented_token(&req), None);
    }
}
