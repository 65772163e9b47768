use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use super::error::{ApiQuery, AppError};
use super::AppState;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub async fn healthz() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
pub struct MetricsQuery {
    format: Option<String>,
}

fn wants_json(query: &MetricsQuery, headers: &HeaderMap) -> bool {
    if let Some(f) = query.format.as_deref() {
        return f.eq_ignore_ascii_case("json");
    }
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json"))
}

/// `GET /metrics`
pub async fn metrics(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<MetricsQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let snap = state.app.snapshot().await?;
    if wants_json(&query, &headers) {
        return Ok(Json(state.metrics.render_json(&snap)).into_response());
    }
    Ok((
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.metrics.render_prometheus(&snap),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_param_wins_over_accept() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, "application/json".parse().unwrap());
        let text = MetricsQuery {
            format: Some("prometheus".into()),
        };
        assert!(!wants_json(&text, &headers));
        assert!(wants_json(&MetricsQuery { format: None }, &headers));
        assert!(!wants_json(&MetricsQuery { format: None }, &HeaderMap::new()));
    }
}
