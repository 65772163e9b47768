//! Error envelope and JSON extraction.
//!
//! Every non-2xx response is `{"error": <code>, "message": <text>, "code": <status>}`.
//!
//! | `error` | Status |
//! |---------|--------|
//! | `invalid_json`, `invalid_request` | 400 |
//! | `unauthorized` | 401 |
//! | `forbidden` | 403 |
//! | `not_found` | 404 |
//! | `method_not_allowed` | 405 |
//! | `too_many_requests` | 429 |
//! | `internal_error` | 500 |
//! | `bad_gateway` | 502 |
//! | `not_configured` | 503 |

use axum::extract::{FromRequest, FromRequestParts, Query, Request};
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::error;

use crate::chat_provider::ProviderError;
use crate::fs_ops::FsError;

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: &'a str,
    code: u16,
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub retry_after: Option<u64>,
}

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn invalid_json(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_json", message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn method_not_allowed() -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            "method not allowed",
        )
    }

    pub fn too_many_requests(retry_after: u64) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "too_many_requests",
                "rate limit exceeded",
            )
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub fn not_configured(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "not_configured", message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "bad_gateway", message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code,
            message: &self.message,
            code: self.status.as_u16(),
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        response
    }
}

impl From<FsError> for AppError {
    fn from(e: FsError) -> Self {
        match e {
            FsError::Escape(_) | FsError::Denied(_) => AppError::forbidden(e.to_string()),
            FsError::NotFound(_) => AppError::not_found(e.to_string()),
            FsError::InvalidPath(_) | FsError::InvalidPatch(_) | FsError::Conflict { .. } => {
                AppError::invalid_request(e.to_string())
            }
            FsError::Io(_) => {
                error!(error = %e, "filesystem error");
                AppError::internal(e.to_string())
            }
            FsError::Storage(inner) => AppError::from(inner),
        }
    }
}

/// Classify by the typed errors carried in the chain; anything else is a 500.
impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        for cause in e.chain() {
            if let Some(p) = cause.downcast_ref::<ProviderError>() {
                return match p {
                    ProviderError::NotConfigured => AppError::not_configured(p.to_string()),
                    ProviderError::Upstream(_) => AppError::bad_gateway(p.to_string()),
                };
            }
        }
        error!(error = %format!("{:#}", e), "request failed");
        AppError::internal(format!("{:#}", e))
    }
}

/// `axum::Json` with rejections mapped to `invalid_json`.
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(AppError::invalid_json(rejection.body_text())),
        }
    }
}

/// `axum::extract::Query` with rejections mapped to `invalid_request`.
pub struct ApiQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(ApiQuery(value)),
            Err(rejection) => Err(AppError::invalid_request(rejection.body_text())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape_and_retry_after() {
        let resp = AppError::too_many_requests(2).into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "2");
    }

    #[test]
    fn fs_errors_map_to_statuses() {
        assert_eq!(
            AppError::from(FsError::Escape("../x".into())).status,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::from(FsError::NotFound("a".into())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::from(FsError::InvalidPatch("bad".into())).code,
            "invalid_request"
        );
    }

    #[test]
    fn provider_errors_are_classified_through_context() {
        let e = anyhow::Error::from(ProviderError::NotConfigured).context("chat failed");
        assert_eq!(AppError::from(e).code, "not_configured");
        let e = anyhow::Error::from(ProviderError::Upstream("500".into()));
        assert_eq!(AppError::from(e).status, StatusCode::BAD_GATEWAY);
        assert_eq!(AppError::from(anyhow::anyhow!("boom")).code, "internal_error");
    }
}
