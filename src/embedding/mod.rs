//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]** returns errors; used when embeddings are not configured.
//! - **[`OpenAIProvider`]** calls an OpenAI-compatible `/embeddings` endpoint with retry and backoff.
//! - **[`HashProvider`]** deterministic feature hashing, offline and dependency-free.
//!
//! [`EmbeddingRouter`] picks the `(provider, model)` pair for a path: code
//! files (by extension) go to the code route, everything else to the default.
//! [`ProviderQueryEmbedder`] adapts a provider to the retriever's
//! [`QueryEmbedder`].
//!
//! # Retry Strategy
//!
//! The OpenAI provider uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

pub mod cache;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use mycoder_core::embedding::QueryEmbedder;

use crate::config::{EmbedCacheConfig, EmbeddingConfig};
use cache::{CachedProvider, EmbeddingCache};

/// An embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name recorded on every stored embedding (`openai`, `hash`, ...).
    fn name(&self) -> &str;
    /// Embed `texts` with `model`, one vector per input, in input order.
    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ============ Disabled Provider ============

pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn embed(&self, _model: &str, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ OpenAI Provider ============

/// Embedding provider for OpenAI-compatible APIs.
///
/// Calls `POST {base_url}/embeddings`. The API key is read once from the
/// environment variable named by `embedding.api_key_env`.
pub struct OpenAIProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    max_retries: u32,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = match std::env::var(&config.api_key_env) {
            Ok(k) if !k.is_empty() => k,
            _ => bail!("{} environment variable not set", config.api_key_env),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": model,
            "input": texts,
        });
        let url = format!("{}/embeddings", self.base_url);

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_openai_response(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "Embedding API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Embedding API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }
}

/// Extract `data[].embedding`, ordered by `data[].index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid embedding response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid embedding response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Hash Provider ============

/// Feature-hashing embedder: each lowercase alphanumeric token adds ±1 to
/// one of `dims` buckets, then the vector is L2-normalized.
///
/// Texts sharing vocabulary land close together, which is enough for
/// offline use and tests.
pub struct HashProvider {
    dims: usize,
}

impl HashProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let h = fnv1a(token.to_lowercase().as_bytes());
            let bucket = (h % self.dims as u64) as usize;
            let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

#[async_trait]
impl EmbeddingProvider for HashProvider {
    fn name(&self) -> &str {
        "hash"
    }

    async fn embed(&self, _model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Create the [`EmbeddingProvider`] named `name`.
///
/// | Name | Provider |
/// |------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"hash"` | [`HashProvider`] |
pub fn create_provider(name: &str, config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match name {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "hash" => Ok(Arc::new(HashProvider::new(config.dims))),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Routing ============

/// A provider paired with the model it should be called with.
#[derive(Clone)]
pub struct Route {
    pub provider: Arc<dyn EmbeddingProvider>,
    pub model: String,
}

impl Route {
    /// Grouping key for batching: `model|provider`.
    pub fn key(&self) -> String {
        format!("{}|{}", self.model, self.provider.name())
    }
}

/// Chooses the default or code route per path.
#[derive(Clone)]
pub struct EmbeddingRouter {
    pub default: Route,
    pub code: Route,
    code_extensions: Vec<String>,
}

impl EmbeddingRouter {
    pub fn new(default: Route, code: Route, code_extensions: Vec<String>) -> Self {
        Self {
            default,
            code,
            code_extensions: code_extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    /// Same route for every path.
    pub fn single(route: Route) -> Self {
        Self::new(route.clone(), route, Vec::new())
    }

    /// Build both routes from configuration, each wrapped by `cache` when given.
    pub fn from_config(config: &EmbeddingConfig, cache: Option<Arc<EmbeddingCache>>) -> Result<Self> {
        let wrap = |p: Arc<dyn EmbeddingProvider>| -> Arc<dyn EmbeddingProvider> {
            match &cache {
                Some(c) => Arc::new(CachedProvider::new(p, c.clone())),
                None => p,
            }
        };
        let default_provider = wrap(create_provider(&config.provider, config)?);
        let code_provider = if config.code_provider() == config.provider {
            default_provider.clone()
        } else {
            wrap(create_provider(config.code_provider(), config)?)
        };
        Ok(Self::new(
            Route {
                provider: default_provider,
                model: config.model.clone(),
            },
            Route {
                provider: code_provider,
                model: config.code_model().to_string(),
            },
            config.code_extensions.clone(),
        ))
    }

    pub fn is_code_path(&self, path: &str) -> bool {
        Path::new(path)
            .extension()
            .map(|e| {
                let ext = e.to_string_lossy().to_ascii_lowercase();
                self.code_extensions.iter().any(|c| *c == ext)
            })
            .unwrap_or(false)
    }

    pub fn route(&self, path: &str) -> &Route {
        if self.is_code_path(path) {
            &self.code
        } else {
            &self.default
        }
    }

    /// Startup health probe: embed a short string through the default route.
    pub async fn probe(&self) -> bool {
        match self
            .default
            .provider
            .embed(&self.default.model, &["ping".to_string()])
            .await
        {
            Ok(v) if v.first().map(|x| !x.is_empty()).unwrap_or(false) => true,
            Ok(_) => {
                warn!("embedding probe returned no vector");
                false
            }
            Err(e) => {
                warn!(error = %e, "embedding probe failed; semantic retrieval disabled");
                false
            }
        }
    }
}

/// Build the process-wide cache unless disabled.
pub fn cache_from_config(config: &EmbedCacheConfig) -> Option<Arc<EmbeddingCache>> {
    if config.disable {
        return None;
    }
    Some(Arc::new(EmbeddingCache::new(
        Duration::from_secs(config.ttl_sec),
        &config.gen,
        config.max_entries,
    )))
}

/// Embeds retrieval queries with the default route.
pub struct ProviderQueryEmbedder {
    route: Route,
}

impl ProviderQueryEmbedder {
    pub fn new(route: Route) -> Self {
        Self { route }
    }
}

#[async_trait]
impl QueryEmbedder for ProviderQueryEmbedder {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self
            .route
            .provider
            .embed(&self.route.model, &[text.to_string()])
            .await?;
        out.pop()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }
}
