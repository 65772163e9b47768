//! Configuration parsing, environment overrides, and validation.
//!
//! mycoder is configured by an optional TOML file (default
//! `./config/mycoder.toml`). Every section has defaults, so a missing or
//! empty file yields a working in-process setup with embeddings and chat
//! disabled. `MYCODER_*` environment variables override file values.
//!
//! # Example
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8765"
//!
//! [storage]
//! path = "./data/mycoder.sqlite"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//!
//! [chat]
//! provider = "openai"
//! model = "gpt-4o-mini"
//!
//! [rag]
//! budget = 3000
//! inject_strategy = "system"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub chat: ChatConfig,
    pub embedding: EmbeddingConfig,
    pub embed_cache: EmbedCacheConfig,
    pub retrieval: RetrievalConfig,
    pub rag: RagConfig,
    pub index: IndexConfig,
    pub curator: CuratorConfig,
    pub rate_limit: RateLimitConfig,
    pub metrics: MetricsConfig,
    pub conversations: ConversationsConfig,
    pub fs: FsConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Base URL the CLI uses to reach a running server.
    pub url: String,
    /// When set, every request except `/healthz` needs this bearer token.
    pub api_token: Option<String>,
    pub readonly: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8765".to_string(),
            url: "http://127.0.0.1:8765".to_string(),
            api_token: None,
            readonly: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file. Empty or `:memory:` selects the in-memory store.
    pub path: PathBuf,
    /// Continue with the in-memory store if the database cannot be opened.
    pub fallback_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/mycoder.sqlite"),
            fallback_memory: true,
        }
    }
}

impl StorageConfig {
    pub fn is_memory(&self) -> bool {
        let s = self.path.to_string_lossy();
        s.is_empty() || s == ":memory:"
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChatConfig {
    /// `openai`, `mock`, or `disabled`.
    pub provider: String,
    pub model: String,
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    /// Minimum spacing between upstream calls.
    pub min_interval_ms: u64,
    pub temperature: f32,
    pub timeout_secs: u64,
    /// Deltas emitted by the `mock` provider.
    pub mock_deltas: Vec<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            min_interval_ms: 0,
            temperature: 0.2,
            timeout_secs: 120,
            mock_deltas: vec!["Hello ".to_string(), "world".to_string()],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `openai`, `hash`, or `disabled`.
    pub provider: String,
    pub model: String,
    /// Provider for code files; defaults to `provider`.
    pub provider_code: Option<String>,
    /// Model for code files; defaults to `model`.
    pub model_code: Option<String>,
    /// Extensions routed to the code model.
    pub code_extensions: Vec<String>,
    pub base_url: String,
    pub api_key_env: String,
    /// Vector size of the `hash` provider.
    pub dims: usize,
    pub batch_size: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
    /// Translate Korean text to English before embedding.
    pub translate: bool,
    pub translate_timeout_ms: u64,
    pub max_input_bytes: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: "text-embedding-3-small".to_string(),
            provider_code: None,
            model_code: None,
            code_extensions: [
                "go", "rs", "ts", "tsx", "js", "jsx", "py", "java", "kt", "c", "h", "cpp", "cs",
                "rb", "php", "swift", "scala",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            dims: 256,
            batch_size: 8,
            max_retries: 3,
            timeout_secs: 30,
            translate: false,
            translate_timeout_ms: 1200,
            max_input_bytes: 8000,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn code_provider(&self) -> &str {
        self.provider_code.as_deref().unwrap_or(&self.provider)
    }

    pub fn code_model(&self) -> &str {
        self.model_code.as_deref().unwrap_or(&self.model)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbedCacheConfig {
    pub disable: bool,
    pub ttl_sec: u64,
    /// Namespace prefix; changing it invalidates every cached entry.
    pub gen: String,
    /// 0 means unbounded.
    pub max_entries: usize,
}

impl Default for EmbedCacheConfig {
    fn default() -> Self {
        Self {
            disable: false,
            ttl_sec: 3600,
            gen: "1".to_string(),
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    /// `aggregate = lex + α × knn`.
    pub hybrid_alpha: f64,
    pub preview_tokens: usize,
    pub default_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: 0.5,
            preview_tokens: 10,
            default_k: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RagConfig {
    /// Byte budget for injected snippets. 0 means citations only.
    pub budget: usize,
    /// `system` or `append_user`.
    pub inject_strategy: String,
    /// `default` or `concise`.
    pub style: String,
    pub debug: bool,
    pub retrieval_timeout_ms: u64,
    pub avg_line_bytes: usize,
    pub margin_lines: usize,
    pub min_lines: usize,
    pub max_lines: usize,
    pub summary: bool,
    pub summary_threshold: usize,
    pub window_chars: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            budget: 3000,
            inject_strategy: "system".to_string(),
            style: "default".to_string(),
            debug: false,
            retrieval_timeout_ms: 5000,
            avg_line_bytes: 80,
            margin_lines: 3,
            min_lines: 8,
            max_lines: 80,
            summary: false,
            summary_threshold: 8000,
            window_chars: 6000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexConfig {
    pub max_files: usize,
    pub max_file_size: u64,
    pub max_tokens: usize,
    pub overlap_ratio: f64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_files: 20_000,
            max_file_size: 256 * 1024,
            max_tokens: 400,
            overlap_ratio: 0.10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CuratorConfig {
    pub disable: bool,
    pub interval_secs: u64,
    pub min_trust: f64,
    pub decay_rate: f64,
    pub decay_after_days: i64,
}

impl Default for CuratorConfig {
    fn default() -> Self {
        Self {
            disable: false,
            interval_secs: 600,
            min_trust: 0.3,
            decay_rate: 0.05,
            decay_after_days: 14,
        }
    }
}

/// Requests per second per scope; 0 disables that scope.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RateLimitConfig {
    pub global_rps: f64,
    pub path_rps: f64,
    pub ip_rps: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    /// Fraction of HTTP requests recorded, in `[0, 1]`.
    pub sample_rate: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { sample_rate: 1.0 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConversationsConfig {
    /// 0 disables cleanup.
    pub ttl_days: u32,
    pub cleanup_interval_secs: u64,
}

impl Default for ConversationsConfig {
    fn default() -> Self {
        Self {
            ttl_days: 30,
            cleanup_interval_secs: 3600,
        }
    }
}

/// Path regex policy for mutating filesystem operations.
///
/// A path must match at least one `allow` pattern (when any are set) and
/// no `deny` pattern.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FsConfig {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            allow: Vec::new(),
            deny: vec![r"(^|/)\.git(/|$)".to_string()],
        }
    }
}

/// Load configuration from `path` (if it exists), apply `MYCODER_*`
/// environment overrides, and validate.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    apply_env(&mut config, |k| std::env::var(k).ok())?;
    validate(&config)?;
    Ok(config)
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| anyhow::anyhow!("Invalid value for {}: '{}'", key, raw))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => bail!("Invalid boolean for {}: '{}'", key, raw),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Apply environment overrides through `lookup`. Environment wins over file.
pub fn apply_env<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    macro_rules! env_str {
        ($key:literal, $target:expr) => {
            if let Some(v) = lookup($key) {
                $target = v;
            }
        };
    }
    macro_rules! env_parse {
        ($key:literal, $target:expr) => {
            if let Some(v) = lookup($key) {
                $target = parse_env($key, &v)?;
            }
        };
    }
    macro_rules! env_bool {
        ($key:literal, $target:expr) => {
            if let Some(v) = lookup($key) {
                $target = parse_bool($key, &v)?;
            }
        };
    }

    env_str!("MYCODER_BIND", config.server.bind);
    env_str!("MYCODER_SERVER_URL", config.server.url);
    if let Some(v) = lookup("MYCODER_API_TOKEN") {
        config.server.api_token = Some(v).filter(|t| !t.is_empty());
    }
    env_bool!("MYCODER_READONLY", config.server.readonly);

    if let Some(v) = lookup("MYCODER_STORAGE_PATH") {
        config.storage.path = PathBuf::from(v);
    }

    env_str!("MYCODER_CHAT_MODEL", config.chat.model);
    env_parse!("MYCODER_MIN_LLM_INTERVAL_MS", config.chat.min_interval_ms);

    env_str!("MYCODER_EMBEDDING_MODEL", config.embedding.model);
    env_str!("MYCODER_EMBEDDING_PROVIDER", config.embedding.provider);
    if let Some(v) = lookup("MYCODER_EMBEDDING_MODEL_CODE") {
        config.embedding.model_code = Some(v);
    }
    if let Some(v) = lookup("MYCODER_EMBEDDING_PROVIDER_CODE") {
        config.embedding.provider_code = Some(v);
    }

    if let Some(v) = lookup("MYCODER_FS_ALLOW") {
        config.fs.allow = split_list(&v);
    }
    if let Some(v) = lookup("MYCODER_FS_DENY") {
        config.fs.deny = split_list(&v);
    }

    env_bool!("MYCODER_CURATOR_DISABLE", config.curator.disable);
    env_parse!("MYCODER_CURATOR_INTERVAL_SECS", config.curator.interval_secs);
    env_parse!("MYCODER_KNOWLEDGE_MIN_TRUST", config.curator.min_trust);

    env_parse!("MYCODER_METRICS_SAMPLE_RATE", config.metrics.sample_rate);
    env_parse!("MYCODER_RATE_LIMIT_GLOBAL_RPS", config.rate_limit.global_rps);
    env_parse!("MYCODER_RATE_LIMIT_PATH_RPS", config.rate_limit.path_rps);
    env_parse!("MYCODER_RATE_LIMIT_IP_RPS", config.rate_limit.ip_rps);

    env_parse!("MYCODER_RAG_BUDGET", config.rag.budget);
    env_str!("MYCODER_RAG_INJECT_STRATEGY", config.rag.inject_strategy);
    env_str!("MYCODER_RAG_STYLE", config.rag.style);
    env_bool!("MYCODER_RAG_DEBUG", config.rag.debug);
    env_parse!(
        "MYCODER_RAG_RETRIEVAL_TIMEOUT_MS",
        config.rag.retrieval_timeout_ms
    );

    env_parse!("MYCODER_EMBED_CACHE_TTL_SEC", config.embed_cache.ttl_sec);
    env_str!("MYCODER_EMBED_CACHE_GEN", config.embed_cache.gen);
    env_parse!("MYCODER_EMBED_CACHE_MAX_ENTRIES", config.embed_cache.max_entries);
    env_bool!("MYCODER_EMBED_CACHE_DISABLE", config.embed_cache.disable);

    env_parse!("MYCODER_CONV_TTL_DAYS", config.conversations.ttl_days);
    Ok(())
}

/// Reject configurations that would misbehave at runtime.
pub fn validate(config: &Config) -> Result<()> {
    if config.retrieval.hybrid_alpha < 0.0 || config.retrieval.hybrid_alpha.is_nan() {
        bail!("retrieval.hybrid_alpha must be >= 0");
    }
    if !(0.0..=0.5).contains(&config.index.overlap_ratio) {
        bail!("index.overlap_ratio must be in [0.0, 0.5]");
    }
    if config.index.max_tokens == 0 {
        bail!("index.max_tokens must be > 0");
    }
    if !(0.0..=1.0).contains(&config.metrics.sample_rate) {
        bail!("metrics.sample_rate must be in [0.0, 1.0]");
    }
    for (key, rps) in [
        ("rate_limit.global_rps", config.rate_limit.global_rps),
        ("rate_limit.path_rps", config.rate_limit.path_rps),
        ("rate_limit.ip_rps", config.rate_limit.ip_rps),
    ] {
        if rps < 0.0 || rps.is_nan() {
            bail!("{} must be >= 0", key);
        }
    }

    for (key, name) in [
        ("embedding.provider", config.embedding.provider.as_str()),
        ("embedding.provider_code", config.embedding.code_provider()),
    ] {
        match name {
            "openai" | "hash" | "disabled" => {}
            other => bail!(
                "Unknown {}: '{}'. Must be openai, hash, or disabled.",
                key,
                other
            ),
        }
    }
    if config.embedding.is_enabled() && config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.provider == "hash" && config.embedding.dims == 0 {
        bail!("embedding.dims must be > 0 for the hash provider");
    }

    match config.chat.provider.as_str() {
        "openai" | "mock" | "disabled" => {}
        other => bail!(
            "Unknown chat provider: '{}'. Must be openai, mock, or disabled.",
            other
        ),
    }

    match config.rag.inject_strategy.as_str() {
        "system" | "append_user" => {}
        other => bail!(
            "Unknown rag.inject_strategy: '{}'. Must be system or append_user.",
            other
        ),
    }

    for pattern in config.fs.allow.iter().chain(config.fs.deny.iter()) {
        regex::Regex::new(pattern)
            .with_context(|| format!("Invalid fs policy regex: {}", pattern))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_is_valid() {
        let config: Config = toml::from_str("").unwrap();
        validate(&config).unwrap();
        assert_eq!(config.rag.budget, 3000);
        assert_eq!(config.retrieval.hybrid_alpha, 0.5);
        assert_eq!(config.conversations.ttl_days, 30);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("nope.toml")).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8765");
    }

    #[test]
    fn env_overrides_file() {
        let mut config: Config = toml::from_str(
            r#"
            [rag]
            budget = 100
            [rate_limit]
            global_rps = 5
            "#,
        )
        .unwrap();
        let env: HashMap<&str, &str> = [
            ("MYCODER_RAG_BUDGET", "0"),
            ("MYCODER_RATE_LIMIT_GLOBAL_RPS", "1"),
            ("MYCODER_READONLY", "true"),
            ("MYCODER_FS_DENY", "secret, \\.env$"),
        ]
        .into_iter()
        .collect();
        apply_env(&mut config, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.rag.budget, 0);
        assert_eq!(config.rate_limit.global_rps, 1.0);
        assert!(config.server.readonly);
        assert_eq!(config.fs.deny, vec!["secret".to_string(), "\\.env$".to_string()]);
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let mut config = Config::default();
        let err = apply_env(&mut config, |k| {
            (k == "MYCODER_RAG_BUDGET").then(|| "lots".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("MYCODER_RAG_BUDGET"));
    }

    #[test]
    fn rejects_unknown_strategy_and_provider() {
        let mut config = Config::default();
        config.rag.inject_strategy = "prepend".into();
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.embedding.provider = "magic".into();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = Config::default();
        config.metrics.sample_rate = 1.5;
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.index.overlap_ratio = 0.7;
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.retrieval.hybrid_alpha = -0.1;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn memory_storage_detection() {
        let mut s = StorageConfig::default();
        assert!(!s.is_memory());
        s.path = PathBuf::from(":memory:");
        assert!(s.is_memory());
        s.path = PathBuf::new();
        assert!(s.is_memory());
    }

    #[test]
    fn example_config_parses_and_validates() {
        let config: Config =
            toml::from_str(include_str!("../config/mycoder.example.toml")).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.fs.deny, Config::default().fs.deny);
        assert_eq!(config.rag.inject_strategy, "system");
    }
}
