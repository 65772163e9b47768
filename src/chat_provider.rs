//! Chat model providers.
//!
//! A [`ChatProvider`] turns a message list into a stream of content deltas.
//!
//! | Provider | Behaviour |
//! |----------|-----------|
//! | [`OpenAIChat`] | `POST {base}/chat/completions` with `stream: true`, parsing `data:` lines |
//! | [`MockChat`] | emits scripted deltas; used by tests and demos |
//! | [`DisabledChat`] | fails with [`ProviderError::NotConfigured`] |
//!
//! Errors that the HTTP layer needs to classify are [`ProviderError`]
//! values carried inside `anyhow::Error`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use mycoder_core::models::ChatMessage;

use crate::config::ChatConfig;
use crate::embed_pipeline::Translator;

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("chat provider is not configured")]
    NotConfigured,
    #[error("upstream provider error: {0}")]
    Upstream(String),
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Start a streaming completion.
    async fn stream(&self, req: ChatRequest) -> Result<DeltaStream>;

    /// Non-streaming completion: the concatenated deltas.
    async fn complete(&self, req: ChatRequest) -> Result<String> {
        let mut deltas = self.stream(req).await?;
        let mut out = String::new();
        while let Some(delta) = deltas.next().await {
            out.push_str(&delta?);
        }
        Ok(out)
    }
}

// ============ OpenAI-compatible ============

#[derive(Serialize)]
struct OpenAiStreamRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
}

pub struct OpenAIChat {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl OpenAIChat {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty()),
            model: config.model.clone(),
            temperature: config.temperature,
            min_interval: Duration::from_millis(config.min_interval_ms),
            last_call: Mutex::new(None),
        })
    }

    /// Space upstream calls at least `min_interval` apart.
    async fn throttle(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut last = self.last_call.lock().await;
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[async_trait]
impl ChatProvider for OpenAIChat {
    fn name(&self) -> &str {
        "openai"
    }

    async fn stream(&self, req: ChatRequest) -> Result<DeltaStream> {
        self.throttle().await;
        let model = req.model.as_deref().unwrap_or(&self.model);
        let body = OpenAiStreamRequest {
            model,
            messages: &req.messages,
            temperature: req.temperature.unwrap_or(self.temperature),
            stream: true,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| ProviderError::Upstream(format!("connect failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream(format!("{}: {}", status, body)).into());
        }

        let deltas = stream_lines(resp.bytes_stream()).filter_map(|line| async move {
            match line {
                Ok(line) => parse_openai_line(&line),
                Err(e) => Some(Err(e)),
            }
        });
        Ok(Box::pin(deltas))
    }
}

/// Parse one SSE line of an OpenAI-style stream.
///
/// `Some(Ok(delta))` for content, `Some(Err)` for malformed JSON, `None` for
/// anything to skip (blank lines, `[DONE]`, role-only chunks).
fn parse_openai_line(line: &str) -> Option<Result<String>> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<OpenAiStreamChunk>(data) {
        Ok(chunk) => {
            let content = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta.content)
                .unwrap_or_default();
            if content.is_empty() {
                None
            } else {
                Some(Ok(content))
            }
        }
        Err(e) => Some(Err(anyhow::anyhow!("Failed to parse stream chunk: {}", e))),
    }
}

/// Convert a byte stream into a stream of complete, non-blank lines.
fn stream_lines<S, B>(byte_stream: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send,
{
    stream::unfold(
        (Box::pin(byte_stream), String::new()),
        |(mut bytes, mut buffer)| async move {
            loop {
                if let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].to_string();
                    buffer.drain(..=pos);
                    if !line.trim().is_empty() {
                        return Some((Ok(line), (bytes, buffer)));
                    }
                    continue;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => buffer.push_str(&String::from_utf8_lossy(chunk.as_ref())),
                    Some(Err(e)) => {
                        return Some((
                            Err(ProviderError::Upstream(format!("stream read error: {}", e)).into()),
                            (bytes, buffer),
                        ))
                    }
                    None => {
                        if buffer.trim().is_empty() {
                            return None;
                        }
                        let rest = std::mem::take(&mut buffer);
                        return Some((Ok(rest), (bytes, buffer)));
                    }
                }
            }
        },
    )
}

// ============ Mock ============

/// Emits a fixed list of deltas. With `fail_after = Some(n)` the stream
/// yields an error after `n` deltas.
pub struct MockChat {
    deltas: Vec<String>,
    fail_after: Option<usize>,
}

impl MockChat {
    pub fn new(deltas: Vec<String>) -> Self {
        Self {
            deltas,
            fail_after: None,
        }
    }

    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }
}

#[async_trait]
impl ChatProvider for MockChat {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(&self, _req: ChatRequest) -> Result<DeltaStream> {
        let mut items: Vec<Result<String>> = Vec::new();
        for (i, d) in self.deltas.iter().enumerate() {
            if self.fail_after == Some(i) {
                break;
            }
            items.push(Ok(d.clone()));
        }
        if self.fail_after.is_some() {
            items.push(Err(ProviderError::Upstream("mock stream failure".into()).into()));
        }
        Ok(Box::pin(stream::iter(items)))
    }
}

// ============ Disabled ============

pub struct DisabledChat;

#[async_trait]
impl ChatProvider for DisabledChat {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn stream(&self, _req: ChatRequest) -> Result<DeltaStream> {
        Err(ProviderError::NotConfigured.into())
    }
}

pub fn create_chat_provider(config: &ChatConfig) -> Result<Arc<dyn ChatProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(
            OpenAIChat::new(config).context("Failed to build chat client")?,
        )),
        "mock" => Ok(Arc::new(MockChat::new(config.mock_deltas.clone()))),
        "disabled" => Ok(Arc::new(DisabledChat)),
        other => anyhow::bail!("Unknown chat provider: {}", other),
    }
}

/// Korean → English translation through a chat provider.
pub struct ChatTranslator {
    provider: Arc<dyn ChatProvider>,
}

impl ChatTranslator {
    pub fn new(provider: Arc<dyn ChatProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Translator for ChatTranslator {
    async fn translate(&self, text: &str) -> Result<String> {
        self.provider
            .complete(ChatRequest {
                messages: vec![
                    ChatMessage::system(
                        "Translate the user's Korean text to English. Reply with the translation only.",
                    ),
                    ChatMessage::user(text),
                ],
                model: None,
                temperature: Some(0.0),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_openai_lines() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_openai_line(line).unwrap().unwrap(), "Hel");
        assert!(parse_openai_line("data: [DONE]").is_none());
        assert!(parse_openai_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#).is_none());
        assert!(parse_openai_line(": keep-alive").is_none());
        assert!(parse_openai_line("data: {broken").unwrap().is_err());
    }

    #[tokio::test]
    async fn stream_lines_reassembles_split_chunks() {
        let chunks: Vec<reqwest::Result<Vec<u8>>> = vec![
            Ok(b"data: one\n\nda".to_vec()),
            Ok(b"ta: two\n".to_vec()),
            Ok(b"tail".to_vec()),
        ];
        let lines: Vec<String> = stream_lines(stream::iter(chunks))
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["data: one", "data: two", "tail"]);
    }

    #[tokio::test]
    async fn mock_streams_and_completes() {
        let mock = MockChat::new(vec!["Hello ".into(), "world".into()]);
        assert_eq!(mock.complete(ChatRequest::default()).await.unwrap(), "Hello world");

        let failing = MockChat::new(vec!["a".into(), "b".into()]).failing_after(1);
        let items: Vec<Result<String>> = failing.stream(ChatRequest::default()).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn disabled_is_not_configured() {
        let err = DisabledChat.complete(ChatRequest::default()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProviderError>(),
            Some(ProviderError::NotConfigured)
        ));
    }
}
