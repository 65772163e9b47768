//! Batched embedding of freshly indexed chunks.
//!
//! The indexer feeds chunks through [`EmbedPipeline::add`]; the pipeline
//! queues them and, once `batch_size` items are waiting or on
//! [`EmbedPipeline::flush`], groups the queue by `model|provider` and makes
//! one embedding call per group.
//!
//! # Policy
//!
//! | Step | Behaviour |
//! |------|-----------|
//! | Dedup | `project|path|sha` seen earlier in this pipeline is dropped |
//! | Truncate | text capped at `max_input_bytes` (char boundary) |
//! | Route | code extensions use the code route, others the default |
//! | Translate | Hangul text goes through the translator under a deadline |
//! | Failure | batch error or count mismatch → retry each item alone; still failing → skipped |
//!
//! Embedding failures are never fatal to indexing. Vector-store write
//! failures are returned to the caller.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use mycoder_core::conversation::contains_hangul;
use mycoder_core::embedding::embedding_id;
use mycoder_core::models::EmbeddingRecord;
use mycoder_core::store::VectorStore;

use crate::embedding::{EmbeddingRouter, Route};

/// Translates text to English before embedding.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str) -> Result<String>;
}

/// One chunk waiting to be embedded.
#[derive(Debug, Clone)]
pub struct EmbedItem {
    pub project_id: String,
    pub doc_id: String,
    pub chunk_id: String,
    pub path: String,
    /// Content hash used for dedup; empty disables dedup for this item.
    pub sha: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbedStats {
    pub embedded: u64,
    pub deduped: u64,
    pub failed: u64,
    pub retried_batches: u64,
}

/// Everything needed to start a pipeline; one pipeline is built per index run.
#[derive(Clone)]
pub struct EmbedSettings {
    pub router: EmbeddingRouter,
    pub batch_size: usize,
    pub max_input_bytes: usize,
    pub translator: Option<Arc<dyn Translator>>,
    pub translate_timeout: Duration,
}

impl EmbedSettings {
    pub fn new(router: EmbeddingRouter) -> Self {
        Self {
            router,
            batch_size: 8,
            max_input_bytes: 8000,
            translator: None,
            translate_timeout: Duration::from_millis(1200),
        }
    }

    pub fn pipeline(&self, vectors: Arc<dyn VectorStore>) -> EmbedPipeline {
        let p = EmbedPipeline::new(self.router.clone(), vectors)
            .with_batch_size(self.batch_size)
            .with_max_input_bytes(self.max_input_bytes);
        match &self.translator {
            Some(t) => p.with_translator(t.clone(), self.translate_timeout),
            None => p,
        }
    }
}

pub struct EmbedPipeline {
    router: EmbeddingRouter,
    vectors: Arc<dyn VectorStore>,
    translator: Option<Arc<dyn Translator>>,
    translate_timeout: Duration,
    batch_size: usize,
    max_input_bytes: usize,
    seen: HashSet<String>,
    queue: Vec<EmbedItem>,
    stats: EmbedStats,
}

impl EmbedPipeline {
    pub fn new(router: EmbeddingRouter, vectors: Arc<dyn VectorStore>) -> Self {
        Self {
            router,
            vectors,
            translator: None,
            translate_timeout: Duration::from_millis(1200),
            batch_size: 8,
            max_input_bytes: 8000,
            seen: HashSet::new(),
            queue: Vec::new(),
            stats: EmbedStats::default(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_input_bytes(mut self, bytes: usize) -> Self {
        self.max_input_bytes = bytes;
        self
    }

    pub fn with_translator(mut self, translator: Arc<dyn Translator>, timeout: Duration) -> Self {
        self.translator = Some(translator);
        self.translate_timeout = timeout;
        self
    }

    pub fn stats(&self) -> EmbedStats {
        self.stats
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Queue one item, flushing once a full batch is waiting.
    pub async fn add(&mut self, item: EmbedItem) -> Result<()> {
        if !item.sha.is_empty() {
            let key = format!("{}|{}|{}", item.project_id, item.path, item.sha);
            if !self.seen.insert(key) {
                self.stats.deduped += 1;
                return Ok(());
            }
        }
        self.queue.push(item);
        if self.queue.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Embed and store everything queued.
    pub async fn flush(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let queue = std::mem::take(&mut self.queue);

        let mut groups: Vec<(String, Route, Vec<EmbedItem>)> = Vec::new();
        for item in queue {
            let route = self.router.route(&item.path).clone();
            let key = route.key();
            match groups.iter_mut().find(|(k, _, _)| *k == key) {
                Some((_, _, items)) => items.push(item),
                None => groups.push((key, route, vec![item])),
            }
        }

        for (key, route, items) in groups {
            let mut texts = Vec::with_capacity(items.len());
            for item in &items {
                texts.push(self.prepare_text(&item.text).await);
            }
            let vectors = self.embed_group(&key, &route, &texts).await;

            let now = Utc::now();
            let records: Vec<EmbeddingRecord> = items
                .iter()
                .zip(vectors)
                .filter_map(|(item, v)| {
                    let v = v?;
                    Some(EmbeddingRecord {
                        id: embedding_id(&item.project_id, &item.doc_id, &item.chunk_id, &route.model),
                        project_id: item.project_id.clone(),
                        doc_id: item.doc_id.clone(),
                        chunk_id: item.chunk_id.clone(),
                        provider: route.provider.name().to_string(),
                        model: route.model.clone(),
                        dim: v.len(),
                        vector: v,
                        created_at: now,
                    })
                })
                .collect();

            self.stats.failed += (items.len() - records.len()) as u64;
            self.stats.embedded += records.len() as u64;
            self.vectors.upsert(&records).await?;
            debug!(group = %key, stored = records.len(), "embedded batch");
        }
        Ok(())
    }

    /// One vector slot per text; `None` marks items that failed twice.
    async fn embed_group(&mut self, key: &str, route: &Route, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        match route.provider.embed(&route.model, texts).await {
            Ok(vs) if vs.len() == texts.len() => {
                return vs
                    .into_iter()
                    .map(|v| if v.is_empty() { None } else { Some(v) })
                    .collect();
            }
            Ok(vs) => warn!(
                group = %key,
                expected = texts.len(),
                got = vs.len(),
                "embedding count mismatch, retrying per item"
            ),
            Err(e) => warn!(group = %key, error = %e, "embedding batch failed, retrying per item"),
        }

        self.stats.retried_batches += 1;
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let single = route
                .provider
                .embed(&route.model, std::slice::from_ref(text))
                .await;
            out.push(match single {
                Ok(mut vs) if vs.len() == 1 && !vs[0].is_empty() => vs.pop(),
                Ok(_) => None,
                Err(e) => {
                    debug!(group = %key, error = %e, "embedding item skipped");
                    None
                }
            });
        }
        out
    }

    async fn prepare_text(&self, text: &str) -> String {
        let text = truncate_bytes(text, self.max_input_bytes);
        let Some(translator) = &self.translator else {
            return text.to_string();
        };
        if !contains_hangul(text) {
            return text.to_string();
        }
        match tokio::time::timeout(self.translate_timeout, translator.translate(text)).await {
            Ok(Ok(t)) if !t.trim().is_empty() => truncate_bytes(&t, self.max_input_bytes).to_string(),
            Ok(Ok(_)) => text.to_string(),
            Ok(Err(e)) => {
                warn!(error = %e, "translation failed, embedding original text");
                text.to_string()
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.translate_timeout.as_millis() as u64,
                    "translation timed out, embedding original text"
                );
                text.to_string()
            }
        }
    }
}

/// Longest prefix of `text` within `max` bytes that ends on a char boundary.
pub fn truncate_bytes(text: &str, max: usize) -> &str {
    if max == 0 || text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingProvider, HashProvider};
    use mycoder_core::store::memory::InMemoryVectorStore;
    use std::sync::Mutex;

    fn item(path: &str, chunk: &str, sha: &str, text: &str) -> EmbedItem {
        EmbedItem {
            project_id: "p".into(),
            doc_id: format!("doc-{}", path),
            chunk_id: chunk.into(),
            path: path.into(),
            sha: sha.into(),
            text: text.into(),
        }
    }

    fn hash_router(dims: usize) -> EmbeddingRouter {
        EmbeddingRouter::single(Route {
            provider: Arc::new(HashProvider::new(dims)),
            model: "m".into(),
        })
    }

    /// Fails every multi-item batch and any text containing "bad".
    struct Flaky {
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl EmbeddingProvider for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn embed(&self, _model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.batches.lock().unwrap().push(texts.len());
            if texts.len() > 1 || texts.iter().any(|t| t.contains("bad")) {
                anyhow::bail!("upstream 500");
            }
            Ok(vec![vec![1.0, 0.0]])
        }
    }

    struct Upper;

    #[async_trait]
    impl Translator for Upper {
        async fn translate(&self, _text: &str) -> Result<String> {
            Ok("translated".into())
        }
    }

    struct Slow;

    #[async_trait]
    impl Translator for Slow {
        async fn translate(&self, text: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(text.to_string())
        }
    }

    #[tokio::test]
    async fn batches_and_dedups() {
        let vectors = Arc::new(InMemoryVectorStore::new());
        let mut p = EmbedPipeline::new(hash_router(16), vectors.clone()).with_batch_size(2);
        p.add(item("a.go", "c1", "s1", "func A")).await.unwrap();
        assert_eq!(p.pending(), 1);
        p.add(item("a.go", "c1-dup", "s1", "func A")).await.unwrap();
        assert_eq!(p.pending(), 1);
        p.add(item("b.md", "c2", "s2", "docs")).await.unwrap();
        assert_eq!(p.pending(), 0);
        p.add(item("c.md", "c3", "", "more")).await.unwrap();
        p.flush().await.unwrap();

        assert_eq!(vectors.count().await.unwrap(), 3);
        let stats = p.stats();
        assert_eq!((stats.embedded, stats.deduped, stats.failed), (3, 1, 0));
    }

    #[tokio::test]
    async fn retries_items_and_skips_failures() {
        let flaky = Arc::new(Flaky {
            batches: Mutex::new(Vec::new()),
        });
        let router = EmbeddingRouter::single(Route {
            provider: flaky.clone(),
            model: "m".into(),
        });
        let vectors = Arc::new(InMemoryVectorStore::new());
        let mut p = EmbedPipeline::new(router, vectors.clone()).with_batch_size(10);
        p.add(item("a.md", "c1", "1", "good")).await.unwrap();
        p.add(item("b.md", "c2", "2", "bad")).await.unwrap();
        p.add(item("c.md", "c3", "3", "fine")).await.unwrap();
        p.flush().await.unwrap();

        assert_eq!(*flaky.batches.lock().unwrap(), vec![3, 1, 1, 1]);
        assert_eq!(vectors.count().await.unwrap(), 2);
        let stats = p.stats();
        assert_eq!((stats.embedded, stats.failed, stats.retried_batches), (2, 1, 1));
    }

    #[tokio::test]
    async fn translates_hangul_with_deadline() {
        let vectors = Arc::new(InMemoryVectorStore::new());
        let p = EmbedPipeline::new(hash_router(8), vectors.clone())
            .with_translator(Arc::new(Upper), Duration::from_millis(500));
        assert_eq!(p.prepare_text("검색 API").await, "translated");
        assert_eq!(p.prepare_text("plain").await, "plain");

        let slow = EmbedPipeline::new(hash_router(8), vectors)
            .with_translator(Arc::new(Slow), Duration::from_millis(10));
        assert_eq!(slow.prepare_text("검색").await, "검색");
    }

    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate_bytes("hello", 10), "hello");
        assert_eq!(truncate_bytes("hello", 3), "hel");
        // each Hangul syllable is three bytes
        assert_eq!(truncate_bytes("검색", 4), "검");
    }
}
