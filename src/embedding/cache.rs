//! Process-wide embedding cache.
//!
//! Entries are keyed `model|generation|sha256(text)`. The generation is a
//! namespace prefix from configuration: bumping it makes every existing
//! entry unreachable without a purge. Entries expire after `ttl`; when
//! `max_entries` is non-zero the oldest insertion is evicted first.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use mycoder_core::embedding::sha256_hex;

use super::EmbeddingProvider;

struct Entry {
    vector: Vec<f32>,
    inserted: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    order: VecDeque<(String, Instant)>,
}

pub struct EmbeddingCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    gen: String,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(ttl: Duration, gen: &str, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ttl,
            gen: gen.to_string(),
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn key(&self, model: &str, text: &str) -> String {
        format!("{}|{}|{}", model, self.gen, sha256_hex(text.as_bytes()))
    }

    pub fn get(&self, model: &str, text: &str) -> Option<Vec<f32>> {
        let key = self.key(model, text);
        let mut inner = self.lock();
        let found = match inner.entries.get(&key) {
            Some(e) if e.inserted.elapsed() <= self.ttl => Some(e.vector.clone()),
            Some(_) => {
                inner.entries.remove(&key);
                None
            }
            None => None,
        };
        drop(inner);
        match found {
            Some(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(v)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, model: &str, text: &str, vector: Vec<f32>) {
        let key = self.key(model, text);
        let now = Instant::now();
        let mut inner = self.lock();
        inner.entries.insert(
            key.clone(),
            Entry {
                vector,
                inserted: now,
            },
        );
        inner.order.push_back((key, now));

        if self.max_entries > 0 {
            while inner.entries.len() > self.max_entries {
                let Some((old, at)) = inner.order.pop_front() else {
                    break;
                };
                // Skip stale order records left by re-inserts.
                if inner.entries.get(&old).map(|e| e.inserted == at) == Some(true) {
                    inner.entries.remove(&old);
                }
            }
        }
        // Keep the order queue from outgrowing the map.
        if inner.order.len() > inner.entries.len() * 2 + 16 {
            let Inner { entries, order } = &mut *inner;
            order.retain(|(k, at)| entries.get(k).map(|e| e.inserted == *at) == Some(true));
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Wraps a provider, serving repeated texts from an [`EmbeddingCache`].
pub struct CachedProvider {
    inner: Arc<dyn EmbeddingProvider>,
    cache: Arc<EmbeddingCache>,
}

impl CachedProvider {
    pub fn new(inner: Arc<dyn EmbeddingProvider>, cache: Arc<EmbeddingCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl EmbeddingProvider for CachedProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out: Vec<Option<Vec<f32>>> =
            texts.iter().map(|t| self.cache.get(model, t)).collect();
        let missing: Vec<usize> = (0..texts.len()).filter(|i| out[*i].is_none()).collect();

        if !missing.is_empty() {
            let batch: Vec<String> = missing.iter().map(|i| texts[*i].clone()).collect();
            let vectors = self.inner.embed(model, &batch).await?;
            if vectors.len() != batch.len() {
                anyhow::bail!(
                    "Embedding provider returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                );
            }
            for (i, v) in missing.into_iter().zip(vectors) {
                self.cache.put(model, &texts[i], v.clone());
                out[i] = Some(v);
            }
        }

        Ok(out.into_iter().flatten().collect())
    }
}
