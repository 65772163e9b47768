//! Runtime wiring shared by the server and the CLI commands.
//!
//! [`App::from_config`] opens the store (falling back to memory when
//! allowed), builds the embedding router and probes it once, and creates
//! the chat provider. When the probe fails, semantic retrieval is off for
//! the life of the process and the vector store is a no-op.

use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use mycoder_core::chunk::ChunkOptions;
use mycoder_core::search::{Bm25Retriever, HybridRetriever, KnnRetriever, Retriever};
use mycoder_core::store::memory::{InMemoryStore, InMemoryVectorStore};
use mycoder_core::store::{NoopVectorStore, Store, VectorStore};

use crate::chat::{ChatOrchestrator, ChatSettings};
use crate::chat_provider::{create_chat_provider, ChatProvider, ChatTranslator};
use crate::config::Config;
use crate::connector_fs::WalkOptions;
use crate::context::{ContextAssembler, ContextSettings};
use crate::embed_pipeline::EmbedSettings;
use crate::embedding::cache::EmbeddingCache;
use crate::embedding::{cache_from_config, EmbeddingRouter, ProviderQueryEmbedder};
use crate::ingest::Indexer;
use crate::metrics::{Metrics, Snapshot};
use crate::sqlite_store::{SqliteStore, SqliteVectorStore};

pub struct App {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub vectors: Arc<dyn VectorStore>,
    /// `None` when embeddings are disabled or the startup probe failed.
    pub embeddings: Option<EmbeddingRouter>,
    pub embed_cache: Option<Arc<EmbeddingCache>>,
    pub chat: Arc<dyn ChatProvider>,
    pub metrics: Arc<Metrics>,
}

impl App {
    pub async fn from_config(config: Config) -> Result<Self> {
        let (store, vectors) = open_store(&config).await?;
        let chat = create_chat_provider(&config.chat)?;

        let mut app = Self::with_parts(config, store, vectors, chat);
        if app.config.embedding.is_enabled() {
            let cache = cache_from_config(&app.config.embed_cache);
            let router = EmbeddingRouter::from_config(&app.config.embedding, cache.clone())?;
            if router.probe().await {
                info!(
                    provider = router.default.provider.name(),
                    model = %router.default.model,
                    "embeddings available"
                );
                app.embed_cache = cache;
                app.embeddings = Some(router);
            } else {
                warn!("embeddings unavailable, continuing with lexical retrieval only");
                app.vectors = Arc::new(NoopVectorStore);
            }
        } else {
            app.vectors = Arc::new(NoopVectorStore);
        }
        Ok(app)
    }

    /// Assemble from explicit parts, without embeddings.
    pub fn with_parts(
        config: Config,
        store: Arc<dyn Store>,
        vectors: Arc<dyn VectorStore>,
        chat: Arc<dyn ChatProvider>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new(config.metrics.sample_rate));
        Self {
            config: Arc::new(config),
            store,
            vectors,
            embeddings: None,
            embed_cache: None,
            chat,
            metrics,
        }
    }

    pub fn with_embeddings(mut self, router: EmbeddingRouter) -> Self {
        self.embeddings = Some(router);
        self
    }

    pub fn chunk_options(&self) -> ChunkOptions {
        ChunkOptions::new(self.config.index.max_tokens, self.config.index.overlap_ratio)
    }

    pub fn walk_options(&self) -> WalkOptions {
        WalkOptions {
            max_files: self.config.index.max_files,
            max_file_size: self.config.index.max_file_size,
            ..Default::default()
        }
    }

    pub fn indexer(&self) -> Indexer {
        let indexer = Indexer::new(self.store.clone(), self.vectors.clone(), self.chunk_options());
        let Some(router) = &self.embeddings else {
            return indexer;
        };
        let cfg = &self.config.embedding;
        let mut settings = EmbedSettings::new(router.clone());
        settings.batch_size = cfg.batch_size.max(1);
        settings.max_input_bytes = cfg.max_input_bytes;
        settings.translate_timeout = Duration::from_millis(cfg.translate_timeout_ms);
        if cfg.translate {
            settings.translator = Some(Arc::new(ChatTranslator::new(self.chat.clone())));
        }
        indexer.with_embeddings(settings)
    }

    pub fn lexical(&self) -> Arc<Bm25Retriever> {
        Arc::new(
            Bm25Retriever::new(self.store.clone())
                .with_preview_tokens(self.config.retrieval.preview_tokens),
        )
    }

    /// Hybrid retriever over BM25 and KNN, when embeddings are available.
    pub fn hybrid(&self) -> Option<Arc<dyn Retriever>> {
        let router = self.embeddings.as_ref()?;
        let knn = KnnRetriever::new(
            self.store.clone(),
            self.vectors.clone(),
            Arc::new(ProviderQueryEmbedder::new(router.default.clone())),
        );
        Some(Arc::new(HybridRetriever::new(
            self.lexical(),
            Arc::new(knn),
            self.config.retrieval.hybrid_alpha,
        )))
    }

    pub fn assembler(&self) -> ContextAssembler {
        let assembler = ContextAssembler::new(
            self.store.clone(),
            self.lexical(),
            ContextSettings::from_config(&self.config.rag),
        );
        match self.hybrid() {
            Some(h) => assembler.with_hybrid(h),
            None => assembler,
        }
    }

    pub fn orchestrator(&self) -> ChatOrchestrator {
        ChatOrchestrator::new(
            self.store.clone(),
            self.chat.clone(),
            Arc::new(self.assembler()),
            self.metrics.clone(),
            ChatSettings::from_config(&self.config.rag, &self.config.retrieval),
        )
    }

    /// Gauge values for `/metrics`.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        Ok(Snapshot {
            store: self.store.stats().await?,
            embeddings: self.vectors.count().await?,
            cache_hits: self.embed_cache.as_ref().map(|c| c.hits()).unwrap_or(0),
            cache_misses: self.embed_cache.as_ref().map(|c| c.misses()).unwrap_or(0),
        })
    }
}

async fn open_store(config: &Config) -> Result<(Arc<dyn Store>, Arc<dyn VectorStore>)> {
    if config.storage.is_memory() {
        info!("using in-memory store");
        return Ok((
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryVectorStore::new()),
        ));
    }
    match SqliteStore::open(&config.storage.path).await {
        Ok(store) => {
            info!(path = %config.storage.path.display(), "opened sqlite store");
            let vectors = SqliteVectorStore::new(store.pool().clone());
            Ok((Arc::new(store), Arc::new(vectors)))
        }
        Err(e) if config.storage.fallback_memory => {
            warn!(error = %e, "could not open store, falling back to memory");
            Ok((
                Arc::new(InMemoryStore::new()),
                Arc::new(InMemoryVectorStore::new()),
            ))
        }
        Err(e) => bail!("Failed to open store at {}: {:#}", config.storage.path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_provider::DisabledChat;
    use crate::embedding::{HashProvider, Route};

    fn memory_app() -> App {
        App::with_parts(
            Config::default(),
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(DisabledChat),
        )
    }

    #[tokio::test]
    async fn memory_config_is_lexical_only() {
        let mut config = Config::default();
        config.storage.path = ":memory:".into();
        let app = App::from_config(config).await.unwrap();
        assert!(app.embeddings.is_none());
        assert_eq!(app.vectors.kind(), "noop");
        assert!(app.hybrid().is_none());
    }

    #[tokio::test]
    async fn unopenable_store_falls_back_when_allowed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let mut config = Config::default();
        config.storage.path = blocker.join("db.sqlite");

        config.storage.fallback_memory = false;
        assert!(App::from_config(config.clone()).await.is_err());

        config.storage.fallback_memory = true;
        let app = App::from_config(config).await.unwrap();
        assert_eq!(app.store.stats().await.unwrap().projects, 0);
    }

    #[test]
    fn hybrid_requires_embeddings() {
        let app = memory_app();
        assert!(app.hybrid().is_none());
        let app = app.with_embeddings(EmbeddingRouter::single(Route {
            provider: Arc::new(HashProvider::new(8)),
            model: "m".into(),
        }));
        assert!(app.hybrid().is_some());
    }
}
