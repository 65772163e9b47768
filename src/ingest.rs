//! Indexing pipeline orchestration.
//!
//! Coordinates one index pass over a project: walk → incremental upsert
//! (chunking + lexical entries) → embedding → prune. Embedding failures are
//! logged and never fail the pass.
//!
//! Progress is reported through a [`ProgressSink`] every
//! [`PROGRESS_EVERY`] files and once at the end. The sink is also asked
//! for cancellation before each file; a cancelled pass stops at that
//! boundary and skips pruning, since the set of present paths is incomplete.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use mycoder_core::chunk::ChunkOptions;
use mycoder_core::embedding::sha256_hex;
use mycoder_core::models::{IndexMode, Project, UpsertStatus};
use mycoder_core::store::{Store, VectorStore};

use crate::connector_fs::{scan_project, WalkOptions};
use crate::embed_pipeline::{EmbedItem, EmbedSettings};

pub const PROGRESS_EVERY: u64 = 10;

/// Receives progress and answers cancellation checks.
#[async_trait]
pub trait ProgressSink: Send {
    async fn progress(&mut self, indexed: u64, total: u64);
    fn cancelled(&self) -> bool {
        false
    }
}

/// Discards progress; never cancels.
pub struct NullProgress;

#[async_trait]
impl ProgressSink for NullProgress {
    async fn progress(&mut self, _indexed: u64, _total: u64) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexReport {
    /// Files processed in this pass, whatever their upsert status.
    pub documents: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub pruned: u64,
    pub embedded: u64,
    pub cancelled: bool,
}

pub struct Indexer {
    store: Arc<dyn Store>,
    vectors: Arc<dyn VectorStore>,
    embed: Option<EmbedSettings>,
    chunk: ChunkOptions,
}

impl Indexer {
    pub fn new(store: Arc<dyn Store>, vectors: Arc<dyn VectorStore>, chunk: ChunkOptions) -> Self {
        Self {
            store,
            vectors,
            embed: None,
            chunk,
        }
    }

    /// Embed new chunks with these settings.
    pub fn with_embeddings(mut self, settings: EmbedSettings) -> Self {
        self.embed = Some(settings);
        self
    }

    pub async fn run(
        &self,
        project: &Project,
        mode: IndexMode,
        walk: &WalkOptions,
        sink: &mut dyn ProgressSink,
    ) -> Result<IndexReport> {
        let root = PathBuf::from(&project.root_path);
        let mut walk = walk.clone();
        walk.exclude.extend(project.ignore.iter().cloned());
        let files = tokio::task::spawn_blocking(move || scan_project(&root, &walk))
            .await
            .context("File walk panicked")??;

        let total = files.len() as u64;
        let force = mode == IndexMode::Full;
        let mut pipeline = self.embed.as_ref().map(|s| s.pipeline(self.vectors.clone()));
        let mut report = IndexReport::default();
        let mut present = Vec::with_capacity(files.len());

        for file in &files {
            if sink.cancelled() {
                report.cancelled = true;
                break;
            }

            let outcome = self
                .store
                .upsert_document(&project.id, file, &self.chunk, force)
                .await
                .with_context(|| format!("Failed to index {}", file.path))?;
            present.push(file.path.clone());

            match outcome.status {
                UpsertStatus::Unchanged => report.unchanged += 1,
                UpsertStatus::Inserted => report.inserted += 1,
                UpsertStatus::Updated => {
                    report.updated += 1;
                    self.vectors
                        .delete_by_doc(&project.id, &outcome.document_id)
                        .await?;
                }
            }

            if let Some(p) = pipeline.as_mut() {
                for chunk in &outcome.chunks {
                    let item = EmbedItem {
                        project_id: project.id.clone(),
                        doc_id: outcome.document_id.clone(),
                        chunk_id: chunk.id.clone(),
                        path: file.path.clone(),
                        sha: sha256_hex(chunk.text.as_bytes()),
                        text: chunk.text.clone(),
                    };
                    if let Err(e) = p.add(item).await {
                        warn!(path = %file.path, error = %e, "storing embeddings failed");
                    }
                }
            }

            report.documents += 1;
            if report.documents % PROGRESS_EVERY == 0 || report.documents == total {
                sink.progress(report.documents, total).await;
            }
        }

        if let Some(p) = pipeline.as_mut() {
            if let Err(e) = p.flush().await {
                warn!(error = %e, "storing embeddings failed");
            }
            report.embedded = p.stats().embedded;
        }

        if !report.cancelled {
            let pruned = self.store.prune_documents(&project.id, &present).await?;
            for doc_id in &pruned {
                self.vectors.delete_by_doc(&project.id, doc_id).await?;
            }
            report.pruned = pruned.len() as u64;
        }

        info!(
            project = %project.id,
            mode = mode.as_str(),
            documents = report.documents,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            pruned = report.pruned,
            embedded = report.embedded,
            cancelled = report.cancelled,
            "index pass finished"
        );
        Ok(report)
    }
}
