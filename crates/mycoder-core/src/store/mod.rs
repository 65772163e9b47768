//! Storage abstraction.
//!
//! [`Store`] covers everything the indexer, retrievers, curator, and HTTP
//! surface persist: projects, documents with their chunks and lexical
//! entries, knowledge, jobs, conversations, and patch records.
//! [`VectorStore`] holds embeddings separately so that it can be swapped for
//! a [`NoopVectorStore`] when no embedding provider is available.
//!
//! Implementations must be `Send + Sync`; the server shares them behind
//! `Arc<dyn Store>` / `Arc<dyn VectorStore>`.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::chunk::{chunk_source, ChunkOptions};
use crate::models::{
    ChatMessage, Chunk, ChunkLocation, Document, EmbeddingRecord, FileDoc, IndexJob, Knowledge,
    PatchRecord, Project, SearchHit, StoreStats, VectorHit,
};

/// Abstract storage backend.
///
/// | Group | Methods |
/// |-------|---------|
/// | Projects | `create_project`, `get_project`, `list_projects`, `delete_project` |
/// | Documents | `upsert_document`, `prune_documents`, `list_documents`, `list_chunks`, `lexical_ords`, `chunk_locations` |
/// | Lexical | `lexical_search` |
/// | Knowledge | `add_knowledge`, `get_knowledge`, `list_knowledge`, `update_knowledge`, `delete_knowledge` |
/// | Jobs | `save_job`, `get_job` |
/// | Conversations | `append_message`, `conversation_messages`, `delete_conversations_before` |
/// | Patches | `save_patch`, `get_patch` |
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_project(&self, name: &str, root_path: &str, ignore: &[String])
        -> Result<Project>;
    async fn get_project(&self, id: &str) -> Result<Option<Project>>;
    async fn list_projects(&self) -> Result<Vec<Project>>;
    /// Deletes the project and everything it owns. Returns false if absent.
    async fn delete_project(&self, id: &str) -> Result<bool>;

    /// Insert or incrementally update one document.
    ///
    /// Unchanged files (same `sha`, or same `mtime` unless `force` is set)
    /// keep their chunks. Otherwise chunks and lexical entries are replaced
    /// in a single atomic step.
    async fn upsert_document(
        &self,
        project_id: &str,
        file: &FileDoc,
        opts: &ChunkOptions,
        force: bool,
    ) -> Result<crate::models::UpsertOutcome>;

    /// Deletes documents whose path is not in `present`; returns their ids.
    async fn prune_documents(&self, project_id: &str, present: &[String]) -> Result<Vec<String>>;
    async fn list_documents(&self, project_id: &str) -> Result<Vec<Document>>;
    async fn list_chunks(&self, doc_id: &str) -> Result<Vec<Chunk>>;
    /// Ordinals present in the lexical index for a document, ascending.
    async fn lexical_ords(&self, doc_id: &str) -> Result<Vec<i64>>;
    async fn chunk_locations(&self, chunk_ids: &[String]) -> Result<Vec<ChunkLocation>>;

    /// BM25 search. Results are sorted by score descending, ties by path.
    async fn lexical_search(
        &self,
        project_id: Option<&str>,
        query: &str,
        k: usize,
        preview_tokens: usize,
    ) -> Result<Vec<SearchHit>>;

    async fn add_knowledge(&self, item: &Knowledge) -> Result<String>;
    async fn get_knowledge(&self, id: &str) -> Result<Option<Knowledge>>;
    /// Items with `trust_score >= min_trust`, highest trust first.
    async fn list_knowledge(&self, project_id: &str, min_trust: f64) -> Result<Vec<Knowledge>>;
    async fn update_knowledge(&self, item: &Knowledge) -> Result<()>;
    async fn delete_knowledge(&self, ids: &[String]) -> Result<u64>;

    async fn save_job(&self, job: &IndexJob) -> Result<()>;
    async fn get_job(&self, id: &str) -> Result<Option<IndexJob>>;

    async fn append_message(
        &self,
        conversation_id: &str,
        project_id: Option<&str>,
        message: &ChatMessage,
    ) -> Result<()>;
    async fn conversation_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>>;
    /// Deletes conversations whose last activity is older than `cutoff`.
    async fn delete_conversations_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn save_patch(&self, patch: &PatchRecord) -> Result<()>;
    async fn get_patch(&self, id: &str) -> Result<Option<PatchRecord>>;

    async fn stats(&self) -> Result<StoreStats>;
}

/// Per-project embedding storage with exact cosine search.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Backend name for logs and metrics (`memory`, `sqlite`, `noop`).
    fn kind(&self) -> &str;
    /// Idempotent: each record replaces any row with the same id.
    async fn upsert(&self, items: &[EmbeddingRecord]) -> Result<()>;
    /// Top-`k` by cosine over embeddings of `project_id` whose dimension
    /// equals `query.len()`.
    async fn search(&self, project_id: &str, query: &[f32], k: usize) -> Result<Vec<VectorHit>>;
    async fn delete_by_doc(&self, project_id: &str, doc_id: &str) -> Result<()>;
    async fn delete_by_project(&self, project_id: &str) -> Result<()>;
    async fn count(&self) -> Result<u64>;
}

/// Always-empty vector store used when embeddings are unavailable.
pub struct NoopVectorStore;

#[async_trait]
impl VectorStore for NoopVectorStore {
    fn kind(&self) -> &str {
        "noop"
    }

    async fn upsert(&self, _items: &[EmbeddingRecord]) -> Result<()> {
        Ok(())
    }

    async fn search(&self, _project_id: &str, _query: &[f32], _k: usize) -> Result<Vec<VectorHit>> {
        Ok(Vec::new())
    }

    async fn delete_by_doc(&self, _project_id: &str, _doc_id: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_by_project(&self, _project_id: &str) -> Result<()> {
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(0)
    }
}

/// Whether an existing document must be re-chunked for `file`.
///
/// A matching `sha` always short-circuits. The `mtime` shortcut only applies
/// to incremental passes; `force` (full mode) compares content alone.
pub fn needs_reindex(existing: &Document, file: &FileDoc, force: bool) -> bool {
    if existing.sha == file.sha {
        return false;
    }
    if force {
        return true;
    }
    file.mtime.is_empty() || existing.mtime != file.mtime
}

/// Chunk a file for `doc_id`, assigning fresh ids and dense ordinals.
pub fn build_chunks(doc_id: &str, file: &FileDoc, opts: &ChunkOptions) -> Vec<Chunk> {
    chunk_source(&file.content, &file.lang, opts)
        .into_iter()
        .enumerate()
        .map(|(ord, piece)| Chunk {
            id: uuid::Uuid::new_v4().to_string(),
            doc_id: doc_id.to_string(),
            ord: ord as i64,
            text: piece.text,
            start_line: piece.start_line,
            end_line: piece.end_line,
        })
        .collect()
}

/// Sort hits by score descending, ties broken by path ascending.
pub fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.start_line.cmp(&b.start_line))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(sha: &str, mtime: &str) -> Document {
        Document {
            id: "d".into(),
            project_id: "p".into(),
            path: "a.go".into(),
            sha: sha.into(),
            lang: "go".into(),
            mtime: mtime.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn file(sha: &str, mtime: &str) -> FileDoc {
        FileDoc {
            path: "a.go".into(),
            content: "package a".into(),
            sha: sha.into(),
            lang: "go".into(),
            mtime: mtime.into(),
        }
    }

    #[test]
    fn unchanged_sha_skips_even_when_forced() {
        assert!(!needs_reindex(&doc("x", "t1"), &file("x", "t2"), false));
        assert!(!needs_reindex(&doc("x", "t1"), &file("x", "t2"), true));
    }

    #[test]
    fn matching_mtime_skips_unless_forced() {
        assert!(!needs_reindex(&doc("x", "t1"), &file("y", "t1"), false));
        assert!(needs_reindex(&doc("x", "t1"), &file("y", "t1"), true));
        assert!(needs_reindex(&doc("x", "t1"), &file("y", "t2"), false));
    }

    #[test]
    fn sort_hits_breaks_ties_by_path() {
        let mk = |p: &str, s: f64| SearchHit {
            path: p.into(),
            score: s,
            preview: String::new(),
            start_line: 1,
            end_line: 1,
        };
        let mut hits = vec![mk("b", 1.0), mk("a", 1.0), mk("c", 2.0)];
        sort_hits(&mut hits);
        let order: Vec<&str> = hits.iter().map(|h| h.path.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }
}
