//! In-memory [`Store`] and [`VectorStore`] implementations.
//!
//! All state lives behind a single `Mutex` so that a document re-index
//! (chunks + lexical entries) is observed atomically. Vector search is
//! brute-force cosine; keyword search uses [`LexicalIndex`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::chunk::ChunkOptions;
use crate::embedding::cosine_search;
use crate::lexical::{snippet, LexicalIndex};
use crate::models::{
    ChatMessage, Chunk, ChunkLocation, Document, EmbeddingRecord, FileDoc, IndexJob, Knowledge,
    PatchRecord, Project, SearchHit, StoreStats, UpsertOutcome, UpsertStatus, VectorHit,
};

use super::{build_chunks, needs_reindex, sort_hits, Store, VectorStore};

struct Conversation {
    project_id: Option<String>,
    messages: Vec<ChatMessage>,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    projects: HashMap<String, Project>,
    documents: HashMap<String, Document>,
    /// doc_id -> chunks ordered by ord
    chunks: HashMap<String, Vec<Chunk>>,
    lexical: LexicalIndex,
    knowledge: HashMap<String, Knowledge>,
    jobs: HashMap<String, IndexJob>,
    conversations: HashMap<String, Conversation>,
    patches: HashMap<String, PatchRecord>,
}

impl Inner {
    fn remove_document(&mut self, doc_id: &str) {
        self.documents.remove(doc_id);
        self.chunks.remove(doc_id);
        self.lexical.delete_by_doc(doc_id);
    }

    fn replace_chunks(&mut self, doc_id: &str, chunks: &[Chunk]) {
        self.lexical.delete_by_doc(doc_id);
        for c in chunks {
            self.lexical.upsert(doc_id, c.ord, &c.text);
        }
        self.chunks.insert(doc_id.to_string(), chunks.to_vec());
    }
}

/// In-memory store for tests and storage-less deployments.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_project(
        &self,
        name: &str,
        root_path: &str,
        ignore: &[String],
    ) -> Result<Project> {
        let project = Project {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            root_path: root_path.to_string(),
            ignore: ignore.to_vec(),
            created_at: Utc::now(),
        };
        self.lock()
            .projects
            .insert(project.id.clone(), project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        Ok(self.lock().projects.get(id).cloned())
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let mut projects: Vec<Project> = self.lock().projects.values().cloned().collect();
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(projects)
    }

    async fn delete_project(&self, id: &str) -> Result<bool> {
        let mut inner = self.lock();
        if inner.projects.remove(id).is_none() {
            return Ok(false);
        }
        let doc_ids: Vec<String> = inner
            .documents
            .values()
            .filter(|d| d.project_id == id)
            .map(|d| d.id.clone())
            .collect();
        for doc_id in doc_ids {
            inner.remove_document(&doc_id);
        }
        inner.knowledge.retain(|_, k| k.project_id != id);
        Ok(true)
    }

    async fn upsert_document(
        &self,
        project_id: &str,
        file: &FileDoc,
        opts: &ChunkOptions,
        force: bool,
    ) -> Result<UpsertOutcome> {
        let mut inner = self.lock();
        let existing = inner
            .documents
            .values()
            .find(|d| d.project_id == project_id && d.path == file.path)
            .cloned();
        let now = Utc::now();

        match existing {
            Some(doc) if !needs_reindex(&doc, file, force) => Ok(UpsertOutcome {
                document_id: doc.id,
                status: UpsertStatus::Unchanged,
                chunks: Vec::new(),
            }),
            Some(mut doc) => {
                doc.sha = file.sha.clone();
                doc.lang = file.lang.clone();
                doc.mtime = file.mtime.clone();
                doc.updated_at = now;
                let chunks = build_chunks(&doc.id, file, opts);
                inner.replace_chunks(&doc.id, &chunks);
                let id = doc.id.clone();
                inner.documents.insert(id.clone(), doc);
                Ok(UpsertOutcome {
                    document_id: id,
                    status: UpsertStatus::Updated,
                    chunks,
                })
            }
            None => {
                let doc = Document {
                    id: uuid::Uuid::new_v4().to_string(),
                    project_id: project_id.to_string(),
                    path: file.path.clone(),
                    sha: file.sha.clone(),
                    lang: file.lang.clone(),
                    mtime: file.mtime.clone(),
                    created_at: now,
                    updated_at: now,
                };
                let chunks = build_chunks(&doc.id, file, opts);
                inner.replace_chunks(&doc.id, &chunks);
                let id = doc.id.clone();
                inner.documents.insert(id.clone(), doc);
                Ok(UpsertOutcome {
                    document_id: id,
                    status: UpsertStatus::Inserted,
                    chunks,
                })
            }
        }
    }

    async fn prune_documents(&self, project_id: &str, present: &[String]) -> Result<Vec<String>> {
        let mut inner = self.lock();
        let stale: Vec<String> = inner
            .documents
            .values()
            .filter(|d| d.project_id == project_id && !present.contains(&d.path))
            .map(|d| d.id.clone())
            .collect();
        for doc_id in &stale {
            inner.remove_document(doc_id);
        }
        Ok(stale)
    }

    async fn list_documents(&self, project_id: &str) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = self
            .lock()
            .documents
            .values()
            .filter(|d| d.project_id == project_id)
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(docs)
    }

    async fn list_chunks(&self, doc_id: &str) -> Result<Vec<Chunk>> {
        Ok(self.lock().chunks.get(doc_id).cloned().unwrap_or_default())
    }

    async fn lexical_ords(&self, doc_id: &str) -> Result<Vec<i64>> {
        Ok(self.lock().lexical.ords_for(doc_id))
    }

    async fn chunk_locations(&self, chunk_ids: &[String]) -> Result<Vec<ChunkLocation>> {
        let inner = self.lock();
        let mut out = Vec::new();
        for id in chunk_ids {
            let found = inner
                .chunks
                .values()
                .flat_map(|cs| cs.iter())
                .find(|c| &c.id == id);
            if let Some(c) = found {
                if let Some(doc) = inner.documents.get(&c.doc_id) {
                    out.push(ChunkLocation {
                        chunk_id: c.id.clone(),
                        doc_id: c.doc_id.clone(),
                        path: doc.path.clone(),
                        start_line: c.start_line,
                        end_line: c.end_line,
                        text: c.text.clone(),
                    });
                }
            }
        }
        Ok(out)
    }

    async fn lexical_search(
        &self,
        project_id: Option<&str>,
        query: &str,
        k: usize,
        preview_tokens: usize,
    ) -> Result<Vec<SearchHit>> {
        let inner = self.lock();
        let project_filter = project_id.filter(|p| !p.is_empty());
        let scored = inner.lexical.search(query, |doc_id| match project_filter {
            Some(pid) => inner
                .documents
                .get(doc_id)
                .map(|d| d.project_id == pid)
                .unwrap_or(false),
            None => true,
        });

        let mut hits: Vec<SearchHit> = scored
            .into_iter()
            .filter_map(|(doc_id, ord, score)| {
                let doc = inner.documents.get(&doc_id)?;
                let chunk = inner.chunks.get(&doc_id)?.iter().find(|c| c.ord == ord)?;
                Some(SearchHit {
                    path: doc.path.clone(),
                    score,
                    preview: snippet(&chunk.text, query, preview_tokens),
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                })
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn add_knowledge(&self, item: &Knowledge) -> Result<String> {
        let mut item = item.clone();
        item.set_trust(item.trust_score);
        let id = item.id.clone();
        self.lock().knowledge.insert(id.clone(), item);
        Ok(id)
    }

    async fn get_knowledge(&self, id: &str) -> Result<Option<Knowledge>> {
        Ok(self.lock().knowledge.get(id).cloned())
    }

    async fn list_knowledge(&self, project_id: &str, min_trust: f64) -> Result<Vec<Knowledge>> {
        let mut items: Vec<Knowledge> = self
            .lock()
            .knowledge
            .values()
            .filter(|k| k.project_id == project_id && k.trust_score >= min_trust)
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            b.trust_score
                .partial_cmp(&a.trust_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.created_at.cmp(&a.created_at))
        });
        Ok(items)
    }

    async fn update_knowledge(&self, item: &Knowledge) -> Result<()> {
        let mut item = item.clone();
        item.set_trust(item.trust_score);
        self.lock().knowledge.insert(item.id.clone(), item);
        Ok(())
    }

    async fn delete_knowledge(&self, ids: &[String]) -> Result<u64> {
        let mut inner = self.lock();
        Ok(ids
            .iter()
            .filter(|id| inner.knowledge.remove(id.as_str()).is_some())
            .count() as u64)
    }

    async fn save_job(&self, job: &IndexJob) -> Result<()> {
        self.lock().jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<IndexJob>> {
        Ok(self.lock().jobs.get(id).cloned())
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        project_id: Option<&str>,
        message: &ChatMessage,
    ) -> Result<()> {
        let mut inner = self.lock();
        let conv = inner
            .conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| Conversation {
                project_id: project_id.map(str::to_string),
                messages: Vec::new(),
                updated_at: Utc::now(),
            });
        if conv.project_id.is_none() {
            conv.project_id = project_id.map(str::to_string);
        }
        conv.messages.push(message.clone());
        conv.updated_at = Utc::now();
        Ok(())
    }

    async fn conversation_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        Ok(self
            .lock()
            .conversations
            .get(conversation_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default())
    }

    async fn delete_conversations_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let before = inner.conversations.len();
        inner.conversations.retain(|_, c| c.updated_at >= cutoff);
        Ok((before - inner.conversations.len()) as u64)
    }

    async fn save_patch(&self, patch: &PatchRecord) -> Result<()> {
        self.lock().patches.insert(patch.id.clone(), patch.clone());
        Ok(())
    }

    async fn get_patch(&self, id: &str) -> Result<Option<PatchRecord>> {
        Ok(self.lock().patches.get(id).cloned())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let inner = self.lock();
        Ok(StoreStats {
            projects: inner.projects.len() as u64,
            documents: inner.documents.len() as u64,
            jobs: inner.jobs.len() as u64,
            knowledge: inner.knowledge.len() as u64,
        })
    }
}

/// In-memory embedding storage keyed by deterministic embedding id.
#[derive(Default)]
pub struct InMemoryVectorStore {
    rows: Mutex<HashMap<String, EmbeddingRecord>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, EmbeddingRecord>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn kind(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, items: &[EmbeddingRecord]) -> Result<()> {
        let mut rows = self.lock();
        for item in items {
            rows.insert(item.id.clone(), item.clone());
        }
        Ok(())
    }

    async fn search(&self, project_id: &str, query: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let rows = self.lock();
        let candidates = rows
            .values()
            .filter(|r| r.project_id == project_id)
            .map(|r| (r.doc_id.as_str(), r.chunk_id.as_str(), r.vector.as_slice()));
        Ok(cosine_search(query, candidates, k))
    }

    async fn delete_by_doc(&self, project_id: &str, doc_id: &str) -> Result<()> {
        self.lock()
            .retain(|_, r| !(r.project_id == project_id && r.doc_id == doc_id));
        Ok(())
    }

    async fn delete_by_project(&self, project_id: &str) -> Result<()> {
        self.lock().retain(|_, r| r.project_id != project_id);
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.lock().len() as u64)
    }
}
