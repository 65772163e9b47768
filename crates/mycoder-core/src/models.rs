//! Core data models shared by the indexer, retrievers, and HTTP surface.
//!
//! JSON field names follow the wire contract of the HTTP API (`projectID`,
//! `rootPath`, `startLine`, `pathOrURL`, ...), so these types are serialized
//! directly into responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A project is a directory tree that gets indexed and queried.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Absolute directory; every filesystem access is confined to it.
    pub root_path: String,
    #[serde(default)]
    pub ignore: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// An indexed file. At most one per `(project_id, path)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    #[serde(rename = "projectID")]
    pub project_id: String,
    /// Project-relative, slash-normalized.
    pub path: String,
    /// SHA-256 of the raw bytes, lowercase hex.
    pub sha: String,
    pub lang: String,
    /// RFC 3339 UTC modification time.
    pub mtime: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A contiguous slice of a document used as the retrieval unit.
///
/// `ord` is dense and 0-based within its document; `start_line`/`end_line`
/// are inclusive and 1-based.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    pub doc_id: String,
    pub ord: i64,
    pub text: String,
    pub start_line: i64,
    pub end_line: i64,
}

/// A file produced by the walker, ready for `upsert_document`.
#[derive(Debug, Clone, PartialEq)]
pub struct FileDoc {
    pub path: String,
    pub content: String,
    pub sha: String,
    pub lang: String,
    pub mtime: String,
}

/// What `upsert_document` did with a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertStatus {
    Inserted,
    Updated,
    Unchanged,
}

/// Result of an incremental document upsert.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub document_id: String,
    pub status: UpsertStatus,
    /// Freshly written chunks; empty when `status` is `Unchanged`.
    pub chunks: Vec<Chunk>,
}

/// A retrieval hit, the common currency of every retriever.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub path: String,
    pub score: f64,
    pub preview: String,
    pub start_line: i64,
    pub end_line: i64,
}

/// Location of a chunk, used to turn vector hits into [`SearchHit`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkLocation {
    pub chunk_id: String,
    pub doc_id: String,
    pub path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub text: String,
}

/// A stored embedding vector for one chunk under one model.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    /// Deterministic, see [`crate::embedding::embedding_id`].
    pub id: String,
    pub project_id: String,
    pub doc_id: String,
    pub chunk_id: String,
    pub provider: String,
    pub model: String,
    pub dim: usize,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub doc_id: String,
    pub chunk_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Code,
    Doc,
    Web,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Code => "code",
            SourceType::Doc => "doc",
            SourceType::Web => "web",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "code" => Some(SourceType::Code),
            "doc" => Some(SourceType::Doc),
            "web" => Some(SourceType::Web),
            _ => None,
        }
    }
}

/// A curated, scored snippet that influences retrieval ordering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Knowledge {
    pub id: String,
    #[serde(rename = "projectID")]
    pub project_id: String,
    pub source_type: SourceType,
    #[serde(rename = "pathOrURL", default, skip_serializing_if = "Option::is_none")]
    pub path_or_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub text: String,
    pub trust_score: f64,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symbols: Vec<String>,
    /// Free-form JSON object; `ttlUntil` (RFC 3339) drives TTL garbage collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
}

impl Knowledge {
    /// Builds a fresh item with `trust_score` clamped to `[0, 1]`.
    pub fn new(project_id: &str, source_type: SourceType, text: &str, trust: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            source_type,
            path_or_url: None,
            title: None,
            text: text.to_string(),
            trust_score: clamp_trust(trust),
            pinned: false,
            commit_sha: None,
            files: Vec::new(),
            symbols: Vec::new(),
            tags: None,
            created_at: Utc::now(),
            verified_at: None,
        }
    }

    /// The `tags.ttlUntil` deadline, if present and parseable.
    pub fn ttl_until(&self) -> Option<DateTime<Utc>> {
        let raw = self.tags.as_ref()?.get("ttlUntil")?.as_str()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// The last time this item was verified, falling back to creation.
    pub fn last_touched(&self) -> DateTime<Utc> {
        self.verified_at.unwrap_or(self.created_at)
    }

    pub fn set_trust(&mut self, trust: f64) {
        self.trust_score = clamp_trust(trust);
    }
}

pub fn clamp_trust(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    Full,
    #[default]
    Incremental,
}

impl IndexMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexMode::Full => "full",
            IndexMode::Incremental => "incremental",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(IndexMode::Full),
            "incremental" | "" => Some(IndexMode::Incremental),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JobStats {
    pub documents: u64,
}

/// An indexing job. Terminal statuses are sticky.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexJob {
    pub id: String,
    #[serde(rename = "projectID")]
    pub project_id: String,
    pub mode: IndexMode,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub stats: JobStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IndexJob {
    pub fn new(project_id: &str, mode: IndexMode) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            mode,
            status: JobStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            stats: JobStats::default(),
            error: None,
        }
    }

    /// `pending -> running`. Returns false if the job already moved on.
    pub fn start(&mut self) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::Running;
        self.started_at = Utc::now();
        true
    }

    pub fn complete(&mut self, documents: u64) -> bool {
        self.finish(JobStatus::Completed, documents, None)
    }

    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        self.finish(JobStatus::Failed, 0, Some(message.into()))
    }

    fn finish(&mut self, status: JobStatus, documents: u64, error: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.stats = JobStats { documents };
        self.error = error;
        self.ended_at = Some(Utc::now());
        true
    }
}

/// One chat turn. `role` is `system`, `user`, or `assistant`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn is_system(&self) -> bool {
        self.role == "system"
    }
}

/// A file touched by an applied patch, with its content before the patch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatchFile {
    pub path: String,
    /// `None` means the file did not exist before the patch.
    pub backup: Option<String>,
}

/// Record of an applied unified patch, kept for rollback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatchRecord {
    pub id: String,
    #[serde(rename = "projectID")]
    pub project_id: String,
    pub files: Vec<PatchFile>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    pub applied: bool,
}

/// Row counts exposed as gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub projects: u64,
    pub documents: u64,
    pub jobs: u64,
    pub knowledge: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_terminal_transition_is_one_way() {
        let mut job = IndexJob::new("p1", IndexMode::Full);
        assert!(job.start());
        assert!(job.complete(3));
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.ended_at.is_some());
        assert!(!job.fail("late"));
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.stats.documents, 3);
    }

    #[test]
    fn failed_job_reports_zero_documents() {
        let mut job = IndexJob::new("p1", IndexMode::Incremental);
        job.start();
        job.fail("boom");
        assert_eq!(job.stats.documents, 0);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[test]
    fn trust_is_clamped() {
        let mut k = Knowledge::new("p", SourceType::Doc, "t", 1.7);
        assert_eq!(k.trust_score, 1.0);
        k.set_trust(-0.2);
        assert_eq!(k.trust_score, 0.0);
    }

    #[test]
    fn ttl_until_parses_tag() {
        let mut k = Knowledge::new("p", SourceType::Web, "t", 0.5);
        k.tags = Some(serde_json::json!({"ttlUntil": "2020-01-01T00:00:00Z"}));
        assert!(k.ttl_until().unwrap() < Utc::now());
    }

    #[test]
    fn job_serializes_wire_names() {
        let job = IndexJob::new("p1", IndexMode::Full);
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["projectID"], "p1");
        assert_eq!(v["status"], "pending");
        assert_eq!(v["stats"]["documents"], 0);
        assert!(v.get("endedAt").is_none());
    }
}
