//! SQLite-backed [`Store`] and [`VectorStore`] implementations.
//!
//! Lexical search is delegated to FTS5: `bm25()` for ranking (negated so
//! that larger is better) and `snippet()` for highlighted previews. All
//! writes go through a single async mutex, and a document re-index deletes
//! and re-inserts its chunks and FTS rows inside one transaction.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::Path;
use tokio::sync::Mutex;

use mycoder_core::chunk::ChunkOptions;
use mycoder_core::embedding::{blob_to_vec, cosine_search, vec_to_blob};
use mycoder_core::lexical::{query_terms, ELLIPSIS, HIGHLIGHT_CLOSE, HIGHLIGHT_OPEN};
use mycoder_core::models::{
    ChatMessage, Chunk, ChunkLocation, Document, EmbeddingRecord, FileDoc, IndexJob, IndexMode,
    JobStats, JobStatus, Knowledge, PatchFile, PatchRecord, Project, SearchHit, SourceType,
    StoreStats, UpsertOutcome, UpsertStatus, VectorHit,
};
use mycoder_core::store::{build_chunks, needs_reindex, Store, VectorStore};

use crate::db;
use crate::migrate;

/// FTS5 caps snippet windows at 64 tokens.
const FTS_SNIPPET_MAX_TOKENS: usize = 64;

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp in database: {}", s))?
        .with_timezone(&Utc))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

/// Build an FTS5 MATCH expression: quoted terms joined with `OR`.
fn fts_query(query: &str) -> Option<String> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn row_to_project(row: &SqliteRow) -> Result<Project> {
    let ignore_json: String = row.get("ignore_json");
    Ok(Project {
        id: row.get("id"),
        name: row.get("name"),
        root_path: row.get("root_path"),
        ignore: serde_json::from_str(&ignore_json).unwrap_or_default(),
        created_at: parse_ts(row.get::<&str, _>("created_at"))?,
    })
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    Ok(Document {
        id: row.get("id"),
        project_id: row.get("project_id"),
        path: row.get("path"),
        sha: row.get("sha"),
        lang: row.get("lang"),
        mtime: row.get("mtime"),
        created_at: parse_ts(row.get::<&str, _>("created_at"))?,
        updated_at: parse_ts(row.get::<&str, _>("updated_at"))?,
    })
}

fn row_to_knowledge(row: &SqliteRow) -> Result<Knowledge> {
    let source: String = row.get("source_type");
    let files: String = row.get("files_json");
    let symbols: String = row.get("symbols_json");
    let tags: Option<String> = row.get("tags_json");
    Ok(Knowledge {
        id: row.get("id"),
        project_id: row.get("project_id"),
        source_type: SourceType::parse(&source).unwrap_or(SourceType::Doc),
        path_or_url: row.get("path_or_url"),
        title: row.get("title"),
        text: row.get("text"),
        trust_score: row.get("trust_score"),
        pinned: row.get::<i64, _>("pinned") != 0,
        commit_sha: row.get("commit_sha"),
        files: serde_json::from_str(&files).unwrap_or_default(),
        symbols: serde_json::from_str(&symbols).unwrap_or_default(),
        tags: tags.and_then(|t| serde_json::from_str(&t).ok()),
        created_at: parse_ts(row.get::<&str, _>("created_at"))?,
        verified_at: parse_opt_ts(row.get("verified_at"))?,
    })
}

fn row_to_job(row: &SqliteRow) -> Result<IndexJob> {
    let mode: String = row.get("mode");
    let status: String = row.get("status");
    Ok(IndexJob {
        id: row.get("id"),
        project_id: row.get("project_id"),
        mode: IndexMode::parse(&mode).unwrap_or_default(),
        status: JobStatus::parse(&status)
            .with_context(|| format!("Unknown job status in database: {}", status))?,
        started_at: parse_ts(row.get::<&str, _>("started_at"))?,
        ended_at: parse_opt_ts(row.get("ended_at"))?,
        stats: JobStats {
            documents: row.get::<i64, _>("documents").max(0) as u64,
        },
        error: row.get("error"),
    })
}

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    write: Mutex<()>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write: Mutex::new(()),
        }
    }

    /// Connect to `path` and bring the schema up to date.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn insert_chunks(tx: &mut Transaction<'_, Sqlite>, chunks: &[Chunk]) -> Result<()> {
        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (id, doc_id, ord, text, start_line, end_line) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.doc_id)
            .bind(chunk.ord)
            .bind(&chunk.text)
            .bind(chunk.start_line)
            .bind(chunk.end_line)
            .execute(&mut **tx)
            .await?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, doc_id, text) VALUES (?, ?, ?)")
                .bind(&chunk.id)
                .bind(&chunk.doc_id)
                .bind(&chunk.text)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    async fn delete_doc_rows(tx: &mut Transaction<'_, Sqlite>, doc_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunks_fts WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
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
        let _w = self.write.lock().await;
        sqlx::query(
            "INSERT INTO projects (id, name, root_path, ignore_json, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&project.id)
        .bind(&project.name)
        .bind(&project.root_path)
        .bind(serde_json::to_string(&project.ignore)?)
        .bind(ts(&project.created_at))
        .execute(&self.pool)
        .await?;
        Ok(project)
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_project).transpose()
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_project).collect()
    }

    async fn delete_project(&self, id: &str) -> Result<bool> {
        let _w = self.write.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM chunks_fts WHERE doc_id IN (SELECT id FROM documents WHERE project_id = ?)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM chunks WHERE doc_id IN (SELECT id FROM documents WHERE project_id = ?)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        for table in ["documents", "knowledge", "embeddings"] {
            sqlx::query(&format!("DELETE FROM {} WHERE project_id = ?", table))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        let deleted = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted > 0)
    }

    async fn upsert_document(
        &self,
        project_id: &str,
        file: &FileDoc,
        opts: &ChunkOptions,
        force: bool,
    ) -> Result<UpsertOutcome> {
        let _w = self.write.lock().await;
        let existing = sqlx::query("SELECT * FROM documents WHERE project_id = ? AND path = ?")
            .bind(project_id)
            .bind(&file.path)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(row_to_document)
            .transpose()?;
        let now = ts(&Utc::now());

        match existing {
            Some(doc) if !needs_reindex(&doc, file, force) => Ok(UpsertOutcome {
                document_id: doc.id,
                status: UpsertStatus::Unchanged,
                chunks: Vec::new(),
            }),
            Some(doc) => {
                let chunks = build_chunks(&doc.id, file, opts);
                let mut tx = self.pool.begin().await?;
                sqlx::query(
                    "UPDATE documents SET sha = ?, lang = ?, mtime = ?, updated_at = ? WHERE id = ?",
                )
                .bind(&file.sha)
                .bind(&file.lang)
                .bind(&file.mtime)
                .bind(&now)
                .bind(&doc.id)
                .execute(&mut *tx)
                .await?;
                Self::delete_doc_rows(&mut tx, &doc.id).await?;
                Self::insert_chunks(&mut tx, &chunks).await?;
                tx.commit().await?;
                Ok(UpsertOutcome {
                    document_id: doc.id,
                    status: UpsertStatus::Updated,
                    chunks,
                })
            }
            None => {
                let doc_id = uuid::Uuid::new_v4().to_string();
                let chunks = build_chunks(&doc_id, file, opts);
                let mut tx = self.pool.begin().await?;
                sqlx::query(
                    r#"
                    INSERT INTO documents (id, project_id, path, sha, lang, mtime, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&doc_id)
                .bind(project_id)
                .bind(&file.path)
                .bind(&file.sha)
                .bind(&file.lang)
                .bind(&file.mtime)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                Self::insert_chunks(&mut tx, &chunks).await?;
                tx.commit().await?;
                Ok(UpsertOutcome {
                    document_id: doc_id,
                    status: UpsertStatus::Inserted,
                    chunks,
                })
            }
        }
    }

    async fn prune_documents(&self, project_id: &str, present: &[String]) -> Result<Vec<String>> {
        let _w = self.write.lock().await;
        let rows = sqlx::query("SELECT id, path FROM documents WHERE project_id = ?")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        let stale: Vec<String> = rows
            .iter()
            .filter(|r| !present.contains(&r.get::<String, _>("path")))
            .map(|r| r.get::<String, _>("id"))
            .collect();
        if stale.is_empty() {
            return Ok(stale);
        }

        let mut tx = self.pool.begin().await?;
        for doc_id in &stale {
            Self::delete_doc_rows(&mut tx, doc_id).await?;
            sqlx::query("DELETE FROM documents WHERE id = ?")
                .bind(doc_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(stale)
    }

    async fn list_documents(&self, project_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents WHERE project_id = ? ORDER BY path")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn list_chunks(&self, doc_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE doc_id = ? ORDER BY ord")
            .bind(doc_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| Chunk {
                id: r.get("id"),
                doc_id: r.get("doc_id"),
                ord: r.get("ord"),
                text: r.get("text"),
                start_line: r.get("start_line"),
                end_line: r.get("end_line"),
            })
            .collect())
    }

    async fn lexical_ords(&self, doc_id: &str) -> Result<Vec<i64>> {
        let ords: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT c.ord FROM chunks_fts f JOIN chunks c ON c.id = f.chunk_id
            WHERE f.doc_id = ? ORDER BY c.ord
            "#,
        )
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ords)
    }

    async fn chunk_locations(&self, chunk_ids: &[String]) -> Result<Vec<ChunkLocation>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT c.id, c.doc_id, d.path, c.start_line, c.end_line, c.text
            FROM chunks c JOIN documents d ON d.id = c.doc_id
            WHERE c.id IN ({})
            "#,
            placeholders(chunk_ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in chunk_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|r| ChunkLocation {
                chunk_id: r.get("id"),
                doc_id: r.get("doc_id"),
                path: r.get("path"),
                start_line: r.get("start_line"),
                end_line: r.get("end_line"),
                text: r.get("text"),
            })
            .collect())
    }

    async fn lexical_search(
        &self,
        project_id: Option<&str>,
        query: &str,
        k: usize,
        preview_tokens: usize,
    ) -> Result<Vec<SearchHit>> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let pid = project_id.unwrap_or("");
        let tokens = preview_tokens.clamp(1, FTS_SNIPPET_MAX_TOKENS) as i64;

        let rows = sqlx::query(
            r#"
            SELECT d.path AS path,
                   c.start_line AS start_line,
                   c.end_line AS end_line,
                   -bm25(chunks_fts) AS score,
                   snippet(chunks_fts, 2, ?, ?, ?, ?) AS preview
            FROM chunks_fts
            JOIN chunks c ON c.id = chunks_fts.chunk_id
            JOIN documents d ON d.id = c.doc_id
            WHERE chunks_fts MATCH ?
              AND (? = '' OR d.project_id = ?)
            ORDER BY score DESC, d.path ASC, c.start_line ASC
            LIMIT ?
            "#,
        )
        .bind(HIGHLIGHT_OPEN)
        .bind(HIGHLIGHT_CLOSE)
        .bind(ELLIPSIS)
        .bind(tokens)
        .bind(&fts)
        .bind(pid)
        .bind(pid)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| SearchHit {
                path: r.get("path"),
                score: r.get("score"),
                preview: r.get("preview"),
                start_line: r.get("start_line"),
                end_line: r.get("end_line"),
            })
            .collect())
    }

    async fn add_knowledge(&self, item: &Knowledge) -> Result<String> {
        self.update_knowledge(item).await?;
        Ok(item.id.clone())
    }

    async fn get_knowledge(&self, id: &str) -> Result<Option<Knowledge>> {
        let row = sqlx::query("SELECT * FROM knowledge WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_knowledge).transpose()
    }

    async fn list_knowledge(&self, project_id: &str, min_trust: f64) -> Result<Vec<Knowledge>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM knowledge WHERE project_id = ? AND trust_score >= ?
            ORDER BY trust_score DESC, created_at DESC
            "#,
        )
        .bind(project_id)
        .bind(min_trust)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_knowledge).collect()
    }

    async fn update_knowledge(&self, item: &Knowledge) -> Result<()> {
        let mut item = item.clone();
        item.set_trust(item.trust_score);
        let _w = self.write.lock().await;
        sqlx::query(
            r#"
            INSERT INTO knowledge (id, project_id, source_type, path_or_url, title, text,
                                   trust_score, pinned, commit_sha, files_json, symbols_json,
                                   tags_json, created_at, verified_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                source_type = excluded.source_type,
                path_or_url = excluded.path_or_url,
                title = excluded.title,
                text = excluded.text,
                trust_score = excluded.trust_score,
                pinned = excluded.pinned,
                commit_sha = excluded.commit_sha,
                files_json = excluded.files_json,
                symbols_json = excluded.symbols_json,
                tags_json = excluded.tags_json,
                verified_at = excluded.verified_at
            "#,
        )
        .bind(&item.id)
        .bind(&item.project_id)
        .bind(item.source_type.as_str())
        .bind(&item.path_or_url)
        .bind(&item.title)
        .bind(&item.text)
        .bind(item.trust_score)
        .bind(item.pinned as i64)
        .bind(&item.commit_sha)
        .bind(serde_json::to_string(&item.files)?)
        .bind(serde_json::to_string(&item.symbols)?)
        .bind(item.tags.as_ref().map(|t| t.to_string()))
        .bind(ts(&item.created_at))
        .bind(item.verified_at.as_ref().map(ts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_knowledge(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let _w = self.write.lock().await;
        let sql = format!(
            "DELETE FROM knowledge WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    async fn save_job(&self, job: &IndexJob) -> Result<()> {
        let _w = self.write.lock().await;
        sqlx::query(
            r#"
            INSERT INTO index_jobs (id, project_id, mode, status, started_at, ended_at, documents, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at,
                documents = excluded.documents,
                error = excluded.error
            "#,
        )
        .bind(&job.id)
        .bind(&job.project_id)
        .bind(job.mode.as_str())
        .bind(job.status.as_str())
        .bind(ts(&job.started_at))
        .bind(job.ended_at.as_ref().map(ts))
        .bind(job.stats.documents as i64)
        .bind(&job.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<IndexJob>> {
        let row = sqlx::query("SELECT * FROM index_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        project_id: Option<&str>,
        message: &ChatMessage,
    ) -> Result<()> {
        let now = ts(&Utc::now());
        let _w = self.write.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO conversations (id, project_id, created_at, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                updated_at = excluded.updated_at,
                project_id = COALESCE(conversations.project_id, excluded.project_id)
            "#,
        )
        .bind(conversation_id)
        .bind(project_id)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO messages (conversation_id, role, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(conversation_id)
        .bind(&message.role)
        .bind(&message.content)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn conversation_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        let rows =
            sqlx::query("SELECT role, content FROM messages WHERE conversation_id = ? ORDER BY id")
                .bind(conversation_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .iter()
            .map(|r| ChatMessage {
                role: r.get("role"),
                content: r.get("content"),
            })
            .collect())
    }

    async fn delete_conversations_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff = ts(&cutoff);
        let _w = self.write.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM messages WHERE conversation_id IN (SELECT id FROM conversations WHERE updated_at < ?)",
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?;
        let n = sqlx::query("DELETE FROM conversations WHERE updated_at < ?")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(n)
    }

    async fn save_patch(&self, patch: &PatchRecord) -> Result<()> {
        let _w = self.write.lock().await;
        sqlx::query(
            r#"
            INSERT INTO patches (id, project_id, files_json, created_at, applied_at, applied)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                files_json = excluded.files_json,
                applied_at = excluded.applied_at,
                applied = excluded.applied
            "#,
        )
        .bind(&patch.id)
        .bind(&patch.project_id)
        .bind(serde_json::to_string(&patch.files)?)
        .bind(ts(&patch.created_at))
        .bind(patch.applied_at.as_ref().map(ts))
        .bind(patch.applied as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_patch(&self, id: &str) -> Result<Option<PatchRecord>> {
        let Some(row) = sqlx::query("SELECT * FROM patches WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let files: String = row.get("files_json");
        let files: Vec<PatchFile> =
            serde_json::from_str(&files).context("Invalid patch files in database")?;
        Ok(Some(PatchRecord {
            id: row.get("id"),
            project_id: row.get("project_id"),
            files,
            created_at: parse_ts(row.get::<&str, _>("created_at"))?,
            applied_at: parse_opt_ts(row.get("applied_at"))?,
            applied: row.get::<i64, _>("applied") != 0,
        }))
    }

    async fn stats(&self) -> Result<StoreStats> {
        let mut counts = [0u64; 4];
        for (i, table) in ["projects", "documents", "index_jobs", "knowledge"]
            .iter()
            .enumerate()
        {
            let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&self.pool)
                .await?;
            counts[i] = n.max(0) as u64;
        }
        Ok(StoreStats {
            projects: counts[0],
            documents: counts[1],
            jobs: counts[2],
            knowledge: counts[3],
        })
    }
}

/// Embeddings stored as little-endian `f32` BLOBs, searched by exact cosine.
pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn kind(&self) -> &str {
        "sqlite"
    }

    async fn upsert(&self, items: &[EmbeddingRecord]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query("DELETE FROM embeddings WHERE id = ?")
                .bind(&item.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                r#"
                INSERT INTO embeddings (id, project_id, doc_id, chunk_id, provider, model, dim, vector, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&item.id)
            .bind(&item.project_id)
            .bind(&item.doc_id)
            .bind(&item.chunk_id)
            .bind(&item.provider)
            .bind(&item.model)
            .bind(item.vector.len() as i64)
            .bind(vec_to_blob(&item.vector))
            .bind(ts(&item.created_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn search(&self, project_id: &str, query: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT doc_id, chunk_id, vector FROM embeddings WHERE project_id = ? AND dim = ?",
        )
        .bind(project_id)
        .bind(query.len() as i64)
        .fetch_all(&self.pool)
        .await?;

        let decoded: Vec<(String, String, Vec<f32>)> = rows
            .iter()
            .map(|r| {
                let blob: Vec<u8> = r.get("vector");
                (r.get("doc_id"), r.get("chunk_id"), blob_to_vec(&blob))
            })
            .collect();
        Ok(cosine_search(
            query,
            decoded
                .iter()
                .map(|(d, c, v)| (d.as_str(), c.as_str(), v.as_slice())),
            k,
        ))
    }

    async fn delete_by_doc(&self, project_id: &str, doc_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM embeddings WHERE project_id = ? AND doc_id = ?")
            .bind(project_id)
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_by_project(&self, project_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM embeddings WHERE project_id = ?")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycoder_core::embedding::{embedding_id, sha256_hex};

    async fn open() -> (tempfile::TempDir, SqliteStore) {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = SqliteStore::open(&tmp.path().join("t.sqlite")).await.unwrap();
        (tmp, store)
    }

    fn file(path: &str, content: &str, mtime: &str) -> FileDoc {
        FileDoc {
            path: path.into(),
            content: content.into(),
            sha: sha256_hex(content.as_bytes()),
            lang: mycoder_core::chunk::lang_for_path(path),
            mtime: mtime.into(),
        }
    }

    #[test]
    fn fts_query_quotes_terms() {
        assert_eq!(fts_query("search API").unwrap(), "\"search\" OR \"api\"");
        assert!(fts_query("   ").is_none());
    }

    #[tokio::test]
    async fn reindex_replaces_chunks_atomically() {
        let (_tmp, store) = open().await;
        let p = store.create_project("p", "/tmp/p", &[]).await.unwrap();
        let opts = ChunkOptions::default();
        let first = store
            .upsert_document(&p.id, &file("README.md", "Hello RAG\nThis project tests search API.", "t1"), &opts, false)
            .await
            .unwrap();
        assert_eq!(first.status, UpsertStatus::Inserted);

        let same = store
            .upsert_document(&p.id, &file("README.md", "Hello RAG\nThis project tests search API.", "t2"), &opts, true)
            .await
            .unwrap();
        assert_eq!(same.status, UpsertStatus::Unchanged);

        let changed = store
            .upsert_document(&p.id, &file("README.md", "Totally different", "t3"), &opts, false)
            .await
            .unwrap();
        assert_eq!(changed.status, UpsertStatus::Updated);
        assert_eq!(changed.document_id, first.document_id);

        let chunks = store.list_chunks(&first.document_id).await.unwrap();
        let ords: Vec<i64> = chunks.iter().map(|c| c.ord).collect();
        assert_eq!(store.lexical_ords(&first.document_id).await.unwrap(), ords);
        assert!(store
            .lexical_search(Some(&p.id), "project", 5, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn fts_search_highlights_and_scopes() {
        let (_tmp, store) = open().await;
        let p = store.create_project("p", "/tmp/p", &[]).await.unwrap();
        let q = store.create_project("q", "/tmp/q", &[]).await.unwrap();
        let opts = ChunkOptions::default();
        store
            .upsert_document(&p.id, &file("README.md", "Hello RAG\nThis project tests search API.", "t"), &opts, false)
            .await
            .unwrap();
        store
            .upsert_document(&q.id, &file("other.md", "unrelated project", "t"), &opts, false)
            .await
            .unwrap();

        let hits = store
            .lexical_search(Some(&p.id), "project", 10, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "README.md");
        assert!(hits[0].score > 0.0);
        assert!(hits[0].preview.contains("[project]"), "{}", hits[0].preview);

        assert_eq!(store.lexical_search(None, "project", 10, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_project_cascades() {
        let (_tmp, store) = open().await;
        let p = store.create_project("p", "/tmp/p", &[]).await.unwrap();
        let out = store
            .upsert_document(&p.id, &file("a.go", "package a\nfunc A(){}", "t"), &ChunkOptions::default(), false)
            .await
            .unwrap();
        store
            .add_knowledge(&Knowledge::new(&p.id, SourceType::Code, "k", 0.5))
            .await
            .unwrap();
        let vectors = SqliteVectorStore::new(store.pool().clone());
        vectors
            .upsert(&[EmbeddingRecord {
                id: embedding_id(&p.id, &out.document_id, &out.chunks[0].id, "m"),
                project_id: p.id.clone(),
                doc_id: out.document_id.clone(),
                chunk_id: out.chunks[0].id.clone(),
                provider: "hash".into(),
                model: "m".into(),
                dim: 2,
                vector: vec![1.0, 0.0],
                created_at: Utc::now(),
            }])
            .await
            .unwrap();

        assert!(store.delete_project(&p.id).await.unwrap());
        assert!(!store.delete_project(&p.id).await.unwrap());
        assert_eq!(vectors.count().await.unwrap(), 0);
        assert!(store.lexical_ords(&out.document_id).await.unwrap().is_empty());
        let stats = store.stats().await.unwrap();
        assert_eq!((stats.projects, stats.documents, stats.knowledge), (0, 0, 0));
    }

    #[tokio::test]
    async fn vector_search_filters_dimension() {
        let (_tmp, store) = open().await;
        let vectors = SqliteVectorStore::new(store.pool().clone());
        let rec = |chunk: &str, v: Vec<f32>| EmbeddingRecord {
            id: embedding_id("p", "d", chunk, "m"),
            project_id: "p".into(),
            doc_id: "d".into(),
            chunk_id: chunk.into(),
            provider: "hash".into(),
            model: "m".into(),
            dim: v.len(),
            vector: v,
            created_at: Utc::now(),
        };
        vectors.upsert(&[rec("c1", vec![1.0, 0.0])]).await.unwrap();
        vectors.upsert(&[rec("c1", vec![0.0, 1.0])]).await.unwrap();
        vectors.upsert(&[rec("c2", vec![1.0, 0.0, 0.0])]).await.unwrap();
        assert_eq!(vectors.count().await.unwrap(), 2);

        let hits = vectors.search("p", &[0.0, 1.0], 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn conversations_expire() {
        let (_tmp, store) = open().await;
        store
            .append_message("c1", None, &ChatMessage::user("hi"))
            .await
            .unwrap();
        store
            .append_message("c1", Some("p"), &ChatMessage::assistant("hello"))
            .await
            .unwrap();
        assert_eq!(store.conversation_messages("c1").await.unwrap().len(), 2);
        let n = store
            .delete_conversations_before(Utc::now() + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert!(store.conversation_messages("c1").await.unwrap().is_empty());
    }
}
