//! Forward-only schema migrations.
//!
//! The current version lives in `schema_version`. Each migration is applied
//! inside its own transaction and bumps the version, so re-running
//! [`run_migrations`] on an up-to-date database is a no-op.
//!
//! | Version | Tables |
//! |---------|--------|
//! | 1 | `projects`, `documents`, `chunks`, `chunks_fts`, `embeddings`, `knowledge`, `index_jobs` |
//! | 2 | `conversations`, `messages`, `patches` |

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::info;

const V1: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        root_path TEXT NOT NULL,
        ignore_json TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        path TEXT NOT NULL,
        sha TEXT NOT NULL,
        lang TEXT NOT NULL DEFAULT '',
        mtime TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(project_id, path)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        doc_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        ord INTEGER NOT NULL,
        text TEXT NOT NULL,
        start_line INTEGER NOT NULL,
        end_line INTEGER NOT NULL,
        UNIQUE(doc_id, ord)
    )
    "#,
    r#"
    CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
        chunk_id UNINDEXED,
        doc_id UNINDEXED,
        text
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embeddings (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        doc_id TEXT NOT NULL,
        chunk_id TEXT NOT NULL,
        provider TEXT NOT NULL,
        model TEXT NOT NULL,
        dim INTEGER NOT NULL,
        vector BLOB NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS knowledge (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        source_type TEXT NOT NULL,
        path_or_url TEXT,
        title TEXT,
        text TEXT NOT NULL,
        trust_score REAL NOT NULL,
        pinned INTEGER NOT NULL DEFAULT 0,
        commit_sha TEXT,
        files_json TEXT NOT NULL DEFAULT '[]',
        symbols_json TEXT NOT NULL DEFAULT '[]',
        tags_json TEXT,
        created_at TEXT NOT NULL,
        verified_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS index_jobs (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        mode TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        documents INTEGER NOT NULL DEFAULT 0,
        error TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_documents_project ON documents(project_id)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_doc ON chunks(doc_id)",
    "CREATE INDEX IF NOT EXISTS idx_embeddings_project_dim ON embeddings(project_id, dim)",
    "CREATE INDEX IF NOT EXISTS idx_embeddings_doc ON embeddings(doc_id)",
    "CREATE INDEX IF NOT EXISTS idx_knowledge_project ON knowledge(project_id)",
];

const V2: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        project_id TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS patches (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        files_json TEXT NOT NULL,
        created_at TEXT NOT NULL,
        applied_at TEXT,
        applied INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id)",
];

const MIGRATIONS: &[&[&str]] = &[V1, V2];

/// Latest schema version known to this build.
pub const LATEST_VERSION: i64 = MIGRATIONS.len() as i64;

/// Current schema version, 0 for a fresh database.
pub async fn current_version(pool: &SqlitePool) -> Result<i64> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
        .execute(pool)
        .await?;
    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await?;
    Ok(version.unwrap_or(0))
}

/// Apply every migration newer than the recorded version.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current = current_version(pool).await?;

    for (idx, statements) in MIGRATIONS.iter().enumerate() {
        let version = idx as i64 + 1;
        if version <= current {
            continue;
        }
        let mut tx = pool.begin().await?;
        for sql in statements.iter() {
            sqlx::query(sql)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Migration v{} failed", version))?;
        }
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(version, "applied schema migration");
    }

    Ok(())
}
