//! Implementations of the `mycoder` subcommands other than `serve`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use mycoder_core::models::{IndexMode, JobStatus, Project};
use mycoder_core::search::Retriever;
use mycoder_core::store::Store;

use crate::app::App;
use crate::config::Config;
use crate::ingest::ProgressSink;
use crate::jobs::JobRunner;
use crate::migrate;
use crate::sqlite_store::SqliteStore;

/// Create the database and bring its schema up to date.
pub async fn run_init(config: &Config) -> Result<()> {
    if config.storage.is_memory() {
        println!("Storage is in-memory; nothing to initialize.");
        return Ok(());
    }
    let store = SqliteStore::open(&config.storage.path).await?;
    let version = migrate::current_version(store.pool()).await?;
    println!(
        "Database initialized at {} (schema version {}).",
        config.storage.path.display(),
        version
    );
    Ok(())
}

struct TerminalProgress;

#[async_trait]
impl ProgressSink for TerminalProgress {
    async fn progress(&mut self, indexed: u64, total: u64) {
        eprint!("\rIndexed {}/{}", indexed, total);
        if indexed >= total {
            eprintln!();
        }
    }
}

/// The project rooted at `root`, created on first use.
async fn project_for_root(store: &dyn Store, root: &Path, name: Option<&str>) -> Result<Project> {
    let root_str = root.to_string_lossy();
    if let Some(p) = store
        .list_projects()
        .await?
        .into_iter()
        .find(|p| p.root_path == root_str)
    {
        return Ok(p);
    }
    let name = name
        .map(str::to_string)
        .or_else(|| root.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "project".to_string());
    store.create_project(&name, &root_str, &[]).await
}

/// Index the directory at `root` in the foreground.
pub async fn run_index(config: Config, root: &Path, name: Option<&str>, full: bool) -> Result<()> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Project root not found: {}", root.display()))?;
    let app = App::from_config(config).await?;
    let project = project_for_root(app.store.as_ref(), &root, name).await?;

    let runner = JobRunner::new(app.store.clone(), Arc::new(app.indexer()));
    let mode = if full {
        IndexMode::Full
    } else {
        IndexMode::Incremental
    };
    let job = runner.create(&project.id, mode).await?;
    let job = runner
        .run(job, &project, &app.walk_options(), &mut TerminalProgress)
        .await?;

    if job.status != JobStatus::Completed {
        bail!(
            "Indexing failed: {}",
            job.error.as_deref().unwrap_or("unknown error")
        );
    }
    println!(
        "Indexed {} documents into project {} ({}).",
        job.stats.documents, project.name, project.id
    );
    Ok(())
}

/// Lexical search over one project, or all of them.
pub async fn run_search(config: Config, query: &str, project: Option<&str>, limit: usize) -> Result<()> {
    if query.trim().is_empty() {
        bail!("Query must not be empty");
    }
    let app = App::from_config(config).await?;
    let hits = app
        .lexical()
        .retrieve(project.unwrap_or(""), query, limit.max(1))
        .await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.2}] {}:{}-{}",
            i + 1,
            hit.score,
            hit.path,
            hit.start_line,
            hit.end_line
        );
        println!("    excerpt: \"{}\"", hit.preview.replace('\n', " ").trim());
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycoder_core::store::memory::InMemoryStore;

    #[tokio::test]
    async fn project_for_root_reuses_existing() {
        let store = InMemoryStore::new();
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();

        let a = project_for_root(&store, &root, Some("demo")).await.unwrap();
        let b = project_for_root(&store, &root, None).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.name, "demo");
        assert_eq!(store.list_projects().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn index_then_search_in_memory() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("README.md"), "Hello RAG\n").unwrap();
        let mut config = Config::default();
        config.storage.path = ":memory:".into();
        run_index(config.clone(), tmp.path(), None, true).await.unwrap();
        assert!(run_search(config, "  ", None, 5).await.is_err());
    }
}
