//! Index job lifecycle.
//!
//! `create` stores a `pending` job; `run` moves it to `running`, executes
//! the [`Indexer`], and concludes with `completed{documents}` or
//! `failed{documents: 0}`. Every transition is persisted. The streaming
//! variant mirrors the run as SSE frames: `job`, `progress`*, then
//! `completed` or `error`.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use mycoder_core::models::{IndexJob, IndexMode, Project};
use mycoder_core::store::Store;

use crate::connector_fs::WalkOptions;
use crate::ingest::{Indexer, ProgressSink};
use crate::sse::{SseEvent, SseWriter};

pub struct JobRunner {
    store: Arc<dyn Store>,
    indexer: Arc<Indexer>,
}

/// Forwards progress to an SSE stream and reports client disconnects as
/// cancellation.
struct SseProgress<'a> {
    writer: &'a mut SseWriter,
}

#[async_trait]
impl ProgressSink for SseProgress<'_> {
    async fn progress(&mut self, indexed: u64, total: u64) {
        self.writer
            .send(SseEvent::Progress { indexed, total })
            .await;
    }

    fn cancelled(&self) -> bool {
        self.writer.is_cancelled()
    }
}

impl JobRunner {
    pub fn new(store: Arc<dyn Store>, indexer: Arc<Indexer>) -> Self {
        Self { store, indexer }
    }

    pub async fn create(&self, project_id: &str, mode: IndexMode) -> Result<IndexJob> {
        let job = IndexJob::new(project_id, mode);
        self.store.save_job(&job).await?;
        Ok(job)
    }

    /// Execute `job` to a terminal state and return it.
    pub async fn run(
        &self,
        mut job: IndexJob,
        project: &Project,
        walk: &WalkOptions,
        sink: &mut dyn ProgressSink,
    ) -> Result<IndexJob> {
        job.start();
        self.store.save_job(&job).await?;

        match self.indexer.run(project, job.mode, walk, sink).await {
            Ok(report) if report.cancelled => {
                job.fail("cancelled by client");
            }
            Ok(report) => {
                job.complete(report.documents);
            }
            Err(e) => {
                warn!(job = %job.id, error = %e, "index job failed");
                job.fail(format!("{:#}", e));
            }
        }
        self.store.save_job(&job).await?;
        info!(job = %job.id, status = job.status.as_str(), documents = job.stats.documents, "index job finished");
        Ok(job)
    }

    /// Run `job` on a detached task.
    pub fn spawn(self: &Arc<Self>, job: IndexJob, project: Project, walk: WalkOptions) {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let id = job.id.clone();
            if let Err(e) = runner
                .run(job, &project, &walk, &mut crate::ingest::NullProgress)
                .await
            {
                warn!(job = %id, error = %e, "could not record job state");
            }
        });
    }

    /// Run `job` while streaming its frames to `writer`.
    pub async fn run_stream(
        &self,
        job: IndexJob,
        project: &Project,
        walk: &WalkOptions,
        mut writer: SseWriter,
    ) {
        writer.send(SseEvent::Job(job.id.clone())).await;
        let result = {
            let mut sink = SseProgress {
                writer: &mut writer,
            };
            self.run(job, project, walk, &mut sink).await
        };
        match result {
            Ok(job) if job.status == mycoder_core::models::JobStatus::Completed => {
                writer
                    .send(SseEvent::Completed {
                        documents: job.stats.documents,
                    })
                    .await;
            }
            Ok(job) => {
                writer
                    .fail(job.error.unwrap_or_else(|| "index job failed".to_string()))
                    .await
            }
            Err(e) => writer.fail(format!("{:#}", e)).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::NullProgress;
    use mycoder_core::chunk::ChunkOptions;
    use mycoder_core::models::JobStatus;
    use mycoder_core::store::memory::{InMemoryStore, InMemoryVectorStore};

    fn runner(store: Arc<InMemoryStore>) -> Arc<JobRunner> {
        let indexer = Indexer::new(
            store.clone(),
            Arc::new(InMemoryVectorStore::new()),
            ChunkOptions::default(),
        );
        Arc::new(JobRunner::new(store, Arc::new(indexer)))
    }

    #[tokio::test]
    async fn job_completes_with_document_count() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("README.md"), "Hello RAG").unwrap();
        std::fs::create_dir_all(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/code.go"), "package x\nfunc A(){}").unwrap();

        let store = Arc::new(InMemoryStore::new());
        let project = store
            .create_project("p", &tmp.path().to_string_lossy(), &[])
            .await
            .unwrap();
        let runner = runner(store.clone());
        let job = runner.create(&project.id, IndexMode::Full).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let done = runner
            .run(job, &project, &WalkOptions::default(), &mut NullProgress)
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.stats.documents, 2);
        let stored = store.get_job(&done.id).await.unwrap().unwrap();
        assert_eq!(stored, done);
    }

    #[tokio::test]
    async fn missing_root_fails_with_zero_documents() {
        let store = Arc::new(InMemoryStore::new());
        let project = store
            .create_project("p", "/definitely/not/here", &[])
            .await
            .unwrap();
        let runner = runner(store.clone());
        let job = runner.create(&project.id, IndexMode::Incremental).await.unwrap();
        let done = runner
            .run(job, &project, &WalkOptions::default(), &mut NullProgress)
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.stats.documents, 0);
        assert!(done.ended_at.is_some());
    }

    #[tokio::test]
    async fn stream_on_empty_project() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let project = store
            .create_project("p", &tmp.path().to_string_lossy(), &[])
            .await
            .unwrap();
        let runner = runner(store);
        let job = runner.create(&project.id, IndexMode::Full).await.unwrap();
        let id = job.id.clone();

        let (writer, mut rx) = SseWriter::channel(None);
        runner
            .run_stream(job, &project, &WalkOptions::default(), writer)
            .await;
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        assert_eq!(
            events,
            vec![SseEvent::Job(id), SseEvent::Completed { documents: 0 }]
        );
    }
}
