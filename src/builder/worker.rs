//! Disposable builder worker.
//!
//! Every job gets a fresh OS thread running a single-threaded Tokio runtime
//! and its own database connection. The thread reports over a typed channel
//! and is torn down when the job ends; a thread that dies without sending
//! a terminal message is reported as a crash.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{ApplySummary, DimensionProbe, IndexBuilder, RebuildSummary};
use crate::error::BuilderError;
use crate::retry::{BulkIndexSignal, Retrier, RetryPolicy};
use crate::storage::Database;
use crate::watcher::{ChangeFilter, ConsolidatedChange};
use crate::Result;

/// Start a full rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildRequest {
    /// Job identifier used in logs and errors.
    pub job_id: String,
}

/// Apply a consolidated change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyRequest {
    /// Job identifier used in logs and errors.
    pub job_id: String,
    /// Changes to apply.
    pub changes: Vec<ConsolidatedChange>,
}

/// Job sent to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerRequest {
    /// Full rebuild.
    Rebuild(RebuildRequest),
    /// Incremental apply.
    Apply(ApplyRequest),
}

impl WorkerRequest {
    /// Identifier of the job.
    #[must_use]
    pub fn job_id(&self) -> &str {
        match self {
            Self::Rebuild(r) => &r.job_id,
            Self::Apply(r) => &r.job_id,
        }
    }

    /// Short job kind label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Rebuild(_) => "rebuild",
            Self::Apply(_) => "apply",
        }
    }
}

/// Successful job result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobOutcome {
    /// Rebuild finished.
    Rebuilt(RebuildSummary),
    /// Apply finished.
    Applied(ApplySummary),
}

/// Message from a worker back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message")]
pub enum WorkerMessage {
    /// Rebuild progress after a committed batch.
    Progress {
        /// Nodes committed so far.
        processed_files: u64,
    },
    /// Terminal: the job succeeded.
    Done(JobOutcome),
    /// Terminal: the job failed and rolled back.
    Failed {
        /// Error description.
        reason: String,
    },
}

/// Everything a worker needs to build its own [`IndexBuilder`].
#[derive(Clone)]
pub struct BuilderContext {
    /// Database the worker opens its own connection to.
    pub db: Database,
    /// Media root.
    pub root: PathBuf,
    /// Shared change filter.
    pub filter: Arc<ChangeFilter>,
    /// Dimension probe.
    pub probe: Arc<dyn DimensionProbe>,
    /// Retry policy for every write.
    pub retry: RetryPolicy,
    /// Bulk signal, raised by the orchestrator during rebuilds.
    pub bulk: BulkIndexSignal,
    /// Rows per rebuild batch.
    pub batch_size: usize,
    /// Simultaneous probes.
    pub probe_concurrency: usize,
    /// Busy timeout applied to the worker connection for rebuilds.
    pub bulk_query_timeout: Duration,
}

impl BuilderContext {
    fn open_builder(&self, request: &WorkerRequest) -> Result<IndexBuilder> {
        let db = self.db.worker_handle()?;
        if matches!(request, WorkerRequest::Rebuild(_)) {
            db.set_busy_timeout(self.bulk_query_timeout)?;
        }
        Ok(IndexBuilder::new(
            db,
            self.root.clone(),
            Arc::clone(&self.filter),
            Arc::clone(&self.probe),
            Retrier::new(self.retry.clone(), self.bulk.clone()),
        )
        .with_batch_size(self.batch_size)
        .with_probe_concurrency(self.probe_concurrency))
    }
}

impl std::fmt::Debug for BuilderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderContext")
            .field("db", &self.db)
            .field("root", &self.root)
            .field("batch_size", &self.batch_size)
            .field("probe_concurrency", &self.probe_concurrency)
            .finish_non_exhaustive()
    }
}

/// Handle to a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    job_id: String,
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
    thread: Option<JoinHandle<()>>,
}

/// Spawn a worker for one job.
///
/// # Errors
///
/// Returns an error if the thread cannot be spawned.
pub fn spawn(ctx: &BuilderContext, request: WorkerRequest) -> Result<WorkerHandle> {
    let ctx = ctx.clone();
    let job_id = request.job_id().to_string();
    let name = format!("index-{}-{}", request.kind(), short_id(&job_id));

    spawn_thread(job_id, name, move |tx| run_job(&ctx, request, tx))
}

fn spawn_thread<F>(job_id: String, name: String, body: F) -> Result<WorkerHandle>
where
    F: FnOnce(&mpsc::UnboundedSender<WorkerMessage>) + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let thread = std::thread::Builder::new()
        .name(name)
        .spawn(move || body(&tx))
        .map_err(|e| BuilderError::Crashed {
            job_id: job_id.clone(),
            reason: format!("failed to spawn worker: {e}"),
        })?;

    Ok(WorkerHandle {
        job_id,
        rx,
        thread: Some(thread),
    })
}

fn run_job(ctx: &BuilderContext, request: WorkerRequest, tx: &mpsc::UnboundedSender<WorkerMessage>) {
    let span = crate::telemetry::spans::job_span(request.kind(), request.job_id());
    let _enter = span.enter();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = tx.send(WorkerMessage::Failed {
                reason: format!("failed to start worker runtime: {e}"),
            });
            return;
        }
    };

    let result = runtime.block_on(async {
        let builder = ctx.open_builder(&request)?;
        match request {
            WorkerRequest::Rebuild(_) => {
                let summary = builder
                    .rebuild(|processed_files| {
                        let _ = tx.send(WorkerMessage::Progress { processed_files });
                    })
                    .await?;
                Ok::<_, crate::Error>(JobOutcome::Rebuilt(summary))
            }
            WorkerRequest::Apply(req) => {
                let summary = builder.apply(&req.changes).await?;
                Ok::<_, crate::Error>(JobOutcome::Applied(summary))
            }
        }
    });

    let message = match result {
        Ok(outcome) => WorkerMessage::Done(outcome),
        Err(e) => {
            tracing::error!(error = %e, "Index job failed");
            WorkerMessage::Failed {
                reason: e.to_string(),
            }
        }
    };
    let _ = tx.send(message);
}

impl WorkerHandle {
    /// Identifier of the job.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Wait for the job to end, forwarding progress, then reap the thread.
    ///
    /// # Errors
    ///
    /// Returns [`BuilderError::JobFailed`] when the job reported failure and
    /// [`BuilderError::Crashed`] when the thread ended without a result.
    pub async fn finish<P>(mut self, mut on_progress: P) -> Result<JobOutcome>
    where
        P: FnMut(u64),
    {
        let mut result = None;
        while let Some(message) = self.rx.recv().await {
            match message {
                WorkerMessage::Progress { processed_files } => on_progress(processed_files),
                WorkerMessage::Done(outcome) => {
                    result = Some(Ok(outcome));
                    break;
                }
                WorkerMessage::Failed { reason } => {
                    result = Some(Err(BuilderError::JobFailed {
                        job_id: self.job_id.clone(),
                        reason,
                    }));
                    break;
                }
            }
        }

        let panic = match self.thread.take() {
            Some(thread) => tokio::task::spawn_blocking(move || thread.join())
                .await
                .ok()
                .and_then(|joined| joined.err())
                .map(|payload| panic_message(payload.as_ref())),
            None => None,
        };

        match result {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(e)) => Err(e.into()),
            None => Err(BuilderError::Crashed {
                job_id: self.job_id.clone(),
                reason: panic.unwrap_or_else(|| "worker exited without a result".to_string()),
            }
            .into()),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string())
}

fn short_id(job_id: &str) -> &str {
    job_id.get(..8).unwrap_or(job_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::test_support::{write_media, FixedProbe};
    use crate::error::Error;
    use crate::storage::{count_items, init_storage};
    use crate::watcher::ChangeOp;
    use tempfile::TempDir;

    fn context(root: &std::path::Path, db: Database) -> BuilderContext {
        BuilderContext {
            db,
            root: root.to_path_buf(),
            filter: Arc::new(ChangeFilter::new(root, &[]).unwrap()),
            probe: Arc::new(FixedProbe),
            retry: RetryPolicy::default(),
            bulk: BulkIndexSignal::new(),
            batch_size: 2,
            probe_concurrency: 2,
            bulk_query_timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_rebuild_job_reports_progress() {
        let tmp = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        write_media(tmp.path(), "A/1.jpg", 1);
        write_media(tmp.path(), "A/2.jpg", 2);
        let db = Database::open(data.path().join("index.db")).unwrap();
        init_storage(&db).unwrap();

        let request = WorkerRequest::Rebuild(RebuildRequest {
            job_id: "job-rebuild".to_string(),
        });
        let handle = spawn(&context(tmp.path(), db.clone()), request).unwrap();
        assert_eq!(handle.job_id(), "job-rebuild");

        let mut progress = Vec::new();
        let outcome = handle.finish(|n| progress.push(n)).await.unwrap();

        let JobOutcome::Rebuilt(summary) = outcome else {
            panic!("expected a rebuild outcome");
        };
        assert_eq!(summary.processed_files, 3);
        assert_eq!(progress, vec![2, 3]);
        assert_eq!(db.with_conn(count_items).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_apply_job() {
        let tmp = TempDir::new().unwrap();
        write_media(tmp.path(), "1.jpg", 1);
        let db = Database::open_in_memory().unwrap();
        init_storage(&db).unwrap();

        let request = WorkerRequest::Apply(ApplyRequest {
            job_id: "job-apply".to_string(),
            changes: vec![ConsolidatedChange {
                path: "1.jpg".to_string(),
                op: ChangeOp::Add,
                is_dir: false,
                content_hash: None,
            }],
        });
        let outcome = spawn(&context(tmp.path(), db.clone()), request)
            .unwrap()
            .finish(|_| {})
            .await
            .unwrap();

        assert!(matches!(outcome, JobOutcome::Applied(ApplySummary { upserted: 1, .. })));
        assert_eq!(db.with_conn(count_items).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_job() {
        let tmp = TempDir::new().unwrap();
        // No schema: every write fails permanently.
        let db = Database::open_in_memory().unwrap();
        let request = WorkerRequest::Rebuild(RebuildRequest {
            job_id: "job-broken".to_string(),
        });
        let err = spawn(&context(tmp.path(), db), request)
            .unwrap()
            .finish(|_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Builder(BuilderError::JobFailed { .. })));
    }

    #[tokio::test]
    async fn test_panicking_worker_is_a_crash() {
        let handle = spawn_thread("job-crash".to_string(), "index-crash".to_string(), |tx| {
            let _ = tx.send(WorkerMessage::Progress { processed_files: 1 });
            panic!("worker blew up");
        })
        .unwrap();

        let mut seen = Vec::new();
        let err = handle.finish(|n| seen.push(n)).await.unwrap_err();
        assert_eq!(seen, vec![1]);
        match err {
            Error::Builder(BuilderError::Crashed { job_id, reason }) => {
                assert_eq!(job_id, "job-crash");
                assert!(reason.contains("worker blew up"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_message_union_serde() {
        let msg = WorkerMessage::Progress { processed_files: 5 };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"message":"Progress","processed_files":5}"#);
    }
}
