//! Index orchestrator.
//!
//! Owns the lifecycle around the builder: it buffers watcher events,
//! debounces flushes, serializes critical jobs through a single slot and
//! decides when a change set is large enough to fall back to a full
//! rebuild. Jobs themselves run in builder workers; the orchestrator only
//! waits on them.

mod debounce;
mod maintenance;
mod state;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::builder::worker::{self, ApplyRequest, BuilderContext, JobOutcome, RebuildRequest, WorkerRequest};
use crate::builder::{ApplySummary, DimensionProbe, ImageProbe, RebuildSummary};
use crate::cache::{CacheInvalidator, MemoryTagCache, TagCache};
use crate::config::IndexerConfig;
use crate::error::BuilderError;
use crate::retry::{BulkIndexSignal, Retrier};
use crate::paths::relative_key;
use crate::storage::{
    count_items, get_item, load_checkpoint, load_index_status, Database, IndexStatus,
};
use crate::telemetry::metrics::{ITEMS_TOTAL, JOBS_TOTAL, PENDING_CHANGES, WATCHER_DROPPED_EVENTS};
use crate::telemetry::spans;
use crate::watcher::{
    consolidate_indexed, ChangeFilter, ConsolidatedChange, MediaWatcher, PendingChangeBuffer,
    RawChange, RawEventKind, WatcherConfig,
};
use crate::{Error, Result};

pub use debounce::DebouncePolicy;
pub use maintenance::{MaintenancePass, MaintenanceReport};
pub use state::{JobKind, JobPermit, JobSlot, JobState};

/// Watcher batches buffered between the watcher thread and the event loop.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Failed applies in a row before the next flush falls back to a rebuild.
const MAX_APPLY_FAILURES: u32 = 3;

/// What a flush did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum FlushOutcome {
    /// Nothing was pending.
    Empty,
    /// Another job holds the slot; the buffer was left alone.
    Busy,
    /// The change set was applied incrementally.
    Applied(ApplySummary),
    /// The change set was too large and a full rebuild ran instead.
    Escalated(RebuildSummary),
}

/// Point-in-time view of the index for status surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexReport {
    /// Job currently holding the slot.
    pub state: JobState,
    /// Raw events waiting for the next flush.
    pub pending_changes: usize,
    /// Watcher events dropped while a rebuild ran.
    pub dropped_events: u64,
    /// Nodes committed by the last or running rebuild.
    pub rebuild_progress: u64,
    /// Rows in the item table.
    pub items: i64,
    /// Last rebuild checkpoint, if a rebuild is incomplete.
    pub checkpoint: Option<String>,
    /// Stored rebuild status.
    pub status: Option<IndexStatus>,
    /// Message of the last failed job, cleared by the next success.
    pub last_error: Option<String>,
    /// Whether the watcher is running.
    pub watching: bool,
}

/// Job finished by a task spawned from the event loop.
enum Finished {
    Flush(Result<FlushOutcome>),
    Rebuild(Result<RebuildSummary>),
    Maintenance(Result<MaintenanceReport>),
}

struct Inner {
    config: IndexerConfig,
    root: PathBuf,
    db: Database,
    filter: Arc<ChangeFilter>,
    buffer: PendingChangeBuffer,
    slot: JobSlot,
    builder: BuilderContext,
    invalidator: Arc<CacheInvalidator>,
    retrier: Retrier,
    watcher: Mutex<Option<MediaWatcher>>,
    events_tx: mpsc::Sender<Vec<RawChange>>,
    events_rx: Mutex<Option<mpsc::Receiver<Vec<RawChange>>>>,
    dropped_events: AtomicU64,
    rebuild_progress: Arc<AtomicU64>,
    apply_failures: AtomicU32,
    last_error: Mutex<Option<String>>,
    mtime_cursor: Mutex<Option<String>>,
    dimension_cursor: Mutex<Option<String>>,
}

/// Builds an [`Orchestrator`].
pub struct OrchestratorBuilder {
    root: PathBuf,
    config: IndexerConfig,
    db: Database,
    probe: Arc<dyn DimensionProbe>,
    cache: Arc<dyn TagCache>,
}

impl OrchestratorBuilder {
    /// Use a different dimension probe.
    #[must_use]
    pub fn probe(mut self, probe: Arc<dyn DimensionProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Use a different tag cache store.
    #[must_use]
    pub fn tag_cache(mut self, cache: Arc<dyn TagCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Finish construction.
    ///
    /// # Errors
    ///
    /// Returns an error if the media root cannot be resolved, an ignore
    /// pattern is invalid, or the busy timeout cannot be applied.
    pub fn build(self) -> Result<Orchestrator> {
        let root = std::fs::canonicalize(&self.root).map_err(|e| {
            Error::config(format!(
                "media root '{}' is not accessible: {e}",
                self.root.display()
            ))
        })?;
        let filter = Arc::new(ChangeFilter::new(&root, &self.config.ignore_patterns)?);
        self.db.set_busy_timeout(self.config.query_timeout)?;

        let bulk = BulkIndexSignal::new();
        let builder = BuilderContext {
            db: self.db.clone(),
            root: root.clone(),
            filter: Arc::clone(&filter),
            probe: self.probe,
            retry: self.config.retry.clone(),
            bulk: bulk.clone(),
            batch_size: self.config.batch_size,
            probe_concurrency: self.config.probe_concurrency,
            bulk_query_timeout: self.config.bulk_query_timeout,
        };
        let invalidator = Arc::new(CacheInvalidator::new(self.cache, self.config.cache.clone()));
        let retrier = Retrier::new(self.config.retry.clone(), bulk);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                config: self.config,
                root,
                db: self.db,
                filter,
                buffer: PendingChangeBuffer::new(),
                slot: JobSlot::new(),
                builder,
                invalidator,
                retrier,
                watcher: Mutex::new(None),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                dropped_events: AtomicU64::new(0),
                rebuild_progress: Arc::new(AtomicU64::new(0)),
                apply_failures: AtomicU32::new(0),
                last_error: Mutex::new(None),
                mtime_cursor: Mutex::new(None),
                dimension_cursor: Mutex::new(None),
            }),
        })
    }
}

/// Coordinates the watcher, the pending buffer and builder jobs.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Start building an orchestrator over `root`, writing to `db`.
    ///
    /// Defaults to [`ImageProbe`] and an in-process [`MemoryTagCache`].
    pub fn builder(root: impl Into<PathBuf>, config: IndexerConfig, db: Database) -> OrchestratorBuilder {
        OrchestratorBuilder {
            root: root.into(),
            config,
            db,
            probe: Arc::new(ImageProbe),
            cache: Arc::new(MemoryTagCache::new()),
        }
    }

    /// Canonical media root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Foreground database handle.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    /// Sender for externally produced event batches, consumed by [`Self::run`].
    #[must_use]
    pub fn events(&self) -> mpsc::Sender<Vec<RawChange>> {
        self.inner.events_tx.clone()
    }

    /// Queue raw changes for the next flush. Paths may be absolute under
    /// the root or relative to it; anything outside the root or rejected by
    /// the filter is dropped. Returns the number accepted.
    pub fn enqueue(&self, changes: impl IntoIterator<Item = RawChange>) -> usize {
        let accepted = self.accept(changes);
        let count = accepted.len();
        self.inner.buffer.enqueue_all(accepted);
        self.update_pending_gauge();
        count
    }

    /// Raw events waiting for the next flush.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.buffer.event_count()
    }

    /// Whether a rebuild or apply is running.
    #[must_use]
    pub fn is_indexing(&self) -> bool {
        matches!(
            self.inner.slot.running(),
            Some(JobKind::Rebuild | JobKind::Apply)
        )
    }

    /// Whether the watcher is running.
    #[must_use]
    pub fn is_watching(&self) -> bool {
        self.inner.watcher.lock().is_some()
    }

    /// Whether the index must be rebuilt before incremental updates make
    /// sense: it is empty, or a previous rebuild did not finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be read.
    pub fn needs_rebuild(&self) -> Result<bool> {
        self.inner.db.with_conn(|conn| {
            if count_items(conn)? == 0 || load_checkpoint(conn)?.is_some() {
                return Ok(true);
            }
            Ok(load_index_status(conn)?.is_some_and(|s| s.is_incomplete()))
        })
    }

    /// Status snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be read.
    pub fn report(&self) -> Result<IndexReport> {
        let (items, checkpoint, status) = self.inner.db.with_conn(|conn| {
            Ok((count_items(conn)?, load_checkpoint(conn)?, load_index_status(conn)?))
        })?;

        Ok(IndexReport {
            state: self.inner.slot.state(),
            pending_changes: self.pending(),
            dropped_events: self.inner.dropped_events.load(Ordering::Relaxed),
            rebuild_progress: self.inner.rebuild_progress.load(Ordering::Relaxed),
            items,
            checkpoint,
            status,
            last_error: self.inner.last_error.lock().clone(),
            watching: self.is_watching(),
        })
    }

    /// Start the watcher if it is not running. Returns whether it started.
    ///
    /// Does nothing while a rebuild holds the slot; the rebuild restarts
    /// the watcher itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the watcher cannot be started.
    pub fn ensure_watching(&self) -> Result<bool> {
        if self.inner.slot.running() == Some(JobKind::Rebuild) {
            return Ok(false);
        }
        self.start_watcher()
    }

    /// Stop the watcher. Returns whether one was running.
    pub fn stop_watching(&self) -> bool {
        self.inner.watcher.lock().take().is_some()
    }

    /// Run a full rebuild now.
    ///
    /// The watcher is paused for the duration and restarted afterwards
    /// whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`BuilderError::Busy`] if another job holds the slot, or the
    /// rebuild's own error.
    pub async fn rebuild(&self) -> Result<RebuildSummary> {
        let permit = self.acquire(JobKind::Rebuild)?;
        self.run_rebuild(&permit).await
    }

    /// Filter, consolidate and apply `changes` now, bypassing the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`BuilderError::Busy`] if another job holds the slot, or the
    /// apply's own error.
    pub async fn apply_changes(&self, changes: Vec<RawChange>) -> Result<ApplySummary> {
        let permit = self.acquire(JobKind::Apply)?;
        let changes = self.consolidate(self.accept(changes))?;
        self.apply_consolidated(&permit, changes).await
    }

    /// Drain the buffer and apply it, escalating to a full rebuild when the
    /// consolidated set exceeds the rebuild threshold.
    ///
    /// A failed apply puts the drained events back; after repeated failures
    /// the next flush rebuilds instead.
    ///
    /// # Errors
    ///
    /// Returns the apply or rebuild error after re-queueing the events.
    pub async fn flush(&self) -> Result<FlushOutcome> {
        let Some(permit) = self.inner.slot.try_acquire(JobKind::Apply) else {
            tracing::debug!(running = ?self.inner.slot.running(), "Flush skipped, job in progress");
            return Ok(FlushOutcome::Busy);
        };

        let raw = self.inner.buffer.flatten_and_clear();
        self.update_pending_gauge();
        if raw.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        let span = spans::flush_span(raw.len());
        async {
            let result = async {
                let changes = self.consolidate(raw.clone())?;
                let threshold = self.inner.config.rebuild_threshold;
                let failures = self.inner.apply_failures.load(Ordering::Relaxed);

                if changes.len() > threshold || failures >= MAX_APPLY_FAILURES {
                    tracing::info!(
                        changes = changes.len(),
                        threshold,
                        failures,
                        "Escalating flush to full rebuild"
                    );
                    permit.switch(JobKind::Rebuild);
                    self.run_rebuild(&permit).await.map(FlushOutcome::Escalated)
                } else {
                    self.apply_consolidated(&permit, changes)
                        .await
                        .map(FlushOutcome::Applied)
                }
            }
            .await;

            match result {
                Ok(outcome) => {
                    self.inner.apply_failures.store(0, Ordering::Relaxed);
                    Ok(outcome)
                }
                Err(e) => {
                    self.inner.apply_failures.fetch_add(1, Ordering::Relaxed);
                    self.inner.buffer.requeue(raw);
                    self.update_pending_gauge();
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Run one maintenance pass if the slot is free.
    ///
    /// Vanished files are queued as removals for the next flush.
    ///
    /// # Errors
    ///
    /// Returns [`BuilderError::Busy`] if another job holds the slot, or the
    /// pass error.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let permit = self.acquire(JobKind::Maintenance)?;
        let orchestrator = self.clone();
        let cursor = self.inner.mtime_cursor.lock().clone();
        let dimensions_after = self.inner.dimension_cursor.lock().clone();

        let result = tokio::task::spawn_blocking(move || {
            let inner = &orchestrator.inner;
            let db = inner.db.worker_handle()?;
            let pass = MaintenancePass {
                db: &db,
                root: &inner.root,
                probe: inner.builder.probe.as_ref(),
                retrier: &inner.retrier,
                batch: inner.config.maintenance_batch,
                dimensions_after: dimensions_after.as_deref(),
                deadline: std::time::Instant::now() + inner.config.maintenance_timeout,
            };
            pass.run(cursor.as_deref())
        })
        .await
        .map_err(|e| Error::internal(format!("maintenance task failed: {e}")))
        .and_then(|r| r);
        drop(permit);

        self.record(JobKind::Maintenance, &result);
        let report = result?;
        *self.inner.mtime_cursor.lock() = report.next_cursor.clone();
        *self.inner.dimension_cursor.lock() = report.next_dimension_cursor.clone();

        if !report.vanished.is_empty() {
            tracing::info!(count = report.vanished.len(), "Queueing removal of vanished media");
            self.enqueue(
                report
                    .vanished
                    .iter()
                    .map(|path| RawChange::new(RawEventKind::Unlink, path.clone())),
            );
        }
        Ok(report)
    }

    /// Drive the index until `cancel` fires.
    ///
    /// Rebuilds first when [`Self::needs_rebuild`] says so, then watches the
    /// root and flushes buffered changes on an adaptive debounce. Events
    /// that arrive while a rebuild runs are counted and dropped.
    ///
    /// With a `watcher_idle_timeout`, the watcher stops after that long
    /// without activity. It comes back on the next batch sent through
    /// [`Self::events`] or on [`Self::ensure_watching`]; file system changes
    /// made while it is stopped are not seen until then.
    ///
    /// # Errors
    ///
    /// Returns an error if called twice on the same orchestrator.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut events = self
            .inner
            .events_rx
            .lock()
            .take()
            .ok_or_else(|| Error::internal("orchestrator event loop already running"))?;
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Finished>();
        let config = &self.inner.config;

        let mut busy = false;
        let mut flush_at: Option<Instant> = None;
        let mut maintenance_at: Option<Instant> = None;
        let mut maintenance_attempts = 0u32;
        let mut last_activity = Instant::now();
        let mut idle_stopped = false;

        match self.needs_rebuild() {
            Ok(true) => {
                tracing::info!("Index empty or incomplete, rebuilding");
                busy = true;
                let orchestrator = self.clone();
                let done = done_tx.clone();
                tokio::spawn(async move {
                    let _ = done.send(Finished::Rebuild(orchestrator.rebuild().await));
                });
            }
            Ok(false) => self.start_watching_logged(),
            Err(e) => {
                tracing::error!(error = %e, "Cannot read index state");
                self.start_watching_logged();
            }
        }

        loop {
            let idle_deadline = config.watcher_idle_timeout.map(|t| last_activity + t);
            let idle_eligible = !busy && flush_at.is_none() && self.inner.buffer.is_empty();

            tokio::select! {
                () = cancel.cancelled() => break,

                Some(batch) = events.recv() => {
                    last_activity = Instant::now();
                    if self.inner.slot.running() == Some(JobKind::Rebuild) {
                        let dropped = batch.len() as u64;
                        self.inner.dropped_events.fetch_add(dropped, Ordering::Relaxed);
                        WATCHER_DROPPED_EVENTS.inc_by(dropped);
                        tracing::debug!(dropped, "Dropping events during rebuild");
                        continue;
                    }
                    if idle_stopped {
                        idle_stopped = false;
                        if !self.is_watching() {
                            tracing::info!("Activity after idle stop, restarting watcher");
                            self.start_watching_logged();
                        }
                    }
                    self.enqueue(batch);
                    flush_at = Some(last_activity + config.debounce.interval_for(self.pending()));
                }

                () = sleep_until(flush_at.unwrap_or(last_activity)), if flush_at.is_some() && !busy => {
                    flush_at = None;
                    busy = true;
                    let orchestrator = self.clone();
                    let done = done_tx.clone();
                    tokio::spawn(async move {
                        let _ = done.send(Finished::Flush(orchestrator.flush().await));
                    });
                }

                () = sleep_until(maintenance_at.unwrap_or(last_activity)), if maintenance_at.is_some() && !busy && flush_at.is_none() => {
                    maintenance_at = None;
                    busy = true;
                    let orchestrator = self.clone();
                    let done = done_tx.clone();
                    tokio::spawn(async move {
                        let _ = done.send(Finished::Maintenance(orchestrator.run_maintenance().await));
                    });
                }

                () = sleep_until(idle_deadline.unwrap_or(last_activity)), if idle_deadline.is_some() && idle_eligible && self.is_watching() => {
                    if self.stop_watching() {
                        idle_stopped = true;
                        tracing::info!("Watcher idle, stopping");
                    }
                }

                Some(finished) = done_rx.recv() => {
                    busy = false;
                    last_activity = Instant::now();
                    match finished {
                        Finished::Flush(Ok(FlushOutcome::Applied(_))) => {
                            maintenance_attempts = 0;
                            maintenance_at = Some(last_activity + config.maintenance_delay);
                        }
                        Finished::Flush(Ok(FlushOutcome::Escalated(_))) | Finished::Rebuild(Ok(_)) => {
                            self.start_watching_logged();
                        }
                        Finished::Flush(Ok(FlushOutcome::Busy)) => {
                            flush_at = Some(last_activity + config.debounce.base);
                        }
                        Finished::Flush(Ok(FlushOutcome::Empty)) => {}
                        Finished::Flush(Err(e)) => {
                            tracing::error!(error = %e, "Flush failed, changes re-queued");
                        }
                        Finished::Rebuild(Err(e)) => {
                            tracing::error!(error = %e, "Rebuild failed");
                            self.start_watching_logged();
                        }
                        Finished::Maintenance(Ok(report)) => {
                            if report.timed_out {
                                maintenance_at = Some(last_activity + config.maintenance_delay);
                            }
                        }
                        Finished::Maintenance(Err(e)) => {
                            maintenance_attempts += 1;
                            if maintenance_attempts <= config.retry.max_retries {
                                tracing::warn!(error = %e, attempt = maintenance_attempts, "Maintenance failed, retrying later");
                                maintenance_at = Some(last_activity + config.maintenance_delay);
                            } else {
                                tracing::warn!(error = %e, "Maintenance failed, giving up until next apply");
                            }
                        }
                    }
                    if flush_at.is_none() && !self.inner.buffer.is_empty() {
                        flush_at = Some(last_activity + config.debounce.interval_for(self.pending()));
                    }
                }
            }
        }

        self.stop_watching();
        tracing::info!("Orchestrator stopped");
        Ok(())
    }

    fn accept(&self, changes: impl IntoIterator<Item = RawChange>) -> Vec<RawChange> {
        changes
            .into_iter()
            .filter_map(|mut change| {
                let Some(key) = relative_key(&self.inner.root, Path::new(&change.path)) else {
                    tracing::debug!(path = %change.path, "Dropping change outside the media root");
                    return None;
                };
                change.path = key;
                self.inner
                    .filter
                    .accepts(&change.path, change.kind)
                    .then_some(change)
            })
            .collect()
    }

    /// Consolidate raw events, keeping cancelled bursts on indexed paths as
    /// updates so the apply can confirm whether they still exist.
    fn consolidate(&self, raw: Vec<RawChange>) -> Result<Vec<ConsolidatedChange>> {
        self.inner.db.with_conn(|conn| {
            Ok(consolidate_indexed(raw, |path| {
                !matches!(get_item(conn, path), Ok(None))
            }))
        })
    }

    fn acquire(&self, kind: JobKind) -> Result<JobPermit> {
        self.inner.slot.try_acquire(kind).ok_or_else(|| {
            let running = self.inner.slot.running().map_or("job", JobKind::as_str);
            BuilderError::Busy(running.to_string()).into()
        })
    }

    async fn run_rebuild(&self, permit: &JobPermit) -> Result<RebuildSummary> {
        let inner = &self.inner;
        let was_watching = self.stop_watching();
        let bulk = inner.builder.bulk.activate();
        if let Err(e) = inner.db.set_busy_timeout(inner.config.bulk_query_timeout) {
            tracing::warn!(error = %e, "Cannot raise busy timeout for rebuild");
        }
        inner.rebuild_progress.store(0, Ordering::Relaxed);

        let progress = Arc::clone(&inner.rebuild_progress);
        let request = WorkerRequest::Rebuild(RebuildRequest {
            job_id: permit.job_id().to_string(),
        });
        let result = self
            .run_worker(request, move |processed| {
                progress.store(processed, Ordering::Relaxed);
            })
            .await
            .and_then(|outcome| match outcome {
                JobOutcome::Rebuilt(summary) => Ok(summary),
                other => Err(Error::internal(format!("rebuild returned {other:?}"))),
            });

        drop(bulk);
        if let Err(e) = inner.db.set_busy_timeout(inner.config.query_timeout) {
            tracing::warn!(error = %e, "Cannot restore busy timeout");
        }
        if was_watching {
            if let Err(e) = self.start_watcher() {
                tracing::warn!(error = %e, "Cannot resume watcher after rebuild");
            }
        }

        self.record(JobKind::Rebuild, &result);
        result
    }

    fn start_watcher(&self) -> Result<bool> {
        let mut watcher = self.inner.watcher.lock();
        if watcher.is_some() {
            return Ok(false);
        }

        let config = WatcherConfig {
            root: self.inner.root.clone(),
            stabilization: self.inner.config.stabilization,
            poll_interval: self.inner.config.poll_interval,
        };
        *watcher = Some(MediaWatcher::start(
            &config,
            Arc::clone(&self.inner.filter),
            self.inner.events_tx.clone(),
        )?);
        Ok(true)
    }

    async fn apply_consolidated(
        &self,
        permit: &JobPermit,
        changes: Vec<ConsolidatedChange>,
    ) -> Result<ApplySummary> {
        if changes.is_empty() {
            return Ok(ApplySummary::default());
        }

        let invalidator = Arc::clone(&self.inner.invalidator);
        let stale = changes.clone();
        let invalidation = tokio::task::spawn_blocking(move || invalidator.invalidate(&stale));

        let request = WorkerRequest::Apply(ApplyRequest {
            job_id: permit.job_id().to_string(),
            changes,
        });
        let (applied, invalidated) = tokio::join!(self.run_worker(request, |_| {}), invalidation);

        match invalidated {
            Ok(Ok(outcome)) => tracing::debug!(?outcome, "Cache invalidated"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Cache invalidation failed"),
            Err(e) => tracing::warn!(error = %e, "Cache invalidation task failed"),
        }

        let result = applied.and_then(|outcome| match outcome {
            JobOutcome::Applied(summary) => Ok(summary),
            other => Err(Error::internal(format!("apply returned {other:?}"))),
        });
        self.record(JobKind::Apply, &result);
        result
    }

    async fn run_worker<P>(&self, request: WorkerRequest, progress: P) -> Result<JobOutcome>
    where
        P: FnMut(u64),
    {
        worker::spawn(&self.inner.builder, request)?
            .finish(progress)
            .await
    }

    fn record<T>(&self, kind: JobKind, result: &Result<T>) {
        let label = if result.is_ok() { "ok" } else { "error" };
        JOBS_TOTAL.with_label_values(&[kind.as_str(), label]).inc();

        match result {
            Ok(_) => {
                *self.inner.last_error.lock() = None;
                if kind != JobKind::Maintenance {
                    match self.inner.db.with_conn(count_items) {
                        Ok(items) => ITEMS_TOTAL.set(items),
                        Err(e) => tracing::debug!(error = %e, "Cannot count items"),
                    }
                }
            }
            Err(e) => {
                tracing::warn!(job = kind.as_str(), error = %e, "Job failed");
                *self.inner.last_error.lock() = Some(e.to_string());
            }
        }
    }

    fn start_watching_logged(&self) {
        match self.ensure_watching() {
            Ok(true) => tracing::debug!("Watcher started"),
            Ok(false) => {}
            Err(e) => tracing::error!(error = %e, "Cannot start watcher"),
        }
    }

    fn update_pending_gauge(&self) {
        PENDING_CHANGES.set(i64::try_from(self.pending()).unwrap_or(i64::MAX));
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("root", &self.inner.root)
            .field("state", &self.inner.slot.state())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::test_support::{write_media, FixedProbe};
    use crate::storage::{get_cover, get_item, init_storage};
    use std::time::Duration;
    use tempfile::TempDir;

    fn orchestrator(root: &Path) -> Orchestrator {
        orchestrator_with(root, IndexerConfig::default())
    }

    fn orchestrator_with(root: &Path, config: IndexerConfig) -> Orchestrator {
        let db = Database::open_in_memory().unwrap();
        init_storage(&db).unwrap();
        Orchestrator::builder(root, config, db)
            .probe(Arc::new(FixedProbe))
            .build()
            .unwrap()
    }

    fn add(path: &str) -> RawChange {
        RawChange::new(RawEventKind::Add, path)
    }

    fn quiet_config() -> IndexerConfig {
        let mut config = IndexerConfig::default();
        config.debounce = DebouncePolicy {
            base: Duration::from_millis(50),
            tiers: Vec::new(),
        };
        config.poll_interval = Some(Duration::from_secs(3600));
        config
    }

    fn spawn_run(orch: &Orchestrator) -> (CancellationToken, tokio::task::JoinHandle<Result<()>>) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let orch = orch.clone();
            let cancel = cancel.clone();
            async move { orch.run(cancel).await }
        });
        (cancel, handle)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..250 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_enqueue_normalizes_absolute_paths() {
        let tmp = TempDir::new().unwrap();
        write_media(tmp.path(), "A/1.jpg", 100);
        let orch = orchestrator(tmp.path());

        let inside = orch.root().join("A/1.jpg").to_string_lossy().into_owned();
        let accepted = orch.enqueue(vec![add("/elsewhere/x.jpg"), add(&inside)]);
        assert_eq!(accepted, 1);

        let outcome = orch.flush().await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Applied(ref s) if s.upserted == 2));
        orch.database()
            .with_conn(|conn| {
                assert!(get_item(conn, "A/1.jpg")?.is_some());
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_apply_changes_accepts_absolute_paths_under_root() {
        let tmp = TempDir::new().unwrap();
        write_media(tmp.path(), "A/1.jpg", 100);
        let orch = orchestrator(tmp.path());

        let inside = orch.root().join("A/1.jpg").to_string_lossy().into_owned();
        let summary = orch
            .apply_changes(vec![add(&inside), add("/elsewhere/x.jpg")])
            .await
            .unwrap();
        assert_eq!(summary.upserted, 2);

        orch.database()
            .with_conn(|conn| {
                assert_eq!(get_cover(conn, "A")?.unwrap().cover_path, "A/1.jpg");
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_burst_on_indexed_file_removes_it() {
        let tmp = TempDir::new().unwrap();
        write_media(tmp.path(), "A/1.jpg", 300);
        write_media(tmp.path(), "A/2.jpg", 100);
        let orch = orchestrator(tmp.path());
        orch.rebuild().await.unwrap();

        // Rewrite then delete: the watcher reports the rewrite as an add.
        std::fs::remove_file(tmp.path().join("A/1.jpg")).unwrap();
        orch.enqueue(vec![
            add("A/1.jpg").with_hash("h"),
            RawChange::new(RawEventKind::Unlink, "A/1.jpg"),
        ]);

        match orch.flush().await.unwrap() {
            FlushOutcome::Applied(summary) => {
                assert_eq!(summary.deleted, 1);
                assert_eq!(summary.confirmed_absent, 1);
            }
            other => panic!("expected an apply, got {other:?}"),
        }
        orch.database()
            .with_conn(|conn| {
                assert!(get_item(conn, "A/1.jpg")?.is_none());
                assert_eq!(get_cover(conn, "A")?.unwrap().cover_path, "A/2.jpg");
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_idle_watcher_stops_and_restarts() {
        let tmp = TempDir::new().unwrap();
        write_media(tmp.path(), "A/1.jpg", 100);
        let mut config = quiet_config();
        config.watcher_idle_timeout = Some(Duration::from_millis(200));
        let orch = orchestrator_with(tmp.path(), config);
        orch.rebuild().await.unwrap();

        let (cancel, handle) = spawn_run(&orch);
        assert!(wait_for(|| orch.is_watching()).await);
        assert!(wait_for(|| !orch.is_watching()).await);
        assert!(!orch.report().unwrap().watching);

        assert!(orch.ensure_watching().unwrap());
        assert!(orch.is_watching());
        assert!(orch.stop_watching());

        // An externally sent batch brings the watcher back.
        write_media(tmp.path(), "A/2.jpg", 200);
        orch.events().send(vec![add("A/2.jpg")]).await.unwrap();
        assert!(wait_for(|| orch.is_watching()).await);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_events_during_rebuild_are_dropped() {
        let tmp = TempDir::new().unwrap();
        write_media(tmp.path(), "A/1.jpg", 100);
        let orch = orchestrator_with(tmp.path(), quiet_config());
        orch.rebuild().await.unwrap();

        let (cancel, handle) = spawn_run(&orch);
        let permit = orch.inner.slot.try_acquire(JobKind::Rebuild).unwrap();
        orch.events()
            .send(vec![add("A/2.jpg"), add("A/3.jpg"), add("A/4.jpg")])
            .await
            .unwrap();

        assert!(wait_for(|| orch.report().unwrap().dropped_events == 3).await);
        assert_eq!(orch.pending(), 0);
        drop(permit);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_flush_applies_buffered_changes() {
        let tmp = TempDir::new().unwrap();
        write_media(tmp.path(), "A/1.jpg", 100);
        write_media(tmp.path(), "A/2.jpg", 200);
        let orch = orchestrator(tmp.path());

        let accepted = orch.enqueue(vec![
            RawChange::new(RawEventKind::AddDir, "A"),
            add("A/1.jpg"),
            add("A/2.jpg"),
            add("A/notes.txt"),
        ]);
        assert_eq!(accepted, 3);

        let outcome = orch.flush().await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Applied(ref s) if s.upserted == 3));
        assert_eq!(orch.pending(), 0);

        orch.database()
            .with_conn(|conn| {
                assert_eq!(get_cover(conn, "A")?.unwrap().cover_path, "A/2.jpg");
                Ok(())
            })
            .unwrap();
        assert_eq!(orch.flush().await.unwrap(), FlushOutcome::Empty);
    }

    #[tokio::test]
    async fn test_flush_while_rebuilding_is_refused() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(tmp.path());
        orch.enqueue(vec![add("A/1.jpg")]);

        let permit = orch.inner.slot.try_acquire(JobKind::Rebuild).unwrap();
        assert!(orch.is_indexing());
        assert_eq!(orch.flush().await.unwrap(), FlushOutcome::Busy);
        assert_eq!(orch.pending(), 1);

        let err = orch.apply_changes(vec![add("A/1.jpg")]).await.unwrap_err();
        assert!(matches!(err, Error::Builder(BuilderError::Busy(ref k)) if k == "rebuild"));
        assert!(matches!(orch.rebuild().await, Err(Error::Builder(BuilderError::Busy(_)))));

        drop(permit);
        assert!(!orch.is_indexing());
    }

    #[tokio::test]
    async fn test_large_change_set_escalates() {
        let tmp = TempDir::new().unwrap();
        write_media(tmp.path(), "A/1.jpg", 100);
        let orch = orchestrator(tmp.path());

        orch.enqueue((0..6000).map(|i| add(&format!("burst/{i}.jpg"))));
        let outcome = orch.flush().await.unwrap();

        match outcome {
            FlushOutcome::Escalated(summary) => assert_eq!(summary.processed_files, 2),
            other => panic!("expected escalation, got {other:?}"),
        }
        assert_eq!(orch.pending(), 0);
        assert_eq!(orch.inner.slot.state(), JobState::Idle);
    }

    #[tokio::test]
    async fn test_failed_apply_requeues_events() {
        let tmp = TempDir::new().unwrap();
        write_media(tmp.path(), "A/1.jpg", 100);
        let orch = orchestrator(tmp.path());
        orch.database()
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER reject_items BEFORE INSERT ON items
                     BEGIN SELECT RAISE(ABORT, 'items rejected'); END;",
                )?;
                Ok(())
            })
            .unwrap();

        orch.enqueue(vec![add("A/1.jpg")]);
        assert!(orch.flush().await.is_err());
        assert_eq!(orch.pending(), 1);

        let report = orch.report().unwrap();
        assert!(report.last_error.is_some());
        assert_eq!(report.state, JobState::Idle);
    }

    #[tokio::test]
    async fn test_rebuild_and_report() {
        let tmp = TempDir::new().unwrap();
        write_media(tmp.path(), "A/1.jpg", 100);
        let orch = orchestrator(tmp.path());
        assert!(orch.needs_rebuild().unwrap());

        let summary = orch.rebuild().await.unwrap();
        assert_eq!(summary.processed_files, 2);
        assert!(!orch.needs_rebuild().unwrap());

        let report = orch.report().unwrap();
        assert_eq!(report.items, 2);
        assert_eq!(report.rebuild_progress, 2);
        assert!(report.checkpoint.is_none());
        assert!(report.last_error.is_none());
        assert!(!report.watching);
    }

    #[tokio::test]
    async fn test_maintenance_queues_vanished_media() {
        let tmp = TempDir::new().unwrap();
        write_media(tmp.path(), "A/1.jpg", 100);
        write_media(tmp.path(), "A/2.jpg", 200);
        let orch = orchestrator(tmp.path());
        orch.rebuild().await.unwrap();

        std::fs::remove_file(tmp.path().join("A/2.jpg")).unwrap();
        let report = orch.run_maintenance().await.unwrap();
        assert_eq!(report.vanished, vec!["A/2.jpg".to_string()]);
        assert_eq!(orch.pending(), 1);

        orch.flush().await.unwrap();
        orch.database()
            .with_conn(|conn| {
                assert!(get_item(conn, "A/2.jpg")?.is_none());
                assert_eq!(get_cover(conn, "A")?.unwrap().cover_path, "A/1.jpg");
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_rebuilds_then_flushes_events() {
        let tmp = TempDir::new().unwrap();
        write_media(tmp.path(), "A/1.jpg", 100);
        let mut config = IndexerConfig::default();
        config.debounce = DebouncePolicy {
            base: Duration::from_millis(50),
            tiers: Vec::new(),
        };
        config.poll_interval = Some(Duration::from_secs(3600));
        let orch = orchestrator_with(tmp.path(), config);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let orch = orch.clone();
            let cancel = cancel.clone();
            async move { orch.run(cancel).await }
        });

        for _ in 0..100 {
            if orch.report().unwrap().items == 2 && !orch.is_indexing() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(orch.report().unwrap().items, 2);

        write_media(tmp.path(), "A/3.jpg", 300);
        orch.events().send(vec![add("A/3.jpg")]).await.unwrap();
        for _ in 0..100 {
            let found = orch
                .database()
                .with_conn(|conn| get_item(conn, "A/3.jpg"))
                .unwrap();
            if found.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        orch.database()
            .with_conn(|conn| {
                assert!(get_item(conn, "A/3.jpg")?.is_some());
                assert_eq!(get_cover(conn, "A")?.unwrap().cover_path, "A/3.jpg");
                Ok(())
            })
            .unwrap();

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert!(!orch.is_watching());
    }
}
