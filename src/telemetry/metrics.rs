//! Prometheus metrics definitions.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

/// Rows in the item table after the last job.
pub static ITEMS_TOTAL: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("mediadex_items_total", "Number of indexed albums, photos and videos")
        .unwrap()
});

/// Raw events waiting for the next flush.
pub static PENDING_CHANGES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "mediadex_pending_changes",
        "Raw change events waiting in the pending buffer"
    )
    .unwrap()
});

/// Builder jobs by kind and result.
pub static JOBS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mediadex_jobs_total",
        "Index builder jobs by kind and result",
        &["kind", "result"]
    )
    .unwrap()
});

/// Nodes committed by the running rebuild.
pub static REBUILD_PROCESSED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "mediadex_rebuild_processed_files",
        "Nodes committed by the current rebuild"
    )
    .unwrap()
});

/// Cache invalidations by mode (targeted or purge).
pub static CACHE_INVALIDATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mediadex_cache_invalidations_total",
        "Cache invalidations by mode",
        &["mode"]
    )
    .unwrap()
});

/// Watcher events dropped while a rebuild was running.
pub static WATCHER_DROPPED_EVENTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "mediadex_watcher_dropped_events_total",
        "Watcher events dropped during a rebuild"
    )
    .unwrap()
});

/// Failed persistence attempts by error class.
pub static RETRY_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mediadex_retry_attempts_total",
        "Failed persistence attempts by error class",
        &["class"]
    )
    .unwrap()
});

/// Initialize all metrics (call once at startup).
pub fn init_metrics() {
    let _ = &*ITEMS_TOTAL;
    let _ = &*PENDING_CHANGES;
    let _ = &*JOBS_TOTAL;
    let _ = &*REBUILD_PROCESSED;
    let _ = &*CACHE_INVALIDATIONS;
    let _ = &*WATCHER_DROPPED_EVENTS;
    let _ = &*RETRY_ATTEMPTS;

    tracing::debug!("Prometheus metrics initialized");
}
