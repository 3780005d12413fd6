//! Configuration settings and validation.

use std::path::PathBuf;
use std::time::Duration;

use crate::cache::InvalidationPolicy;
use crate::orchestrator::DebouncePolicy;
use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Upper bound on simultaneous dimension probes.
const MAX_PROBE_CONCURRENCY: usize = 50;

/// Main configuration for the indexing engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the media tree being indexed.
    pub media_root: PathBuf,

    /// Directory for the `SQLite` database.
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines.
    pub log_json: bool,

    /// Indexing engine tunables.
    pub indexer: IndexerConfig,
}

/// Tunables for the watcher, orchestrator and index builder.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Rows committed per rebuild transaction.
    pub batch_size: usize,

    /// Maximum simultaneous dimension probes.
    pub probe_concurrency: usize,

    /// Consolidated change count above which a flush escalates to a rebuild.
    pub rebuild_threshold: usize,

    /// Adaptive flush debounce.
    pub debounce: DebouncePolicy,

    /// A file is reported once it has been quiet for this long.
    pub stabilization: Duration,

    /// Poll the tree at this interval instead of using native events.
    pub poll_interval: Option<Duration>,

    /// Stop the watcher after this long without events or pending changes.
    /// The event loop restarts it on the next externally sent batch;
    /// otherwise the embedder calls `Orchestrator::ensure_watching`.
    pub watcher_idle_timeout: Option<Duration>,

    /// Idle time after an apply before maintenance runs.
    pub maintenance_delay: Duration,

    /// Per-attempt timeout for a maintenance pass.
    pub maintenance_timeout: Duration,

    /// Rows examined per maintenance pass.
    pub maintenance_batch: usize,

    /// Busy timeout for foreground queries.
    pub query_timeout: Duration,

    /// Busy timeout while a rebuild is running.
    pub bulk_query_timeout: Duration,

    /// Retry policy for every persistence write.
    pub retry: RetryPolicy,

    /// Cache invalidation thresholds.
    pub cache: InvalidationPolicy,

    /// Ignore globs added on top of the built-in defaults.
    pub ignore_patterns: Vec<String>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            probe_concurrency: std::thread::available_parallelism()
                .map(|n| n.get().min(4))
                .unwrap_or(4),
            rebuild_threshold: 5000,
            debounce: DebouncePolicy::default(),
            stabilization: Duration::from_secs(2),
            poll_interval: None,
            watcher_idle_timeout: Some(Duration::from_secs(600)),
            maintenance_delay: Duration::from_secs(30),
            maintenance_timeout: Duration::from_secs(60),
            maintenance_batch: 500,
            query_timeout: Duration::from_secs(5),
            bulk_query_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            cache: InvalidationPolicy::default(),
            ignore_patterns: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            media_root: PathBuf::from("./media"),
            data_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
            log_json: false,
            indexer: IndexerConfig::default(),
        }
    }
}

impl Config {
    /// Create a new configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(Error::config(format!(
                "invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.media_root.as_os_str().is_empty() {
            return Err(Error::config("media_root cannot be empty"));
        }

        self.indexer.validate()
    }

    /// Get the path to the `SQLite` database file.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("mediadex.db")
    }
}

impl IndexerConfig {
    /// Validate indexer tunables.
    ///
    /// # Errors
    ///
    /// Returns an error if any tunable is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size cannot be 0"));
        }

        if self.probe_concurrency == 0 {
            return Err(Error::config("probe_concurrency cannot be 0"));
        }

        if self.probe_concurrency > MAX_PROBE_CONCURRENCY {
            return Err(Error::config(format!(
                "probe_concurrency cannot exceed {MAX_PROBE_CONCURRENCY}"
            )));
        }

        if self.rebuild_threshold == 0 {
            return Err(Error::config("rebuild_threshold cannot be 0"));
        }

        if self.maintenance_batch == 0 {
            return Err(Error::config("maintenance_batch cannot be 0"));
        }

        if self.retry.max_delay < self.retry.base_delay {
            return Err(Error::config(
                "retry max_delay cannot be shorter than base_delay",
            ));
        }

        if self.bulk_query_timeout < self.query_timeout {
            return Err(Error::config(
                "bulk_query_timeout cannot be shorter than query_timeout",
            ));
        }

        Ok(())
    }
}
