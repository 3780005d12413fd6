//! mediadex - incremental media indexing daemon
//!
//! Entry point for the indexer.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use mediadex::storage::{init_storage, Database};
use mediadex::telemetry::{init_metrics, init_tracing};
use mediadex::{Config, IndexerConfig, Orchestrator};
use tokio_util::sync::CancellationToken;

/// mediadex - incremental media indexing daemon
#[derive(Parser, Debug)]
#[command(name = "mediadex")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Root of the media tree to index
    #[arg(short, long, env = "MEDIADEX_MEDIA_ROOT", default_value = "./media")]
    media_root: PathBuf,

    /// Data directory for the `SQLite` database
    #[arg(short, long, env = "MEDIADEX_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "MEDIADEX_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, env = "MEDIADEX_LOG_JSON")]
    log_json: bool,

    /// Rows committed per rebuild transaction
    #[arg(long, env = "MEDIADEX_BATCH_SIZE", default_value = "1000")]
    batch_size: usize,

    /// Consolidated changes above which a flush becomes a full rebuild
    #[arg(long, env = "MEDIADEX_REBUILD_THRESHOLD", default_value = "5000")]
    rebuild_threshold: usize,

    /// Maximum simultaneous dimension probes
    #[arg(long, env = "MEDIADEX_PROBE_CONCURRENCY")]
    probe_concurrency: Option<usize>,

    /// Report a file once it has been quiet for N milliseconds
    #[arg(long, env = "MEDIADEX_STABILIZATION_MS", default_value = "2000")]
    stabilization_ms: u64,

    /// Poll the tree every N seconds instead of using native events
    #[arg(long, env = "MEDIADEX_POLL_INTERVAL")]
    poll_interval: Option<u64>,

    /// Stop the watcher after N idle seconds (disabled when unset)
    #[arg(long, env = "MEDIADEX_WATCHER_IDLE_TIMEOUT")]
    watcher_idle_timeout: Option<u64>,

    /// Extra ignore patterns (gitignore syntax)
    #[arg(short, long, env = "MEDIADEX_IGNORE", value_delimiter = ',')]
    ignore: Vec<String>,

    /// Run a full rebuild before watching
    #[arg(long)]
    rebuild: bool,

    /// Print the index status as JSON and exit
    #[arg(long)]
    status: bool,
}

impl Cli {
    fn into_config(self) -> Config {
        let defaults = IndexerConfig::default();
        Config {
            media_root: self.media_root,
            data_dir: self.data_dir,
            log_level: self.log_level,
            log_json: self.log_json,
            indexer: IndexerConfig {
                batch_size: self.batch_size,
                rebuild_threshold: self.rebuild_threshold,
                probe_concurrency: self.probe_concurrency.unwrap_or(defaults.probe_concurrency),
                stabilization: Duration::from_millis(self.stabilization_ms),
                poll_interval: self.poll_interval.map(Duration::from_secs),
                watcher_idle_timeout: self.watcher_idle_timeout.map(Duration::from_secs),
                ignore_patterns: self.ignore,
                ..defaults
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (force_rebuild, status_only) = (cli.rebuild, cli.status);

    init_tracing(&cli.log_level, cli.log_json);

    tracing::info!("mediadex v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = cli.into_config();
    tracing::debug!(?config, "Configuration loaded");
    config.validate()?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    let db = Database::open(config.database_path())?;
    init_storage(&db)?;

    init_metrics();

    let orchestrator =
        Orchestrator::builder(&config.media_root, config.indexer.clone(), db).build()?;

    if status_only {
        println!("{}", serde_json::to_string_pretty(&orchestrator.report()?)?);
        return Ok(());
    }

    tracing::info!(
        media_root = %orchestrator.root().display(),
        data_dir = %config.data_dir.display(),
        "Indexing"
    );

    if force_rebuild {
        let summary = orchestrator.rebuild().await?;
        tracing::info!(processed = summary.processed_files, "Forced rebuild finished");
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
        }
        shutdown.cancel();
    });

    orchestrator.run(cancel).await?;
    Ok(())
}
