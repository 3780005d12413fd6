//! Recursive media tree watcher using notify-rs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{PollWatcher, RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{
    new_debouncer_opt, DebounceEventResult, DebouncedEvent, DebouncedEventKind, Debouncer,
};
use tokio::sync::mpsc;

use super::events::{content_fingerprint, RawChange, RawEventKind};
use super::filter::ChangeFilter;
use crate::error::WatcherError;
use crate::paths::relative_key;
use crate::Result;

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Root of the media tree.
    pub root: PathBuf,
    /// Quiet period before a path is reported.
    pub stabilization: Duration,
    /// Poll at this interval instead of using native events.
    pub poll_interval: Option<Duration>,
}

impl WatcherConfig {
    /// Native-event configuration with the default stabilization delay.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stabilization: Duration::from_secs(2),
            poll_interval: None,
        }
    }
}

enum Backend {
    Native(Debouncer<RecommendedWatcher>),
    Poll(Debouncer<PollWatcher>),
}

/// Running watch over the media root.
///
/// Filtered events are sent as batches on the channel handed to
/// [`MediaWatcher::start`]. Dropping the watcher stops it.
pub struct MediaWatcher {
    backend: Backend,
    root: PathBuf,
}

impl MediaWatcher {
    /// Start watching `config.root` recursively.
    ///
    /// # Errors
    ///
    /// Returns an error if the root does not exist or the watch primitive
    /// cannot be created.
    pub fn start(
        config: &WatcherConfig,
        filter: Arc<ChangeFilter>,
        tx: mpsc::Sender<Vec<RawChange>>,
    ) -> Result<Self> {
        let root = config.root.clone();
        if !root.is_dir() {
            return Err(WatcherError::WatchFailed {
                path: root.display().to_string(),
                reason: "directory does not exist".to_string(),
            }
            .into());
        }

        let handler_root = root.clone();
        let handler = move |result: DebounceEventResult| match result {
            Ok(events) => {
                let batch = map_events(&handler_root, &filter, events);
                if !batch.is_empty() && tx.blocking_send(batch).is_err() {
                    tracing::debug!("Event receiver closed, dropping batch");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Watch error");
            }
        };

        let watch_failed = |e: notify::Error| WatcherError::WatchFailed {
            path: root.display().to_string(),
            reason: e.to_string(),
        };

        let mut notify_config = notify::Config::default();
        if let Some(interval) = config.poll_interval {
            notify_config = notify_config.with_poll_interval(interval);
        }
        let debounce_config = notify_debouncer_mini::Config::default()
            .with_timeout(config.stabilization)
            .with_notify_config(notify_config);

        let mut backend = if config.poll_interval.is_some() {
            Backend::Poll(new_debouncer_opt(debounce_config, handler).map_err(watch_failed)?)
        } else {
            Backend::Native(new_debouncer_opt(debounce_config, handler).map_err(watch_failed)?)
        };

        match &mut backend {
            Backend::Native(d) => d.watcher().watch(&root, RecursiveMode::Recursive),
            Backend::Poll(d) => d.watcher().watch(&root, RecursiveMode::Recursive),
        }
        .map_err(watch_failed)?;

        tracing::info!(
            path = %root.display(),
            polling = config.poll_interval.is_some(),
            "Watching media root"
        );

        Ok(Self { backend, root })
    }

    /// The watched root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the watcher polls instead of using native events.
    #[must_use]
    pub const fn is_polling(&self) -> bool {
        matches!(self.backend, Backend::Poll(_))
    }
}

impl Drop for MediaWatcher {
    fn drop(&mut self) {
        tracing::info!(path = %self.root.display(), "Stopped watching media root");
    }
}

impl std::fmt::Debug for MediaWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaWatcher")
            .field("root", &self.root)
            .field("polling", &self.is_polling())
            .finish()
    }
}

/// Turn stabilized notifications into filtered raw changes.
///
/// The debouncer reports only that a path changed, so the kind is read
/// back from the file system. A vanished path is a file unlink when its
/// extension is media and a directory unlink otherwise.
fn map_events(root: &Path, filter: &ChangeFilter, events: Vec<DebouncedEvent>) -> Vec<RawChange> {
    events
        .into_iter()
        .filter(|e| matches!(e.kind, DebouncedEventKind::Any))
        .filter_map(|e| classify_path(root, &e.path))
        .filter(|c| filter.accepts(&c.path, c.kind))
        .collect()
}

fn classify_path(root: &Path, path: &Path) -> Option<RawChange> {
    let key = relative_key(root, path)?;
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Some(RawChange::new(RawEventKind::AddDir, key)),
        Ok(meta) if meta.is_file() => {
            let change = RawChange::new(RawEventKind::Add, key);
            match content_fingerprint(path) {
                Ok(hash) => Some(change.with_hash(hash)),
                Err(_) => Some(change),
            }
        }
        Ok(_) => None,
        Err(_) => {
            let kind = if ChangeFilter::media_type(&key).is_some() {
                RawEventKind::Unlink
            } else {
                RawEventKind::UnlinkDir
            };
            Some(RawChange::new(kind, key))
        }
    }
}
