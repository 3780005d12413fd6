//! Index builder.
//!
//! Owns the two jobs that write the index: a checkpointed full rebuild and
//! a transactional incremental apply. Each job runs inside a disposable
//! worker thread (see [`worker`]) with its own database connection.

mod apply;
mod probe;
mod rebuild;
mod walker;
pub mod worker;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::retry::Retrier;
use crate::storage::{known_dimensions, Database, ItemRecord};
use crate::watcher::ChangeFilter;
use crate::Result;

pub(crate) use probe::probe_one;
pub use probe::{probe_dimensions, DimensionProbe, ImageProbe, Probed, PLACEHOLDER_DIMENSIONS};
pub use walker::{mtime_millis, stat_node, TreeNode, TreeWalker};
pub use worker::{
    ApplyRequest, BuilderContext, JobOutcome, RebuildRequest, WorkerHandle, WorkerMessage,
    WorkerRequest,
};

/// Result of a full rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildSummary {
    /// Nodes committed across this and any resumed earlier runs.
    pub processed_files: u64,
    /// Batches committed by this run.
    pub batches: u64,
    /// Checkpoint the run resumed from.
    pub resumed_from: Option<String>,
    /// Covers written by the final recomputation.
    pub covers: usize,
    /// Thumbnail rows pruned because their item vanished.
    pub pruned_thumbs: usize,
}

/// Result of an incremental apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    /// Item rows inserted or refreshed.
    pub upserted: usize,
    /// Item rows removed, cascades included.
    pub deleted: usize,
    /// Additions or updates whose path was gone at apply time.
    pub confirmed_absent: usize,
    /// Album covers written.
    pub covers_updated: usize,
    /// Album covers removed.
    pub covers_removed: usize,
}

/// Runs rebuild and apply jobs against one database connection.
pub struct IndexBuilder {
    db: Database,
    root: PathBuf,
    filter: Arc<ChangeFilter>,
    probe: Arc<dyn DimensionProbe>,
    retrier: Retrier,
    batch_size: usize,
    probe_concurrency: usize,
}

impl IndexBuilder {
    /// Create a builder.
    pub fn new(
        db: Database,
        root: impl Into<PathBuf>,
        filter: Arc<ChangeFilter>,
        probe: Arc<dyn DimensionProbe>,
        retrier: Retrier,
    ) -> Self {
        Self {
            db,
            root: root.into(),
            filter,
            probe,
            retrier,
            batch_size: 1000,
            probe_concurrency: 4,
        }
    }

    /// Set the rows committed per rebuild transaction.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the number of simultaneous dimension probes.
    #[must_use]
    pub fn with_probe_concurrency(mut self, concurrency: usize) -> Self {
        self.probe_concurrency = concurrency.max(1);
        self
    }

    /// Media root being indexed.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Turn nodes into item records, probing media whose stored dimensions
    /// are missing or whose mtime changed.
    async fn records_with_dimensions(&self, nodes: &[TreeNode]) -> Result<Vec<ItemRecord>> {
        let media: Vec<&TreeNode> = nodes.iter().filter(|n| n.media_type.is_media()).collect();
        let known = self
            .db
            .with_conn(|conn| known_dimensions(conn, media.iter().map(|n| n.path.as_str())))?;

        let targets: Vec<_> = media
            .iter()
            .filter(|n| {
                known.get(&n.path).map_or(true, |k| {
                    k.mtime != n.mtime || k.width.is_none() || k.height.is_none()
                })
            })
            .map(|n| (n.path.clone(), n.media_type))
            .collect();
        let to_probe: HashSet<String> = targets.iter().map(|(k, _)| k.clone()).collect();

        let probed: HashMap<String, Probed> = probe_dimensions(
            Arc::clone(&self.probe),
            &self.root,
            targets,
            self.probe_concurrency,
        )
        .await?;

        Ok(nodes
            .iter()
            .map(|node| {
                let record = node.to_record();
                if !to_probe.contains(&node.path) {
                    return record;
                }
                match probed.get(&node.path).and_then(|p| p.dimensions()) {
                    Some((w, h)) => record.with_dimensions(w, h),
                    None => record,
                }
            })
            .collect())
    }
}

impl std::fmt::Debug for IndexBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexBuilder")
            .field("root", &self.root)
            .field("batch_size", &self.batch_size)
            .field("probe_concurrency", &self.probe_concurrency)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::retry::{BulkIndexSignal, RetryPolicy};
    use crate::storage::{init_storage, MediaType};
    use std::fs::File;
    use std::time::{Duration, UNIX_EPOCH};

    pub struct FixedProbe;

    impl DimensionProbe for FixedProbe {
        fn probe(&self, _path: &Path, _media_type: MediaType) -> Result<(u32, u32)> {
            Ok((800, 600))
        }
    }

    pub fn write_media(root: &Path, key: &str, mtime: u64) {
        let path = root.join(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, key.as_bytes()).unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(UNIX_EPOCH + Duration::from_millis(mtime))
            .unwrap();
    }

    pub fn builder(root: &Path) -> IndexBuilder {
        let db = Database::open_in_memory().unwrap();
        init_storage(&db).unwrap();
        builder_with(db, root, Arc::new(FixedProbe))
    }

    pub fn builder_with(db: Database, root: &Path, probe: Arc<dyn DimensionProbe>) -> IndexBuilder {
        let filter = Arc::new(ChangeFilter::new(root, &[]).unwrap());
        let retrier = Retrier::new(RetryPolicy::default(), BulkIndexSignal::new());
        IndexBuilder::new(db, root, filter, probe, retrier)
    }
}
