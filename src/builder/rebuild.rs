//! Checkpointed full rebuild.

use std::sync::Arc;

use super::{IndexBuilder, RebuildSummary, TreeNode, TreeWalker};
use crate::storage::{
    begin_rebuild, clear_items, complete_rebuild, ensure_thumb_rows, load_checkpoint,
    load_index_status, prune_orphan_thumbs, recompute_all_covers, save_checkpoint, upsert_items,
};
use crate::telemetry::metrics::REBUILD_PROCESSED;
use crate::Result;

impl IndexBuilder {
    /// Rebuild the index from the file tree.
    ///
    /// Resumes after the stored checkpoint when one exists; otherwise clears
    /// the item table and starts over. Each batch and its checkpoint commit
    /// in one transaction, so a crash loses at most the batch in flight.
    /// `progress` receives the running processed count after every batch.
    ///
    /// # Errors
    ///
    /// Returns an error if a batch cannot be committed after retries, or a
    /// probe task aborts.
    pub async fn rebuild<P>(&self, mut progress: P) -> Result<RebuildSummary>
    where
        P: FnMut(u64),
    {
        let (checkpoint, status) = self
            .db
            .with_conn(|conn| Ok((load_checkpoint(conn)?, load_index_status(conn)?)))?;

        let mut summary = RebuildSummary::default();
        let walker = match checkpoint {
            Some(cp) => {
                summary.processed_files = status.map_or(0, |s| s.processed_files);
                tracing::info!(
                    checkpoint = %cp,
                    processed = summary.processed_files,
                    "Resuming rebuild"
                );
                summary.resumed_from = Some(cp.clone());
                TreeWalker::resume(&self.root, Arc::clone(&self.filter), cp)
            }
            None => {
                self.retrier.run("rebuild.begin", || {
                    self.db.with_transaction(|conn| {
                        let cleared = clear_items(conn)?;
                        begin_rebuild(conn)?;
                        Ok(cleared)
                    })
                })?;
                tracing::info!(root = %self.root.display(), "Starting full rebuild");
                TreeWalker::new(&self.root, Arc::clone(&self.filter))
            }
        };

        let mut batch: Vec<TreeNode> = Vec::with_capacity(self.batch_size);
        for node in walker {
            batch.push(node);
            if batch.len() >= self.batch_size {
                self.commit_batch(&batch, &mut summary).await?;
                progress(summary.processed_files);
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.commit_batch(&batch, &mut summary).await?;
            progress(summary.processed_files);
        }

        let processed = summary.processed_files;
        let (covers, pruned) = self.retrier.run("rebuild.complete", || {
            self.db.with_transaction(|conn| {
                let pruned = prune_orphan_thumbs(conn)?;
                let covers = recompute_all_covers(conn)?;
                complete_rebuild(conn, processed)?;
                Ok((covers, pruned))
            })
        })?;
        summary.covers = covers;
        summary.pruned_thumbs = pruned;

        tracing::info!(
            processed = summary.processed_files,
            batches = summary.batches,
            covers,
            pruned_thumbs = pruned,
            "Rebuild complete"
        );
        Ok(summary)
    }

    async fn commit_batch(&self, batch: &[TreeNode], summary: &mut RebuildSummary) -> Result<()> {
        let Some(last) = batch.last() else {
            return Ok(());
        };

        let records = self.records_with_dimensions(batch).await?;
        let processed = summary.processed_files + batch.len() as u64;

        self.retrier.run("rebuild.batch", || {
            self.db.with_transaction(|conn| {
                upsert_items(conn, &records)?;
                ensure_thumb_rows(conn, &records)?;
                save_checkpoint(conn, &last.path, processed)
            })
        })?;

        summary.processed_files = processed;
        summary.batches += 1;
        REBUILD_PROCESSED.set(i64::try_from(processed).unwrap_or(i64::MAX));
        tracing::debug!(
            batch = summary.batches,
            size = batch.len(),
            last = %last.path,
            processed,
            "Committed rebuild batch"
        );
        Ok(())
    }
}
