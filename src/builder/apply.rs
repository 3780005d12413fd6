//! Transactional incremental apply of a consolidated change set.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::{stat_node, ApplySummary, IndexBuilder, TreeNode, TreeWalker};
use crate::paths::ancestors;
use crate::storage::{
    delete_covers_under, delete_items_under, delete_thumbs_under, ensure_thumb_rows, get_item,
    list_descendant_paths, refresh_cover, upsert_items, CoverChange, MediaType,
};
use crate::watcher::{ChangeOp, ConsolidatedChange};
use crate::Result;

/// Work derived from a change set before the transaction opens.
#[derive(Debug, Default)]
struct ApplyPlan {
    deletions: BTreeSet<String>,
    nodes: BTreeMap<String, TreeNode>,
    albums: BTreeSet<String>,
    confirmed_absent: usize,
}

impl IndexBuilder {
    /// Apply consolidated changes in one transaction.
    ///
    /// Deletions cascade to everything nested under the path. Additions
    /// and updates are checked against the file system first: a path that
    /// is gone is deleted instead, and a directory that is new to the index
    /// (or was replaced) is indexed together with its subtree. Indexed
    /// descendants of a replaced directory that are no longer on disk are
    /// deleted, and a path that turned from a file into a directory or back
    /// loses its old row first. Every album above a changed path gets its
    /// cover recomputed.
    ///
    /// Any failure rolls the whole change set back.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction cannot be committed after
    /// retries, or a probe task aborts.
    pub async fn apply(&self, changes: &[ConsolidatedChange]) -> Result<ApplySummary> {
        let plan = self.plan(changes)?;
        let nodes: Vec<TreeNode> = plan.nodes.values().cloned().collect();
        let records = self.records_with_dimensions(&nodes).await?;

        let (deleted, covers_updated, covers_removed) = self.retrier.run("apply", || {
            self.db.with_transaction(|conn| {
                let mut deleted = 0;
                for path in &plan.deletions {
                    deleted += delete_items_under(conn, path)?;
                    delete_thumbs_under(conn, path)?;
                    delete_covers_under(conn, path)?;
                }

                upsert_items(conn, &records)?;
                ensure_thumb_rows(conn, &records)?;

                let (mut updated, mut removed) = (0, 0);
                for album in &plan.albums {
                    match refresh_cover(conn, album)? {
                        CoverChange::Updated => updated += 1,
                        CoverChange::Removed => removed += 1,
                    }
                }
                Ok((deleted, updated, removed))
            })
        })?;

        let summary = ApplySummary {
            upserted: records.len(),
            deleted,
            confirmed_absent: plan.confirmed_absent,
            covers_updated,
            covers_removed,
        };
        tracing::info!(
            changes = changes.len(),
            upserted = summary.upserted,
            deleted = summary.deleted,
            confirmed_absent = summary.confirmed_absent,
            covers_updated,
            covers_removed,
            "Applied changes"
        );
        Ok(summary)
    }

    fn plan(&self, changes: &[ConsolidatedChange]) -> Result<ApplyPlan> {
        let mut plan = ApplyPlan::default();

        for change in changes {
            if change.path.is_empty() {
                continue;
            }
            for album in ancestors(&change.path) {
                plan.albums.insert(album.to_string());
            }

            if change.op == ChangeOp::Delete {
                plan.deletions.insert(change.path.clone());
                continue;
            }

            let Some(node) = stat_node(&self.root, &change.path, &self.filter) else {
                tracing::debug!(path = %change.path, "Changed path is gone, deleting");
                plan.confirmed_absent += 1;
                plan.deletions.insert(change.path.clone());
                continue;
            };

            let known = self.db.with_conn(|conn| get_item(conn, &change.path))?;
            let replaced = known
                .as_ref()
                .is_some_and(|item| item.media_type != node.media_type);
            if replaced {
                tracing::debug!(path = %change.path, "Path changed kind, replacing row");
                plan.deletions.insert(change.path.clone());
            }

            if node.media_type == MediaType::Album {
                plan.albums.insert(node.path.clone());
                if known.is_none() || replaced {
                    self.expand(&node.path, &mut plan, false)?;
                } else if change.op == ChangeOp::Update {
                    self.expand(&node.path, &mut plan, true)?;
                }
            }
            plan.nodes.insert(node.path.clone(), node);
        }

        // Albums above changed paths may be missing when their own event
        // was lost; index the ones that still exist.
        let missing: Vec<String> = plan
            .albums
            .iter()
            .filter(|a| !plan.nodes.contains_key(*a) && !plan.deletions.contains(*a))
            .cloned()
            .collect();
        for album in missing {
            if let Some(node) = stat_node(&self.root, &album, &self.filter) {
                if node.media_type == MediaType::Album {
                    plan.nodes.insert(album, node);
                }
            }
        }

        Ok(plan)
    }

    /// Walk the directory at `key` into the plan. With `prune`, indexed
    /// descendants the walk did not find are deleted.
    fn expand(&self, key: &str, plan: &mut ApplyPlan, prune: bool) -> Result<()> {
        let mut walked = BTreeSet::new();
        for node in TreeWalker::subtree(&self.root, key, Arc::clone(&self.filter)) {
            if node.media_type == MediaType::Album {
                plan.albums.insert(node.path.clone());
            }
            walked.insert(node.path.clone());
            plan.nodes.insert(node.path.clone(), node);
        }

        let mut stale = 0usize;
        if prune {
            for path in self.db.with_conn(|conn| list_descendant_paths(conn, key))? {
                if !walked.contains(&path) {
                    plan.deletions.insert(path);
                    stale += 1;
                }
            }
        }
        tracing::debug!(path = %key, nodes = walked.len(), stale, "Expanded directory");
        Ok(())
    }
}
