//! Lazy, resumable depth-first walk over the media tree.

use std::cmp::Ordering;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use ignore::{Walk, WalkBuilder};

use crate::paths::{is_same_or_descendant, relative_key, walk_order};
use crate::storage::{ItemRecord, MediaType};
use crate::watcher::ChangeFilter;

/// One indexable node found by the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    /// Relative item key.
    pub path: String,
    /// Album for directories, photo or video for files.
    pub media_type: MediaType,
    /// Modification time in epoch milliseconds.
    pub mtime: i64,
}

impl TreeNode {
    /// Item row for this node, without dimensions.
    #[must_use]
    pub fn to_record(&self) -> ItemRecord {
        ItemRecord::new(self.path.clone(), self.media_type, self.mtime)
    }
}

/// Modification time of `meta` in epoch milliseconds.
#[must_use]
pub fn mtime_millis(meta: &Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Stat one key under `root` and turn it into a node.
///
/// Returns `None` when the path is missing, is neither a directory nor a
/// recognized media file, or is ignored.
#[must_use]
pub fn stat_node(root: &Path, key: &str, filter: &ChangeFilter) -> Option<TreeNode> {
    let meta = std::fs::symlink_metadata(root.join(key)).ok()?;
    let media_type = if meta.is_dir() {
        MediaType::Album
    } else if meta.is_file() {
        ChangeFilter::media_type(key)?
    } else {
        return None;
    };
    if filter.is_ignored(key, meta.is_dir()) {
        return None;
    }
    Some(TreeNode {
        path: key.to_string(),
        media_type,
        mtime: mtime_millis(&meta),
    })
}

/// Iterator over [`TreeNode`]s in walk order.
///
/// Siblings are visited in byte order of their names, so the sequence of
/// keys is ascending under [`walk_order`]. Ignored directories are pruned
/// without being read.
pub struct TreeWalker {
    inner: Walk,
    root: PathBuf,
    resume_after: Option<String>,
}

impl TreeWalker {
    /// Walk the whole tree below `root`. The root itself is not yielded.
    #[must_use]
    pub fn new(root: &Path, filter: Arc<ChangeFilter>) -> Self {
        Self::build(root, root, filter, None)
    }

    /// Walk `key` and everything below it.
    #[must_use]
    pub fn subtree(root: &Path, key: &str, filter: Arc<ChangeFilter>) -> Self {
        Self::build(root, &root.join(key), filter, None)
    }

    /// Walk the whole tree, skipping every node up to and including
    /// `checkpoint`. Directories entirely before it are not descended.
    #[must_use]
    pub fn resume(root: &Path, filter: Arc<ChangeFilter>, checkpoint: String) -> Self {
        Self::build(root, root, filter, Some(checkpoint))
    }

    fn build(
        root: &Path,
        start: &Path,
        filter: Arc<ChangeFilter>,
        resume_after: Option<String>,
    ) -> Self {
        let prune_root = root.to_path_buf();
        let prune_checkpoint = resume_after.clone();

        let inner = WalkBuilder::new(start)
            .standard_filters(false)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                let Some(key) = relative_key(&prune_root, entry.path()) else {
                    return true;
                };
                let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
                if filter.is_ignored(&key, is_dir) {
                    return false;
                }
                match &prune_checkpoint {
                    Some(cp) if is_dir => {
                        walk_order(&key, cp) == Ordering::Greater
                            || is_same_or_descendant(cp, &key)
                    }
                    _ => true,
                }
            })
            .build();

        Self {
            inner,
            root: root.to_path_buf(),
            resume_after,
        }
    }

    fn node_for(&self, entry: &ignore::DirEntry) -> Option<TreeNode> {
        let key = relative_key(&self.root, entry.path())?;
        let file_type = entry.file_type()?;

        let media_type = if file_type.is_dir() {
            MediaType::Album
        } else if file_type.is_file() {
            ChangeFilter::media_type(&key)?
        } else {
            return None;
        };

        if let Some(cp) = &self.resume_after {
            if walk_order(&key, cp) != Ordering::Greater {
                return None;
            }
        }

        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(path = %key, error = %e, "Cannot stat entry, skipping");
                return None;
            }
        };

        Some(TreeNode {
            path: key,
            media_type,
            mtime: mtime_millis(&meta),
        })
    }
}

impl Iterator for TreeWalker {
    type Item = TreeNode;

    fn next(&mut self) -> Option<TreeNode> {
        loop {
            match self.inner.next()? {
                Ok(entry) => {
                    if let Some(node) = self.node_for(&entry) {
                        return Some(node);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Error walking media tree");
                }
            }
        }
    }
}

impl std::fmt::Debug for TreeWalker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeWalker")
            .field("root", &self.root)
            .field("resume_after", &self.resume_after)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("A/B")).unwrap();
        fs::create_dir_all(root.join("A b")).unwrap();
        fs::create_dir_all(root.join("@eaDir/x")).unwrap();
        fs::write(root.join("A/1.jpg"), b"1").unwrap();
        fs::write(root.join("A/B/2.mp4"), b"2").unwrap();
        fs::write(root.join("A/notes.txt"), b"n").unwrap();
        fs::write(root.join("A b/3.png"), b"3").unwrap();
        fs::write(root.join("@eaDir/x/4.jpg"), b"4").unwrap();
        fs::write(root.join("mediadex.db"), b"db").unwrap();
        tmp
    }

    fn filter(root: &Path) -> Arc<ChangeFilter> {
        Arc::new(ChangeFilter::new(root, &[]).unwrap())
    }

    fn keys(walker: TreeWalker) -> Vec<String> {
        walker.map(|n| n.path).collect()
    }

    #[test]
    fn test_full_walk_order_and_filtering() {
        let tmp = tree();
        let walked = keys(TreeWalker::new(tmp.path(), filter(tmp.path())));
        assert_eq!(walked, vec!["A", "A/1.jpg", "A/B", "A/B/2.mp4", "A b", "A b/3.png"]);

        let mut sorted = walked.clone();
        sorted.sort_by(|a, b| walk_order(a, b));
        assert_eq!(walked, sorted);
    }

    #[test]
    fn test_node_types() {
        let tmp = tree();
        let nodes: Vec<_> = TreeWalker::new(tmp.path(), filter(tmp.path())).collect();
        assert_eq!(nodes[0].media_type, MediaType::Album);
        assert_eq!(nodes[1].media_type, MediaType::Photo);
        assert_eq!(nodes[3].media_type, MediaType::Video);
        assert!(nodes.iter().all(|n| n.mtime > 0));
    }

    #[test]
    fn test_resume_skips_through_checkpoint() {
        let tmp = tree();
        let f = filter(tmp.path());
        let resumed = keys(TreeWalker::resume(tmp.path(), f, "A/1.jpg".to_string()));
        assert_eq!(resumed, vec!["A/B", "A/B/2.mp4", "A b", "A b/3.png"]);
    }

    #[test]
    fn test_resume_after_deleted_checkpoint() {
        let tmp = tree();
        let f = filter(tmp.path());
        // "A/A.jpg" never existed; it sorts after "A/1.jpg" and before "A/B".
        let resumed = keys(TreeWalker::resume(tmp.path(), f, "A/A.jpg".to_string()));
        assert_eq!(resumed, vec!["A/B", "A/B/2.mp4", "A b", "A b/3.png"]);
    }

    #[test]
    fn test_subtree_includes_start() {
        let tmp = tree();
        let sub = keys(TreeWalker::subtree(tmp.path(), "A/B", filter(tmp.path())));
        assert_eq!(sub, vec!["A/B", "A/B/2.mp4"]);
    }

    #[test]
    fn test_stat_node() {
        let tmp = tree();
        let f = filter(tmp.path());
        assert_eq!(
            stat_node(tmp.path(), "A", &f).unwrap().media_type,
            MediaType::Album
        );
        assert_eq!(
            stat_node(tmp.path(), "A/1.jpg", &f).unwrap().media_type,
            MediaType::Photo
        );
        assert!(stat_node(tmp.path(), "A/notes.txt", &f).is_none());
        assert!(stat_node(tmp.path(), "A/missing.jpg", &f).is_none());
        assert!(stat_node(tmp.path(), "@eaDir/x/4.jpg", &f).is_none());
    }
}
