//! Route cache invalidation driven by index changes.
//!
//! Changed paths map to hierarchical `album:<path>` tags (the root tag is
//! `album:/`). Small tag sets are invalidated exactly; above a ceiling that
//! shrinks as the change volume grows, route keys are purged wholesale with
//! a bounded cursor scan.

mod memory;

use std::collections::BTreeSet;

use crate::error::CacheError;
use crate::paths::ancestors;
use crate::telemetry::metrics::CACHE_INVALIDATIONS;
use crate::watcher::ConsolidatedChange;
use crate::Result;

pub use memory::MemoryTagCache;

/// Tag of the root album.
pub const ROOT_TAG: &str = "album:/";

/// One page of a cursor scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor for the next page; `0` once the scan is complete.
    pub cursor: u64,
    /// Keys matched on this page.
    pub keys: Vec<String>,
}

/// Tag-aware cache store consumed by the invalidator.
pub trait TagCache: Send + Sync {
    /// Drop every entry carrying any of `tags`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the operation.
    fn invalidate(&self, tags: &[String]) -> Result<usize>;

    /// Return up to `count` keys matching the glob `pattern`, starting at
    /// `cursor` (`0` starts a new scan).
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the operation.
    fn scan(&self, pattern: &str, cursor: u64, count: usize) -> Result<ScanPage>;

    /// Delete entries by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the operation.
    fn delete(&self, keys: &[String]) -> Result<usize>;
}

/// Thresholds for choosing targeted invalidation over a purge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationPolicy {
    /// `(max changes, tag ceiling)` tiers, ascending by change count.
    pub tiers: Vec<(usize, usize)>,
    /// Tag ceiling once the change count passes every tier.
    pub min_ceiling: usize,
    /// Glob matching route-level cache keys.
    pub purge_pattern: String,
    /// Keys requested per scan page.
    pub scan_page: usize,
    /// Upper bound on scan pages per purge.
    pub max_scan_iterations: usize,
}

impl Default for InvalidationPolicy {
    fn default() -> Self {
        Self {
            tiers: vec![(100, 1000), (1000, 500)],
            min_ceiling: 200,
            purge_pattern: "route:*".to_string(),
            scan_page: 500,
            max_scan_iterations: 1000,
        }
    }
}

impl InvalidationPolicy {
    /// Largest tag set invalidated exactly for `changes` consolidated changes.
    #[must_use]
    pub fn ceiling(&self, changes: usize) -> usize {
        self.tiers
            .iter()
            .find(|(max_changes, _)| changes <= *max_changes)
            .map_or(self.min_ceiling, |(_, ceiling)| *ceiling)
    }
}

/// Tag for one album key.
#[must_use]
pub fn album_tag(album: &str) -> String {
    if album.is_empty() {
        ROOT_TAG.to_string()
    } else {
        format!("album:{album}")
    }
}

/// Tags touched by a change set: every ancestor album of every changed
/// path, directories themselves, and the root.
#[must_use]
pub fn album_tags(changes: &[ConsolidatedChange]) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();
    tags.insert(ROOT_TAG.to_string());
    for change in changes {
        if change.is_dir {
            tags.insert(album_tag(&change.path));
        }
        for album in ancestors(&change.path) {
            if !tags.insert(album_tag(album)) {
                // Everything above was inserted by an earlier sibling.
                break;
            }
        }
    }
    tags
}

/// What an invalidation pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationOutcome {
    /// Nothing changed.
    Skipped,
    /// Exact tags invalidated.
    Targeted {
        /// Tags sent to the store.
        tags: usize,
        /// Entries the store reported dropped.
        removed: usize,
    },
    /// Route keys purged by pattern.
    Purged {
        /// Keys deleted.
        removed: usize,
    },
}

/// Applies an [`InvalidationPolicy`] against a [`TagCache`].
pub struct CacheInvalidator {
    store: std::sync::Arc<dyn TagCache>,
    policy: InvalidationPolicy,
}

impl CacheInvalidator {
    /// Create an invalidator.
    pub fn new(store: std::sync::Arc<dyn TagCache>, policy: InvalidationPolicy) -> Self {
        Self { store, policy }
    }

    /// Invalidate whatever `changes` made stale.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or a purge exceeds its scan bound.
    pub fn invalidate(&self, changes: &[ConsolidatedChange]) -> Result<InvalidationOutcome> {
        if changes.is_empty() {
            return Ok(InvalidationOutcome::Skipped);
        }

        let tags = album_tags(changes);
        let ceiling = self.policy.ceiling(changes.len());
        if tags.len() > ceiling {
            tracing::debug!(
                tags = tags.len(),
                ceiling,
                changes = changes.len(),
                "Tag set over ceiling, purging routes"
            );
            return self.purge_all();
        }

        let tags: Vec<String> = tags.into_iter().collect();
        let removed = self.store.invalidate(&tags)?;
        CACHE_INVALIDATIONS.with_label_values(&["targeted"]).inc();
        tracing::debug!(tags = tags.len(), removed, "Invalidated album tags");

        Ok(InvalidationOutcome::Targeted {
            tags: tags.len(),
            removed,
        })
    }

    /// Delete every route-level entry, one scan page at a time.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the scan does not finish
    /// within `max_scan_iterations` pages.
    pub fn purge_all(&self) -> Result<InvalidationOutcome> {
        let pattern = &self.policy.purge_pattern;
        let mut cursor = 0;
        let mut removed = 0;

        for _ in 0..self.policy.max_scan_iterations {
            let page = self.store.scan(pattern, cursor, self.policy.scan_page)?;
            if !page.keys.is_empty() {
                removed += self.store.delete(&page.keys)?;
            }
            cursor = page.cursor;
            if cursor == 0 {
                CACHE_INVALIDATIONS.with_label_values(&["purge"]).inc();
                tracing::info!(removed, "Purged route cache");
                return Ok(InvalidationOutcome::Purged { removed });
            }
        }

        Err(CacheError::ScanLimit {
            pattern: pattern.clone(),
            iterations: self.policy.max_scan_iterations,
        }
        .into())
    }
}

impl std::fmt::Debug for CacheInvalidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheInvalidator")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
