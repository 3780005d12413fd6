//! In-process [`TagCache`] implementation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use globset::Glob;
use parking_lot::RwLock;

use super::{ScanPage, TagCache};
use crate::error::CacheError;
use crate::Result;

#[derive(Debug, Default)]
struct Entries {
    next_seq: u64,
    by_seq: BTreeMap<u64, (String, BTreeSet<String>)>,
    seq_of: HashMap<String, u64>,
}

impl Entries {
    fn remove(&mut self, key: &str) -> bool {
        match self.seq_of.remove(key) {
            Some(seq) => self.by_seq.remove(&seq).is_some(),
            None => false,
        }
    }
}

/// Tagged key set held in memory.
///
/// Scan cursors are insertion sequence numbers, so deleting keys between
/// pages never skips a live key.
#[derive(Debug, Default)]
pub struct MemoryTagCache {
    entries: RwLock<Entries>,
}

impl MemoryTagCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `key` with its tags.
    pub fn insert<I, T>(&self, key: impl Into<String>, tags: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let key = key.into();
        let tags = tags.into_iter().map(Into::into).collect();

        let mut entries = self.entries.write();
        entries.remove(&key);
        entries.next_seq += 1;
        let seq = entries.next_seq;
        entries.seq_of.insert(key.clone(), seq);
        entries.by_seq.insert(seq, (key, tags));
    }

    /// Whether `key` is cached.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().seq_of.contains_key(key)
    }

    /// Number of cached keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().seq_of.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TagCache for MemoryTagCache {
    fn invalidate(&self, tags: &[String]) -> Result<usize> {
        let mut entries = self.entries.write();
        let doomed: Vec<String> = entries
            .by_seq
            .values()
            .filter(|(_, entry_tags)| tags.iter().any(|t| entry_tags.contains(t)))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            entries.remove(key);
        }
        Ok(doomed.len())
    }

    fn scan(&self, pattern: &str, cursor: u64, count: usize) -> Result<ScanPage> {
        let matcher = Glob::new(pattern)
            .map_err(|e| CacheError::Pattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?
            .compile_matcher();

        let entries = self.entries.read();
        let mut examined = entries.by_seq.range(cursor.max(1)..);

        let mut keys = Vec::new();
        let mut last = None;
        for (seq, (key, _)) in examined.by_ref().take(count.max(1)) {
            if matcher.is_match(key) {
                keys.push(key.clone());
            }
            last = Some(*seq);
        }

        let cursor = match (last, examined.next()) {
            (Some(_), Some((next, _))) => *next,
            _ => 0,
        };
        Ok(ScanPage { cursor, keys })
    }

    fn delete(&self, keys: &[String]) -> Result<usize> {
        let mut entries = self.entries.write();
        Ok(keys.iter().filter(|k| entries.remove(k)).count())
    }
}
