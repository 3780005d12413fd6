//! In-memory accumulation of filtered events between flushes.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::events::RawChange;

#[derive(Debug, Default)]
struct Inner {
    by_path: HashMap<String, Vec<RawChange>>,
    events: usize,
}

/// Path-keyed event lists awaiting the next flush.
///
/// `flatten_and_clear` swaps in a fresh map under the lock, so enqueues
/// racing a flush land in the next window.
#[derive(Debug, Default)]
pub struct PendingChangeBuffer {
    inner: Mutex<Inner>,
}

impl PendingChangeBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one event to its path's list.
    pub fn enqueue(&self, change: RawChange) {
        let mut inner = self.inner.lock();
        inner
            .by_path
            .entry(change.path.clone())
            .or_default()
            .push(change);
        inner.events += 1;
    }

    /// Append a batch of events.
    pub fn enqueue_all(&self, changes: impl IntoIterator<Item = RawChange>) {
        let mut inner = self.inner.lock();
        for change in changes {
            inner
                .by_path
                .entry(change.path.clone())
                .or_default()
                .push(change);
            inner.events += 1;
        }
    }

    /// Put back events taken by a flush that could not be applied.
    ///
    /// Restored events go ahead of anything enqueued since, keeping each
    /// path's order intact.
    pub fn requeue(&self, changes: Vec<RawChange>) {
        let mut restored: HashMap<String, Vec<RawChange>> = HashMap::new();
        let count = changes.len();
        for change in changes {
            restored.entry(change.path.clone()).or_default().push(change);
        }

        let mut inner = self.inner.lock();
        for (path, mut older) in restored {
            let slot = inner.by_path.entry(path).or_default();
            older.append(slot);
            *slot = older;
        }
        inner.events += count;
    }

    /// Drain every list and return the events flattened, per-path order
    /// preserved.
    pub fn flatten_and_clear(&self) -> Vec<RawChange> {
        let taken = {
            let mut inner = self.inner.lock();
            inner.events = 0;
            std::mem::take(&mut inner.by_path)
        };
        taken.into_values().flatten().collect()
    }

    /// Number of distinct pending paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().by_path.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().by_path.is_empty()
    }

    /// Number of raw events pending.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.inner.lock().events
    }
}
