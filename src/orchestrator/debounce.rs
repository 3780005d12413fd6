//! Adaptive flush debounce.

use std::time::Duration;

/// Debounce interval that grows with the pending event count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebouncePolicy {
    /// Interval while few changes are pending.
    pub base: Duration,
    /// `(pending threshold, interval)` tiers, ascending by threshold.
    pub tiers: Vec<(usize, Duration)>,
}

impl Default for DebouncePolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            tiers: vec![
                (500, Duration::from_secs(10)),
                (2000, Duration::from_secs(20)),
                (5000, Duration::from_secs(30)),
            ],
        }
    }
}

impl DebouncePolicy {
    /// Interval to wait before flushing `pending` events.
    #[must_use]
    pub fn interval_for(&self, pending: usize) -> Duration {
        self.tiers
            .iter()
            .rev()
            .find(|(threshold, _)| pending >= *threshold)
            .map_or(self.base, |(_, interval)| *interval)
    }
}
