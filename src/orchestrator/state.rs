//! Mutual exclusion for critical index jobs.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::storage::now_millis;

/// Kind of critical job holding the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Full rebuild.
    Rebuild,
    /// Incremental apply.
    Apply,
    /// Post-apply backfill.
    Maintenance,
}

impl JobKind {
    /// Metric and log label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rebuild => "rebuild",
            Self::Apply => "apply",
            Self::Maintenance => "maintenance",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the orchestrator is doing right now.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum JobState {
    /// No critical job.
    #[default]
    Idle,
    /// A job holds the slot.
    Running {
        /// Job kind.
        kind: JobKind,
        /// Job identifier.
        job_id: String,
        /// Start time in epoch milliseconds.
        started_at: i64,
    },
}

impl JobState {
    /// Kind of the running job, if any.
    #[must_use]
    pub const fn kind(&self) -> Option<JobKind> {
        match self {
            Self::Idle => None,
            Self::Running { kind, .. } => Some(*kind),
        }
    }
}

/// Single slot that at most one critical job can hold.
#[derive(Debug, Clone, Default)]
pub struct JobSlot {
    state: Arc<Mutex<JobState>>,
}

impl JobSlot {
    /// Create an idle slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the slot for a new job, or `None` if another job holds it.
    #[must_use]
    pub fn try_acquire(&self, kind: JobKind) -> Option<JobPermit> {
        let mut state = self.state.lock();
        if *state != JobState::Idle {
            return None;
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        *state = JobState::Running {
            kind,
            job_id: job_id.clone(),
            started_at: now_millis(),
        };
        Some(JobPermit {
            slot: self.clone(),
            job_id,
        })
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> JobState {
        self.state.lock().clone()
    }

    /// Kind of the running job, if any.
    #[must_use]
    pub fn running(&self) -> Option<JobKind> {
        self.state.lock().kind()
    }
}

/// Proof of holding the [`JobSlot`]; releases it on drop.
#[derive(Debug)]
pub struct JobPermit {
    slot: JobSlot,
    job_id: String,
}

impl JobPermit {
    /// Identifier of the job holding the slot.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Relabel the held slot, e.g. when a flush escalates to a rebuild.
    pub fn switch(&self, kind: JobKind) {
        if let JobState::Running { kind: current, .. } = &mut *self.slot.state.lock() {
            *current = kind;
        }
    }
}

impl Drop for JobPermit {
    fn drop(&mut self) {
        *self.slot.state.lock() = JobState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_holder() {
        let slot = JobSlot::new();
        let permit = slot.try_acquire(JobKind::Rebuild).unwrap();
        assert_eq!(slot.running(), Some(JobKind::Rebuild));
        assert!(slot.try_acquire(JobKind::Apply).is_none());

        drop(permit);
        assert_eq!(slot.state(), JobState::Idle);
        assert!(slot.try_acquire(JobKind::Apply).is_some());
    }

    #[test]
    fn test_switch_keeps_job_id() {
        let slot = JobSlot::new();
        let permit = slot.try_acquire(JobKind::Apply).unwrap();
        permit.switch(JobKind::Rebuild);

        match slot.state() {
            JobState::Running { kind, job_id, .. } => {
                assert_eq!(kind, JobKind::Rebuild);
                assert_eq!(job_id, permit.job_id());
            }
            JobState::Idle => panic!("slot should be held"),
        }
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&JobState::Idle).unwrap();
        assert_eq!(json, r#"{"state":"idle"}"#);
    }
}
