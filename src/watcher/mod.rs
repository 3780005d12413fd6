//! File system watching and change intake.
//!
//! This module provides:
//! - The change filter deciding which paths and events are indexable
//! - Raw and consolidated change events, plus content fingerprints
//! - Per-path burst consolidation
//! - The pending change buffer drained by each flush
//! - The recursive watcher over the media root

mod consolidate;
mod events;
mod filter;
mod pending;
#[allow(clippy::module_inception)]
mod watcher;

pub use consolidate::{consolidate, consolidate_all, consolidate_indexed};
pub use events::{content_fingerprint, ChangeOp, ConsolidatedChange, RawChange, RawEventKind};
pub use filter::ChangeFilter;
pub use pending::PendingChangeBuffer;
pub use watcher::{MediaWatcher, WatcherConfig};
