//! mediadex library
//!
//! Incremental media indexing for photo and video libraries. A file tree
//! is mirrored into `SQLite` as albums, photos and videos, together with a
//! per-album cover and a thumbnail status row per media file. A watcher
//! feeds changes into a debounced buffer; the orchestrator consolidates
//! them and applies them transactionally, falling back to a checkpointed
//! full rebuild when a change set is too large or the index is incomplete.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod builder;
pub mod cache;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod paths;
pub mod retry;
pub mod storage;
pub mod telemetry;
pub mod watcher;

pub use config::{Config, IndexerConfig};
pub use error::{Error, Result};
pub use orchestrator::{FlushOutcome, IndexReport, Orchestrator};
