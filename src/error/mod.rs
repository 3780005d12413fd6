//! Error types and Result aliases for mediadex.
//!
//! This module defines the error hierarchy used throughout the crate.
//! All public functions return `Result<T, Error>` or `Result<T>`.
//!
//! Storage errors keep the driver's error code as a distinct variant so the
//! retry wrapper can tell lock contention apart from schema or constraint
//! failures without inspecting messages.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Result type alias using mediadex's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mediadex operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database/storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// File watching error.
    #[error("watcher error: {0}")]
    Watcher(#[from] WatcherError),

    /// Index builder error.
    #[error("builder error: {0}")]
    Builder(#[from] BuilderError),

    /// Tag cache error.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Storage-specific errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Lock wait gave up (`SQLITE_BUSY`).
    #[error("database busy: {0}")]
    Busy(String),

    /// Conflicting lock held by another statement (`SQLITE_LOCKED`).
    #[error("database locked: {0}")]
    Locked(String),

    /// Query was interrupted or timed out.
    #[error("query timed out: {0}")]
    Timeout(String),

    /// Connection could not be opened or no connection was available.
    #[error("connection unavailable: {0}")]
    Connection(String),

    /// Constraint violation.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Any other `SQLite` database error.
    #[error("database error: {0}")]
    Database(String),

    /// Record not found.
    #[error("not found: {entity} with id '{id}'")]
    NotFound { entity: &'static str, id: String },

    /// Schema migration error.
    #[error("migration error: {0}")]
    Migration(String),
}

/// File watcher errors.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Failed to watch path.
    #[error("failed to watch path '{path}': {reason}")]
    WatchFailed { path: String, reason: String },

    /// Invalid ignore pattern.
    #[error("invalid ignore pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },
}

/// Index builder errors.
#[derive(Error, Debug)]
pub enum BuilderError {
    /// Another critical job already holds the builder.
    #[error("index builder busy: {0} in progress")]
    Busy(String),

    /// The job reported a failure.
    #[error("index job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    /// The worker exited without reporting a result.
    #[error("index worker {job_id} crashed: {reason}")]
    Crashed { job_id: String, reason: String },

    /// A dimension probe task was aborted.
    #[error("probe task for '{path}' aborted: {reason}")]
    Probe { path: String, reason: String },
}

/// Tag cache errors.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The backing store rejected an operation.
    #[error("cache store error: {0}")]
    Store(String),

    /// A scan exceeded its iteration bound.
    #[error("cache scan for '{pattern}' stopped after {iterations} pages")]
    ScanLimit { pattern: String, iterations: usize },

    /// A scan pattern does not parse.
    #[error("invalid cache scan pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl StorageError {
    /// Create a not-found error.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        let message = err.to_string();
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) => Self::Busy(message),
            Some(ErrorCode::DatabaseLocked) => Self::Locked(message),
            Some(ErrorCode::OperationInterrupted) => Self::Timeout(message),
            Some(ErrorCode::CannotOpen) => Self::Connection(message),
            Some(ErrorCode::ConstraintViolation) => Self::Constraint(message),
            _ => Self::Database(message),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.into())
    }
}

#[cfg(test)]
mod tests;
