//! Rebuild checkpoint storage.
//!
//! Two keys live in `index_checkpoint`:
//! - `last_processed_path`: the last node committed by a running rebuild
//! - `index_status`: JSON [`IndexStatus`] record

use rusqlite::{params, Connection, OptionalExtension};

use super::models::{now_millis, IndexStatus, RebuildState};
use crate::error::StorageError;
use crate::{Error, Result};

const LAST_PROCESSED_PATH: &str = "last_processed_path";
const INDEX_STATUS: &str = "index_status";

fn get_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM index_checkpoint WHERE key = ?",
            [key],
            |row| row.get(0),
        )
        .optional()?)
}

fn set_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO index_checkpoint (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )?
    .execute(params![key, value, now_millis()])?;
    Ok(())
}

/// Load the resume marker of an unfinished rebuild.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn load_checkpoint(conn: &Connection) -> Result<Option<String>> {
    get_value(conn, LAST_PROCESSED_PATH)
}

/// Load the rebuild status record.
///
/// # Errors
///
/// Returns an error if the query fails or the stored record is malformed.
pub fn load_index_status(conn: &Connection) -> Result<Option<IndexStatus>> {
    get_value(conn, INDEX_STATUS)?
        .map(|json| {
            serde_json::from_str(&json).map_err(|e| {
                Error::from(StorageError::Database(format!(
                    "malformed index status '{json}': {e}"
                )))
            })
        })
        .transpose()
}

/// Mark the start of a fresh rebuild: no resume marker, zero processed.
///
/// # Errors
///
/// Returns an error if the writes fail.
pub fn begin_rebuild(conn: &Connection) -> Result<()> {
    conn.execute(
        "DELETE FROM index_checkpoint WHERE key = ?",
        [LAST_PROCESSED_PATH],
    )?;
    store_status(conn, IndexStatus::building(0))
}

/// Record the last committed node and the running count.
///
/// # Errors
///
/// Returns an error if the writes fail.
pub fn save_checkpoint(conn: &Connection, last_path: &str, processed_files: u64) -> Result<()> {
    set_value(conn, LAST_PROCESSED_PATH, last_path)?;
    store_status(conn, IndexStatus::building(processed_files))
}

/// Clear the resume marker and record a completed rebuild.
///
/// # Errors
///
/// Returns an error if the writes fail.
pub fn complete_rebuild(conn: &Connection, processed_files: u64) -> Result<()> {
    conn.execute(
        "DELETE FROM index_checkpoint WHERE key = ?",
        [LAST_PROCESSED_PATH],
    )?;
    store_status(
        conn,
        IndexStatus {
            state: RebuildState::Complete,
            processed_files,
        },
    )
}

fn store_status(conn: &Connection, status: IndexStatus) -> Result<()> {
    let json = serde_json::to_string(&status)
        .map_err(|e| StorageError::Database(format!("failed to serialize status: {e}")))?;
    set_value(conn, INDEX_STATUS, &json)
}
