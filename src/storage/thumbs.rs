//! Thumbnail readiness rows.
//!
//! Rows are created and removed in lockstep with media items. The `status`
//! column belongs to the thumbnail generator and is never written here.

use rusqlite::{params, Connection, OptionalExtension};

use super::models::{ItemRecord, ThumbState, ThumbStatus};
use crate::paths::descendant_range;
use crate::Result;

/// Ensure a `pending` row exists for every media item, refreshing `mtime`
/// on rows whose media changed.
///
/// # Errors
///
/// Returns an error if any insert fails.
pub fn ensure_thumb_rows(conn: &Connection, items: &[ItemRecord]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO thumb_status (path, mtime, status) VALUES (?1, ?2, 'pending')
         ON CONFLICT(path) DO UPDATE SET mtime = excluded.mtime
         WHERE thumb_status.mtime != excluded.mtime",
    )?;

    let mut touched = 0;
    for item in items.iter().filter(|i| i.media_type.is_media()) {
        touched += stmt.execute(params![item.path, item.mtime])?;
    }
    Ok(touched)
}

/// Delete the row at `path` and every row nested below it.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub fn delete_thumbs_under(conn: &Connection, path: &str) -> Result<usize> {
    let (start, end) = descendant_range(path);
    Ok(conn.execute(
        "DELETE FROM thumb_status WHERE path = ?1 OR (path >= ?2 AND path < ?3)",
        params![path, start, end],
    )?)
}

/// Delete rows whose media item no longer exists.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub fn prune_orphan_thumbs(conn: &Connection) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM thumb_status WHERE NOT EXISTS
            (SELECT 1 FROM items WHERE items.path = thumb_status.path)",
        [],
    )?)
}

/// Refresh the recorded media mtime for one row.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn update_thumb_mtime(conn: &Connection, path: &str, mtime: i64) -> Result<bool> {
    Ok(conn.execute(
        "UPDATE thumb_status SET mtime = ?2 WHERE path = ?1",
        params![path, mtime],
    )? > 0)
}

/// Get the row for one path.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn get_thumb_status(conn: &Connection, path: &str) -> Result<Option<ThumbStatus>> {
    let row = conn
        .query_row(
            "SELECT path, mtime, status, last_checked FROM thumb_status WHERE path = ?",
            [path],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            },
        )
        .optional()?;

    row.map(|(path, mtime, status, last_checked)| -> Result<ThumbStatus> {
        Ok(ThumbStatus {
            path,
            mtime,
            status: status.parse::<ThumbState>()?,
            last_checked,
        })
    })
    .transpose()
}

/// Count rows.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn count_thumbs(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM thumb_status", [], |row| row.get(0))?)
}
