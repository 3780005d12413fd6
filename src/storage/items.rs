//! Item storage operations.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::models::{ItemRecord, MediaType};
use crate::paths::descendant_range;
use crate::Result;

/// Dimensions and mtime already stored for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownDimensions {
    /// Stored mtime.
    pub mtime: i64,
    /// Stored width.
    pub width: Option<i64>,
    /// Stored height.
    pub height: Option<i64>,
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<ItemRecord> {
    let media_type: String = row.get(1)?;
    let media_type = media_type.parse::<MediaType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(ItemRecord {
        path: row.get(0)?,
        media_type,
        name: row.get(2)?,
        mtime: row.get(3)?,
        width: row.get(4)?,
        height: row.get(5)?,
        status: row.get(6)?,
    })
}

/// Upsert a batch of items with one cached prepared statement.
///
/// On conflict only `mtime`, `width` and `height` are refreshed; `status`
/// is never touched. Missing dimensions keep the stored values.
///
/// # Errors
///
/// Returns an error if any insert fails.
pub fn upsert_items(conn: &Connection, items: &[ItemRecord]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO items (path, type, name, mtime, width, height)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(path) DO UPDATE SET
            mtime = excluded.mtime,
            width = COALESCE(excluded.width, items.width),
            height = COALESCE(excluded.height, items.height)",
    )?;

    for item in items {
        stmt.execute(params![
            item.path,
            item.media_type.as_str(),
            item.name,
            item.mtime,
            item.width,
            item.height,
        ])?;
    }

    tracing::trace!(count = items.len(), "Upserted items");
    Ok(items.len())
}

/// Get an item by path.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn get_item(conn: &Connection, path: &str) -> Result<Option<ItemRecord>> {
    Ok(conn
        .query_row(
            "SELECT path, type, name, mtime, width, height, status FROM items WHERE path = ?",
            [path],
            item_from_row,
        )
        .optional()?)
}

/// Delete the item at `path` and every item nested below it.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub fn delete_items_under(conn: &Connection, path: &str) -> Result<usize> {
    let (start, end) = descendant_range(path);
    let deleted = conn.execute(
        "DELETE FROM items WHERE path = ?1 OR (path >= ?2 AND path < ?3)",
        params![path, start, end],
    )?;
    Ok(deleted)
}

/// Remove every item.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub fn clear_items(conn: &Connection) -> Result<usize> {
    Ok(conn.execute("DELETE FROM items", [])?)
}

/// Count all items.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn count_items(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?)
}

/// List all item paths in key order.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn list_item_paths(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT path FROM items ORDER BY path")?;
    let paths = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(paths)
}

/// List the paths nested below `path`, excluding `path` itself.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn list_descendant_paths(conn: &Connection, path: &str) -> Result<Vec<String>> {
    let (start, end) = descendant_range(path);
    let mut stmt = conn.prepare_cached(
        "SELECT path FROM items WHERE path >= ?1 AND path < ?2 ORDER BY path",
    )?;
    let paths = stmt
        .query_map(params![start, end], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(paths)
}

/// List every album path.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn list_album_paths(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT path FROM items WHERE type = 'album' ORDER BY path")?;
    let paths = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(paths)
}

/// Look up stored mtime and dimensions for the given paths.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn known_dimensions<'a, I>(conn: &Connection, paths: I) -> Result<HashMap<String, KnownDimensions>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut stmt =
        conn.prepare_cached("SELECT mtime, width, height FROM items WHERE path = ?")?;
    let mut known = HashMap::new();

    for path in paths {
        let row = stmt
            .query_row([path], |row| {
                Ok(KnownDimensions {
                    mtime: row.get(0)?,
                    width: row.get(1)?,
                    height: row.get(2)?,
                })
            })
            .optional()?;
        if let Some(dims) = row {
            known.insert(path.to_string(), dims);
        }
    }

    Ok(known)
}

/// Media items whose width or height was never recorded, in key order
/// starting after `after`.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn items_missing_dimensions(
    conn: &Connection,
    after: Option<&str>,
    limit: usize,
) -> Result<Vec<ItemRecord>> {
    let mut stmt = conn.prepare(
        "SELECT path, type, name, mtime, width, height, status FROM items
         WHERE type != 'album' AND (width IS NULL OR height IS NULL) AND path > ?1
         ORDER BY path LIMIT ?2",
    )?;
    let items = stmt
        .query_map(
            params![after.unwrap_or(""), i64::try_from(limit).unwrap_or(i64::MAX)],
            item_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(items)
}

/// Page through media items in key order, starting after `after`.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn media_items_after(
    conn: &Connection,
    after: Option<&str>,
    limit: usize,
) -> Result<Vec<ItemRecord>> {
    let mut stmt = conn.prepare(
        "SELECT path, type, name, mtime, width, height, status FROM items
         WHERE type != 'album' AND path > ?1
         ORDER BY path LIMIT ?2",
    )?;
    let items = stmt
        .query_map(
            params![after.unwrap_or(""), i64::try_from(limit).unwrap_or(i64::MAX)],
            item_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(items)
}

/// Record probed dimensions for an item.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn update_dimensions(conn: &Connection, path: &str, width: i64, height: i64) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE items SET width = ?2, height = ?3 WHERE path = ?1",
        params![path, width, height],
    )?;
    Ok(updated > 0)
}

/// Record a new mtime for an item.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn update_mtime(conn: &Connection, path: &str, mtime: i64) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE items SET mtime = ?2 WHERE path = ?1",
        params![path, mtime],
    )?;
    Ok(updated > 0)
}
