//! Album cover storage.
//!
//! A cover is a cache of a pure function over `items`: the most recently
//! modified photo or video anywhere below the album.

use rusqlite::{params, Connection, OptionalExtension};

use super::items::list_album_paths;
use super::models::AlbumCover;
use crate::paths::descendant_range;
use crate::Result;

/// What happened to an album's cover row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverChange {
    /// The cover row was written.
    Updated,
    /// The album has no media below it (or no longer exists); the row was removed.
    Removed,
}

/// Find the cover an album should have right now.
///
/// Ties on mtime pick the smallest path.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn latest_descendant_media(conn: &Connection, album: &str) -> Result<Option<AlbumCover>> {
    let (start, end) = descendant_range(album);
    let mut stmt = conn.prepare_cached(
        "SELECT path, width, height, mtime FROM items
         WHERE type != 'album' AND path >= ?1 AND path < ?2
         ORDER BY mtime DESC, path ASC
         LIMIT 1",
    )?;

    Ok(stmt
        .query_row(params![start, end], |row| {
            Ok(AlbumCover {
                album_path: album.to_string(),
                cover_path: row.get(0)?,
                width: row.get(1)?,
                height: row.get(2)?,
                mtime: row.get(3)?,
            })
        })
        .optional()?)
}

/// Recompute one album's cover, writing or deleting its row.
///
/// # Errors
///
/// Returns an error if any query fails.
pub fn refresh_cover(conn: &Connection, album: &str) -> Result<CoverChange> {
    let is_album: bool = conn
        .query_row(
            "SELECT 1 FROM items WHERE path = ? AND type = 'album'",
            [album],
            |_| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    let cover = if is_album {
        latest_descendant_media(conn, album)?
    } else {
        None
    };

    match cover {
        Some(cover) => {
            upsert_cover(conn, &cover)?;
            Ok(CoverChange::Updated)
        }
        None => {
            conn.execute("DELETE FROM album_covers WHERE album_path = ?", [album])?;
            Ok(CoverChange::Removed)
        }
    }
}

/// Write a cover row.
///
/// # Errors
///
/// Returns an error if the upsert fails.
pub fn upsert_cover(conn: &Connection, cover: &AlbumCover) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO album_covers (album_path, cover_path, width, height, mtime)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(album_path) DO UPDATE SET
            cover_path = excluded.cover_path,
            width = excluded.width,
            height = excluded.height,
            mtime = excluded.mtime",
    )?
    .execute(params![
        cover.album_path,
        cover.cover_path,
        cover.width,
        cover.height,
        cover.mtime,
    ])?;
    Ok(())
}

/// Rebuild every cover from scratch. Returns the number of covers written.
///
/// # Errors
///
/// Returns an error if any query fails.
pub fn recompute_all_covers(conn: &Connection) -> Result<usize> {
    conn.execute("DELETE FROM album_covers", [])?;

    let mut written = 0;
    for album in list_album_paths(conn)? {
        if let Some(cover) = latest_descendant_media(conn, &album)? {
            upsert_cover(conn, &cover)?;
            written += 1;
        }
    }

    tracing::debug!(covers = written, "Recomputed all album covers");
    Ok(written)
}

/// Get an album's cover.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn get_cover(conn: &Connection, album: &str) -> Result<Option<AlbumCover>> {
    Ok(conn
        .query_row(
            "SELECT album_path, cover_path, width, height, mtime FROM album_covers
             WHERE album_path = ?",
            [album],
            |row| {
                Ok(AlbumCover {
                    album_path: row.get(0)?,
                    cover_path: row.get(1)?,
                    width: row.get(2)?,
                    height: row.get(3)?,
                    mtime: row.get(4)?,
                })
            },
        )
        .optional()?)
}

/// Delete the cover of `path` and of every album nested below it.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub fn delete_covers_under(conn: &Connection, path: &str) -> Result<usize> {
    let (start, end) = descendant_range(path);
    Ok(conn.execute(
        "DELETE FROM album_covers WHERE album_path = ?1 OR (album_path >= ?2 AND album_path < ?3)",
        params![path, start, end],
    )?)
}

/// Count cover rows.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn count_covers(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM album_covers", [], |row| row.get(0))?)
}
