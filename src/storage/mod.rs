//! `SQLite` persistence for the media index.
//!
//! This module provides persistent storage for:
//! - Items (albums, photos, videos)
//! - Album covers derived from items
//! - Thumbnail readiness rows kept in lockstep with media items
//! - Rebuild checkpoint and status

mod checkpoint;
mod connection;
mod covers;
mod items;
mod models;
mod schema;
mod thumbs;

pub use checkpoint::{
    begin_rebuild, complete_rebuild, load_checkpoint, load_index_status, save_checkpoint,
};
pub use connection::Database;
pub use covers::{
    count_covers, delete_covers_under, get_cover, latest_descendant_media, recompute_all_covers,
    refresh_cover, upsert_cover, CoverChange,
};
pub use items::{
    clear_items, count_items, delete_items_under, get_item, items_missing_dimensions,
    known_dimensions, list_album_paths, list_descendant_paths, list_item_paths,
    media_items_after, update_dimensions, update_mtime, upsert_items, KnownDimensions,
};
pub use models::{
    AlbumCover, IndexStatus, ItemRecord, MediaType, RebuildState, ThumbState, ThumbStatus,
};
pub use schema::{migrate, verify_schema, SCHEMA_VERSION};
pub use thumbs::{
    count_thumbs, delete_thumbs_under, ensure_thumb_rows, get_thumb_status, prune_orphan_thumbs,
    update_thumb_mtime,
};

pub(crate) use models::now_millis;

/// Initialize storage with migrations.
///
/// # Errors
///
/// Returns an error if database initialization fails.
pub fn init_storage(db: &Database) -> crate::Result<()> {
    db.with_conn(|conn| {
        migrate(conn)?;
        verify_schema(conn)?;

        tracing::info!("Storage initialized, schema version {SCHEMA_VERSION}");
        Ok(())
    })
}
