//! Data models for storage operations.
//!
//! This module defines the core data structures used for:
//! - Indexed items (albums, photos, videos)
//! - Derived album covers
//! - Thumbnail readiness rows
//! - Rebuild checkpoint and status records

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StorageError;

/// Get current Unix timestamp in milliseconds.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Kind of node in the media tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// A directory.
    Album,
    /// A still image.
    Photo,
    /// A video file.
    Video,
}

impl MediaType {
    /// Column value for this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Album => "album",
            Self::Photo => "photo",
            Self::Video => "video",
        }
    }

    /// Whether rows of this type are media (photo or video).
    #[must_use]
    pub const fn is_media(self) -> bool {
        !matches!(self, Self::Album)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "album" => Ok(Self::Album),
            "photo" => Ok(Self::Photo),
            "video" => Ok(Self::Video),
            other => Err(StorageError::Database(format!("unknown item type '{other}'"))),
        }
    }
}

/// One row of the `items` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Relative, `/`-separated path; unique.
    pub path: String,
    /// Node kind.
    pub media_type: MediaType,
    /// Final path segment.
    pub name: String,
    /// Modification time in epoch milliseconds.
    pub mtime: i64,
    /// Pixel width once probed.
    pub width: Option<i64>,
    /// Pixel height once probed.
    pub height: Option<i64>,
    /// Lifecycle status owned by other collaborators.
    pub status: String,
}

impl ItemRecord {
    /// Create a record with no dimensions and the default status.
    #[must_use]
    pub fn new(path: impl Into<String>, media_type: MediaType, mtime: i64) -> Self {
        let path = path.into();
        let name = crate::paths::file_name(&path).to_string();
        Self {
            path,
            media_type,
            name,
            mtime,
            width: None,
            height: None,
            status: "active".to_string(),
        }
    }

    /// Set probed dimensions.
    #[must_use]
    pub const fn with_dimensions(mut self, width: i64, height: i64) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }
}

/// One row of the `album_covers` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumCover {
    /// Album the cover belongs to.
    pub album_path: String,
    /// Most recently modified descendant media.
    pub cover_path: String,
    /// Cover width.
    pub width: Option<i64>,
    /// Cover height.
    pub height: Option<i64>,
    /// Cover mtime in epoch milliseconds.
    pub mtime: i64,
}

/// Readiness of a derived thumbnail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThumbState {
    /// Not generated yet.
    Pending,
    /// Generated.
    Exists,
    /// Generation failed; may be retried.
    Failed,
    /// Generation failed; will not be retried.
    PermanentFailed,
}

impl FromStr for ThumbState {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "exists" => Ok(Self::Exists),
            "failed" => Ok(Self::Failed),
            "permanent_failed" => Ok(Self::PermanentFailed),
            other => Err(StorageError::Database(format!(
                "unknown thumbnail status '{other}'"
            ))),
        }
    }
}

/// One row of the `thumb_status` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbStatus {
    /// Media path.
    pub path: String,
    /// Media mtime the thumbnail corresponds to.
    pub mtime: i64,
    /// Readiness.
    pub status: ThumbState,
    /// Last time the thumbnail collaborator checked the row.
    pub last_checked: Option<i64>,
}

/// Phase of the full rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebuildState {
    /// A rebuild started and has not completed.
    Building,
    /// The last rebuild completed.
    Complete,
}

/// The `index_status` checkpoint record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStatus {
    /// Rebuild phase.
    pub state: RebuildState,
    /// Nodes committed by the current or last rebuild.
    pub processed_files: u64,
}

impl IndexStatus {
    /// Status recorded when a fresh rebuild starts.
    #[must_use]
    pub const fn building(processed_files: u64) -> Self {
        Self {
            state: RebuildState::Building,
            processed_files,
        }
    }

    /// Whether this status marks an unfinished rebuild.
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        self.state == RebuildState::Building
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_type_round_trip() {
        for t in [MediaType::Album, MediaType::Photo, MediaType::Video] {
            assert_eq!(t.as_str().parse::<MediaType>().unwrap(), t);
        }
        assert!("folder".parse::<MediaType>().is_err());
        assert!(!MediaType::Album.is_media());
        assert!(MediaType::Video.is_media());
    }

    #[test]
    fn test_item_record_name() {
        let item = ItemRecord::new("A/B/cat.jpg", MediaType::Photo, 10);
        assert_eq!(item.name, "cat.jpg");
        assert_eq!(item.status, "active");
        assert!(item.width.is_none());

        let item = item.with_dimensions(640, 480);
        assert_eq!((item.width, item.height), (Some(640), Some(480)));
    }

    #[test]
    fn test_index_status_json() {
        let status = IndexStatus::building(42);
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, r#"{"state":"building","processed_files":42}"#);
        let back: IndexStatus = serde_json::from_str(&json).unwrap();
        assert!(back.is_incomplete());
    }

    #[test]
    fn test_thumb_state_parse() {
        assert_eq!(
            "permanent_failed".parse::<ThumbState>().unwrap(),
            ThumbState::PermanentFailed
        );
        assert!("gone".parse::<ThumbState>().is_err());
    }
}
