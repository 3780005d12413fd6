//! Indexability filter for paths and raw events.

use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use super::events::RawEventKind;
use crate::error::WatcherError;
use crate::storage::MediaType;
use crate::Result;

/// Recognized still-image extensions.
const PHOTO_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "heic", "heif", "avif", "tif", "tiff", "bmp", "dng",
    "cr2", "cr3", "nef", "arw", "orf", "rw2", "raf",
];

/// Recognized video extensions.
const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "m4v", "mov", "avi", "mkv", "webm", "wmv", "mpg", "mpeg", "3gp", "mts", "m2ts",
];

/// Extensions the engine and its neighbours write into the tree themselves.
const ARTIFACT_EXTENSIONS: &[&str] = &[
    "db", "db-journal", "db-wal", "db-shm", "sqlite", "sqlite3", "log", "m3u8", "m3u", "ts",
    "tmp", "part", "partial", "crdownload", "download",
];

/// Built-in ignore globs: hidden entries, NAS and OS system folders,
/// editor swap files and partial-write markers.
const DEFAULT_IGNORES: &[&str] = &[
    ".*",
    "@eaDir/",
    "#recycle/",
    "#snapshot/",
    "$RECYCLE.BIN/",
    "System Volume Information/",
    "lost+found/",
    "Thumbs.db",
    "desktop.ini",
    "~*",
    "*~",
    "*.swp",
];

/// Decides whether a path or event is worth indexing.
///
/// Holds only the compiled ignore set; every check is pure.
#[derive(Debug, Clone)]
pub struct ChangeFilter {
    ignore: Gitignore,
}

impl ChangeFilter {
    /// Build a filter from the defaults plus `extra` user globs.
    ///
    /// # Errors
    ///
    /// Returns an error if a glob does not parse.
    pub fn new(root: impl AsRef<Path>, extra: &[String]) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(root.as_ref());

        let patterns = DEFAULT_IGNORES
            .iter()
            .copied()
            .chain(extra.iter().map(String::as_str));
        for pattern in patterns {
            builder
                .add_line(None, pattern)
                .map_err(|e| WatcherError::Pattern {
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                })?;
        }

        let ignore = builder.build().map_err(|e| WatcherError::Pattern {
            pattern: "<set>".to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self { ignore })
    }

    /// Whether the relative key, or any directory above it, is ignored.
    ///
    /// Absolute paths are not keys and always count as ignored.
    #[must_use]
    pub fn is_ignored(&self, key: &str, is_dir: bool) -> bool {
        if key.is_empty() {
            return false;
        }
        if Path::new(key).has_root() {
            return true;
        }
        self.ignore
            .matched_path_or_any_parents(key, is_dir)
            .is_ignore()
    }

    /// Whether a raw event on `key` should reach the pending buffer.
    #[must_use]
    pub fn accepts(&self, key: &str, kind: RawEventKind) -> bool {
        if key.is_empty() || self.is_ignored(key, kind.is_dir()) {
            return false;
        }
        kind.is_dir() || Self::media_type(key).is_some()
    }

    /// Media type implied by the extension, or `None` for anything that is
    /// not a recognized photo or video (artifacts included).
    #[must_use]
    pub fn media_type(key: &str) -> Option<MediaType> {
        let ext = extension(key)?;
        if is_artifact_extension(&ext) {
            return None;
        }
        if PHOTO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaType::Photo)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaType::Video)
        } else {
            None
        }
    }

    /// Whether `key` names a database, log, playlist or segment artifact.
    #[must_use]
    pub fn is_artifact(key: &str) -> bool {
        extension(key).is_some_and(|ext| is_artifact_extension(&ext))
    }
}

fn is_artifact_extension(ext: &str) -> bool {
    ARTIFACT_EXTENSIONS.contains(&ext)
}

/// Lowercased extension of the last segment. Compound journal suffixes
/// like `db-wal` come through whole because they contain no dot.
fn extension(key: &str) -> Option<String> {
    let name = crate::paths::file_name(key);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
