//! Raw and consolidated change events.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Bytes of file content hashed into a fingerprint.
const FINGERPRINT_PREFIX: u64 = 64 * 1024;

/// Event kind as reported by the watch primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RawEventKind {
    /// A file appeared or was rewritten.
    Add,
    /// A file disappeared.
    Unlink,
    /// A directory appeared.
    AddDir,
    /// A directory disappeared.
    UnlinkDir,
}

impl RawEventKind {
    /// Whether the event concerns a directory.
    #[must_use]
    pub const fn is_dir(self) -> bool {
        matches!(self, Self::AddDir | Self::UnlinkDir)
    }

    /// Whether the event reports a removal.
    #[must_use]
    pub const fn is_removal(self) -> bool {
        matches!(self, Self::Unlink | Self::UnlinkDir)
    }
}

/// One filtered event for a relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawChange {
    /// Event kind.
    pub kind: RawEventKind,
    /// Relative item key.
    pub path: String,
    /// Content fingerprint for file additions, when it could be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

#[allow(clippy::missing_const_for_fn)]
impl RawChange {
    /// Create an event without a fingerprint.
    pub fn new(kind: RawEventKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            content_hash: None,
        }
    }

    /// Attach a content fingerprint.
    #[must_use]
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }
}

/// Effective operation after consolidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    /// New node.
    Add,
    /// Existing node whose content changed, or an ambiguous burst.
    Update,
    /// Node removed; cascades to everything below it.
    Delete,
}

/// The single effective change for one path in a flush window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidatedChange {
    /// Relative item key.
    pub path: String,
    /// Effective operation.
    pub op: ChangeOp,
    /// Whether the last event seen for the path was a directory event.
    pub is_dir: bool,
    /// Fingerprint of the last file addition, if any.
    pub content_hash: Option<String>,
}

impl ConsolidatedChange {
    /// Whether this change removes its path.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.op == ChangeOp::Delete
    }
}

/// Fingerprint a file from its length and first 64 KiB.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn content_fingerprint(path: &Path) -> std::io::Result<String> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();

    let mut hasher = blake3::Hasher::new();
    hasher.update(&len.to_le_bytes());

    let mut prefix = Vec::new();
    file.take(FINGERPRINT_PREFIX).read_to_end(&mut prefix)?;
    hasher.update(&prefix);

    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_kind_predicates() {
        assert!(RawEventKind::AddDir.is_dir());
        assert!(!RawEventKind::Add.is_dir());
        assert!(RawEventKind::UnlinkDir.is_removal());
        assert!(!RawEventKind::AddDir.is_removal());
    }

    #[test]
    fn test_raw_change_serde_shape() {
        let change = RawChange::new(RawEventKind::UnlinkDir, "A");
        let json = serde_json::to_string(&change).unwrap();
        assert_eq!(json, r#"{"kind":"unlinkDir","path":"A"}"#);

        let back: RawChange = serde_json::from_str(&json).unwrap();
        assert_eq!(back, change);
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.jpg");
        let b = tmp.path().join("b.jpg");
        std::fs::write(&a, b"same bytes").unwrap();
        std::fs::write(&b, b"same bytes").unwrap();

        let fa = content_fingerprint(&a).unwrap();
        assert_eq!(fa, content_fingerprint(&b).unwrap());

        std::fs::write(&b, b"other bytes").unwrap();
        assert_ne!(fa, content_fingerprint(&b).unwrap());
    }

    #[test]
    fn test_fingerprint_includes_length_beyond_prefix() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.mp4");
        let b = tmp.path().join("b.mp4");
        let head = vec![7u8; 70 * 1024];
        let mut longer = head.clone();
        longer.extend_from_slice(b"tail");
        std::fs::write(&a, &head).unwrap();
        std::fs::write(&b, &longer).unwrap();

        assert_ne!(
            content_fingerprint(&a).unwrap(),
            content_fingerprint(&b).unwrap()
        );
    }

    #[test]
    fn test_fingerprint_missing_file() {
        let tmp = TempDir::new().unwrap();
        assert!(content_fingerprint(&tmp.path().join("gone.jpg")).is_err());
    }
}
