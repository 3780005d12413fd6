//! Relative path handling for indexed items.
//!
//! Every item is keyed by its path relative to the media root, with `/`
//! separators and no leading or trailing slash. The root itself is the
//! empty string.

use std::cmp::Ordering;
use std::path::{Component, Path};

/// Normalize `path` into a relative item key under `root`.
///
/// Accepts absolute paths under `root` or paths already relative to it.
/// Returns `None` for the root itself, for paths outside the root and for
/// paths that are not valid UTF-8 or contain `..`.
#[must_use]
pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = if path.is_absolute() {
        path.strip_prefix(root).ok()?
    } else {
        path
    };

    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(name) => parts.push(name.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Final segment of a key.
#[must_use]
pub fn file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Parent album key, or `None` when the parent is the root.
#[must_use]
pub fn parent(key: &str) -> Option<&str> {
    key.rfind('/').map(|idx| &key[..idx])
}

/// Every proper ancestor album key, nearest first. The root is not included.
#[must_use]
pub fn ancestors(key: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut current = key;
    while let Some(p) = parent(current) {
        out.push(p);
        current = p;
    }
    out
}

/// Half-open key range `[start, end)` covering every descendant of `key`.
///
/// Children of `A` all start with `A/`; under binary collation they sort
/// at or after `A/` and strictly before `A0` (`'0'` follows `'/'`).
#[must_use]
pub fn descendant_range(key: &str) -> (String, String) {
    (format!("{key}/"), format!("{key}0"))
}

/// Whether `key` is `ancestor` itself or nested below it.
#[must_use]
pub fn is_same_or_descendant(key: &str, ancestor: &str) -> bool {
    key == ancestor
        || (key.len() > ancestor.len()
            && key.starts_with(ancestor)
            && key.as_bytes()[ancestor.len()] == b'/')
}

/// Compare two keys in depth-first walk order (siblings by byte order).
///
/// Plain string comparison disagrees with the walk when a sibling name
/// sorts between `/` and a longer name, e.g. `A/x` versus `A b`.
#[must_use]
pub fn walk_order(a: &str, b: &str) -> Ordering {
    a.split('/').cmp(b.split('/'))
}
