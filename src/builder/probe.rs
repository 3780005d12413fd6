//! Bounded-concurrency dimension probing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::error::BuilderError;
use crate::retry::{classify, ErrorClass};
use crate::storage::MediaType;
use crate::{Error, Result};

/// Dimensions recorded when a file cannot be decoded.
pub const PLACEHOLDER_DIMENSIONS: (i64, i64) = (1920, 1080);

/// Reads pixel dimensions from a media file.
pub trait DimensionProbe: Send + Sync {
    /// Probe `path`.
    ///
    /// # Errors
    ///
    /// Returns an error on unreadable, corrupt or unsupported media.
    fn probe(&self, path: &Path, media_type: MediaType) -> Result<(u32, u32)>;
}

/// Probe backed by the `image` crate's header readers.
///
/// Videos are not decoded and always fail, which records the placeholder.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageProbe;

impl DimensionProbe for ImageProbe {
    fn probe(&self, path: &Path, media_type: MediaType) -> Result<(u32, u32)> {
        let unsupported = |reason: String| BuilderError::Probe {
            path: path.display().to_string(),
            reason,
        };

        if media_type != MediaType::Photo {
            return Err(unsupported(format!("no decoder for {media_type}")).into());
        }

        image::image_dimensions(path).map_err(|e| match e {
            image::ImageError::IoError(io) => Error::Io(io),
            other => unsupported(other.to_string()).into(),
        })
    }
}

/// Result of probing one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probed {
    /// Real dimensions.
    Measured(i64, i64),
    /// Permanent failure; the placeholder is recorded.
    Placeholder,
    /// Transient failure; left unset for the maintenance backfill.
    Deferred,
}

impl Probed {
    /// Dimensions to store, if any.
    #[must_use]
    pub const fn dimensions(self) -> Option<(i64, i64)> {
        match self {
            Self::Measured(w, h) => Some((w, h)),
            Self::Placeholder => Some(PLACEHOLDER_DIMENSIONS),
            Self::Deferred => None,
        }
    }
}

pub(crate) fn probe_one(probe: &dyn DimensionProbe, root: &Path, key: &str, media_type: MediaType) -> Probed {
    match probe.probe(&root.join(key), media_type) {
        Ok((w, h)) => Probed::Measured(i64::from(w), i64::from(h)),
        Err(e) if classify(&e) == ErrorClass::Transient => {
            tracing::warn!(path = %key, error = %e, "Probe failed transiently, deferring");
            Probed::Deferred
        }
        Err(e) => {
            tracing::debug!(path = %key, error = %e, "Probe failed, using placeholder");
            Probed::Placeholder
        }
    }
}

/// Probe every target with at most `concurrency` decodes in flight.
///
/// Each probe runs on the blocking pool. Probe errors never fail the call;
/// a probe task that panics does.
///
/// # Errors
///
/// Returns [`BuilderError::Probe`] if a probe task panicked or was cancelled.
pub async fn probe_dimensions(
    probe: Arc<dyn DimensionProbe>,
    root: &Path,
    targets: Vec<(String, MediaType)>,
    concurrency: usize,
) -> Result<HashMap<String, Probed>> {
    if targets.is_empty() {
        return Ok(HashMap::new());
    }

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let root: Arc<PathBuf> = Arc::new(root.to_path_buf());

    let tasks = targets.into_iter().map(|(key, media_type)| {
        let semaphore = Arc::clone(&semaphore);
        let probe = Arc::clone(&probe);
        let root = Arc::clone(&root);
        async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| BuilderError::Probe {
                    path: key.clone(),
                    reason: e.to_string(),
                })?;

            let task_key = key.clone();
            let probed = tokio::task::spawn_blocking(move || {
                probe_one(probe.as_ref(), &root, &task_key, media_type)
            })
            .await
            .map_err(|e| BuilderError::Probe {
                path: key.clone(),
                reason: e.to_string(),
            })?;

            Ok::<_, Error>((key, probed))
        }
    });

    join_all(tasks).await.into_iter().collect()
}
