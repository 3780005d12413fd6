//! Best-effort backfill run while the index is idle.
//!
//! Two passes share one deadline. The dimension pass pages through media
//! whose width or height was never recorded and re-probes them. The mtime
//! pass pages through media
//! in key order, refreshing rows whose file changed without an event and
//! reporting files that vanished so the caller can queue their removal.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::builder::{mtime_millis, DimensionProbe};
use crate::paths::ancestors;
use crate::retry::Retrier;
use crate::storage::{
    items_missing_dimensions, media_items_after, refresh_cover, update_dimensions, update_mtime,
    update_thumb_mtime, Database,
};
use crate::Result;

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    /// Items that received dimensions.
    pub dimensions_filled: usize,
    /// Items whose mtime was refreshed.
    pub mtimes_refreshed: usize,
    /// Indexed media no longer on disk.
    pub vanished: Vec<String>,
    /// Where the next mtime pass continues; `None` restarts from the top.
    pub next_cursor: Option<String>,
    /// Where the next dimension pass continues; `None` restarts from the top.
    pub next_dimension_cursor: Option<String>,
    /// The deadline cut the pass short.
    pub timed_out: bool,
}

/// One bounded maintenance pass.
pub struct MaintenancePass<'a> {
    /// Connection the pass reads and writes through.
    pub db: &'a Database,
    /// Media root.
    pub root: &'a Path,
    /// Dimension probe.
    pub probe: &'a dyn DimensionProbe,
    /// Retry wrapper for the writes.
    pub retrier: &'a Retrier,
    /// Rows examined by each backfill.
    pub batch: usize,
    /// Dimension backfill continues after this path.
    pub dimensions_after: Option<&'a str>,
    /// Work stops once this passes.
    pub deadline: Instant,
}

impl MaintenancePass<'_> {
    /// Run both backfills, continuing the mtime scan after `cursor`.
    ///
    /// # Errors
    ///
    /// Returns an error if a read fails or a write fails after retries.
    pub fn run(&self, cursor: Option<&str>) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport {
            next_cursor: cursor.map(str::to_string),
            next_dimension_cursor: self.dimensions_after.map(str::to_string),
            ..MaintenanceReport::default()
        };

        self.backfill_dimensions(&mut report)?;
        if !report.timed_out {
            self.backfill_mtimes(cursor, &mut report)?;
        }

        tracing::debug!(
            dimensions = report.dimensions_filled,
            mtimes = report.mtimes_refreshed,
            vanished = report.vanished.len(),
            timed_out = report.timed_out,
            "Maintenance pass finished"
        );
        Ok(report)
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Probe one page of items with missing dimensions and store what
    /// comes back.
    ///
    /// Transient probe failures stay unset and the page cursor moves past
    /// them; they are retried once the scan wraps around.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the write fails after retries.
    pub fn backfill_dimensions(&self, report: &mut MaintenanceReport) -> Result<()> {
        let missing = self
            .db
            .with_conn(|conn| items_missing_dimensions(conn, self.dimensions_after, self.batch))?;
        let exhausted = missing.len() < self.batch;

        let mut updates = Vec::new();
        let mut last = self.dimensions_after.map(str::to_string);
        for item in missing {
            if self.expired() {
                report.timed_out = true;
                break;
            }
            let probed =
                crate::builder::probe_one(self.probe, self.root, &item.path, item.media_type);
            if let Some((width, height)) = probed.dimensions() {
                updates.push((item.path.clone(), width, height));
            }
            last = Some(item.path);
        }

        report.next_dimension_cursor = if exhausted && !report.timed_out {
            None
        } else {
            last
        };
        if updates.is_empty() {
            return Ok(());
        }

        report.dimensions_filled += self.retrier.run("maintenance.dimensions", || {
            self.db.with_transaction(|conn| {
                let mut filled = 0;
                let mut albums = BTreeSet::new();
                for (path, width, height) in &updates {
                    if update_dimensions(conn, path, *width, *height)? {
                        filled += 1;
                        albums.extend(ancestors(path));
                    }
                }
                for album in albums {
                    refresh_cover(conn, album)?;
                }
                Ok(filled)
            })
        })?;
        Ok(())
    }

    /// Compare one page of media rows against the file system.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the write fails after retries.
    pub fn backfill_mtimes(&self, cursor: Option<&str>, report: &mut MaintenanceReport) -> Result<()> {
        let page = self
            .db
            .with_conn(|conn| media_items_after(conn, cursor, self.batch))?;
        let exhausted = page.len() < self.batch;

        let mut changed = Vec::new();
        let mut last = cursor.map(str::to_string);
        for item in page {
            if self.expired() {
                report.timed_out = true;
                break;
            }
            match std::fs::metadata(self.root.join(&item.path)) {
                Ok(meta) => {
                    let mtime = mtime_millis(&meta);
                    if mtime != item.mtime {
                        changed.push((item.path.clone(), mtime));
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    report.vanished.push(item.path.clone());
                }
                Err(e) => {
                    tracing::debug!(path = %item.path, error = %e, "Cannot stat indexed media");
                }
            }
            last = Some(item.path);
        }

        report.next_cursor = if exhausted && !report.timed_out {
            None
        } else {
            last
        };
        if changed.is_empty() {
            return Ok(());
        }

        report.mtimes_refreshed += self.retrier.run("maintenance.mtimes", || {
            self.db.with_transaction(|conn| {
                let mut refreshed = 0;
                let mut albums = BTreeSet::new();
                for (path, mtime) in &changed {
                    if update_mtime(conn, path, *mtime)? {
                        update_thumb_mtime(conn, path, *mtime)?;
                        refreshed += 1;
                        albums.extend(ancestors(path));
                    }
                }
                for album in albums {
                    refresh_cover(conn, album)?;
                }
                Ok(refreshed)
            })
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::test_support::{builder_with, write_media, FixedProbe};
    use crate::builder::ImageProbe;
    use crate::retry::{BulkIndexSignal, RetryPolicy};
    use crate::storage::{get_cover, get_item, get_thumb_status, init_storage, upsert_items, ItemRecord, MediaType};
    use crate::watcher::{ChangeOp, ConsolidatedChange};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn retrier() -> Retrier {
        Retrier::new(RetryPolicy::default(), BulkIndexSignal::new())
    }

    fn pass<'a>(
        db: &'a Database,
        root: &'a Path,
        probe: &'a dyn DimensionProbe,
        retrier: &'a Retrier,
        batch: usize,
    ) -> MaintenancePass<'a> {
        MaintenancePass {
            db,
            root,
            probe,
            retrier,
            batch,
            dimensions_after: None,
            deadline: Instant::now() + Duration::from_secs(30),
        }
    }

    async fn indexed(tmp: &TempDir) -> Database {
        let db = Database::open_in_memory().unwrap();
        init_storage(&db).unwrap();
        let builder = builder_with(db.clone(), tmp.path(), Arc::new(FixedProbe));
        let add = |path: &str, is_dir| ConsolidatedChange {
            path: path.to_string(),
            op: ChangeOp::Add,
            is_dir,
            content_hash: None,
        };
        builder
            .apply(&[add("A", true), add("A/1.jpg", false), add("A/2.jpg", false)])
            .await
            .unwrap();
        db
    }

    #[test]
    fn test_backfill_fills_missing_dimensions() {
        let tmp = TempDir::new().unwrap();
        write_media(tmp.path(), "A/1.jpg", 100);
        let db = Database::open_in_memory().unwrap();
        init_storage(&db).unwrap();
        db.with_conn(|conn| {
            upsert_items(
                conn,
                &[
                    ItemRecord::new("A", MediaType::Album, 1),
                    ItemRecord::new("A/1.jpg", MediaType::Photo, 100),
                ],
            )?;
            refresh_cover(conn, "A")?;
            Ok(())
        })
        .unwrap();

        let retrier = retrier();
        let report = pass(&db, tmp.path(), &FixedProbe, &retrier, 10)
            .run(None)
            .unwrap();
        assert_eq!(report.dimensions_filled, 1);

        db.with_conn(|conn| {
            let item = get_item(conn, "A/1.jpg")?.unwrap();
            assert_eq!((item.width, item.height), (Some(800), Some(600)));
            let cover = get_cover(conn, "A")?.unwrap();
            assert_eq!((cover.width, cover.height), (Some(800), Some(600)));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_undecodable_media_gets_placeholder() {
        let tmp = TempDir::new().unwrap();
        write_media(tmp.path(), "clip.mp4", 100);
        let db = Database::open_in_memory().unwrap();
        init_storage(&db).unwrap();
        db.with_conn(|conn| {
            upsert_items(conn, &[ItemRecord::new("clip.mp4", MediaType::Video, 100)])?;
            Ok(())
        })
        .unwrap();

        let retrier = retrier();
        pass(&db, tmp.path(), &ImageProbe, &retrier, 10)
            .run(None)
            .unwrap();

        db.with_conn(|conn| {
            let item = get_item(conn, "clip.mp4")?.unwrap();
            assert_eq!((item.width, item.height), (Some(1920), Some(1080)));
            Ok(())
        })
        .unwrap();
    }

    /// Defers the first file on every call.
    struct DeferFirstProbe;

    impl DimensionProbe for DeferFirstProbe {
        fn probe(&self, path: &Path, _media_type: MediaType) -> Result<(u32, u32)> {
            if path.ends_with("A/1.jpg") {
                return Err(std::io::Error::from(ErrorKind::TimedOut).into());
            }
            Ok((640, 480))
        }
    }

    #[test]
    fn test_deferred_dimensions_do_not_block_later_rows() {
        let tmp = TempDir::new().unwrap();
        write_media(tmp.path(), "A/1.jpg", 100);
        write_media(tmp.path(), "A/2.jpg", 200);
        let db = Database::open_in_memory().unwrap();
        init_storage(&db).unwrap();
        db.with_conn(|conn| {
            upsert_items(
                conn,
                &[
                    ItemRecord::new("A", MediaType::Album, 1),
                    ItemRecord::new("A/1.jpg", MediaType::Photo, 100),
                    ItemRecord::new("A/2.jpg", MediaType::Photo, 200),
                ],
            )?;
            Ok(())
        })
        .unwrap();

        let retrier = retrier();
        let first = pass(&db, tmp.path(), &DeferFirstProbe, &retrier, 1)
            .run(None)
            .unwrap();
        assert_eq!(first.dimensions_filled, 0);
        assert_eq!(first.next_dimension_cursor.as_deref(), Some("A/1.jpg"));

        let mut second = pass(&db, tmp.path(), &DeferFirstProbe, &retrier, 1);
        second.dimensions_after = first.next_dimension_cursor.as_deref();
        let second = second.run(None).unwrap();
        assert_eq!(second.dimensions_filled, 1);

        let mut third = pass(&db, tmp.path(), &DeferFirstProbe, &retrier, 1);
        third.dimensions_after = second.next_dimension_cursor.as_deref();
        assert!(third.run(None).unwrap().next_dimension_cursor.is_none());

        db.with_conn(|conn| {
            let item = get_item(conn, "A/2.jpg")?.unwrap();
            assert_eq!((item.width, item.height), (Some(640), Some(480)));
            assert_eq!(get_item(conn, "A/1.jpg")?.unwrap().width, None);
            Ok(())
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_mtime_drift_is_refreshed() {
        let tmp = TempDir::new().unwrap();
        write_media(tmp.path(), "A/1.jpg", 100);
        write_media(tmp.path(), "A/2.jpg", 200);
        let db = indexed(&tmp).await;

        // 1.jpg edited without an event reaching the index.
        write_media(tmp.path(), "A/1.jpg", 500);

        let retrier = retrier();
        let report = pass(&db, tmp.path(), &FixedProbe, &retrier, 10)
            .run(None)
            .unwrap();
        assert_eq!(report.mtimes_refreshed, 1);
        assert!(report.vanished.is_empty());
        assert!(report.next_cursor.is_none());

        db.with_conn(|conn| {
            assert_eq!(get_item(conn, "A/1.jpg")?.unwrap().mtime, 500);
            assert_eq!(get_thumb_status(conn, "A/1.jpg")?.unwrap().mtime, 500);
            assert_eq!(get_cover(conn, "A")?.unwrap().cover_path, "A/1.jpg");
            Ok(())
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_vanished_files_are_reported() {
        let tmp = TempDir::new().unwrap();
        write_media(tmp.path(), "A/1.jpg", 100);
        write_media(tmp.path(), "A/2.jpg", 200);
        let db = indexed(&tmp).await;
        std::fs::remove_file(tmp.path().join("A/2.jpg")).unwrap();

        let retrier = retrier();
        let report = pass(&db, tmp.path(), &FixedProbe, &retrier, 10)
            .run(None)
            .unwrap();
        assert_eq!(report.vanished, vec!["A/2.jpg".to_string()]);

        // Removal is left to the caller.
        db.with_conn(|conn| {
            assert!(get_item(conn, "A/2.jpg")?.is_some());
            Ok(())
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_mtime_scan_pages_with_cursor() {
        let tmp = TempDir::new().unwrap();
        write_media(tmp.path(), "A/1.jpg", 100);
        write_media(tmp.path(), "A/2.jpg", 200);
        let db = indexed(&tmp).await;

        let retrier = retrier();
        let first = pass(&db, tmp.path(), &FixedProbe, &retrier, 1)
            .run(None)
            .unwrap();
        assert_eq!(first.next_cursor.as_deref(), Some("A/1.jpg"));

        let second = pass(&db, tmp.path(), &FixedProbe, &retrier, 1)
            .run(first.next_cursor.as_deref())
            .unwrap();
        assert_eq!(second.next_cursor.as_deref(), Some("A/2.jpg"));

        let third = pass(&db, tmp.path(), &FixedProbe, &retrier, 1)
            .run(second.next_cursor.as_deref())
            .unwrap();
        assert!(third.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_expired_deadline_stops_early() {
        let tmp = TempDir::new().unwrap();
        write_media(tmp.path(), "A/1.jpg", 100);
        write_media(tmp.path(), "A/2.jpg", 200);
        let db = indexed(&tmp).await;
        write_media(tmp.path(), "A/1.jpg", 900);

        let retrier = retrier();
        let mut expired = pass(&db, tmp.path(), &FixedProbe, &retrier, 10);
        expired.deadline = Instant::now();
        let report = expired.run(Some("A")).unwrap();

        assert!(report.timed_out);
        assert_eq!(report.mtimes_refreshed, 0);
        assert_eq!(report.next_cursor.as_deref(), Some("A"));
    }
}
