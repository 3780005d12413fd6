//! `SQLite` database connection management.
//!
//! Provides a connection wrapper with proper configuration for:
//! - WAL mode so readers never wait on the index builder
//! - Serialized access through `parking_lot::Mutex`
//! - An adjustable busy timeout, raised while a rebuild is running

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::StorageError;
use crate::Result;

const IN_MEMORY: &str = ":memory:";

/// Database connection wrapper.
///
/// Clone is cheap - it just clones the Arc. Use [`Database::worker_handle`]
/// to get an independent connection for a background job.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: String,
}

impl Database {
    /// Open a database at the given path.
    ///
    /// Creates the database file and parent directories if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or configured.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path_str = path.to_string_lossy().to_string();

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| StorageError::Connection(format!("failed to open database: {e}")))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path_str,
        };

        db.configure()?;

        Ok(db)
    }

    /// Open an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            StorageError::Connection(format!("failed to open in-memory database: {e}"))
        })?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: IN_MEMORY.to_string(),
        };

        db.configure()?;

        Ok(db)
    }

    fn configure(&self) -> Result<()> {
        {
            let conn = self.conn.lock();

            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA cache_size = -64000;  -- 64MB cache
                PRAGMA temp_store = MEMORY;
                PRAGMA foreign_keys = ON;
                ",
            )?;
            conn.busy_timeout(Duration::from_secs(5))?;
        }

        tracing::debug!(path = %self.path, "Database configured with WAL mode");

        Ok(())
    }

    /// Open a separate connection to the same database for a background job.
    ///
    /// In-memory databases cannot be reopened, so they share this handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the new connection cannot be opened.
    pub fn worker_handle(&self) -> Result<Self> {
        if self.path == IN_MEMORY {
            Ok(self.clone())
        } else {
            Self::open(&self.path)
        }
    }

    /// Set how long a statement waits on a locked database before failing
    /// with a busy error.
    ///
    /// # Errors
    ///
    /// Returns an error if the pragma cannot be applied.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn.lock().busy_timeout(timeout)?;
        tracing::debug!(path = %self.path, timeout_ms = timeout.as_millis(), "Busy timeout updated");
        Ok(())
    }

    /// Execute a function with exclusive database access.
    ///
    /// # Errors
    ///
    /// Returns an error if the function fails.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a function that may modify the database.
    ///
    /// Wraps the operation in an immediate transaction. Any error rolls the
    /// whole transaction back.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails or if the function fails.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();

        conn.execute_batch("BEGIN IMMEDIATE")?;

        match f(&conn) {
            Ok(result) => {
                if let Err(e) = conn.execute_batch("COMMIT") {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e.into());
                }
                Ok(result)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Get the database path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Check if the database is healthy.
    ///
    /// # Errors
    ///
    /// Returns an error if the health check fails.
    pub fn health_check(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use tempfile::TempDir;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.path(), ":memory:");
        db.health_check().unwrap();
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("dirs").join("test.db");

        let db = Database::open(&path).unwrap();
        assert!(path.exists());
        db.health_check().unwrap();
    }

    #[test]
    fn test_with_transaction_commit() {
        let db = Database::open_in_memory().unwrap();

        db.with_conn(|conn| {
            conn.execute("CREATE TABLE test (id INTEGER PRIMARY KEY)", [])?;
            Ok(())
        })
        .unwrap();

        db.with_transaction(|conn| {
            conn.execute("INSERT INTO test (id) VALUES (1)", [])?;
            Ok(())
        })
        .unwrap();

        let count: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM test", [], |row| row.get(0))?))
            .unwrap();

        assert_eq!(count, 1);
    }

    #[test]
    fn test_with_transaction_rollback() {
        let db = Database::open_in_memory().unwrap();

        db.with_conn(|conn| {
            conn.execute("CREATE TABLE test (id INTEGER PRIMARY KEY)", [])?;
            Ok(())
        })
        .unwrap();

        let result: Result<()> = db.with_transaction(|conn| {
            conn.execute("INSERT INTO test (id) VALUES (1)", [])?;
            Err(crate::Error::internal("simulated failure"))
        });

        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM test", [], |row| row.get(0))?))
            .unwrap();

        assert_eq!(count, 0);
    }

    #[test]
    fn test_worker_handle_in_memory_shares_connection() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute_batch("CREATE TABLE test (id INTEGER); INSERT INTO test VALUES (7);")?;
            Ok(())
        })
        .unwrap();

        let worker = db.worker_handle().unwrap();
        let value: i64 = worker
            .with_conn(|conn| Ok(conn.query_row("SELECT id FROM test", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_lock_contention_surfaces_busy() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("busy.db");

        let holder = Database::open(&path).unwrap();
        holder
            .with_conn(|conn| {
                conn.execute_batch("CREATE TABLE test (id INTEGER)")?;
                Ok(())
            })
            .unwrap();

        let contender = holder.worker_handle().unwrap();
        contender.set_busy_timeout(Duration::ZERO).unwrap();

        let result: Result<()> = holder.with_transaction(|_| {
            contender.with_transaction(|conn| {
                conn.execute("INSERT INTO test VALUES (1)", [])?;
                Ok(())
            })
        });

        assert!(matches!(
            result,
            Err(Error::Storage(StorageError::Busy(_)))
        ));
    }
}
