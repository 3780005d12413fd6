//! Tests for error types.

#[cfg(test)]
mod tests {
    use super::super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config("invalid batch size");
        assert_eq!(err.to_string(), "configuration error: invalid batch size");
    }

    #[test]
    fn test_storage_error_not_found() {
        let err = StorageError::not_found("item", "A/1.jpg");
        assert_eq!(err.to_string(), "not found: item with id 'A/1.jpg'");
    }

    #[test]
    fn test_storage_error_conversion() {
        let storage_err = StorageError::Database("connection failed".to_string());
        let err: Error = storage_err.into();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[test]
    fn test_watcher_error_conversion() {
        let watch_err = WatcherError::WatchFailed {
            path: "/tmp/test".to_string(),
            reason: "permission denied".to_string(),
        };
        let err: Error = watch_err.into();
        assert!(matches!(err, Error::Watcher(_)));
    }

    #[test]
    fn test_builder_error_conversion() {
        let err: Error = BuilderError::Busy("rebuild".to_string()).into();
        assert!(matches!(err, Error::Builder(BuilderError::Busy(_))));
        assert_eq!(
            err.to_string(),
            "builder error: index builder busy: rebuild in progress"
        );
    }

    #[test]
    fn test_cache_error_display() {
        let err = CacheError::ScanLimit {
            pattern: "route:*".to_string(),
            iterations: 1000,
        };
        assert_eq!(
            err.to_string(),
            "cache scan for 'route:*' stopped after 1000 pages"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_rusqlite_constraint_maps_to_constraint() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .unwrap();
        conn.execute("INSERT INTO t (id) VALUES (1)", []).unwrap();
        let raw = conn.execute("INSERT INTO t (id) VALUES (1)", []).unwrap_err();

        let err: Error = raw.into();
        assert!(matches!(err, Error::Storage(StorageError::Constraint(_))));
    }

    #[test]
    fn test_rusqlite_syntax_maps_to_database() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let raw = conn.execute_batch("SELEKT nonsense").unwrap_err();

        let err: StorageError = raw.into();
        assert!(matches!(err, StorageError::Database(_)));
    }

    #[test]
    fn test_rusqlite_busy_maps_to_busy() {
        let raw = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        assert!(matches!(StorageError::from(raw), StorageError::Busy(_)));
    }

    #[test]
    fn test_error_internal() {
        let err = Error::internal("test internal error");
        assert_eq!(err.to_string(), "internal error: test internal error");
    }

    #[test]
    fn test_error_propagation_with_question_mark() {
        fn inner() -> Result<i32> {
            Err(Error::config("inner error"))
        }

        fn outer() -> Result<i32> {
            let _ = inner()?;
            Ok(0)
        }

        let result = outer();
        assert_eq!(
            result.unwrap_err().to_string(),
            "configuration error: inner error"
        );
    }
}
