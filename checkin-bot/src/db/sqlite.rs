//! SQLite database - schema definitions and connection management
//!
//! This file contains:
//! - Database struct definition
//! - Connection management (new, init)
//! - Schema creation
//!
//! All record operations are in the tables/ subdirectory.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::StorageError;

/// Main database wrapper; one connection serialized behind a Mutex
pub struct Database {
    pub(crate) conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file and initialize schema
    pub fn new(database_url: &str) -> Result<Self, StorageError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = Path::new(database_url).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(database_url)?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests
    #[cfg(test)]
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Initialize all database tables
    fn init(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        // Check-in records, one row per (target, period)
        conn.execute(
            "CREATE TABLE IF NOT EXISTS checkin_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_key TEXT NOT NULL,
                period TEXT NOT NULL,
                status TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                failure_kind TEXT,
                message TEXT,
                credits_delta INTEGER,
                credits_after INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(target_key, period)
            )",
            [],
        )?;

        // Migration: credit columns were added after the first release
        for (column, definition) in [("credits_delta", "INTEGER"), ("credits_after", "INTEGER")] {
            let has_column: bool = conn
                .query_row(
                    "SELECT COUNT(*) FROM pragma_table_info('checkin_records') WHERE name = ?1",
                    [column],
                    |row| row.get::<_, i64>(0),
                )
                .map(|c| c > 0)?;

            if !has_column {
                log::info!("[STORE] Adding column checkin_records.{}", column);
                conn.execute(&format!("ALTER TABLE checkin_records ADD COLUMN {} {}", column, definition), [])?;
            }
        }

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_checkin_records_period ON checkin_records(period)",
            [],
        )?;

        // Site sessions (only written when session persistence is enabled)
        conn.execute(
            "CREATE TABLE IF NOT EXISTS site_sessions (
                target_key TEXT PRIMARY KEY,
                cookie TEXT NOT NULL,
                obtained_at TEXT NOT NULL,
                expires_at TEXT
            )",
            [],
        )?;

        log::debug!("[STORE] Schema ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_missing_data_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data").join("checkin.db");

        let db = Database::new(path.to_str().unwrap());
        assert!(db.is_ok());
        assert!(path.exists());
    }

    #[test]
    fn test_reopen_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkin.db");
        let path = path.to_str().unwrap();

        drop(Database::new(path).unwrap());
        assert!(Database::new(path).is_ok());
    }

    #[test]
    fn test_old_schema_gains_credit_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE checkin_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_key TEXT NOT NULL,
                period TEXT NOT NULL,
                status TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                failure_kind TEXT,
                message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(target_key, period)
            )",
            [],
        )
        .unwrap();

        let db = Database::from_connection(conn).unwrap();
        let conn = db.conn().unwrap();
        let columns: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('checkin_records') WHERE name LIKE 'credits_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(columns, 2);
    }

    #[test]
    fn test_garbage_file_is_reported_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkin.db");
        std::fs::write(&path, vec![0x42u8; 4096]).unwrap();

        match Database::new(path.to_str().unwrap()) {
            Err(StorageError::Corrupt(_)) => {}
            Err(other) => panic!("expected Corrupt, got {:?}", other),
            Ok(_) => panic!("expected Corrupt, got a usable database"),
        }
    }

    #[test]
    fn test_unwritable_data_directory_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the parent directory should be
        let blocker = dir.path().join("data");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let path = blocker.join("checkin.db");

        assert!(matches!(
            Database::new(path.to_str().unwrap()),
            Err(StorageError::Io(_))
        ));
    }
}
