//! `SQLite` database connection and document store.
//!
//! The database is stored at `~/.medsync/medsync.db` and contains tables for:
//! - The operation queue
//! - Per-entity delta state (timestamps, checksums, pending changes, failures)
//! - Conflicts awaiting resolution and the resolution log
//! - Sync history
//! - Keyed JSON documents (status, configuration, checkpoints, diagnostics)
//!
//! [`Database`] is a cheap, cloneable handle. Every component receives its own
//! clone; the connection lock is only held for the duration of a closure and
//! never across an await point.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::Paths;
use crate::core::datetime;
use crate::error::SyncError;

use super::migrations;

/// Shared database handle.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open the database at the default location.
    ///
    /// Creates the database file and runs migrations if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub fn open() -> Result<Self, SyncError> {
        let paths = Paths::new()?;
        paths.ensure_dirs()?;
        Self::open_at(&paths.database)
    }

    /// Open the database at a specific path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub fn open_at(path: &std::path::Path) -> Result<Self, SyncError> {
        let conn = Connection::open(path).map_err(|e| {
            SyncError::Database(format!("Failed to open database {}: {e}", path.display()))
        })?;

        // WAL keeps readers (the CLI) from blocking the sync process.
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .map_err(|e| SyncError::Database(format!("Failed to configure database: {e}")))?;

        Self::from_connection(conn)
    }

    /// Open an in-memory database (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub fn open_in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            SyncError::Database(format!("Failed to open in-memory database: {e}"))
        })?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| SyncError::Database(format!("Failed to enable foreign keys: {e}")))?;

        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, SyncError> {
        migrations::run(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Get the current schema version.
    ///
    /// # Errors
    ///
    /// Returns an error if the version cannot be read.
    pub fn schema_version(&self) -> Result<i32, SyncError> {
        self.with_connection(migrations::get_version)
    }

    /// Run `f` with exclusive access to the connection.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns.
    pub fn with_connection<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&Connection) -> Result<T, SyncError>,
    {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn)
    }

    /// Run `f` inside a transaction, committing if it succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction cannot be started or committed,
    /// or whatever `f` returns (in which case the transaction rolls back).
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, SyncError>,
    {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn
            .transaction()
            .map_err(|e| SyncError::Database(format!("Failed to begin transaction: {e}")))?;
        let value = f(&tx)?;
        tx.commit()
            .map_err(|e| SyncError::Database(format!("Failed to commit transaction: {e}")))?;
        Ok(value)
    }

    /// Read a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the stored JSON does not
    /// deserialize into `T`.
    pub fn get_document<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, SyncError> {
        let raw: Option<String> = self.with_connection(|conn| {
            conn.query_row("SELECT value FROM documents WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| SyncError::Database(format!("Failed to read document {key}: {e}")))
        })?;

        raw.map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(SyncError::from)
    }

    /// Write a JSON document, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn put_document<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), SyncError> {
        let json = serde_json::to_string(value)?;
        self.with_connection(|conn| {
            conn.execute(
                r"INSERT INTO documents (key, value, updated_at) VALUES (?1, ?2, ?3)
                  ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, json, datetime::to_sql(Utc::now())],
            )
            .map_err(|e| SyncError::Database(format!("Failed to write document {key}: {e}")))?;
            Ok(())
        })
    }

    /// Delete a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete_document(&self, key: &str) -> Result<bool, SyncError> {
        self.with_connection(|conn| {
            let rows = conn
                .execute("DELETE FROM documents WHERE key = ?1", [key])
                .map_err(|e| SyncError::Database(format!("Failed to delete document {key}: {e}")))?;
            Ok(rows > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Checkpoint {
        cursor: u32,
    }

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.schema_version().unwrap() > 0);
    }

    #[test]
    fn test_open_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let db = Database::open_at(&db_path).unwrap();
        assert!(db.schema_version().unwrap() > 0);
        assert!(db_path.exists());
    }

    #[test]
    fn test_document_round_trip() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_document::<Checkpoint>("cp").unwrap().is_none());

        db.put_document("cp", &Checkpoint { cursor: 1 }).unwrap();
        db.put_document("cp", &Checkpoint { cursor: 2 }).unwrap();
        assert_eq!(
            db.get_document::<Checkpoint>("cp").unwrap(),
            Some(Checkpoint { cursor: 2 })
        );

        assert!(db.delete_document("cp").unwrap());
        assert!(!db.delete_document("cp").unwrap());
    }

    #[test]
    fn test_documents_survive_reopen() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        {
            let db = Database::open_at(&db_path).unwrap();
            db.put_document("cp", &Checkpoint { cursor: 7 }).unwrap();
        }

        let db = Database::open_at(&db_path).unwrap();
        assert_eq!(
            db.get_document::<Checkpoint>("cp").unwrap(),
            Some(Checkpoint { cursor: 7 })
        );
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<(), SyncError> = db.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO documents (key, value, updated_at) VALUES ('k', '1', 'now')",
                [],
            )?;
            Err(SyncError::Validation("abort".to_string()))
        });
        assert!(result.is_err());
        assert!(db.get_document::<u32>("k").unwrap().is_none());
    }
}
