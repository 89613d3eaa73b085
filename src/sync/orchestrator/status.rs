//! Persisted status snapshot and bounded sync history.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::result::SyncResult;
use crate::config::QueueConfig;
use crate::core::datetime;
use crate::error::SyncError;
use crate::storage::{keys, Database};
use crate::sync::conflict::ConflictStore;
use crate::sync::queue::SyncQueueManager;

/// Overall sync status, stored as the `sync_status` document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncStatus {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    pub last_strategy: Option<String>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub total_syncs: u64,
    pub in_progress: bool,

    // Live counts, filled in when the status is read
    pub pending_operations: usize,
    pub failed_operations: usize,
    pub pending_conflicts: usize,
}

impl SyncStatus {
    /// Read the stored status and fill in live counts.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be read.
    pub fn load(db: &Database) -> Result<Self, SyncError> {
        let mut status: Self = db.get_document(keys::SYNC_STATUS)?.unwrap_or_default();
        let stats = SyncQueueManager::new(db.clone(), QueueConfig::default()).get_stats()?;
        status.pending_operations = stats.pending + stats.processing;
        status.failed_operations = stats.failed;
        status.pending_conflicts = ConflictStore::new(db.clone()).count()?;
        Ok(status)
    }

    pub(crate) fn save(&self, db: &Database) -> Result<(), SyncError> {
        db.put_document(keys::SYNC_STATUS, self)
    }

    /// Fold a finished cycle into the status.
    pub(crate) fn record(&mut self, result: &SyncResult) {
        self.last_sync_at = Some(result.finished_at);
        self.last_strategy = Some(result.strategy.clone());
        self.total_syncs += 1;
        self.in_progress = false;
        if result.success {
            self.last_successful_sync_at = Some(result.finished_at);
            self.last_error = None;
            self.consecutive_failures = 0;
        } else {
            self.last_error = result.errors.last().cloned();
            self.consecutive_failures += 1;
        }
    }
}

/// Most recent sync results, newest first.
#[derive(Debug, Clone)]
pub struct SyncHistory {
    db: Database,
}

impl SyncHistory {
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a result and drop anything beyond the newest `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn append(&self, result: &SyncResult, limit: usize) -> Result<(), SyncError> {
        let json = serde_json::to_string(result)?;
        let keep = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        self.db.with_transaction(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO sync_history (id, started_at, result) VALUES (?1, ?2, ?3)",
                params![result.id, datetime::to_sql(result.started_at), json],
            )
            .map_err(|e| SyncError::Database(format!("Failed to record sync result: {e}")))?;
            tx.execute(
                r"DELETE FROM sync_history WHERE id NOT IN (
                    SELECT id FROM sync_history ORDER BY started_at DESC, rowid DESC LIMIT ?1
                  )",
                [keep],
            )
            .map_err(|e| SyncError::Database(format!("Failed to trim sync history: {e}")))?;
            Ok(())
        })
    }

    /// Up to `limit` results, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a stored result is corrupt.
    pub fn list(&self, limit: usize) -> Result<Vec<SyncResult>, SyncError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<String> = self.db.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT result FROM sync_history ORDER BY started_at DESC, rowid DESC LIMIT ?1")
                .map_err(|e| SyncError::Database(format!("Failed to prepare query: {e}")))?;
            let mapped = stmt
                .query_map([limit], |row| row.get(0))
                .map_err(|e| SyncError::Database(format!("Failed to query sync history: {e}")))?;
            mapped
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| SyncError::Database(e.to_string()))
        })?;

        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(SyncError::from))
            .collect()
    }

    /// Number of stored results.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count(&self) -> Result<usize, SyncError> {
        self.db.with_connection(|conn| {
            let n: i64 = conn
                .query_row("SELECT COUNT(*) FROM sync_history", [], |row| row.get(0))
                .map_err(|e| SyncError::Database(format!("Failed to count history: {e}")))?;
            Ok(usize::try_from(n).unwrap_or_default())
        })
    }
}
