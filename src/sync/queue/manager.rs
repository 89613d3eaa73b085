//! Sync queue storage and management.
//!
//! The queue is the `sync_queue` table itself; there is no separate in-memory
//! copy. Dispatch order is `priority DESC, created_at ASC` with the insertion
//! sequence breaking ties, so ordering survives restarts unchanged.

use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use rand::Rng;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::operation::{NewOperation, OperationKind, OperationStatus, QueueBatch, SyncOperation};
use crate::config::QueueConfig;
use crate::core::datetime;
use crate::error::SyncError;
use crate::storage::Database;

const COLUMNS: &str = "id, kind, entity_type, entity_id, payload, priority, created_at, \
                       retry_count, last_attempt_at, next_attempt_at, last_error, status, completed_at";

/// Durable, priority-ordered operation queue.
#[derive(Debug, Clone)]
pub struct SyncQueueManager {
    db: Database,
    config: QueueConfig,
}

impl SyncQueueManager {
    /// Create a queue manager over an existing database.
    #[must_use]
    pub const fn new(db: Database, config: QueueConfig) -> Self {
        Self { db, config }
    }

    #[must_use]
    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Recover from an interrupted cycle and drop expired history.
    ///
    /// Operations left `processing` by a crash are returned to `pending`.
    /// Returns the number of recovered operations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be updated.
    pub fn initialize(&self) -> Result<usize, SyncError> {
        let recovered = self.release_processing()?;
        let purged = self.purge_completed()?;
        info!(recovered, purged, "sync queue initialized");
        Ok(recovered)
    }

    /// Return every `processing` operation to `pending` without touching
    /// its retry budget. Returns how many were released.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be updated.
    pub fn release_processing(&self) -> Result<usize, SyncError> {
        let released = self.db.with_connection(|conn| {
            conn.execute(
                "UPDATE sync_queue SET status = 'pending' WHERE status = 'processing'",
                [],
            )
            .map_err(|e| SyncError::Database(format!("Failed to release operations: {e}")))
        })?;
        if released > 0 {
            warn!(count = released, "released operations interrupted mid-cycle");
        }
        Ok(released)
    }

    /// Validate and persist a new operation.
    ///
    /// When the queue is at capacity, old completed entries and then the
    /// lowest-priority failed entries are pruned first. Insertion always
    /// proceeds.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Validation` for malformed operations, or a database
    /// error if the insert fails.
    pub fn enqueue(&self, new: NewOperation) -> Result<SyncOperation, SyncError> {
        new.validate()?;

        let operation = SyncOperation {
            id: Uuid::new_v4().to_string(),
            kind: new.kind,
            entity_type: new.entity_type,
            entity_id: new.entity_id,
            payload: new.payload,
            priority: new.priority,
            created_at: datetime::now(),
            retry_count: 0,
            last_attempt_at: None,
            next_attempt_at: None,
            last_error: None,
            status: OperationStatus::Pending,
            completed_at: None,
        };
        let payload = serde_json::to_string(&operation.payload)?;
        let max = self.config.max_queue_size;

        let pruned = self.db.with_transaction(|tx| {
            let pruned = prune_for_capacity(tx, max)?;
            tx.execute(
                r"INSERT INTO sync_queue (id, kind, entity_type, entity_id, payload, priority,
                                          created_at, retry_count, status)
                  VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 'pending')",
                params![
                    operation.id,
                    operation.kind.to_string(),
                    operation.entity_type,
                    operation.entity_id,
                    payload,
                    operation.priority,
                    datetime::to_sql(operation.created_at),
                ],
            )
            .map_err(|e| SyncError::Database(format!("Failed to enqueue operation: {e}")))?;
            Ok(pruned)
        })?;

        if pruned > 0 {
            warn!(pruned, max, "queue at capacity, pruned history");
        }
        debug!(
            id = %operation.id,
            entity = %operation.entity_id,
            priority = operation.priority,
            "operation enqueued"
        );
        Ok(operation)
    }

    /// Select the next batch using the configured batch size.
    ///
    /// Ordering is by priority among operations that are ready now. An
    /// operation waiting out a retry backoff is skipped, so lower-priority
    /// ready operations may be sent before it.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_next_batch(&self) -> Result<Option<QueueBatch>, SyncError> {
        self.next_batch_with(self.config.batch_size, 1)
    }

    /// Select the next batch, considering only operations of at least
    /// `min_priority`.
    ///
    /// Urgent operations (at or above the high-priority threshold) are
    /// returned in small groups of their own and never folded into a bulk
    /// batch. With batching disabled exactly one operation is returned.
    /// Operations still waiting out a retry backoff are not eligible, so the
    /// priority ordering only holds among operations whose backoff has
    /// elapsed.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn next_batch_with(
        &self,
        batch_size: usize,
        min_priority: u8,
    ) -> Result<Option<QueueBatch>, SyncError> {
        let limit = if self.config.batching_enabled {
            batch_size.max(self.config.urgent_batch_size).max(1)
        } else {
            1
        };
        let now = datetime::to_sql(Utc::now());

        let candidates = self.db.with_connection(|conn| {
            query_operations(
                conn,
                &format!(
                    r"SELECT {COLUMNS} FROM sync_queue
                      WHERE status = 'pending'
                        AND priority >= ?1
                        AND (next_attempt_at IS NULL OR next_attempt_at <= ?2)
                      ORDER BY priority DESC, created_at ASC, seq ASC
                      LIMIT ?3"
                ),
                params![min_priority, now, i64::try_from(limit).unwrap_or(i64::MAX)],
            )
        })?;

        let Some(head_priority) = candidates.first().map(|op| op.priority) else {
            return Ok(None);
        };

        let selected: Vec<SyncOperation> = if !self.config.batching_enabled {
            candidates.into_iter().take(1).collect()
        } else if head_priority >= self.config.high_priority_threshold {
            let threshold = self.config.high_priority_threshold;
            candidates
                .into_iter()
                .take_while(|op| op.priority >= threshold)
                .take(self.config.urgent_batch_size.max(1))
                .collect()
        } else {
            candidates.into_iter().take(batch_size.max(1)).collect()
        };

        Ok(QueueBatch::from_operations(selected))
    }

    /// Mark every operation in `batch` as `processing`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn mark_batch_processing(&self, batch: &QueueBatch) -> Result<(), SyncError> {
        let now = datetime::to_sql(Utc::now());
        self.db.with_transaction(|tx| {
            for op in &batch.operations {
                tx.execute(
                    r"UPDATE sync_queue SET status = 'processing', last_attempt_at = ?1
                      WHERE id = ?2 AND status = 'pending'",
                    params![now, op.id],
                )
                .map_err(|e| SyncError::Database(format!("Failed to mark operation processing: {e}")))?;
            }
            Ok(())
        })
    }

    /// Move an operation into the completed history.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::NotFound` if no such operation exists.
    pub fn mark_operation_completed(&self, id: &str) -> Result<(), SyncError> {
        let now = datetime::to_sql(Utc::now());
        let limit = i64::try_from(self.config.completed_history_limit).unwrap_or(i64::MAX);

        self.db.with_transaction(|tx| {
            let rows = tx
                .execute(
                    r"UPDATE sync_queue SET status = 'completed', completed_at = ?1,
                      next_attempt_at = NULL, last_error = NULL
                      WHERE id = ?2",
                    params![now, id],
                )
                .map_err(|e| SyncError::Database(format!("Failed to mark operation completed: {e}")))?;
            if rows == 0 {
                return Err(SyncError::NotFound(format!("operation {id}")));
            }

            tx.execute(
                r"DELETE FROM sync_queue WHERE status = 'completed' AND seq NOT IN (
                    SELECT seq FROM sync_queue WHERE status = 'completed'
                    ORDER BY completed_at DESC, seq DESC LIMIT ?1)",
                [limit],
            )
            .map_err(|e| SyncError::Database(format!("Failed to trim completed history: {e}")))?;
            Ok(())
        })
    }

    /// Record a failed attempt.
    ///
    /// Returns `true` if the operation was requeued for another attempt, or
    /// `false` if it exhausted its retries and is now terminally `failed`.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::NotFound` if no such operation exists.
    pub fn mark_operation_failed(&self, id: &str, error: &str) -> Result<bool, SyncError> {
        let mut operation = self
            .get(id)?
            .ok_or_else(|| SyncError::NotFound(format!("operation {id}")))?;

        operation.retry_count += 1;
        let will_retry = operation.retry_count < self.config.max_retry_attempts;
        let now = Utc::now();

        let (status, next_attempt_at) = if will_retry {
            let delay = chrono::Duration::from_std(self.get_retry_delay(&operation))
                .unwrap_or_else(|_| chrono::Duration::zero());
            (OperationStatus::Pending, Some(now + delay))
        } else {
            (OperationStatus::Failed, None)
        };

        self.db.with_connection(|conn| {
            conn.execute(
                r"UPDATE sync_queue SET status = ?1, retry_count = ?2, last_attempt_at = ?3,
                  next_attempt_at = ?4, last_error = ?5
                  WHERE id = ?6",
                params![
                    status.to_string(),
                    operation.retry_count,
                    datetime::to_sql(now),
                    datetime::opt_to_sql(next_attempt_at),
                    error,
                    id,
                ],
            )
            .map_err(|e| SyncError::Database(format!("Failed to mark operation failed: {e}")))
        })?;

        if will_retry {
            debug!(id, retry = operation.retry_count, "operation requeued");
        } else {
            warn!(id, attempts = operation.retry_count, error, "operation failed permanently");
        }
        Ok(will_retry)
    }

    /// Exponential backoff without jitter: `base * 2^(retry_count - 1)`.
    #[must_use]
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1);
        let factor = 2u64.checked_pow(exponent).unwrap_or(u64::MAX);
        Duration::from_millis(self.config.retry_base_delay_ms.saturating_mul(factor))
    }

    /// Backoff for `op` plus random jitter.
    #[must_use]
    pub fn get_retry_delay(&self, op: &SyncOperation) -> Duration {
        let jitter = if self.config.retry_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.config.retry_jitter_ms)
        };
        self.backoff_delay(op.retry_count)
            .saturating_add(Duration::from_millis(jitter))
    }

    /// Get queue statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_stats(&self) -> Result<QueueStats, SyncError> {
        let midnight = datetime::to_sql(datetime::local_midnight_utc(Local::now()));

        self.db.with_connection(|conn| {
            let count = |status: &str| -> Result<usize, SyncError> {
                let n: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM sync_queue WHERE status = ?1",
                        [status],
                        |row| row.get(0),
                    )
                    .map_err(|e| SyncError::Database(format!("Failed to count {status}: {e}")))?;
                Ok(usize::try_from(n).unwrap_or_default())
            };

            let pending = count("pending")?;
            let processing = count("processing")?;
            let failed = count("failed")?;

            let completed_today: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sync_queue WHERE status = 'completed' AND completed_at >= ?1",
                    [&midnight],
                    |row| row.get(0),
                )
                .map_err(|e| SyncError::Database(format!("Failed to count completed: {e}")))?;

            let queue_bytes: i64 = conn
                .query_row(
                    r"SELECT COALESCE(SUM(LENGTH(payload) + LENGTH(id) + LENGTH(entity_type)
                                          + LENGTH(entity_id) + 160), 0)
                      FROM sync_queue WHERE status != 'completed'",
                    [],
                    |row| row.get(0),
                )
                .map_err(|e| SyncError::Database(format!("Failed to size queue: {e}")))?;

            let oldest_pending: Option<String> = conn
                .query_row(
                    "SELECT created_at FROM sync_queue WHERE status = 'pending' ORDER BY created_at ASC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| SyncError::Database(format!("Failed to get oldest pending: {e}")))?;

            Ok(QueueStats {
                total: pending + processing + failed,
                pending,
                processing,
                failed,
                completed_today: usize::try_from(completed_today).unwrap_or_default(),
                queue_bytes: usize::try_from(queue_bytes).unwrap_or_default(),
                oldest_pending: oldest_pending.as_deref().and_then(datetime::from_sql),
            })
        })
    }

    /// Get a specific operation by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, id: &str) -> Result<Option<SyncOperation>, SyncError> {
        self.db.with_connection(|conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM sync_queue WHERE id = ?1"),
                [id],
                row_to_operation,
            )
            .optional()
            .map_err(|e| SyncError::Database(format!("Failed to query operation: {e}")))
        })
    }

    /// List operations in dispatch order, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(
        &self,
        status: Option<OperationStatus>,
        limit: usize,
    ) -> Result<Vec<SyncOperation>, SyncError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db.with_connection(|conn| match status {
            Some(status) => query_operations(
                conn,
                &format!(
                    r"SELECT {COLUMNS} FROM sync_queue WHERE status = ?1
                      ORDER BY priority DESC, created_at ASC, seq ASC LIMIT ?2"
                ),
                params![status.to_string(), limit],
            ),
            None => query_operations(
                conn,
                &format!(
                    r"SELECT {COLUMNS} FROM sync_queue
                      ORDER BY priority DESC, created_at ASC, seq ASC LIMIT ?1"
                ),
                params![limit],
            ),
        })
    }

    /// Return terminally failed operations to `pending` with a fresh retry
    /// budget. With `id = None` every failed operation is retried.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn retry_failed(&self, id: Option<&str>) -> Result<usize, SyncError> {
        let sql = r"UPDATE sync_queue SET status = 'pending', retry_count = 0, next_attempt_at = NULL
                    WHERE status = 'failed'";
        let rows = self.db.with_connection(|conn| {
            let updated = match id {
                Some(id) => conn.execute(&format!("{sql} AND id = ?1"), [id]),
                None => conn.execute(sql, []),
            };
            updated.map_err(|e| SyncError::Database(format!("Failed to retry operations: {e}")))
        })?;
        info!(count = rows, "failed operations requeued");
        Ok(rows)
    }

    /// Delete completed operations older than the retention window.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn purge_completed(&self) -> Result<usize, SyncError> {
        let cutoff = Utc::now() - chrono::Duration::hours(self.config.completed_retention_hours);
        self.db.with_connection(|conn| {
            conn.execute(
                "DELETE FROM sync_queue WHERE status = 'completed' AND completed_at < ?1",
                [datetime::to_sql(cutoff)],
            )
            .map_err(|e| SyncError::Database(format!("Failed to purge operations: {e}")))
        })
    }

    /// Clear all operations.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn clear(&self) -> Result<(), SyncError> {
        self.db.with_connection(|conn| {
            conn.execute("DELETE FROM sync_queue", [])
                .map_err(|e| SyncError::Database(format!("Failed to clear queue: {e}")))?;
            Ok(())
        })
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Operations not yet completed
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    /// Operations that exhausted their retries
    pub failed: usize,
    /// Completed since local midnight
    pub completed_today: usize,
    /// Approximate serialized size of the active queue
    pub queue_bytes: usize,
    pub oldest_pending: Option<DateTime<Utc>>,
}

fn prune_for_capacity(conn: &Connection, max: usize) -> Result<usize, SyncError> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))
        .map_err(|e| SyncError::Database(format!("Failed to count queue: {e}")))?;
    let max = i64::try_from(max).unwrap_or(i64::MAX);
    let mut excess = count - max + 1;
    if excess <= 0 {
        return Ok(0);
    }

    let mut pruned = 0;
    for sql in [
        r"DELETE FROM sync_queue WHERE seq IN (
            SELECT seq FROM sync_queue WHERE status = 'completed'
            ORDER BY completed_at ASC, seq ASC LIMIT ?1)",
        r"DELETE FROM sync_queue WHERE seq IN (
            SELECT seq FROM sync_queue WHERE status = 'failed'
            ORDER BY priority ASC, created_at ASC, seq ASC LIMIT ?1)",
    ] {
        if excess <= 0 {
            break;
        }
        let rows = conn
            .execute(sql, [excess])
            .map_err(|e| SyncError::Database(format!("Failed to prune queue: {e}")))?;
        excess -= i64::try_from(rows).unwrap_or(excess);
        pruned += rows;
    }
    Ok(pruned)
}

fn query_operations<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<SyncOperation>, SyncError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| SyncError::Database(format!("Failed to prepare query: {e}")))?;

    let rows = stmt
        .query_map(params, row_to_operation)
        .map_err(|e| SyncError::Database(format!("Failed to query operations: {e}")))?;

    let mut operations = Vec::new();
    for row in rows {
        operations.push(row.map_err(|e| SyncError::Database(e.to_string()))?);
    }
    Ok(operations)
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        Type::Text,
        Box::new(SyncError::Validation(message)),
    )
}

fn row_to_operation(row: &Row<'_>) -> Result<SyncOperation, rusqlite::Error> {
    let kind_str: String = row.get(1)?;
    let payload_str: String = row.get(4)?;
    let created_at_str: String = row.get(6)?;
    let last_attempt_str: Option<String> = row.get(8)?;
    let next_attempt_str: Option<String> = row.get(9)?;
    let status_str: String = row.get(11)?;
    let completed_str: Option<String> = row.get(12)?;

    let kind = OperationKind::parse(&kind_str)
        .ok_or_else(|| conversion_error(1, format!("unknown operation kind {kind_str}")))?;
    let status = OperationStatus::parse(&status_str)
        .ok_or_else(|| conversion_error(11, format!("unknown operation status {status_str}")))?;
    let payload = serde_json::from_str(&payload_str)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

    Ok(SyncOperation {
        id: row.get(0)?,
        kind,
        entity_type: row.get(2)?,
        entity_id: row.get(3)?,
        payload,
        priority: row.get(5)?,
        created_at: datetime::from_sql(&created_at_str).unwrap_or_else(Utc::now),
        retry_count: row.get(7)?,
        last_attempt_at: last_attempt_str.as_deref().and_then(datetime::from_sql),
        next_attempt_at: next_attempt_str.as_deref().and_then(datetime::from_sql),
        last_error: row.get(10)?,
        status,
        completed_at: completed_str.as_deref().and_then(datetime::from_sql),
    })
}
