//! Delta sync engine.
//!
//! Only the latest local state per entity is kept in `pending_changes`; it is
//! removed once the server accepts it. Uploads that fail move to
//! `failed_syncs` with an attempt count. The checkpoint in the `sync_state`
//! document only moves when a cycle has finished and its download succeeded.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::entity::SyncEntity;
use crate::config::IncrementalConfig;
use crate::core::datetime;
use crate::error::SyncError;
use crate::storage::{keys, Database};
use crate::sync::conflict::SyncConflict;
use crate::sync::queue::{DEFAULT_PRIORITY, MIN_PRIORITY};
use crate::sync::transport::{with_timeout, SyncTransport};

#[derive(Debug, Default, Serialize, Deserialize)]
struct SyncCheckpoint {
    last_sync_timestamp: Option<DateTime<Utc>>,
}

/// Per-cycle knobs, usually derived from the selected strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaOptions {
    pub batch_size: usize,
    /// Changes tracked below this priority stay pending
    pub min_priority: u8,
    /// Whether to fetch server changes this cycle
    pub download: bool,
}

/// Outcome of one delta exchange.
#[derive(Debug, Clone, Default)]
pub struct DeltaSyncResult {
    /// Ids accepted by the server
    pub uploaded: Vec<String>,
    /// Server versions applied locally
    pub downloaded: Vec<SyncEntity>,
    /// Ids whose server version matched local state
    pub unchanged: Vec<String>,
    /// Newly detected conflicts; their server versions were not applied
    pub conflicts: Vec<SyncConflict>,
    /// Ids whose upload failed or was refused
    pub failed: Vec<String>,
    pub bytes_transferred: usize,
    pub duration: Duration,
    pub errors: Vec<String>,
    pub checkpoint_advanced: bool,
}

/// An upload that failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedSync {
    pub entity: SyncEntity,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// Result of [`IncrementalSyncEngine::validate_integrity`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub checked: usize,
    /// Ids whose stored checksum did not match their content
    pub repaired: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Delta,
    Full,
}

/// Tracks local changes and exchanges deltas with the server.
#[derive(Debug, Clone)]
pub struct IncrementalSyncEngine {
    db: Database,
    config: IncrementalConfig,
}

impl IncrementalSyncEngine {
    #[must_use]
    pub const fn new(db: Database, config: IncrementalConfig) -> Self {
        Self { db, config }
    }

    #[must_use]
    pub const fn config(&self) -> &IncrementalConfig {
        &self.config
    }

    /// Default options from configuration.
    #[must_use]
    pub const fn default_options(&self) -> DeltaOptions {
        DeltaOptions {
            batch_size: self.config.batch_size,
            min_priority: MIN_PRIORITY,
            download: true,
        }
    }

    /// When the last successful cycle started.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be read.
    pub fn last_sync_timestamp(&self) -> Result<Option<DateTime<Utc>>, SyncError> {
        Ok(self
            .db
            .get_document::<SyncCheckpoint>(keys::SYNC_STATE)?
            .and_then(|cp| cp.last_sync_timestamp))
    }

    fn set_last_sync_timestamp(&self, ts: DateTime<Utc>) -> Result<(), SyncError> {
        self.db.put_document(
            keys::SYNC_STATE,
            &SyncCheckpoint {
                last_sync_timestamp: Some(ts),
            },
        )
    }

    /// Record the latest local state of an entity at the default priority.
    ///
    /// Replaces any pending record for the same id; the version is one more
    /// than the highest version seen for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn track_entity_change(
        &self,
        id: &str,
        entity_type: &str,
        data: Value,
    ) -> Result<SyncEntity, SyncError> {
        self.track_entity_change_with_priority(id, entity_type, data, DEFAULT_PRIORITY)
    }

    /// Record the latest local state of an entity.
    ///
    /// A pending record keeps the higher of its priority and `priority`, so
    /// coalescing never makes a change less urgent.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn track_entity_change_with_priority(
        &self,
        id: &str,
        entity_type: &str,
        data: Value,
        priority: u8,
    ) -> Result<SyncEntity, SyncError> {
        let entity = self.stage(SyncEntity::new(id, entity_type, data), 0, false, Some(priority))?;
        debug!(id, version = entity.version, priority, "tracked entity change");
        Ok(entity)
    }

    /// Record a local deletion as a tombstone at the default priority.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn track_entity_deletion(&self, id: &str, entity_type: &str) -> Result<SyncEntity, SyncError> {
        self.track_entity_deletion_with_priority(id, entity_type, DEFAULT_PRIORITY)
    }

    /// Record a local deletion as a tombstone.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn track_entity_deletion_with_priority(
        &self,
        id: &str,
        entity_type: &str,
        priority: u8,
    ) -> Result<SyncEntity, SyncError> {
        let entity = self.stage(SyncEntity::tombstone(id, entity_type), 0, false, Some(priority))?;
        debug!(id, version = entity.version, priority, "tracked entity deletion");
        Ok(entity)
    }

    /// `None` priority inherits whatever the entity was last tracked with.
    fn stage(
        &self,
        mut entity: SyncEntity,
        floor_version: u64,
        release_hold: bool,
        priority: Option<u8>,
    ) -> Result<SyncEntity, SyncError> {
        self.db.with_transaction(|tx| {
            entity.version = prior_version(tx, &entity.id)?.max(floor_version) + 1;
            let priority = match priority {
                Some(priority) => priority,
                None => prior_priority(tx, &entity.id)?.unwrap_or(DEFAULT_PRIORITY),
            };
            let json = serde_json::to_string(&entity)?;
            tx.execute(
                r"INSERT INTO pending_changes (entity_id, entity, timestamp, attempts, held, priority)
                  VALUES (?1, ?2, ?3, 0, 0, ?5)
                  ON CONFLICT(entity_id) DO UPDATE SET
                    entity = excluded.entity,
                    timestamp = excluded.timestamp,
                    attempts = 0,
                    held = CASE WHEN ?4 THEN 0 ELSE held END,
                    priority = MAX(priority, excluded.priority)",
                params![entity.id, json, datetime::to_sql(entity.timestamp), release_hold, priority],
            )
            .map_err(|e| SyncError::Database(format!("Failed to track change: {e}")))?;
            tx.execute("DELETE FROM failed_syncs WHERE entity_id = ?1", [&entity.id])
                .map_err(|e| SyncError::Database(format!("Failed to clear failed sync: {e}")))?;
            Ok(())
        })?;
        Ok(entity)
    }

    /// The pending local state of one entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn pending_change(&self, id: &str) -> Result<Option<SyncEntity>, SyncError> {
        self.db.with_connection(|conn| read_entity(conn, "pending_changes", id))
    }

    /// Every pending change, including ones held by a conflict.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn pending_changes(&self) -> Result<Vec<SyncEntity>, SyncError> {
        self.query_pending("SELECT entity FROM pending_changes ORDER BY timestamp ASC, entity_id ASC", [])
    }

    /// Pending changes stamped after `since`, defaulting to the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_modified_entities(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SyncEntity>, SyncError> {
        match since.map_or_else(|| self.last_sync_timestamp(), |s| Ok(Some(s)))? {
            Some(since) => self.query_pending(
                r"SELECT entity FROM pending_changes WHERE timestamp > ?1
                  ORDER BY timestamp ASC, entity_id ASC",
                [datetime::to_sql(since)],
            ),
            None => self.pending_changes(),
        }
    }

    fn uploadable(&self, min_priority: u8) -> Result<Vec<SyncEntity>, SyncError> {
        self.query_pending(
            r"SELECT entity FROM pending_changes WHERE held = 0 AND priority >= ?1
              ORDER BY timestamp ASC, entity_id ASC",
            [min_priority],
        )
    }

    fn query_pending<P: Params>(&self, sql: &str, params: P) -> Result<Vec<SyncEntity>, SyncError> {
        let rows: Vec<String> = self.db.with_connection(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .map_err(|e| SyncError::Database(format!("Failed to prepare query: {e}")))?;
            let mapped = stmt
                .query_map(params, |row| row.get(0))
                .map_err(|e| SyncError::Database(format!("Failed to query pending changes: {e}")))?;
            mapped
                .collect::<Result<Vec<String>, _>>()
                .map_err(|e| SyncError::Database(e.to_string()))
        })?;
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(SyncError::from))
            .collect()
    }

    /// Uploads that failed, with their attempt counts.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn failed_syncs(&self) -> Result<Vec<FailedSync>, SyncError> {
        let rows: Vec<(String, String, u32, String)> = self.db.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT entity, error, attempts, failed_at FROM failed_syncs ORDER BY failed_at ASC",
                )
                .map_err(|e| SyncError::Database(format!("Failed to prepare query: {e}")))?;
            let mapped = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
                .map_err(|e| SyncError::Database(format!("Failed to query failed syncs: {e}")))?;
            mapped
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| SyncError::Database(e.to_string()))
        })?;

        rows.into_iter()
            .map(|(entity, error, attempts, failed_at)| {
                Ok(FailedSync {
                    entity: serde_json::from_str(&entity)?,
                    error,
                    attempts,
                    failed_at: datetime::from_sql(&failed_at).unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }

    /// Checksum of the last synchronized state of an entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn entity_checksum(&self, id: &str) -> Result<Option<String>, SyncError> {
        self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT checksum FROM entity_state WHERE entity_id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| SyncError::Database(format!("Failed to read entity state: {e}")))
        })
    }

    /// Run a delta cycle with default options.
    ///
    /// # Errors
    ///
    /// Returns an error only if local state cannot be read or written;
    /// transport failures are recorded on the result.
    pub async fn perform_incremental_sync(
        &self,
        transport: &dyn SyncTransport,
    ) -> Result<DeltaSyncResult, SyncError> {
        self.run(transport, self.default_options(), Pass::Delta).await
    }

    /// Run a delta cycle.
    ///
    /// # Errors
    ///
    /// Returns an error only if local state cannot be read or written.
    pub async fn perform_incremental_sync_with(
        &self,
        transport: &dyn SyncTransport,
        options: DeltaOptions,
    ) -> Result<DeltaSyncResult, SyncError> {
        self.run(transport, options, Pass::Delta).await
    }

    /// Upload everything pending and download the full server state,
    /// ignoring the checkpoint and checksum suppression.
    ///
    /// # Errors
    ///
    /// Returns an error only if local state cannot be read or written.
    pub async fn perform_full_sync(
        &self,
        transport: &dyn SyncTransport,
        options: DeltaOptions,
    ) -> Result<DeltaSyncResult, SyncError> {
        self.run(transport, options, Pass::Full).await
    }

    async fn run(
        &self,
        transport: &dyn SyncTransport,
        options: DeltaOptions,
        pass: Pass,
    ) -> Result<DeltaSyncResult, SyncError> {
        let started = Instant::now();
        let cycle_start = datetime::now();
        let checkpoint = self.last_sync_timestamp()?;
        let timeout = self.config.transport_timeout();
        let mut result = DeltaSyncResult::default();

        info!(?pass, since = ?checkpoint, "delta sync starting");

        // Upload
        let pending = self.uploadable(options.min_priority)?;
        debug!(count = pending.len(), min_priority = options.min_priority, "changes eligible for upload");
        for (index, chunk) in pending.chunks(options.batch_size.max(1)).enumerate() {
            match with_timeout(timeout, "upload", transport.upload(chunk)).await {
                Ok(accepted) => {
                    let accepted: HashMap<String, SyncEntity> =
                        accepted.into_iter().map(|e| (e.id.clone(), e)).collect();
                    for local in chunk {
                        if let Some(server) = accepted.get(&local.id) {
                            self.mark_uploaded(local, server)?;
                            result.bytes_transferred += local.estimated_size();
                            result.uploaded.push(local.id.clone());
                        } else {
                            self.record_failure(local, "rejected by server")?;
                            result.failed.push(local.id.clone());
                        }
                    }
                }
                Err(e) => {
                    warn!(batch = index, size = chunk.len(), error = %e, "upload batch failed");
                    result.errors.push(format!("upload batch {index}: {e}"));
                    let message = e.to_string();
                    for local in chunk {
                        self.record_failure(local, &message)?;
                        result.failed.push(local.id.clone());
                    }
                }
            }
        }

        // Download
        let mut downloaded_ok = false;
        if options.download {
            let since = match pass {
                Pass::Delta => checkpoint,
                Pass::Full => None,
            };
            match with_timeout(timeout, "download", transport.download(since)).await {
                Ok(entities) => {
                    let suppress = pass == Pass::Delta && self.config.checksum_validation;
                    self.reconcile(entities, suppress, &mut result)?;
                    downloaded_ok = true;
                }
                Err(e) => {
                    warn!(error = %e, "download failed");
                    result.errors.push(format!("download: {e}"));
                }
            }
        }

        if downloaded_ok {
            self.set_last_sync_timestamp(cycle_start)?;
            result.checkpoint_advanced = true;
        }
        result.duration = started.elapsed();

        info!(
            uploaded = result.uploaded.len(),
            downloaded = result.downloaded.len(),
            unchanged = result.unchanged.len(),
            conflicts = result.conflicts.len(),
            failed = result.failed.len(),
            "delta sync finished"
        );
        Ok(result)
    }

    fn reconcile(
        &self,
        entities: Vec<SyncEntity>,
        suppress_unchanged: bool,
        result: &mut DeltaSyncResult,
    ) -> Result<(), SyncError> {
        for server in entities {
            result.bytes_transferred += server.estimated_size();

            let (local, stored_checksum) = self.db.with_connection(|conn| {
                let local = match read_entity(conn, "pending_changes", &server.id)? {
                    Some(entity) => Some(entity),
                    None => read_entity(conn, "failed_syncs", &server.id)?,
                };
                let checksum: Option<String> = conn
                    .query_row(
                        "SELECT checksum FROM entity_state WHERE entity_id = ?1",
                        [&server.id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|e| SyncError::Database(format!("Failed to read entity state: {e}")))?;
                Ok((local, checksum))
            })?;

            if let Some(local) = local {
                if local.checksum == server.checksum {
                    // Both sides already agree.
                    self.apply_server_entity(&server)?;
                    result.unchanged.push(server.id);
                    continue;
                }
                self.hold(&local)?;
                debug!(id = %local.id, "conflict detected, server version held back");
                result
                    .conflicts
                    .push(SyncConflict::detect(local, server, stored_checksum.is_some()));
                continue;
            }

            if suppress_unchanged && stored_checksum.as_deref() == Some(server.checksum.as_str()) {
                result.unchanged.push(server.id);
                continue;
            }

            self.apply_server_entity(&server)?;
            result.downloaded.push(server);
        }
        Ok(())
    }

    fn mark_uploaded(&self, local: &SyncEntity, accepted: &SyncEntity) -> Result<(), SyncError> {
        self.db.with_transaction(|tx| {
            upsert_state(tx, accepted, local.version.max(accepted.version))?;
            tx.execute(
                "DELETE FROM pending_changes WHERE entity_id = ?1 AND timestamp = ?2",
                params![local.id, datetime::to_sql(local.timestamp)],
            )
            .map_err(|e| SyncError::Database(format!("Failed to clear pending change: {e}")))?;
            tx.execute("DELETE FROM failed_syncs WHERE entity_id = ?1", [&local.id])
                .map_err(|e| SyncError::Database(format!("Failed to clear failed sync: {e}")))?;
            Ok(())
        })
    }

    fn record_failure(&self, local: &SyncEntity, error: &str) -> Result<(), SyncError> {
        let json = serde_json::to_string(local)?;
        self.db.with_transaction(|tx| {
            let row: Option<(u32, u8)> = tx
                .query_row(
                    "SELECT attempts, priority FROM pending_changes WHERE entity_id = ?1 AND timestamp = ?2",
                    params![local.id, datetime::to_sql(local.timestamp)],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|e| SyncError::Database(format!("Failed to read pending change: {e}")))?;

            // A newer local change superseded this one mid-upload.
            let Some((attempts, priority)) = row else {
                return Ok(());
            };

            tx.execute(
                r"INSERT INTO failed_syncs (entity_id, entity, error, attempts, failed_at, priority)
                  VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                  ON CONFLICT(entity_id) DO UPDATE SET
                    entity = excluded.entity, error = excluded.error,
                    attempts = excluded.attempts, failed_at = excluded.failed_at,
                    priority = excluded.priority",
                params![local.id, json, error, attempts + 1, datetime::to_sql(Utc::now()), priority],
            )
            .map_err(|e| SyncError::Database(format!("Failed to record failed sync: {e}")))?;
            tx.execute("DELETE FROM pending_changes WHERE entity_id = ?1", [&local.id])
                .map_err(|e| SyncError::Database(format!("Failed to clear pending change: {e}")))?;
            Ok(())
        })
    }

    fn hold(&self, local: &SyncEntity) -> Result<(), SyncError> {
        let json = serde_json::to_string(local)?;
        self.db.with_transaction(|tx| {
            let (attempts, priority): (u32, u8) = tx
                .query_row(
                    "SELECT attempts, priority FROM failed_syncs WHERE entity_id = ?1",
                    [&local.id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|e| SyncError::Database(format!("Failed to read failed sync: {e}")))?
                .unwrap_or((0, DEFAULT_PRIORITY));
            tx.execute(
                r"INSERT INTO pending_changes (entity_id, entity, timestamp, attempts, held, priority)
                  VALUES (?1, ?2, ?3, ?4, 1, ?5)
                  ON CONFLICT(entity_id) DO UPDATE SET held = 1",
                params![local.id, json, datetime::to_sql(local.timestamp), attempts, priority],
            )
            .map_err(|e| SyncError::Database(format!("Failed to hold pending change: {e}")))?;
            tx.execute("DELETE FROM failed_syncs WHERE entity_id = ?1", [&local.id])
                .map_err(|e| SyncError::Database(format!("Failed to clear failed sync: {e}")))?;
            Ok(())
        })
    }

    /// Accept a server version as the local truth and drop any local change.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn apply_server_entity(&self, entity: &SyncEntity) -> Result<(), SyncError> {
        self.db.with_transaction(|tx| {
            upsert_state(tx, entity, entity.version)?;
            tx.execute("DELETE FROM pending_changes WHERE entity_id = ?1", [&entity.id])
                .map_err(|e| SyncError::Database(format!("Failed to clear pending change: {e}")))?;
            tx.execute("DELETE FROM failed_syncs WHERE entity_id = ?1", [&entity.id])
                .map_err(|e| SyncError::Database(format!("Failed to clear failed sync: {e}")))?;
            Ok(())
        })
    }

    /// Release a held local change so it overwrites the server next cycle.
    ///
    /// The change is re-versioned above `server_version`. Returns `None` if
    /// there is no local change for the entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn keep_local_version(
        &self,
        entity_id: &str,
        server_version: u64,
    ) -> Result<Option<SyncEntity>, SyncError> {
        let local = self.db.with_connection(|conn| {
            Ok(match read_entity(conn, "pending_changes", entity_id)? {
                Some(entity) => Some(entity),
                None => read_entity(conn, "failed_syncs", entity_id)?,
            })
        })?;
        local
            .map(|entity| self.stage(entity.with_timestamp(datetime::now()), server_version, true, None))
            .transpose()
    }

    /// Stage resolved data as a new local change versioned above
    /// `server_version`, releasing any hold.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn apply_resolved_data(
        &self,
        entity_id: &str,
        entity_type: &str,
        data: Value,
        server_version: u64,
    ) -> Result<SyncEntity, SyncError> {
        self.stage(SyncEntity::new(entity_id, entity_type, data), server_version, true, None)
    }

    /// Move failed uploads under the attempt ceiling back to pending.
    ///
    /// A newer local change for the same entity takes precedence. Returns
    /// how many entries were moved.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn retry_failed_syncs(&self) -> Result<usize, SyncError> {
        let ceiling = self.config.max_retry_attempts;
        let moved = self.db.with_transaction(|tx| {
            let rows: Vec<(String, String, u32, u8)> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT entity_id, entity, attempts, priority FROM failed_syncs WHERE attempts < ?1",
                    )
                    .map_err(|e| SyncError::Database(format!("Failed to prepare query: {e}")))?;
                let mapped = stmt
                    .query_map([ceiling], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })
                    .map_err(|e| SyncError::Database(format!("Failed to query failed syncs: {e}")))?;
                mapped
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| SyncError::Database(e.to_string()))?
            };

            for (id, json, attempts, priority) in &rows {
                let entity: SyncEntity = serde_json::from_str(json)?;
                tx.execute(
                    r"INSERT INTO pending_changes (entity_id, entity, timestamp, attempts, held, priority)
                      VALUES (?1, ?2, ?3, ?4, 0, ?5)
                      ON CONFLICT(entity_id) DO NOTHING",
                    params![id, json, datetime::to_sql(entity.timestamp), attempts, priority],
                )
                .map_err(|e| SyncError::Database(format!("Failed to requeue change: {e}")))?;
                tx.execute("DELETE FROM failed_syncs WHERE entity_id = ?1", [id])
                    .map_err(|e| SyncError::Database(format!("Failed to clear failed sync: {e}")))?;
            }
            Ok(rows.len())
        })?;

        if moved > 0 {
            info!(count = moved, "failed uploads requeued");
        }
        Ok(moved)
    }

    /// Re-derive checksums of every stored local change and repair mismatches.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or written.
    pub fn validate_integrity(&self) -> Result<IntegrityReport, SyncError> {
        let mut report = IntegrityReport::default();
        for table in ["pending_changes", "failed_syncs"] {
            let rows: Vec<(String, String)> = self.db.with_connection(|conn| {
                let mut stmt = conn
                    .prepare(&format!("SELECT entity_id, entity FROM {table}"))
                    .map_err(|e| SyncError::Database(format!("Failed to prepare query: {e}")))?;
                let mapped = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                    .map_err(|e| SyncError::Database(format!("Failed to scan {table}: {e}")))?;
                mapped
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| SyncError::Database(e.to_string()))
            })?;

            for (id, json) in rows {
                report.checked += 1;
                let mut entity: SyncEntity = serde_json::from_str(&json)?;
                if entity.verify_checksum() {
                    continue;
                }
                entity.checksum = entity.computed_checksum();
                let repaired = serde_json::to_string(&entity)?;
                self.db.with_connection(|conn| {
                    conn.execute(
                        &format!("UPDATE {table} SET entity = ?1 WHERE entity_id = ?2"),
                        params![repaired, id],
                    )
                    .map_err(|e| SyncError::Database(format!("Failed to repair {id}: {e}")))?;
                    Ok(())
                })?;
                warn!(id = %id, "repaired checksum mismatch");
                report.repaired.push(id);
            }
        }
        Ok(report)
    }
}

fn read_entity(conn: &Connection, table: &str, id: &str) -> Result<Option<SyncEntity>, SyncError> {
    let json: Option<String> = conn
        .query_row(
            &format!("SELECT entity FROM {table} WHERE entity_id = ?1"),
            [id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| SyncError::Database(format!("Failed to read {table}: {e}")))?;
    json.map(|s| serde_json::from_str(&s)).transpose().map_err(SyncError::from)
}

fn prior_priority(conn: &Connection, id: &str) -> Result<Option<u8>, SyncError> {
    conn.query_row(
        r"SELECT priority FROM pending_changes WHERE entity_id = ?1
          UNION ALL SELECT priority FROM failed_syncs WHERE entity_id = ?1
          LIMIT 1",
        [id],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| SyncError::Database(format!("Failed to read change priority: {e}")))
}

fn prior_version(conn: &Connection, id: &str) -> Result<u64, SyncError> {
    let pending = read_entity(conn, "pending_changes", id)?.map_or(0, |e| e.version);
    let failed = read_entity(conn, "failed_syncs", id)?.map_or(0, |e| e.version);
    let synced: Option<i64> = conn
        .query_row(
            "SELECT version FROM entity_state WHERE entity_id = ?1",
            [id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| SyncError::Database(format!("Failed to read entity state: {e}")))?;
    let synced = synced.and_then(|v| u64::try_from(v).ok()).unwrap_or(0);
    Ok(pending.max(failed).max(synced))
}

fn upsert_state(conn: &Connection, entity: &SyncEntity, version: u64) -> Result<(), SyncError> {
    conn.execute(
        r"INSERT INTO entity_state (entity_id, entity_type, timestamp, checksum, version)
          VALUES (?1, ?2, ?3, ?4, ?5)
          ON CONFLICT(entity_id) DO UPDATE SET
            entity_type = excluded.entity_type, timestamp = excluded.timestamp,
            checksum = excluded.checksum, version = excluded.version",
        params![
            entity.id,
            entity.entity_type,
            datetime::to_sql(entity.timestamp),
            entity.checksum,
            i64::try_from(version).unwrap_or(i64::MAX),
        ],
    )
    .map_err(|e| SyncError::Database(format!("Failed to write entity state: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::transport::MemoryTransport;
    use serde_json::json;

    fn engine() -> IncrementalSyncEngine {
        IncrementalSyncEngine::new(Database::open_in_memory().unwrap(), IncrementalConfig::default())
    }

    fn options(batch_size: usize) -> DeltaOptions {
        DeltaOptions {
            batch_size,
            min_priority: MIN_PRIORITY,
            download: true,
        }
    }

    #[test]
    fn test_track_keeps_latest_state_and_bumps_version() {
        let engine = engine();
        let first = engine.track_entity_change("m1", "medication", json!({"dose": 5})).unwrap();
        let second = engine.track_entity_change("m1", "medication", json!({"dose": 10})).unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        let pending = engine.pending_changes().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].data, json!({"dose": 10}));
    }

    #[test]
    fn test_get_modified_entities_since() {
        let engine = engine();
        let a = engine.track_entity_change("a", "medication", json!({})).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        engine.track_entity_change("b", "medication", json!({})).unwrap();

        assert_eq!(engine.get_modified_entities(None).unwrap().len(), 2);
        let since = engine.get_modified_entities(Some(a.timestamp)).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].id, "b");
    }

    #[tokio::test]
    async fn test_round_trip_then_idle_cycle_is_empty() {
        let engine = engine();
        let transport = MemoryTransport::new();
        engine.track_entity_change("m1", "medication", json!({"dose": 5})).unwrap();

        let first = engine.perform_incremental_sync(&transport).await.unwrap();
        assert_eq!(first.uploaded, vec!["m1"]);
        assert!(first.downloaded.is_empty());
        assert!(first.checkpoint_advanced);
        assert!(engine.pending_changes().unwrap().is_empty());

        let second = engine.perform_incremental_sync(&transport).await.unwrap();
        assert!(second.uploaded.is_empty());
        assert!(second.downloaded.is_empty());
        assert!(second.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_identical_server_copy_is_unchanged() {
        let engine = engine();
        let transport = MemoryTransport::new();
        transport.reject_entity("m1");
        let local = engine.track_entity_change("m1", "medication", json!({"dose": 5})).unwrap();
        transport.put_server_entity(SyncEntity::new("m1", "medication", json!({"dose": 5})));

        let result = engine.perform_incremental_sync(&transport).await.unwrap();
        assert_eq!(result.unchanged, vec!["m1"]);
        assert!(result.downloaded.is_empty());
        assert!(result.conflicts.is_empty());
        assert_eq!(engine.entity_checksum("m1").unwrap(), Some(local.checksum));
        assert!(engine.failed_syncs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_changes_are_applied() {
        let engine = engine();
        let transport = MemoryTransport::new();
        let server = SyncEntity::new("r1", "reminder", json!({"at": "08:00"}));
        transport.put_server_entity(server.clone());

        let result = engine.perform_incremental_sync(&transport).await.unwrap();
        assert_eq!(result.downloaded, vec![server.clone()]);
        assert_eq!(engine.entity_checksum("r1").unwrap(), Some(server.checksum));
        assert!(result.bytes_transferred > 0);
    }

    #[tokio::test]
    async fn test_conflicting_server_version_is_never_applied() {
        let engine = engine();
        let transport = MemoryTransport::new();
        transport.reject_entity("m1");
        engine.track_entity_change("m1", "medication", json!({"dose": 5})).unwrap();
        transport.put_server_entity(SyncEntity::new("m1", "medication", json!({"dose": 10})));

        let result = engine.perform_incremental_sync(&transport).await.unwrap();
        assert_eq!(result.conflicts.len(), 1);
        assert!(result.downloaded.is_empty());
        assert_eq!(result.conflicts[0].conflict_type, crate::sync::ConflictType::CreateCreate);
        assert!(engine.entity_checksum("m1").unwrap().is_none());

        // Held back from upload until the conflict is settled.
        let pending = engine.pending_change("m1").unwrap().unwrap();
        assert_eq!(pending.data, json!({"dose": 5}));
        let again = engine.perform_incremental_sync_with(&transport, options(50)).await.unwrap();
        assert!(again.uploaded.is_empty());
        assert!(again.failed.is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_abort_cycle() {
        let engine = engine();
        let transport = MemoryTransport::new();
        transport.fail_upload_call(1);
        for id in ["a", "b", "c", "d"] {
            engine.track_entity_change(id, "medication", json!({"id": id})).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        let result = engine.perform_incremental_sync_with(&transport, options(2)).await.unwrap();
        assert_eq!(result.uploaded, vec!["a", "b"]);
        assert_eq!(result.failed, vec!["c", "d"]);
        assert_eq!(result.errors.len(), 1);
        assert!(result.checkpoint_advanced);

        let failed = engine.failed_syncs().unwrap();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|f| f.attempts == 1));

        assert_eq!(engine.retry_failed_syncs().unwrap(), 2);
        let retry = engine.perform_incremental_sync_with(&transport, options(2)).await.unwrap();
        assert_eq!(retry.uploaded, vec!["c", "d"]);
        assert_eq!(transport.uploaded_ids(), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_download_failure_keeps_checkpoint() {
        let engine = engine();
        let transport = MemoryTransport::new();
        engine.perform_incremental_sync(&transport).await.unwrap();
        let checkpoint = engine.last_sync_timestamp().unwrap();
        assert!(checkpoint.is_some());

        transport.set_download_failure(Some("503"));
        let result = engine.perform_incremental_sync(&transport).await.unwrap();
        assert!(!result.checkpoint_advanced);
        assert_eq!(engine.last_sync_timestamp().unwrap(), checkpoint);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_transport_times_out() {
        let engine = IncrementalSyncEngine::new(
            Database::open_in_memory().unwrap(),
            IncrementalConfig {
                transport_timeout_ms: 100,
                ..IncrementalConfig::default()
            },
        );
        let transport = MemoryTransport::new();
        transport.set_latency(Duration::from_secs(1));
        engine.track_entity_change("m1", "medication", json!({})).unwrap();

        let result = engine.perform_incremental_sync(&transport).await.unwrap();
        assert_eq!(result.failed, vec!["m1"]);
        assert_eq!(result.errors.len(), 2);
        assert!(!result.checkpoint_advanced);
    }

    #[tokio::test]
    async fn test_retry_ceiling_quarantines() {
        let engine = IncrementalSyncEngine::new(
            Database::open_in_memory().unwrap(),
            IncrementalConfig {
                max_retry_attempts: 2,
                ..IncrementalConfig::default()
            },
        );
        let transport = MemoryTransport::new();
        transport.reject_entity("m1");
        engine.track_entity_change("m1", "medication", json!({})).unwrap();

        engine.perform_incremental_sync(&transport).await.unwrap();
        assert_eq!(engine.retry_failed_syncs().unwrap(), 1);
        engine.perform_incremental_sync(&transport).await.unwrap();
        assert_eq!(engine.retry_failed_syncs().unwrap(), 0);

        let failed = engine.failed_syncs().unwrap();
        assert_eq!(failed[0].attempts, 2);
        assert_eq!(failed[0].error, "rejected by server");
    }

    #[tokio::test]
    async fn test_full_sync_ignores_checkpoint() {
        let engine = engine();
        let transport = MemoryTransport::new();
        let server = SyncEntity::new("r1", "reminder", json!({"at": "08:00"}));
        transport.put_server_entity(server);

        engine.perform_incremental_sync(&transport).await.unwrap();
        let delta = engine.perform_incremental_sync(&transport).await.unwrap();
        assert!(delta.downloaded.is_empty());

        let full = engine.perform_full_sync(&transport, options(50)).await.unwrap();
        assert_eq!(full.downloaded.len(), 1);
    }

    #[tokio::test]
    async fn test_low_priority_changes_wait_for_a_wider_cycle() {
        let engine = engine();
        let transport = MemoryTransport::new();
        engine
            .track_entity_change_with_priority("n1", "note", json!({"text": "hi"}), 3)
            .unwrap();
        engine
            .track_entity_change_with_priority("d1", "dose_log", json!({"taken": true}), 9)
            .unwrap();

        let options = DeltaOptions {
            batch_size: 10,
            min_priority: 8,
            download: false,
        };
        let narrow = engine.perform_incremental_sync_with(&transport, options).await.unwrap();
        assert_eq!(narrow.uploaded, vec!["d1"]);
        assert_eq!(transport.uploaded_ids(), vec!["d1"]);
        assert_eq!(engine.pending_changes().unwrap()[0].id, "n1");

        let wide = engine.perform_incremental_sync(&transport).await.unwrap();
        assert_eq!(wide.uploaded, vec!["n1"]);
    }

    #[test]
    fn test_coalesced_change_keeps_highest_priority() {
        let engine = engine();
        engine
            .track_entity_change_with_priority("m1", "medication", json!({"dose": 5}), 9)
            .unwrap();
        engine.track_entity_change("m1", "medication", json!({"dose": 6})).unwrap();

        let critical = engine.uploadable(8).unwrap();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].data, json!({"dose": 6}));
    }

    #[test]
    fn test_resolution_helpers() {
        let engine = engine();
        engine.track_entity_change("m1", "medication", json!({"dose": 5})).unwrap();

        let kept = engine.keep_local_version("m1", 7).unwrap().unwrap();
        assert_eq!(kept.version, 8);
        assert_eq!(kept.data, json!({"dose": 5}));

        let merged = engine.apply_resolved_data("m1", "medication", json!({"dose": 7}), 9).unwrap();
        assert_eq!(merged.version, 10);
        assert_eq!(engine.pending_change("m1").unwrap().unwrap().data, json!({"dose": 7}));

        let server = SyncEntity::new("m1", "medication", json!({"dose": 8})).with_version(11);
        engine.apply_server_entity(&server).unwrap();
        assert!(engine.pending_change("m1").unwrap().is_none());
        assert!(engine.keep_local_version("m1", 11).unwrap().is_none());
    }

    #[test]
    fn test_deletion_is_tracked_as_tombstone() {
        let engine = engine();
        engine.track_entity_change("m1", "medication", json!({"dose": 5})).unwrap();
        let tombstone = engine.track_entity_deletion("m1", "medication").unwrap();
        assert!(tombstone.deleted);
        assert_eq!(tombstone.version, 2);
    }

    #[test]
    fn test_validate_integrity_repairs_checksums() {
        let db = Database::open_in_memory().unwrap();
        let engine = IncrementalSyncEngine::new(db.clone(), IncrementalConfig::default());
        let mut entity = engine.track_entity_change("m1", "medication", json!({"dose": 5})).unwrap();
        entity.checksum = "corrupt".to_string();
        let json = serde_json::to_string(&entity).unwrap();
        db.with_connection(|conn| {
            conn.execute("UPDATE pending_changes SET entity = ?1 WHERE entity_id = 'm1'", [json])?;
            Ok(())
        })
        .unwrap();

        let report = engine.validate_integrity().unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.repaired, vec!["m1"]);
        assert!(engine.pending_change("m1").unwrap().unwrap().verify_checksum());
        assert!(engine.validate_integrity().unwrap().repaired.is_empty());
    }
}
