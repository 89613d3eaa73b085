//! Conflict model, resolution policies and the conflict store.
//!
//! A conflict exists when the local and server sides both changed the same
//! entity since the last checkpoint. While a conflict is pending, the server
//! version is never applied and the local change is held back from upload.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::incremental::SyncEntity;
use crate::core::datetime;
use crate::error::SyncError;
use crate::storage::Database;

/// Policy the orchestrator applies to detected conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Local version always wins
    LocalPreference,
    /// Server version always wins
    ServerPreference,
    /// Per-type merge, falling back to a configurable default
    IntelligentMerge,
    /// Leave every conflict for the user
    UserChoiceRequired,
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::LocalPreference => "local_preference",
            Self::ServerPreference => "server_preference",
            Self::IntelligentMerge => "intelligent_merge",
            Self::UserChoiceRequired => "user_choice_required",
        };
        write!(f, "{s}")
    }
}

/// How the two sides diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides created the entity independently
    CreateCreate,
    /// Both sides modified a previously synced entity
    UpdateUpdate,
    /// One side deleted what the other modified
    DeleteUpdate,
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CreateCreate => "create_create",
            Self::UpdateUpdate => "update_update",
            Self::DeleteUpdate => "delete_update",
        };
        write!(f, "{s}")
    }
}

/// A pending or resolved conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: String,
    pub entity_id: String,
    pub entity_type: String,
    pub conflict_type: ConflictType,
    pub local_version: SyncEntity,
    pub server_version: SyncEntity,
    pub local_timestamp: DateTime<Utc>,
    pub server_timestamp: DateTime<Utc>,
    pub resolution: Option<ResolutionStrategy>,
    pub resolved_data: Option<Value>,
    pub detected_at: DateTime<Utc>,
}

impl SyncConflict {
    /// Classify and record a divergence.
    ///
    /// `previously_synced` is whether the entity had a synced state before
    /// either side changed it.
    #[must_use]
    pub fn detect(local: SyncEntity, server: SyncEntity, previously_synced: bool) -> Self {
        let conflict_type = if local.deleted != server.deleted {
            ConflictType::DeleteUpdate
        } else if previously_synced {
            ConflictType::UpdateUpdate
        } else {
            ConflictType::CreateCreate
        };

        Self {
            id: Uuid::new_v4().to_string(),
            entity_id: local.id.clone(),
            entity_type: local.entity_type.clone(),
            conflict_type,
            local_timestamp: local.timestamp,
            server_timestamp: server.timestamp,
            local_version: local,
            server_version: server,
            resolution: None,
            resolved_data: None,
            detected_at: datetime::now(),
        }
    }

    /// Highest version seen on either side.
    #[must_use]
    pub fn max_version(&self) -> u64 {
        self.local_version.version.max(self.server_version.version)
    }
}

/// Outcome chosen for a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResolution {
    LocalWins,
    ServerWins,
    Merged(Value),
    /// Leave it for the user
    Deferred,
}

impl ConflictResolution {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::LocalWins => "local_wins",
            Self::ServerWins => "server_wins",
            Self::Merged(_) => "merged",
            Self::Deferred => "deferred",
        }
    }
}

/// Decides how a conflict is settled.
#[cfg_attr(test, mockall::automock)]
pub trait ConflictResolver: Send + Sync {
    /// Pick a resolution for `conflict`.
    ///
    /// # Errors
    ///
    /// An error defers the conflict to the user.
    fn resolve_conflict(&self, conflict: &SyncConflict) -> Result<ConflictResolution, SyncError>;
}

/// Type-specific merge of two versions of an entity.
pub trait MergePolicy: Send + Sync {
    /// Produce merged data, or `None` if these versions cannot be merged.
    fn merge(&self, local: &SyncEntity, server: &SyncEntity) -> Option<Value>;
}

/// Server fields overlaid with every local field.
///
/// Suited to user preferences, where the device is the authority.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferLocalFields;

impl MergePolicy for PreferLocalFields {
    fn merge(&self, local: &SyncEntity, server: &SyncEntity) -> Option<Value> {
        let (Value::Object(local), Value::Object(server)) = (&local.data, &server.data) else {
            return None;
        };
        let mut merged = server.clone();
        for (key, value) in local {
            merged.insert(key.clone(), value.clone());
        }
        Some(Value::Object(merged))
    }
}

/// The newer version, with every numeric field present on both sides taking
/// the larger value.
///
/// Suited to monotonically growing counters such as adherence streaks.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxCounters;

impl MergePolicy for MaxCounters {
    fn merge(&self, local: &SyncEntity, server: &SyncEntity) -> Option<Value> {
        let (Value::Object(local_map), Value::Object(server_map)) = (&local.data, &server.data)
        else {
            return None;
        };
        let (newer, older): (&Map<String, Value>, &Map<String, Value>) =
            if local.timestamp > server.timestamp {
                (local_map, server_map)
            } else {
                (server_map, local_map)
            };

        let mut merged = newer.clone();
        for (key, value) in &mut merged {
            let Some(other) = older.get(key) else { continue };
            if let (Some(a), Some(b)) = (value.as_f64(), other.as_f64()) {
                if b > a {
                    *value = other.clone();
                }
            }
        }
        Some(Value::Object(merged))
    }
}

/// What intelligent merge does for types without a registered policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeFallback {
    /// Most recently modified version wins
    #[default]
    LatestTimestamp,
    /// Leave the conflict for the user
    Defer,
}

/// [`ConflictResolver`] driven by a [`ResolutionStrategy`].
pub struct PolicyResolver {
    strategy: ResolutionStrategy,
    policies: HashMap<String, Box<dyn MergePolicy>>,
    fallback: MergeFallback,
}

impl std::fmt::Debug for PolicyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyResolver")
            .field("strategy", &self.strategy)
            .field("policies", &self.policies.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl PolicyResolver {
    #[must_use]
    pub fn new(strategy: ResolutionStrategy) -> Self {
        Self {
            strategy,
            policies: HashMap::new(),
            fallback: MergeFallback::default(),
        }
    }

    /// Register a merge policy for an entity type.
    #[must_use]
    pub fn with_policy(mut self, entity_type: &str, policy: impl MergePolicy + 'static) -> Self {
        self.policies.insert(entity_type.to_string(), Box::new(policy));
        self
    }

    /// Preferences merge in favour of the device; statistics keep the
    /// larger counters.
    #[must_use]
    pub fn with_default_policies(self) -> Self {
        self.with_policy("preferences", PreferLocalFields)
            .with_policy("statistics", MaxCounters)
    }

    #[must_use]
    pub const fn with_fallback(mut self, fallback: MergeFallback) -> Self {
        self.fallback = fallback;
        self
    }

    #[must_use]
    pub const fn strategy(&self) -> ResolutionStrategy {
        self.strategy
    }

    fn merge(&self, conflict: &SyncConflict) -> ConflictResolution {
        let local = &conflict.local_version;
        let server = &conflict.server_version;

        if conflict.conflict_type != ConflictType::DeleteUpdate {
            if let Some(policy) = self.policies.get(&conflict.entity_type) {
                if let Some(merged) = policy.merge(local, server) {
                    return ConflictResolution::Merged(merged);
                }
            }
        }

        match self.fallback {
            MergeFallback::LatestTimestamp if local.timestamp > server.timestamp => {
                ConflictResolution::LocalWins
            }
            MergeFallback::LatestTimestamp => ConflictResolution::ServerWins,
            MergeFallback::Defer => ConflictResolution::Deferred,
        }
    }
}

impl ConflictResolver for PolicyResolver {
    fn resolve_conflict(&self, conflict: &SyncConflict) -> Result<ConflictResolution, SyncError> {
        Ok(match self.strategy {
            ResolutionStrategy::LocalPreference => ConflictResolution::LocalWins,
            ResolutionStrategy::ServerPreference => ConflictResolution::ServerWins,
            ResolutionStrategy::UserChoiceRequired => ConflictResolution::Deferred,
            ResolutionStrategy::IntelligentMerge => self.merge(conflict),
        })
    }
}

/// Audit entry for a settled conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionRecord {
    pub conflict_id: String,
    pub entity_id: String,
    pub entity_type: String,
    /// `local_wins`, `server_wins`, `merged` or `user_choice`
    pub outcome: String,
    pub resolved_data: Option<Value>,
    pub reasoning: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

/// Persistent set of unresolved conflicts plus the resolution log.
#[derive(Debug, Clone)]
pub struct ConflictStore {
    db: Database,
}

impl ConflictStore {
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store a conflict. A newer conflict for the same entity replaces the
    /// older one but keeps its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn save(&self, conflict: &SyncConflict) -> Result<SyncConflict, SyncError> {
        let mut stored = conflict.clone();
        if let Some(existing) = self.get_by_entity(&conflict.entity_id)? {
            stored.id = existing.id;
        }
        let json = serde_json::to_string(&stored)?;

        self.db.with_connection(|conn| {
            conn.execute(
                r"INSERT INTO sync_conflicts (id, entity_id, entity_type, conflict, detected_at)
                  VALUES (?1, ?2, ?3, ?4, ?5)
                  ON CONFLICT(entity_id) DO UPDATE SET
                    conflict = excluded.conflict, detected_at = excluded.detected_at",
                params![
                    stored.id,
                    stored.entity_id,
                    stored.entity_type,
                    json,
                    datetime::to_sql(stored.detected_at),
                ],
            )
            .map_err(|e| SyncError::Database(format!("Failed to save conflict: {e}")))?;
            Ok(())
        })?;
        Ok(stored)
    }

    /// All unresolved conflicts, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a record is corrupt.
    pub fn list(&self) -> Result<Vec<SyncConflict>, SyncError> {
        let rows: Vec<String> = self.db.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT conflict FROM sync_conflicts ORDER BY detected_at ASC, id ASC")
                .map_err(|e| SyncError::Database(format!("Failed to prepare query: {e}")))?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .map_err(|e| SyncError::Database(format!("Failed to query conflicts: {e}")))?;
            rows.collect::<Result<Vec<String>, _>>()
                .map_err(|e| SyncError::Database(e.to_string()))
        })?;

        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(SyncError::from))
            .collect()
    }

    /// # Errors
    ///
    /// Returns an error if the query fails or the record is corrupt.
    pub fn get(&self, id: &str) -> Result<Option<SyncConflict>, SyncError> {
        self.query_one("SELECT conflict FROM sync_conflicts WHERE id = ?1", id)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails or the record is corrupt.
    pub fn get_by_entity(&self, entity_id: &str) -> Result<Option<SyncConflict>, SyncError> {
        self.query_one(
            "SELECT conflict FROM sync_conflicts WHERE entity_id = ?1",
            entity_id,
        )
    }

    fn query_one(&self, sql: &str, key: &str) -> Result<Option<SyncConflict>, SyncError> {
        let json: Option<String> = self.db.with_connection(|conn| {
            conn.query_row(sql, [key], |row| row.get(0))
                .optional()
                .map_err(|e| SyncError::Database(format!("Failed to query conflict: {e}")))
        })?;
        json.map(|s| serde_json::from_str(&s)).transpose().map_err(SyncError::from)
    }

    /// Remove a conflict from the pending set.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn remove(&self, id: &str) -> Result<bool, SyncError> {
        self.db.with_connection(|conn| {
            let rows = conn
                .execute("DELETE FROM sync_conflicts WHERE id = ?1", [id])
                .map_err(|e| SyncError::Database(format!("Failed to remove conflict: {e}")))?;
            Ok(rows > 0)
        })
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count(&self) -> Result<usize, SyncError> {
        self.db.with_connection(|conn| {
            let n: i64 = conn
                .query_row("SELECT COUNT(*) FROM sync_conflicts", [], |row| row.get(0))
                .map_err(|e| SyncError::Database(format!("Failed to count conflicts: {e}")))?;
            Ok(usize::try_from(n).unwrap_or_default())
        })
    }

    /// Append to the resolution log.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn log_resolution(&self, record: &ResolutionRecord) -> Result<(), SyncError> {
        let data = record
            .resolved_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.db.with_connection(|conn| {
            conn.execute(
                r"INSERT INTO conflict_resolutions
                  (conflict_id, entity_id, entity_type, strategy, resolved_data, reasoning, resolved_at)
                  VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.conflict_id,
                    record.entity_id,
                    record.entity_type,
                    record.outcome,
                    data,
                    record.reasoning,
                    datetime::to_sql(record.resolved_at),
                ],
            )
            .map_err(|e| SyncError::Database(format!("Failed to log resolution: {e}")))?;
            Ok(())
        })
    }

    /// Most recent resolutions, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn resolutions(&self, limit: usize) -> Result<Vec<ResolutionRecord>, SyncError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    r"SELECT conflict_id, entity_id, entity_type, strategy, resolved_data,
                             reasoning, resolved_at
                      FROM conflict_resolutions ORDER BY id DESC LIMIT ?1",
                )
                .map_err(|e| SyncError::Database(format!("Failed to prepare query: {e}")))?;
            let rows = stmt
                .query_map([limit], |row| {
                    let data: Option<String> = row.get(4)?;
                    let resolved_at: String = row.get(6)?;
                    Ok(ResolutionRecord {
                        conflict_id: row.get(0)?,
                        entity_id: row.get(1)?,
                        entity_type: row.get(2)?,
                        outcome: row.get(3)?,
                        resolved_data: data.and_then(|s| serde_json::from_str(&s).ok()),
                        reasoning: row.get(5)?,
                        resolved_at: datetime::from_sql(&resolved_at).unwrap_or_else(Utc::now),
                    })
                })
                .map_err(|e| SyncError::Database(format!("Failed to query resolutions: {e}")))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| SyncError::Database(e.to_string()))
        })
    }
}
