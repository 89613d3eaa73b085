//! Per-cycle sync results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sync::conflict::SyncConflict;
use crate::sync::connection::{ConnectionQuality, ConnectionState, ConnectionType};
use crate::sync::incremental::{DeltaSyncResult, SyncEntity};

/// Connectivity at the start of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub is_connected: bool,
    pub connection_type: ConnectionType,
    pub quality: ConnectionQuality,
    pub signal_strength: f64,
    pub is_metered: bool,
}

impl From<&ConnectionState> for NetworkSnapshot {
    fn from(state: &ConnectionState) -> Self {
        Self {
            is_connected: state.is_connected,
            connection_type: state.connection_type,
            quality: state.connection_quality,
            signal_strength: state.signal_strength,
            is_metered: state.is_metered,
        }
    }
}

/// Record of one sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub strategy: String,
    /// `true` when the cycle recorded no errors
    pub success: bool,
    /// Whether the non-incremental pass was used
    pub full_sync: bool,

    pub operations_processed: usize,
    /// Operations that exhausted their retries this cycle
    pub operations_failed: usize,
    /// Operations requeued for a later attempt
    pub operations_retrying: usize,
    pub offline_items_synced: usize,

    pub entities_uploaded: usize,
    pub entities_downloaded: usize,
    pub entities_unchanged: usize,
    pub entities_failed: usize,

    /// Conflicts detected this cycle, with their resolution if any
    pub conflicts: Vec<SyncConflict>,
    pub conflicts_resolved: usize,

    pub errors: Vec<String>,
    pub bytes_transferred: usize,
    pub network: NetworkSnapshot,

    /// Entity states the host should write to its own store: applied server
    /// versions and conflict outcomes.
    #[serde(skip)]
    pub applied: Vec<SyncEntity>,
}

impl SyncResult {
    pub(crate) fn begin(strategy: &str, network: NetworkSnapshot, full_sync: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            strategy: strategy.to_string(),
            success: false,
            full_sync,
            operations_processed: 0,
            operations_failed: 0,
            operations_retrying: 0,
            offline_items_synced: 0,
            entities_uploaded: 0,
            entities_downloaded: 0,
            entities_unchanged: 0,
            entities_failed: 0,
            conflicts: Vec::new(),
            conflicts_resolved: 0,
            errors: Vec::new(),
            bytes_transferred: 0,
            network,
            applied: Vec::new(),
        }
    }

    /// Fold in a delta exchange. Returns its newly detected conflicts.
    pub(crate) fn absorb_delta(&mut self, delta: DeltaSyncResult) -> Vec<SyncConflict> {
        self.entities_uploaded += delta.uploaded.len();
        self.entities_downloaded += delta.downloaded.len();
        self.entities_unchanged += delta.unchanged.len();
        self.entities_failed += delta.failed.len();
        self.bytes_transferred += delta.bytes_transferred;
        self.errors.extend(delta.errors);
        self.applied.extend(delta.downloaded);
        delta.conflicts
    }

    pub(crate) fn finish(&mut self, elapsed: std::time::Duration) {
        self.finished_at = Utc::now();
        self.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.success = self.errors.is_empty();
    }

    /// Conflicts still waiting for the user.
    #[must_use]
    pub fn unresolved_conflicts(&self) -> usize {
        self.conflicts.len() - self.conflicts_resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> NetworkSnapshot {
        NetworkSnapshot {
            is_connected: true,
            connection_type: ConnectionType::Wifi,
            quality: ConnectionQuality::Excellent,
            signal_strength: 1.0,
            is_metered: false,
        }
    }

    #[test]
    fn test_absorb_delta_counts() {
        let mut result = SyncResult::begin("full", snapshot(), false);
        let server = SyncEntity::new("r1", "reminder", json!({}));
        let delta = DeltaSyncResult {
            uploaded: vec!["a".to_string(), "b".to_string()],
            downloaded: vec![server],
            unchanged: vec!["c".to_string()],
            errors: vec!["download: 503".to_string()],
            bytes_transferred: 120,
            ..DeltaSyncResult::default()
        };

        let conflicts = result.absorb_delta(delta);
        assert!(conflicts.is_empty());
        assert_eq!(result.entities_uploaded, 2);
        assert_eq!(result.entities_downloaded, 1);
        assert_eq!(result.entities_unchanged, 1);
        assert_eq!(result.applied.len(), 1);

        result.finish(std::time::Duration::from_millis(42));
        assert!(!result.success);
        assert_eq!(result.duration_ms, 42);
    }

    #[test]
    fn test_applied_entities_are_not_persisted() {
        let mut result = SyncResult::begin("full", snapshot(), false);
        result.applied.push(SyncEntity::new("r1", "reminder", json!({})));
        let json = serde_json::to_string(&result).unwrap();
        let back: SyncResult = serde_json::from_str(&json).unwrap();
        assert!(back.applied.is_empty());
        assert_eq!(back.id, result.id);
    }
}
