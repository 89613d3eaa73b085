//! JSON output formatting for medsync.

use serde::Serialize;
use serde_json::json;

use crate::error::SyncError;
use crate::sync::conflict::{ResolutionRecord, SyncConflict};
use crate::sync::queue::{QueueStats, SyncOperation};
use crate::sync::{SyncResult, SyncStatus};

/// Format the sync status as JSON
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_status_json(status: &SyncStatus) -> Result<String, SyncError> {
    to_json(status)
}

/// Format queued operations as JSON
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_operations_json(operations: &[SyncOperation], title: &str) -> Result<String, SyncError> {
    let output = json!({
        "list": title,
        "count": operations.len(),
        "items": operations
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

/// Format queue statistics as JSON
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_queue_stats_json(stats: &QueueStats) -> Result<String, SyncError> {
    to_json(stats)
}

/// Format pending conflicts as JSON
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_conflicts_json(conflicts: &[SyncConflict]) -> Result<String, SyncError> {
    let output = json!({
        "count": conflicts.len(),
        "items": conflicts
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

/// Format resolution log entries as JSON
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_resolutions_json(records: &[ResolutionRecord]) -> Result<String, SyncError> {
    let output = json!({
        "count": records.len(),
        "items": records
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

/// Format sync history as JSON
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_history_json(results: &[SyncResult]) -> Result<String, SyncError> {
    let output = json!({
        "count": results.len(),
        "items": results
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

/// Serialize any value as pretty JSON
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, SyncError> {
    Ok(serde_json::to_string_pretty(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_history_json() {
        let out = format_history_json(&[]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["count"], 0);
        assert!(value["items"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_status_json_fields() {
        let status = SyncStatus {
            consecutive_failures: 2,
            ..SyncStatus::default()
        };
        let value: serde_json::Value =
            serde_json::from_str(&format_status_json(&status).unwrap()).unwrap();
        assert_eq!(value["consecutive_failures"], 2);
        assert_eq!(value["in_progress"], false);
    }
}
