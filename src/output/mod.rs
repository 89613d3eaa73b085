//! Output formatting for medsync.
//!
//! This module renders sync state for the CLI in pretty or JSON form.

mod json;
mod pretty;

use crate::cli::args::OutputFormat;
use crate::error::SyncError;
use crate::sync::conflict::{ResolutionRecord, SyncConflict};
use crate::sync::queue::{QueueStats, SyncOperation};
use crate::sync::{SyncResult, SyncStatus};

pub use json::*;
pub use pretty::*;

/// Format the sync status based on output format
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_status(status: &SyncStatus, format: OutputFormat) -> Result<String, SyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_status_pretty(status)),
        OutputFormat::Json => format_status_json(status),
    }
}

/// Format queued operations based on output format
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_operations(
    operations: &[SyncOperation],
    title: &str,
    format: OutputFormat,
) -> Result<String, SyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_operations_pretty(operations, title)),
        OutputFormat::Json => format_operations_json(operations, title),
    }
}

/// Format queue statistics based on output format
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_queue_stats(stats: &QueueStats, format: OutputFormat) -> Result<String, SyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_queue_stats_pretty(stats)),
        OutputFormat::Json => format_queue_stats_json(stats),
    }
}

/// Format pending conflicts based on output format
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_conflicts(
    conflicts: &[SyncConflict],
    format: OutputFormat,
) -> Result<String, SyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_conflicts_pretty(conflicts)),
        OutputFormat::Json => format_conflicts_json(conflicts),
    }
}

/// Format a single conflict based on output format
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_conflict(conflict: &SyncConflict, format: OutputFormat) -> Result<String, SyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_conflict_pretty(conflict)),
        OutputFormat::Json => to_json(conflict),
    }
}

/// Format the resolution log based on output format
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_resolutions(
    records: &[ResolutionRecord],
    format: OutputFormat,
) -> Result<String, SyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_resolutions_pretty(records)),
        OutputFormat::Json => format_resolutions_json(records),
    }
}

/// Format sync history based on output format
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_history(results: &[SyncResult], format: OutputFormat) -> Result<String, SyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_history_pretty(results)),
        OutputFormat::Json => format_history_json(results),
    }
}
