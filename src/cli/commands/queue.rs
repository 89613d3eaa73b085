//! Queue command implementation.

use colored::Colorize;

use super::Context;
use crate::cli::args::{OutputFormat, QueueCommands};
use crate::error::SyncError;
use crate::output::{format_operations, format_queue_stats, to_json};
use crate::sync::queue::{OperationStatus, SyncOperation, SyncQueueManager};

/// Execute queue subcommands.
///
/// # Errors
///
/// Returns an error if the queue cannot be read or updated, or if a status
/// filter is not recognized.
pub fn queue(ctx: &Context, cmd: QueueCommands, format: OutputFormat) -> Result<String, SyncError> {
    let manager = SyncQueueManager::new(ctx.open_database()?, ctx.config.queue.clone());

    match cmd {
        QueueCommands::List { status, limit } => list(&manager, status.as_deref(), limit, format),
        QueueCommands::Stats => format_queue_stats(&manager.get_stats()?, format),
        QueueCommands::Retry { all, id } => {
            if !all && id.is_none() {
                return Err(SyncError::Validation(
                    "Specify an operation ID or --all".to_string(),
                ));
            }
            let target = if all { None } else { id.as_deref() };
            let count = manager.retry_failed(target)?;
            if count == 0 {
                if let Some(id) = target {
                    return Err(SyncError::NotFound(format!("Failed operation: {id}")));
                }
            }
            report(format, "retried", count, &format!("Requeued {count} failed operation(s)"))
        }
        QueueCommands::Purge => {
            let count = manager.purge_completed()?;
            report(format, "purged", count, &format!("Purged {count} completed operation(s)"))
        }
        QueueCommands::Clear { force } => {
            if !force {
                return Err(SyncError::Validation(
                    "Clearing the queue discards unsent changes; pass --force".to_string(),
                ));
            }
            let count = manager.get_stats()?.total;
            manager.clear()?;
            report(format, "cleared", count, &format!("Cleared queue ({count} active operation(s) discarded)"))
        }
    }
}

fn list(
    manager: &SyncQueueManager,
    status: Option<&str>,
    limit: usize,
    format: OutputFormat,
) -> Result<String, SyncError> {
    let operations: Vec<SyncOperation> = match status {
        Some(s) => {
            let parsed = OperationStatus::parse(s)
                .ok_or_else(|| SyncError::Validation(format!("Unknown status: {s}")))?;
            manager.list(Some(parsed), limit)?
        }
        None => manager
            .list(None, usize::MAX)?
            .into_iter()
            .filter(|op| !op.status.is_terminal())
            .take(limit)
            .collect(),
    };

    let title = status.map_or_else(|| "Queue".to_string(), |s| format!("Queue: {s}"));
    format_operations(&operations, &title, format)
}

fn report(format: OutputFormat, action: &str, count: usize, message: &str) -> Result<String, SyncError> {
    match format {
        OutputFormat::Json => to_json(&serde_json::json!({ action: count })),
        OutputFormat::Pretty => Ok(format!("{} {message}", "✓".green())),
    }
}
