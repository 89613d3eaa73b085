use chrono::{DateTime, Utc};
use colored::Colorize;

use crate::core::datetime::format_age;
use crate::sync::conflict::{ResolutionRecord, SyncConflict};
use crate::sync::queue::{OperationStatus, QueueStats, SyncOperation};
use crate::sync::{SyncResult, SyncStatus};

fn age_or_never(ts: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    ts.map_or_else(|| "never".to_string(), |ts| format_age(ts, now))
}

/// Format the sync status as a short report
pub fn format_status_pretty(status: &SyncStatus) -> String {
    let now = Utc::now();
    let mut lines = Vec::new();

    lines.push(format!("{}", "Sync Status".bold()));
    lines.push("─".repeat(40));

    let state = if status.in_progress {
        "syncing".cyan()
    } else if status.consecutive_failures > 0 {
        "failing".red()
    } else {
        "idle".green()
    };
    lines.push(format!("  State:            {state}"));
    lines.push(format!(
        "  Last sync:        {}",
        age_or_never(status.last_sync_at, now)
    ));
    lines.push(format!(
        "  Last success:     {}",
        age_or_never(status.last_successful_sync_at, now)
    ));
    if let Some(strategy) = &status.last_strategy {
        lines.push(format!("  Strategy:         {strategy}"));
    }
    lines.push(format!("  Total cycles:     {}", status.total_syncs));

    lines.push(String::new());
    lines.push(format!("  Pending ops:      {}", status.pending_operations));
    let failed = status.failed_operations.to_string();
    lines.push(format!(
        "  Failed ops:       {}",
        if status.failed_operations > 0 { failed.red() } else { failed.normal() }
    ));
    let conflicts = status.pending_conflicts.to_string();
    lines.push(format!(
        "  Conflicts:        {}",
        if status.pending_conflicts > 0 { conflicts.yellow() } else { conflicts.normal() }
    ));

    if let Some(err) = &status.last_error {
        lines.push(String::new());
        lines.push(format!(
            "  {} {} ({} in a row)",
            "Last error:".red(),
            err,
            status.consecutive_failures
        ));
    }

    lines.join("\n")
}

/// Format queued operations, one per line
pub fn format_operations_pretty(operations: &[SyncOperation], title: &str) -> String {
    if operations.is_empty() {
        return format!("{title} (0 operations)\n  Queue is empty");
    }

    let now = Utc::now();
    let mut output = format!("{} ({} operations)\n", title, operations.len());
    output.push_str(&"─".repeat(60));
    output.push('\n');

    for op in operations {
        let status = match op.status {
            OperationStatus::Pending => "pending".white(),
            OperationStatus::Processing => "processing".cyan(),
            OperationStatus::Completed => "completed".green(),
            OperationStatus::Failed => "failed".red(),
        };

        let mut line = format!(
            "[{:>2}] {} {}/{}  {}",
            op.priority,
            op.kind.to_string().bold(),
            op.entity_type,
            op.entity_id,
            status
        );
        line.push_str(&format!("  {}", format_age(op.created_at, now).dimmed()));
        if op.retry_count > 0 {
            line.push_str(&format!("  retries: {}", op.retry_count).yellow().to_string());
        }
        output.push_str(&line);
        output.push('\n');

        if let Some(err) = &op.last_error {
            output.push_str(&format!("       {}\n", err.dimmed()));
        }
    }

    output
}

/// Format queue statistics
pub fn format_queue_stats_pretty(stats: &QueueStats) -> String {
    let mut lines = Vec::new();

    lines.push(format!("{}", "Queue".bold()));
    lines.push("─".repeat(40));
    lines.push(format!("  Active:           {}", stats.total));
    lines.push(format!("  Pending:          {}", stats.pending));
    lines.push(format!("  Processing:       {}", stats.processing));
    lines.push(format!("  Failed:           {}", stats.failed));
    lines.push(format!("  Completed today:  {}", stats.completed_today));
    lines.push(format!("  Size:             {} bytes", stats.queue_bytes));
    if let Some(oldest) = stats.oldest_pending {
        lines.push(format!(
            "  Oldest pending:   {}",
            format_age(oldest, Utc::now())
        ));
    }

    lines.join("\n")
}

/// Format pending conflicts
pub fn format_conflicts_pretty(conflicts: &[SyncConflict]) -> String {
    if conflicts.is_empty() {
        return "Conflicts (0 pending)\n  Nothing to resolve".to_string();
    }

    let now = Utc::now();
    let mut output = format!("Conflicts ({} pending)\n", conflicts.len());
    output.push_str(&"─".repeat(60));
    output.push('\n');

    for conflict in conflicts {
        output.push_str(&format!(
            "{} {}/{}  {}  {}\n",
            conflict.conflict_type.to_string().yellow(),
            conflict.entity_type,
            conflict.entity_id.bold(),
            format_age(conflict.detected_at, now).dimmed(),
            conflict.id.dimmed()
        ));
    }

    output
}

/// Format one conflict with both versions
pub fn format_conflict_pretty(conflict: &SyncConflict) -> String {
    let mut output = format!(
        "{} {}/{}\n",
        "Conflict".bold(),
        conflict.entity_type,
        conflict.entity_id
    );
    output.push_str(&format!("  {}: {}\n", "ID".dimmed(), conflict.id));
    output.push_str(&format!("  {}: {}\n", "Type".dimmed(), conflict.conflict_type));
    output.push_str(&format!(
        "  {}: {}\n",
        "Detected".dimmed(),
        conflict.detected_at.format("%Y-%m-%d %H:%M:%S")
    ));

    for (label, entity, ts) in [
        ("Local", &conflict.local_version, conflict.local_timestamp),
        ("Server", &conflict.server_version, conflict.server_timestamp),
    ] {
        output.push('\n');
        output.push_str(&format!(
            "  {} (v{}, {})\n",
            label.bold(),
            entity.version,
            ts.format("%Y-%m-%d %H:%M:%S")
        ));
        if entity.deleted {
            output.push_str(&format!("    {}\n", "deleted".red()));
        } else {
            let body = serde_json::to_string_pretty(&entity.data).unwrap_or_default();
            for line in body.lines() {
                output.push_str(&format!("    {line}\n"));
            }
        }
    }

    output
}

/// Format the resolution log
pub fn format_resolutions_pretty(records: &[ResolutionRecord]) -> String {
    if records.is_empty() {
        return "Resolutions (0 entries)".to_string();
    }

    let now = Utc::now();
    let mut output = format!("Resolutions ({} entries)\n", records.len());
    output.push_str(&"─".repeat(60));
    output.push('\n');

    for record in records {
        let outcome = match record.outcome.as_str() {
            "local_wins" | "server_wins" => record.outcome.cyan(),
            "merged" => record.outcome.green(),
            _ => record.outcome.yellow(),
        };
        let mut line = format!(
            "{} {}/{}  {}",
            outcome,
            record.entity_type,
            record.entity_id,
            format_age(record.resolved_at, now).dimmed()
        );
        if let Some(reasoning) = &record.reasoning {
            line.push_str(&format!("  {}", reasoning.dimmed()));
        }
        output.push_str(&line);
        output.push('\n');
    }

    output
}

/// Format sync history, newest first
pub fn format_history_pretty(results: &[SyncResult]) -> String {
    if results.is_empty() {
        return "Sync History (0 cycles)\n  No sync has run yet".to_string();
    }

    let mut output = format!("Sync History ({} cycles)\n", results.len());
    output.push_str(&"─".repeat(60));
    output.push('\n');

    for result in results {
        let icon = if result.success { "ok".green() } else { "!!".red() };
        output.push_str(&format!(
            "{} {}  {:<22} {:>6}ms  ops {}  up {}  down {}",
            icon,
            result.started_at.format("%Y-%m-%d %H:%M:%S"),
            result.strategy.bold(),
            result.duration_ms,
            result.operations_processed,
            result.entities_uploaded,
            result.entities_downloaded
        ));
        let unresolved = result.unresolved_conflicts();
        if unresolved > 0 {
            output.push_str(&format!("  conflicts {unresolved}").yellow().to_string());
        }
        output.push('\n');
        for err in &result.errors {
            output.push_str(&format!("     {}\n", err.dimmed()));
        }
    }

    output
}
