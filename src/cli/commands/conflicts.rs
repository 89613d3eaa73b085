//! Conflict review commands.
//!
//! Resolving a conflict needs the transport, so it happens through the
//! orchestrator in the host application. The CLI only reads.

use super::Context;
use crate::cli::args::{ConflictCommands, OutputFormat};
use crate::error::SyncError;
use crate::output::{format_conflict, format_conflicts, format_resolutions};
use crate::sync::conflict::ConflictStore;

/// Execute conflict subcommands.
///
/// # Errors
///
/// Returns an error if the store cannot be read, the conflict does not
/// exist, or output formatting fails.
pub fn conflicts(
    ctx: &Context,
    cmd: ConflictCommands,
    format: OutputFormat,
) -> Result<String, SyncError> {
    let store = ConflictStore::new(ctx.open_database()?);

    match cmd {
        ConflictCommands::List => format_conflicts(&store.list()?, format),
        ConflictCommands::Show { id } => {
            let conflict = store
                .get(&id)?
                .ok_or_else(|| SyncError::NotFound(format!("Conflict: {id}")))?;
            format_conflict(&conflict, format)
        }
        ConflictCommands::Log { limit } => format_resolutions(&store.resolutions(limit)?, format),
    }
}
