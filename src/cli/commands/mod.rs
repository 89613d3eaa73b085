//! Command implementations for medsync.
//!
//! Every command works on the local store directly, so they are usable
//! while the host application is not running.

mod config;
mod conflicts;
mod queue;

pub use config::config;
pub use conflicts::conflicts;
pub use queue::queue;

use crate::cli::args::OutputFormat;
use crate::config::{Config, Paths};
use crate::error::SyncError;
use crate::output::{format_history, format_status};
use crate::storage::Database;
use crate::sync::orchestrator::SyncHistory;
use crate::sync::SyncStatus;

/// Resolved locations and settings for one invocation.
#[derive(Debug, Clone)]
pub struct Context {
    pub paths: Paths,
    pub config: Config,
}

impl Context {
    /// Load the config file under `paths`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load(paths: Paths) -> Result<Self, SyncError> {
        let config = Config::load_from_path(&paths.config_file)?;
        Ok(Self { paths, config })
    }

    /// Open the database, creating the data directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or database cannot be created.
    pub fn open_database(&self) -> Result<Database, SyncError> {
        self.paths.ensure_dirs()?;
        Database::open_at(&self.paths.database)
    }
}

/// Execute status command
///
/// # Errors
///
/// Returns an error if the database cannot be read or output formatting fails.
pub fn status(ctx: &Context, format: OutputFormat) -> Result<String, SyncError> {
    let db = ctx.open_database()?;
    let status = SyncStatus::load(&db)?;
    format_status(&status, format)
}

/// Execute history command
///
/// # Errors
///
/// Returns an error if the database cannot be read or output formatting fails.
pub fn history(ctx: &Context, limit: usize, format: OutputFormat) -> Result<String, SyncError> {
    let db = ctx.open_database()?;
    let results = SyncHistory::new(db).list(limit)?;
    format_history(&results, format)
}
