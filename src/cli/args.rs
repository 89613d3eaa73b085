use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(name = "medsync")]
#[command(about = "Inspect and maintain the state of the medsync offline sync core")]
#[command(long_about = "medsync - offline-first sync core

Reads and maintains the local sync store: the operation queue, pending
conflicts, sync history and configuration. The sync cycle itself runs
inside the host application; this tool works on the same database.

QUICK START:
  medsync status              Overall sync health
  medsync queue list          Pending operations, highest priority first
  medsync conflicts list      Conflicts waiting for a decision
  medsync history             Recent sync cycles

OUTPUT FORMATS:
  --output pretty    Human-readable colored output (default)
  --output json      Machine-readable JSON for scripting

For more information on a specific command, run:
  medsync <command> --help")]
#[command(version, propagate_version = true)]
pub struct Cli {
    /// Output format for command results
    ///
    /// Defaults to `general.default_output` from the config file.
    #[arg(short, long, value_enum, global = true)]
    pub output: Option<OutputFormat>,

    /// Data directory (defaults to ~/.medsync)
    #[arg(long, global = true, env = "MEDSYNC_HOME")]
    pub data_dir: Option<PathBuf>,

    /// Log level filter; RUST_LOG takes precedence
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for command results.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable colored output.
    #[default]
    Pretty,
    /// Machine-readable JSON output.
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show overall sync status
    ///
    /// Combines the last cycle's outcome with live queue and conflict
    /// counts.
    ///
    /// # Examples
    ///
    ///   medsync status
    ///   medsync status -o json
    #[command(alias = "s")]
    Status,

    /// Inspect and maintain the operation queue
    ///
    /// # Subcommands
    ///
    ///   list     Show queued operations
    ///   stats    Queue statistics
    ///   retry    Requeue failed operations
    ///   purge    Remove completed history past retention
    ///   clear    Remove every operation
    ///
    /// # Examples
    ///
    ///   medsync queue list                 Pending operations
    ///   medsync queue list --status failed Operations that gave up
    ///   medsync queue retry --all          Requeue every failed operation
    #[command(alias = "q")]
    Queue(QueueArgs),

    /// Review conflicts
    ///
    /// # Subcommands
    ///
    ///   list     Conflicts waiting for a decision
    ///   show     Both versions of one conflict
    ///   log      Recent resolutions
    Conflicts(ConflictArgs),

    /// Show recent sync cycles, newest first
    ///
    /// # Examples
    ///
    ///   medsync history
    ///   medsync history -n 5 -o json
    History {
        /// Maximum results to show
        #[arg(long, short = 'n', default_value = "10")]
        limit: usize,
    },

    /// View or create the configuration file
    ///
    /// # Subcommands
    ///
    ///   show     Effective configuration
    ///   init     Write a config file with every default spelled out
    ///   path     Location of the config file
    Config(ConfigArgs),
}

/// Arguments for queue commands.
#[derive(Args)]
pub struct QueueArgs {
    #[command(subcommand)]
    pub command: QueueCommands,
}

/// Queue subcommands.
#[derive(Subcommand)]
pub enum QueueCommands {
    /// List queued operations
    ///
    /// Without a status filter, pending and processing operations are shown.
    List {
        /// Filter by status (pending, processing, completed, failed)
        #[arg(long, short = 's')]
        status: Option<String>,

        /// Maximum operations to show
        #[arg(long, short = 'n', default_value = "20")]
        limit: usize,
    },

    /// Show queue statistics
    Stats,

    /// Requeue failed operations
    ///
    /// Resets the retry count so the operation gets a fresh budget.
    Retry {
        /// Retry all failed operations
        #[arg(long)]
        all: bool,

        /// Specific operation ID to retry
        id: Option<String>,
    },

    /// Remove completed operations past their retention
    Purge,

    /// Remove every operation from the queue
    Clear {
        /// Required; this cannot be undone
        #[arg(long, short = 'f')]
        force: bool,
    },
}

/// Arguments for conflict commands.
#[derive(Args)]
pub struct ConflictArgs {
    #[command(subcommand)]
    pub command: ConflictCommands,
}

/// Conflict subcommands.
#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List conflicts waiting for a decision
    List,

    /// Show both versions of a conflict
    Show {
        /// Conflict ID
        id: String,
    },

    /// Show recent resolutions
    Log {
        /// Maximum entries to show
        #[arg(long, short = 'n', default_value = "20")]
        limit: usize,
    },
}

/// Arguments for config commands.
#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

/// Config subcommands.
#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Write a config file with all defaults
    Init {
        /// Overwrite an existing file
        #[arg(long, short = 'f')]
        force: bool,
    },

    /// Print the config file location
    Path,
}
