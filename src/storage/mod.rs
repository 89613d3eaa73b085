//! Storage layer for medsync.
//!
//! This module provides SQLite-based persistence for:
//! - The durable operation queue
//! - Delta-sync state (checksums, timestamps, pending and failed changes)
//! - Conflicts and sync history
//! - Keyed JSON documents for status, configuration and diagnostics

mod database;
mod migrations;

pub use database::Database;

/// Document keys used by the sync components.
pub mod keys {
    /// Orchestrator status snapshot.
    pub const SYNC_STATUS: &str = "sync_status";
    /// Active orchestrator configuration.
    pub const SYNC_CONFIG: &str = "sync_config";
    /// Delta-sync checkpoint.
    pub const SYNC_STATE: &str = "sync_state";
    /// Recent connection snapshots.
    pub const CONNECTION_HISTORY: &str = "connection_history";
}
