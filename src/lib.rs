//! medsync - offline-first synchronization core
//!
//! This crate keeps a mobile client's data flowing to its server across
//! unreliable connectivity: it tracks network state, queues local mutations
//! durably, exchanges deltas, resolves conflicts and coordinates all of it
//! in sync cycles. The `medsync` binary inspects the same local store.

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod output;
pub mod storage;
pub mod sync;

pub use cli::args::{Cli, Commands, OutputFormat};
pub use config::Config;
pub use error::SyncError;
pub use storage::Database;
pub use sync::{
    ConnectionStateManager, IncrementalSyncEngine, SyncOrchestrator, SyncQueueManager, SyncResult,
};
