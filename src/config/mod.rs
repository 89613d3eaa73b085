//! Configuration management for medsync.
//!
//! This module handles loading and saving configuration from `~/.medsync/`.

mod paths;
mod settings;

pub use paths::Paths;
pub use settings::{
    Config, ConnectionConfig, GeneralConfig, IncrementalConfig, QueueConfig, SyncConfig,
};
