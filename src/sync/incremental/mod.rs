//! Incremental (delta) synchronization.
//!
//! Tracks per-entity timestamps and content checksums so that only changed
//! entities cross the network, and flags true conflicts instead of silently
//! overwriting local changes.

mod engine;
mod entity;

pub use engine::{DeltaOptions, DeltaSyncResult, FailedSync, IncrementalSyncEngine, IntegrityReport};
pub use entity::{checksum, SyncEntity};
