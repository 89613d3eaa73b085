//! Durable priority queue of outbound mutations.
//!
//! Operations are persisted in `SQLite` and survive restarts. Failed operations
//! retry with exponential backoff until they exhaust their budget, after
//! which they stay in the queue as `failed` for inspection.

mod manager;
mod operation;

pub use manager::{QueueStats, SyncQueueManager};
pub use operation::{
    NewOperation, OperationKind, OperationStatus, QueueBatch, SyncOperation, DEFAULT_PRIORITY,
    MAX_PRIORITY, MIN_PRIORITY,
};
