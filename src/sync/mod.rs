//! The offline-first sync core.
//!
//! - [`connection`] decides whether the network is good enough to sync
//! - [`queue`] holds outbound operations durably, by priority
//! - [`incremental`] exchanges only what changed and detects conflicts
//! - [`conflict`] settles conflicts and keeps the ones left for the user
//! - [`orchestrator`] runs the cycle that ties them together

pub mod conflict;
pub mod connection;
pub mod incremental;
pub mod orchestrator;
pub mod queue;
pub mod transport;

pub use conflict::{
    ConflictResolution, ConflictResolver, ConflictStore, ConflictType, MergeFallback, MergePolicy,
    PolicyResolver, ResolutionRecord, ResolutionStrategy, SyncConflict,
};
pub use connection::{
    ChannelNetworkMonitor, ConnectionQuality, ConnectionState, ConnectionStateManager,
    ConnectionType, NetworkMonitor, NetworkReading,
};
pub use incremental::{IncrementalSyncEngine, SyncEntity};
pub use orchestrator::{DeviceConditions, SyncOrchestrator, SyncResult, SyncStatus, SyncStrategy};
pub use queue::{NewOperation, OperationKind, OperationStatus, SyncOperation, SyncQueueManager};
pub use transport::{MemoryTransport, OfflineQueueService, SyncTransport};
