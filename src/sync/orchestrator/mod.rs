//! Cycle coordination: strategy selection, the orchestrator itself, and the
//! results, status and history it records.

mod cycle;
mod result;
mod status;
mod strategy;

pub use cycle::{SyncOrchestrator, SyncOrchestratorBuilder};
pub use result::{NetworkSnapshot, SyncResult};
pub use status::{SyncHistory, SyncStatus};
pub use strategy::{select_strategy, DeviceConditions, NetworkRequirement, SyncStrategy};
