//! Core utilities shared by the sync components.
//!
//! - Timestamp encoding for persisted records
//! - Named, cancellable timer tasks

pub mod datetime;
mod scheduler;

pub use scheduler::TaskScheduler;
