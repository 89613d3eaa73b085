//! Command-line interface for inspecting the local sync store.

pub mod args;
pub mod commands;
