//! Operation types for the sync queue.
//!
//! Defines the mutations that can be queued and their lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

/// Lowest accepted priority.
pub const MIN_PRIORITY: u8 = 1;
/// Highest accepted priority.
pub const MAX_PRIORITY: u8 = 10;
/// Priority given when none is requested.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Kind of mutation carried by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    /// Whether this kind must carry a payload.
    #[must_use]
    pub const fn requires_payload(&self) -> bool {
        matches!(self, Self::Create | Self::Update)
    }

    /// Convert from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

/// Status of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be sent
    Pending,
    /// Handed to the transport in the current cycle
    Processing,
    /// Successfully sent
    Completed,
    /// Failed after max retries
    Failed,
}

impl OperationStatus {
    /// Check if this status is terminal (no more action needed).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Convert from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: String,
    pub kind: OperationKind,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Value,
    /// 1 (lowest) to 10 (most urgent)
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time the operation may be dispatched again
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub status: OperationStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncOperation {
    /// Approximate serialized size in bytes.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        serde_json::to_vec(self).map_or(0, |bytes| bytes.len())
    }
}

/// A mutation to be enqueued. The queue assigns identity and bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub kind: OperationKind,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Value,
    pub priority: u8,
}

impl NewOperation {
    #[must_use]
    pub fn new(
        kind: OperationKind,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            kind,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            payload,
            priority: DEFAULT_PRIORITY,
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Check required fields and ranges.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Validation` describing the first problem found.
    pub fn validate(&self) -> Result<(), SyncError> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(SyncError::Validation(format!(
                "priority {} outside {MIN_PRIORITY}..={MAX_PRIORITY}",
                self.priority
            )));
        }
        if self.entity_type.trim().is_empty() {
            return Err(SyncError::Validation("entity type is required".to_string()));
        }
        if self.entity_id.trim().is_empty() {
            return Err(SyncError::Validation("entity id is required".to_string()));
        }
        if self.kind.requires_payload() && self.payload.is_null() {
            return Err(SyncError::Validation(format!(
                "{} operation for {} requires a payload",
                self.kind, self.entity_id
            )));
        }
        Ok(())
    }
}

/// Operations selected for one transmission round.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueBatch {
    pub operations: Vec<SyncOperation>,
    pub estimated_bytes: usize,
    /// Highest priority in the batch
    pub aggregate_priority: u8,
}

impl QueueBatch {
    /// Build a batch, or `None` if there is nothing to send.
    #[must_use]
    pub fn from_operations(operations: Vec<SyncOperation>) -> Option<Self> {
        let aggregate_priority = operations.iter().map(|op| op.priority).max()?;
        let estimated_bytes = operations.iter().map(SyncOperation::estimated_size).sum();
        Some(Self {
            operations,
            estimated_bytes,
            aggregate_priority,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Ids of the operations in the batch.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.operations.iter().map(|op| op.id.clone()).collect()
    }
}
