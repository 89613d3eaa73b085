//! Error types for medsync.

use thiserror::Error;

/// Errors produced by the sync core.
///
/// Cycle-level conditions (`NotInitialized`, `Offline`, `SyncInProgress`) are
/// returned before a cycle touches any state. Failures inside a cycle are
/// recorded on the [`SyncResult`](crate::sync::SyncResult) instead.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid operation: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Sync core has not been initialized")]
    NotInitialized,

    #[error("Device is offline")]
    Offline,

    #[error("A sync cycle is already in progress")]
    SyncInProgress,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl SyncError {
    /// Whether the failure is transient and worth retrying with backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }

    /// Whether the error aborted a cycle before it started.
    #[must_use]
    pub const fn is_cycle_rejection(&self) -> bool {
        matches!(
            self,
            Self::NotInitialized | Self::Offline | Self::SyncInProgress
        )
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::Transport("reset".to_string()).is_retryable());
        assert!(SyncError::Timeout("upload".to_string()).is_retryable());
        assert!(!SyncError::Validation("priority".to_string()).is_retryable());
        assert!(!SyncError::Offline.is_retryable());
    }

    #[test]
    fn test_cycle_rejection() {
        assert!(SyncError::SyncInProgress.is_cycle_rejection());
        assert!(SyncError::NotInitialized.is_cycle_rejection());
        assert!(!SyncError::Database("locked".to_string()).is_cycle_rejection());
    }
}
