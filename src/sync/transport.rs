//! Seams to the remote authority.
//!
//! The sync core never speaks a wire protocol itself. Callers supply a
//! [`SyncTransport`] (HTTP, gRPC, or anything else) and optionally a set of
//! [`OfflineQueueService`]s for domain-specific queues that sync on their own.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::incremental::SyncEntity;
use super::queue::SyncOperation;
use crate::error::SyncError;

/// Transport to the remote authority.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Send local changes. Returns the entities the server accepted.
    async fn upload(&self, entities: &[SyncEntity]) -> Result<Vec<SyncEntity>, SyncError>;

    /// Fetch server changes made after `since` (everything if `None`).
    async fn download(&self, since: Option<DateTime<Utc>>) -> Result<Vec<SyncEntity>, SyncError>;

    /// Deliver a batch of queued operations. The batch succeeds or fails as a whole.
    async fn send_operations(&self, operations: &[SyncOperation]) -> Result<(), SyncError>;
}

/// A domain queue that synchronizes independently of the generic queue.
#[async_trait]
pub trait OfflineQueueService: Send + Sync {
    /// Name used in logs and results.
    fn name(&self) -> &str;

    /// Push the service's queued items. Returns how many were sent.
    async fn sync_with_server(&self) -> Result<usize, SyncError>;
}

/// Await `fut`, failing with `SyncError::Timeout` after `limit`.
///
/// # Errors
///
/// Returns the future's own error, or a timeout error.
pub async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, SyncError>
where
    F: Future<Output = Result<T, SyncError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout(format!(
            "{what} after {}ms",
            limit.as_millis()
        ))),
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    entities: HashMap<String, SyncEntity>,
    uploaded: Vec<String>,
    upload_calls: usize,
    failing_upload_calls: HashSet<usize>,
    rejected: HashSet<String>,
    download_calls: usize,
    download_failure: Option<String>,
    operations: Vec<SyncOperation>,
    operation_failure: Option<String>,
    latency: Duration,
}

/// Loopback transport that keeps the "server" in memory.
///
/// Useful for tests and for running the sync core without a backend.
/// Failures and latency can be injected per call.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a server-side change that the next download will return.
    pub fn put_server_entity(&self, entity: SyncEntity) {
        self.state().entities.insert(entity.id.clone(), entity);
    }

    #[must_use]
    pub fn server_entity(&self, id: &str) -> Option<SyncEntity> {
        self.state().entities.get(id).cloned()
    }

    /// Ids accepted by every upload so far, in order.
    #[must_use]
    pub fn uploaded_ids(&self) -> Vec<String> {
        self.state().uploaded.clone()
    }

    #[must_use]
    pub fn upload_calls(&self) -> usize {
        self.state().upload_calls
    }

    #[must_use]
    pub fn download_calls(&self) -> usize {
        self.state().download_calls
    }

    /// Make the upload call with the given zero-based index fail.
    pub fn fail_upload_call(&self, index: usize) {
        self.state().failing_upload_calls.insert(index);
    }

    /// Have the server refuse the entity without failing the batch.
    pub fn reject_entity(&self, id: &str) {
        self.state().rejected.insert(id.to_string());
    }

    pub fn set_download_failure(&self, message: Option<&str>) {
        self.state().download_failure = message.map(str::to_string);
    }

    pub fn set_operation_failure(&self, message: Option<&str>) {
        self.state().operation_failure = message.map(str::to_string);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Operations delivered so far.
    #[must_use]
    pub fn sent_operations(&self) -> Vec<SyncOperation> {
        self.state().operations.clone()
    }

    async fn delay(&self) {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl SyncTransport for MemoryTransport {
    async fn upload(&self, entities: &[SyncEntity]) -> Result<Vec<SyncEntity>, SyncError> {
        self.delay().await;
        let mut state = self.state();
        let call = state.upload_calls;
        state.upload_calls += 1;
        if state.failing_upload_calls.contains(&call) {
            return Err(SyncError::Transport(format!("upload call {call} failed")));
        }

        let mut accepted = Vec::new();
        for entity in entities {
            if state.rejected.contains(&entity.id) {
                continue;
            }
            state.entities.insert(entity.id.clone(), entity.clone());
            state.uploaded.push(entity.id.clone());
            accepted.push(entity.clone());
        }
        Ok(accepted)
    }

    async fn download(&self, since: Option<DateTime<Utc>>) -> Result<Vec<SyncEntity>, SyncError> {
        self.delay().await;
        let mut state = self.state();
        state.download_calls += 1;
        if let Some(message) = &state.download_failure {
            return Err(SyncError::Transport(message.clone()));
        }

        let mut changed: Vec<SyncEntity> = state
            .entities
            .values()
            .filter(|e| since.map_or(true, |since| e.timestamp > since))
            .cloned()
            .collect();
        changed.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(changed)
    }

    async fn send_operations(&self, operations: &[SyncOperation]) -> Result<(), SyncError> {
        self.delay().await;
        let mut state = self.state();
        if let Some(message) = &state.operation_failure {
            return Err(SyncError::Transport(message.clone()));
        }
        state.operations.extend_from_slice(operations);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let result: Result<(), SyncError> = with_timeout(Duration::from_secs(1), "upload", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(SyncError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let result = with_timeout(Duration::from_secs(1), "download", async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_memory_transport_filters_by_since() {
        let transport = MemoryTransport::new();
        let old = SyncEntity::new("a", "medication", json!({}));
        let cutoff = old.timestamp;
        let new = SyncEntity::new("b", "medication", json!({}))
            .with_timestamp(cutoff + chrono::Duration::seconds(1));
        transport.put_server_entity(old);
        transport.put_server_entity(new);

        assert_eq!(transport.download(None).await.unwrap().len(), 2);
        let since = transport.download(Some(cutoff)).await.unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].id, "b");
    }

    #[tokio::test]
    async fn test_memory_transport_injected_failures() {
        let transport = MemoryTransport::new();
        transport.fail_upload_call(0);
        transport.reject_entity("bad");

        let batch = vec![
            SyncEntity::new("good", "medication", json!({})),
            SyncEntity::new("bad", "medication", json!({})),
        ];
        assert!(transport.upload(&batch).await.is_err());
        let accepted = transport.upload(&batch).await.unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(transport.uploaded_ids(), vec!["good"]);
        assert_eq!(transport.upload_calls(), 2);
    }
}
