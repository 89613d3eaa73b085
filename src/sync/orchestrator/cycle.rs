//! The sync orchestrator.
//!
//! One cycle runs at a time. A cycle picks a strategy, checks local
//! integrity, drains the operation queue, runs the offline services,
//! exchanges deltas, settles conflicts and records the result. Failures
//! inside a cycle are recorded on its [`SyncResult`]; only the gating
//! conditions are returned as errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::result::{NetworkSnapshot, SyncResult};
use super::status::{SyncHistory, SyncStatus};
use super::strategy::{select_strategy, DeviceConditions, SyncStrategy};
use crate::config::{Config, SyncConfig};
use crate::core::{datetime, TaskScheduler};
use crate::error::SyncError;
use crate::storage::{keys, Database};
use crate::sync::conflict::{
    ConflictResolution, ConflictResolver, ConflictStore, PolicyResolver, ResolutionRecord,
    ResolutionStrategy, SyncConflict,
};
use crate::sync::connection::{ConnectionChange, ConnectionStateManager, NetworkMonitor, Subscription};
use crate::sync::incremental::{DeltaOptions, IncrementalSyncEngine, SyncEntity};
use crate::sync::queue::{NewOperation, OperationKind, SyncOperation, SyncQueueManager};
use crate::sync::transport::{with_timeout, OfflineQueueService, SyncTransport};

const RECONNECT_TASK: &str = "reconnect-sync";
const BACKGROUND_TASK: &str = "background-sync";

enum ResolverSlot {
    /// Built from the configured conflict policy each cycle
    Policy,
    Custom(Arc<dyn ConflictResolver>),
    /// Every conflict waits for the user
    Absent,
}

/// Builder for [`SyncOrchestrator`].
pub struct SyncOrchestratorBuilder {
    db: Database,
    transport: Arc<dyn SyncTransport>,
    config: Config,
    connection: Option<ConnectionStateManager>,
    resolver: ResolverSlot,
    offline_services: Vec<Arc<dyn OfflineQueueService>>,
    strategies: Vec<SyncStrategy>,
}

impl std::fmt::Debug for SyncOrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestratorBuilder")
            .field("config", &self.config)
            .field("offline_services", &self.offline_services.len())
            .finish_non_exhaustive()
    }
}

impl SyncOrchestratorBuilder {
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Share an existing connection manager instead of creating one.
    #[must_use]
    pub fn connection(mut self, connection: ConnectionStateManager) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Replace the policy resolver with a custom one.
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = ResolverSlot::Custom(resolver);
        self
    }

    /// Run without a resolver; every conflict is left for the user.
    #[must_use]
    pub fn without_resolver(mut self) -> Self {
        self.resolver = ResolverSlot::Absent;
        self
    }

    #[must_use]
    pub fn offline_service(mut self, service: Arc<dyn OfflineQueueService>) -> Self {
        self.offline_services.push(service);
        self
    }

    #[must_use]
    pub fn strategies(mut self, strategies: Vec<SyncStrategy>) -> Self {
        self.strategies = strategies;
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<SyncOrchestrator> {
        let Self {
            db,
            transport,
            config,
            connection,
            resolver,
            offline_services,
            strategies,
        } = self;

        let owns_connection = connection.is_none();
        let connection = connection.unwrap_or_else(|| {
            ConnectionStateManager::with_database(config.connection.clone(), db.clone())
        });

        Arc::new_cyclic(|this| SyncOrchestrator {
            this: this.clone(),
            queue: SyncQueueManager::new(db.clone(), config.queue),
            engine: IncrementalSyncEngine::new(db.clone(), config.incremental),
            conflicts: ConflictStore::new(db.clone()),
            history: SyncHistory::new(db.clone()),
            db,
            config: Mutex::new(config.sync),
            connection,
            owns_connection,
            transport,
            resolver,
            offline_services,
            strategies,
            device: Mutex::new(DeviceConditions::default()),
            in_progress: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            timers: TaskScheduler::new(),
            subscription: Mutex::new(None),
        })
    }
}

/// Clears the in-progress flag when a cycle ends, however it ends.
///
/// A cycle dropped after [`CycleGuard::arm`] but before
/// [`CycleGuard::finish`] hands its in-flight operations back to the queue
/// and is recorded as interrupted.
struct CycleGuard<'a> {
    orchestrator: &'a SyncOrchestrator,
    unfinished: Option<(SyncResult, SyncConfig, Instant)>,
}

impl<'a> CycleGuard<'a> {
    const fn new(orchestrator: &'a SyncOrchestrator) -> Self {
        Self {
            orchestrator,
            unfinished: None,
        }
    }

    fn arm(&mut self, result: &SyncResult, config: &SyncConfig, started: Instant) {
        self.unfinished = Some((result.clone(), config.clone(), started));
    }

    fn finish(mut self) {
        self.unfinished = None;
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if let Some((mut result, config, started)) = self.unfinished.take() {
            self.orchestrator.record_interrupted(&mut result, &config, started);
        }
        self.orchestrator.in_progress.store(false, Ordering::SeqCst);
    }
}

/// Single entry point for synchronization.
pub struct SyncOrchestrator {
    this: Weak<Self>,
    db: Database,
    config: Mutex<SyncConfig>,
    connection: ConnectionStateManager,
    owns_connection: bool,
    queue: SyncQueueManager,
    engine: IncrementalSyncEngine,
    conflicts: ConflictStore,
    history: SyncHistory,
    transport: Arc<dyn SyncTransport>,
    resolver: ResolverSlot,
    offline_services: Vec<Arc<dyn OfflineQueueService>>,
    strategies: Vec<SyncStrategy>,
    device: Mutex<DeviceConditions>,
    in_progress: AtomicBool,
    initialized: AtomicBool,
    timers: TaskScheduler,
    subscription: Mutex<Option<Subscription>>,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("initialized", &self.is_initialized())
            .field("in_progress", &self.is_sync_in_progress())
            .finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    /// Start building an orchestrator over `db` and `transport`.
    #[must_use]
    pub fn builder(db: Database, transport: Arc<dyn SyncTransport>) -> SyncOrchestratorBuilder {
        SyncOrchestratorBuilder {
            db,
            transport,
            config: Config::default(),
            connection: None,
            resolver: ResolverSlot::Policy,
            offline_services: Vec::new(),
            strategies: SyncStrategy::defaults(),
        }
    }

    fn config_lock(&self) -> MutexGuard<'_, SyncConfig> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device_lock(&self) -> MutexGuard<'_, DeviceConditions> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscription_lock(&self) -> MutexGuard<'_, Option<Subscription>> {
        self.subscription.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Restore persisted state and start reacting to connectivity.
    ///
    /// Components come up in order: connection tracking, then the queue
    /// (which recovers operations interrupted mid-send), then the
    /// orchestrator's own status. Must be called from within a tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted state cannot be read.
    pub fn initialize(&self, monitor: &dyn NetworkMonitor) -> Result<(), SyncError> {
        if self.is_initialized() {
            return Ok(());
        }

        if let Some(stored) = self.db.get_document::<SyncConfig>(keys::SYNC_CONFIG)? {
            debug!("using persisted sync configuration");
            *self.config_lock() = stored;
        }

        if !self.connection.is_initialized() {
            self.connection.initialize(monitor)?;
        }
        let recovered = self.queue.initialize()?;

        let mut status: SyncStatus = self.db.get_document(keys::SYNC_STATUS)?.unwrap_or_default();
        if status.in_progress {
            warn!("previous sync cycle did not finish");
            status.in_progress = false;
            status.save(&self.db)?;
        }

        let weak = self.this.clone();
        let subscription = self.connection.on_state_change(move |change| {
            if let Some(orchestrator) = weak.upgrade() {
                orchestrator.on_connection_change(change);
            }
            Ok(())
        });
        *self.subscription_lock() = Some(subscription);

        self.initialized.store(true, Ordering::SeqCst);
        self.start_background_sync();
        info!(recovered, "sync orchestrator initialized");
        Ok(())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_sync_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Run one sync cycle.
    ///
    /// `strategy_hint` names a strategy to prefer when it is eligible.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized`, `Offline` or `SyncInProgress` without
    /// touching any state. Everything that goes wrong after that is
    /// recorded on the returned result.
    pub async fn perform_sync(&self, strategy_hint: Option<&str>) -> Result<SyncResult, SyncError> {
        if !self.is_initialized() {
            return Err(SyncError::NotInitialized);
        }
        let state = self.connection.get_connection_state();
        if !state.is_connected {
            return Err(SyncError::Offline);
        }
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::SyncInProgress);
        }
        let mut guard = CycleGuard::new(self);

        let config = self.sync_config();
        let device = *self.device_lock();
        let strategy = select_strategy(&self.strategies, &state, &device, strategy_hint);
        let started = Instant::now();
        let mut result =
            SyncResult::begin(&strategy.name, NetworkSnapshot::from(&state), !config.enable_incremental);
        info!(id = %result.id, strategy = %strategy.name, "sync cycle started");
        guard.arm(&result, &config, started);
        self.mark_in_progress();

        if config.validate_integrity {
            self.check_integrity(&mut result);
        }
        self.drain_queue(&strategy, &config, &mut result).await;
        self.sync_offline_services(&config, &mut result).await;

        if self.connection.get_connection_state().is_connected {
            let conflicts = self.exchange_deltas(&strategy, &config, &mut result).await;
            self.resolve_conflicts(conflicts, &config, &mut result);
        } else {
            result
                .errors
                .push("connection lost before delta sync".to_string());
        }

        result.finish(started.elapsed());
        self.persist_result(&config, &result);
        guard.finish();
        info!(
            id = %result.id,
            success = result.success,
            operations = result.operations_processed,
            uploaded = result.entities_uploaded,
            downloaded = result.entities_downloaded,
            conflicts = result.conflicts.len(),
            duration_ms = result.duration_ms,
            "sync cycle finished"
        );
        Ok(result)
    }

    fn check_integrity(&self, result: &mut SyncResult) {
        match self.engine.validate_integrity() {
            Ok(report) if !report.repaired.is_empty() => {
                warn!(count = report.repaired.len(), "repaired local checksums");
            }
            Ok(_) => {}
            Err(e) => note(result, "integrity", &e),
        }
    }

    async fn drain_queue(&self, strategy: &SyncStrategy, config: &SyncConfig, result: &mut SyncResult) {
        let timeout = config.transport_timeout();
        loop {
            if !self.connection.get_connection_state().is_connected {
                result
                    .errors
                    .push("connection lost during queue drain".to_string());
                break;
            }

            let batch = match self
                .queue
                .next_batch_with(strategy.batch_size, strategy.min_operation_priority)
            {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => {
                    note(result, "queue", &e);
                    break;
                }
            };
            if let Err(e) = self.queue.mark_batch_processing(&batch) {
                note(result, "queue", &e);
                break;
            }

            debug!(
                size = batch.len(),
                priority = batch.aggregate_priority,
                bytes = batch.estimated_bytes,
                "sending queue batch"
            );
            let sent = with_timeout(
                timeout,
                "send operations",
                self.transport.send_operations(&batch.operations),
            )
            .await;

            match sent {
                Ok(()) => {
                    result.bytes_transferred += batch.estimated_bytes;
                    for op in &batch.operations {
                        match self.queue.mark_operation_completed(&op.id) {
                            Ok(()) => result.operations_processed += 1,
                            Err(e) => note(result, "queue", &e),
                        }
                    }
                }
                Err(e) => {
                    warn!(size = batch.len(), error = %e, "queue batch failed");
                    result.errors.push(format!("queue batch: {e}"));
                    let message = e.to_string();
                    for op in &batch.operations {
                        match self.queue.mark_operation_failed(&op.id, &message) {
                            Ok(true) => result.operations_retrying += 1,
                            Ok(false) => result.operations_failed += 1,
                            Err(e) => note(result, "queue", &e),
                        }
                    }
                    break;
                }
            }
        }
    }

    async fn sync_offline_services(&self, config: &SyncConfig, result: &mut SyncResult) {
        let timeout = config.transport_timeout();
        for service in &self.offline_services {
            match with_timeout(timeout, service.name(), service.sync_with_server()).await {
                Ok(count) => {
                    debug!(service = service.name(), count, "offline service synced");
                    result.offline_items_synced += count;
                }
                Err(e) => note(result, service.name(), &e),
            }
        }
    }

    async fn exchange_deltas(
        &self,
        strategy: &SyncStrategy,
        config: &SyncConfig,
        result: &mut SyncResult,
    ) -> Vec<SyncConflict> {
        if let Err(e) = self.engine.retry_failed_syncs() {
            note(result, "retry", &e);
        }

        let options = DeltaOptions {
            batch_size: strategy.batch_size.min(self.engine.config().batch_size),
            min_priority: strategy.min_operation_priority,
            download: strategy.download,
        };
        let transport = self.transport.as_ref();
        let delta = if config.enable_incremental {
            self.engine.perform_incremental_sync_with(transport, options).await
        } else {
            self.engine.perform_full_sync(transport, options).await
        };

        match delta {
            Ok(delta) => result.absorb_delta(delta),
            Err(e) => {
                note(result, "delta sync", &e);
                Vec::new()
            }
        }
    }

    fn resolver_for(&self, config: &SyncConfig) -> Option<Arc<dyn ConflictResolver>> {
        match &self.resolver {
            ResolverSlot::Policy => Some(Arc::new(
                PolicyResolver::new(config.conflict_policy).with_default_policies(),
            )),
            ResolverSlot::Custom(resolver) => Some(Arc::clone(resolver)),
            ResolverSlot::Absent => None,
        }
    }

    fn resolve_conflicts(
        &self,
        conflicts: Vec<SyncConflict>,
        config: &SyncConfig,
        result: &mut SyncResult,
    ) {
        if conflicts.is_empty() {
            return;
        }
        let resolver = self.resolver_for(config);

        for mut conflict in conflicts {
            let outcome = resolver.as_ref().map_or(ConflictResolution::Deferred, |r| {
                r.resolve_conflict(&conflict).unwrap_or_else(|e| {
                    warn!(entity = %conflict.entity_id, error = %e, "resolver failed, deferring");
                    ConflictResolution::Deferred
                })
            });
            if let Err(e) = self.settle(&mut conflict, outcome, result) {
                note(result, "conflict", &e);
            }
            result.conflicts.push(conflict);
        }
    }

    fn settle(
        &self,
        conflict: &mut SyncConflict,
        outcome: ConflictResolution,
        result: &mut SyncResult,
    ) -> Result<(), SyncError> {
        let label = outcome.label();
        let server_version = conflict.max_version();

        let (strategy, data) = match outcome {
            ConflictResolution::Deferred => {
                conflict.resolution = Some(ResolutionStrategy::UserChoiceRequired);
                *conflict = self.conflicts.save(conflict)?;
                info!(entity = %conflict.entity_id, kind = %conflict.conflict_type, "conflict awaiting user");
                return Ok(());
            }
            ConflictResolution::LocalWins => {
                let kept = self
                    .engine
                    .keep_local_version(&conflict.entity_id, server_version)?;
                (ResolutionStrategy::LocalPreference, kept.map(|e| e.data))
            }
            ConflictResolution::ServerWins => {
                self.engine.apply_server_entity(&conflict.server_version)?;
                result.applied.push(conflict.server_version.clone());
                (
                    ResolutionStrategy::ServerPreference,
                    Some(conflict.server_version.data.clone()),
                )
            }
            ConflictResolution::Merged(data) => {
                let staged = self.engine.apply_resolved_data(
                    &conflict.entity_id,
                    &conflict.entity_type,
                    data,
                    server_version,
                )?;
                let data = staged.data.clone();
                result.applied.push(staged);
                (ResolutionStrategy::IntelligentMerge, Some(data))
            }
        };

        conflict.resolution = Some(strategy);
        conflict.resolved_data.clone_from(&data);
        if let Some(stale) = self.conflicts.get_by_entity(&conflict.entity_id)? {
            self.conflicts.remove(&stale.id)?;
        }
        self.conflicts.log_resolution(&ResolutionRecord {
            conflict_id: conflict.id.clone(),
            entity_id: conflict.entity_id.clone(),
            entity_type: conflict.entity_type.clone(),
            outcome: label.to_string(),
            resolved_data: data,
            reasoning: Some(format!("automatic: {strategy}")),
            resolved_at: datetime::now(),
        })?;
        result.conflicts_resolved += 1;
        debug!(entity = %conflict.entity_id, outcome = label, "conflict resolved");
        Ok(())
    }

    fn mark_in_progress(&self) {
        let mut status = self.stored_status();
        status.in_progress = true;
        if let Err(e) = status.save(&self.db) {
            warn!(error = %e, "failed to persist sync status");
        }
    }

    fn stored_status(&self) -> SyncStatus {
        match self.db.get_document::<SyncStatus>(keys::SYNC_STATUS) {
            Ok(status) => status.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "failed to read sync status");
                SyncStatus::default()
            }
        }
    }

    fn record_interrupted(&self, result: &mut SyncResult, config: &SyncConfig, started: Instant) {
        let released = match self.queue.release_processing() {
            Ok(released) => released,
            Err(e) => {
                note(result, "queue", &e);
                0
            }
        };
        result.errors.push("sync cycle interrupted".to_string());
        result.finish(started.elapsed());
        self.persist_result(config, result);
        warn!(id = %result.id, released, "sync cycle interrupted");
    }

    fn persist_result(&self, config: &SyncConfig, result: &SyncResult) {
        if let Err(e) = self.history.append(result, config.history_limit) {
            warn!(error = %e, "failed to record sync history");
        }
        let mut status = self.stored_status();
        status.record(result);
        if let Err(e) = status.save(&self.db) {
            warn!(error = %e, "failed to persist sync status");
        }
    }

    /// Record a local mutation.
    ///
    /// The change is tracked for the next delta exchange and enqueued as an
    /// operation. With auto-sync on and favourable conditions a cycle is
    /// started in the background; the call itself never waits for it.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Validation` for a malformed operation, or a
    /// database error if it cannot be stored.
    pub fn queue_data_change(
        &self,
        entity_type: &str,
        kind: OperationKind,
        entity_id: &str,
        data: Value,
        priority: u8,
    ) -> Result<SyncOperation, SyncError> {
        let new = NewOperation::new(kind, entity_type, entity_id, data).with_priority(priority);
        new.validate()?;

        match kind {
            OperationKind::Delete => {
                self.engine
                    .track_entity_deletion_with_priority(entity_id, entity_type, priority)?
            }
            OperationKind::Create | OperationKind::Update => self
                .engine
                .track_entity_change_with_priority(entity_id, entity_type, new.payload.clone(), priority)?,
        };
        let operation = self.queue.enqueue(new)?;

        self.maybe_auto_sync();
        Ok(operation)
    }

    fn maybe_auto_sync(&self) {
        if !self.sync_config().auto_sync
            || !self.is_initialized()
            || self.is_sync_in_progress()
            || !self.connection.is_sync_recommended()
        {
            return;
        }
        self.spawn_cycle("data change");
    }

    /// Run a cycle on its own task. Timers only own the wait before it, so
    /// cancelling one never cuts a running cycle short.
    fn spawn_cycle(&self, trigger: &'static str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(trigger, "no runtime, sync skipped");
            return;
        };
        let Some(this) = self.this.upgrade() else { return };
        handle.spawn(async move {
            this.run_logged(trigger).await;
        });
    }

    async fn run_logged(&self, trigger: &str) {
        match self.perform_sync(None).await {
            Ok(result) => debug!(trigger, success = result.success, "triggered sync finished"),
            Err(e) if e.is_cycle_rejection() => debug!(trigger, reason = %e, "triggered sync skipped"),
            Err(e) => warn!(trigger, error = %e, "triggered sync failed"),
        }
    }

    fn on_connection_change(&self, change: &ConnectionChange) {
        if change.went_offline() {
            if self.timers.cancel(RECONNECT_TASK) {
                debug!("connection lost, pending reconnect sync cancelled");
            }
            return;
        }

        let config = self.sync_config();
        if !change.became_stable() || !config.auto_sync {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }

        let delay = config.settle_delay();
        info!(delay_ms = config.settle_delay_ms, "connection stable, sync scheduled");
        let weak = self.this.clone();
        self.timers.schedule_after(RECONNECT_TASK, delay, async move {
            if let Some(orchestrator) = weak.upgrade() {
                orchestrator.spawn_cycle("reconnect");
            }
        });
    }

    /// Start periodic background sync at the configured interval.
    ///
    /// Returns `false` if the interval is disabled.
    pub fn start_background_sync(&self) -> bool {
        let Some(period) = self.sync_config().background_interval() else {
            return false;
        };
        let weak = self.this.clone();
        self.timers.schedule_every(BACKGROUND_TASK, period, move || {
            let weak = weak.clone();
            async move {
                let Some(orchestrator) = weak.upgrade() else {
                    return false;
                };
                if orchestrator.connection.is_sync_recommended() {
                    orchestrator.spawn_cycle("background");
                } else {
                    debug!("conditions unfavourable, background sync skipped");
                }
                true
            }
        });
        debug!(period_secs = period.as_secs(), "background sync started");
        true
    }

    /// Stop periodic background sync. Returns `false` if it was not running.
    pub fn stop_background_sync(&self) -> bool {
        self.timers.cancel(BACKGROUND_TASK)
    }

    /// Conflicts waiting for the user.
    ///
    /// # Errors
    ///
    /// Returns an error if the conflict store cannot be read.
    pub fn get_pending_conflicts(&self) -> Result<Vec<SyncConflict>, SyncError> {
        self.conflicts.list()
    }

    /// Settle a conflict with data chosen by the user.
    ///
    /// Choosing exactly the server's data accepts the server version;
    /// anything else is staged as a new local change that overwrites the
    /// server on the next cycle. Returns the resulting entity state.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::NotFound` for an unknown conflict id.
    pub fn resolve_conflict_with_user_choice(
        &self,
        conflict_id: &str,
        chosen_data: Value,
        reasoning: Option<&str>,
    ) -> Result<SyncEntity, SyncError> {
        let conflict = self
            .conflicts
            .get(conflict_id)?
            .ok_or_else(|| SyncError::NotFound(format!("conflict {conflict_id}")))?;

        let entity = if chosen_data == conflict.server_version.data {
            self.engine.apply_server_entity(&conflict.server_version)?;
            conflict.server_version.clone()
        } else {
            self.engine.apply_resolved_data(
                &conflict.entity_id,
                &conflict.entity_type,
                chosen_data.clone(),
                conflict.max_version(),
            )?
        };

        self.conflicts.remove(conflict_id)?;
        self.conflicts.log_resolution(&ResolutionRecord {
            conflict_id: conflict.id.clone(),
            entity_id: conflict.entity_id.clone(),
            entity_type: conflict.entity_type.clone(),
            outcome: "user_choice".to_string(),
            resolved_data: Some(chosen_data),
            reasoning: reasoning.map(str::to_string),
            resolved_at: datetime::now(),
        })?;
        info!(entity = %conflict.entity_id, "conflict resolved by user");
        Ok(entity)
    }

    /// Up to `limit` recent results, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the history cannot be read.
    pub fn get_sync_history(&self, limit: usize) -> Result<Vec<SyncResult>, SyncError> {
        self.history.list(limit)
    }

    /// Current status with live counts.
    ///
    /// # Errors
    ///
    /// Returns an error if the status cannot be read.
    pub fn get_sync_status(&self) -> Result<SyncStatus, SyncError> {
        let mut status = SyncStatus::load(&self.db)?;
        status.in_progress = self.is_sync_in_progress();
        Ok(status)
    }

    /// The active orchestrator configuration.
    #[must_use]
    pub fn sync_config(&self) -> SyncConfig {
        self.config_lock().clone()
    }

    /// Replace and persist the orchestrator configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be persisted.
    pub fn update_config(&self, config: SyncConfig) -> Result<(), SyncError> {
        self.db.put_document(keys::SYNC_CONFIG, &config)?;
        let previous = std::mem::replace(&mut *self.config_lock(), config.clone());

        if self.is_initialized()
            && previous.background_interval() != config.background_interval()
            && !self.start_background_sync()
        {
            self.stop_background_sync();
        }
        if !config.auto_sync {
            self.timers.cancel(RECONNECT_TASK);
        }
        info!("sync configuration updated");
        Ok(())
    }

    /// Battery state used by strategy selection.
    pub fn set_device_conditions(&self, conditions: DeviceConditions) {
        *self.device_lock() = conditions;
    }

    #[must_use]
    pub fn device_conditions(&self) -> DeviceConditions {
        *self.device_lock()
    }

    #[must_use]
    pub const fn connection(&self) -> &ConnectionStateManager {
        &self.connection
    }

    #[must_use]
    pub const fn queue(&self) -> &SyncQueueManager {
        &self.queue
    }

    #[must_use]
    pub const fn engine(&self) -> &IncrementalSyncEngine {
        &self.engine
    }

    #[must_use]
    pub const fn conflict_store(&self) -> &ConflictStore {
        &self.conflicts
    }

    /// Cancel timers and stop reacting to connectivity.
    pub fn shutdown(&self) {
        self.timers.shutdown();
        if let Some(subscription) = self.subscription_lock().take() {
            subscription.unsubscribe();
        }
        if self.owns_connection {
            self.connection.shutdown();
        }
        self.initialized.store(false, Ordering::SeqCst);
        info!("sync orchestrator stopped");
    }
}

fn note(result: &mut SyncResult, stage: &str, error: &SyncError) {
    warn!(stage, error = %error, "sync step failed");
    result.errors.push(format!("{stage}: {error}"));
}
