//! Connection state tracking.
//!
//! [`ConnectionStateManager`] turns raw reachability readings from the
//! platform into a single answer to "should we sync right now". It rates each
//! reading into a [`ConnectionQuality`], coalesces bursts of events that
//! arrive within the debounce window, and only reports a connection as stable
//! once it has stayed up for the stability window.
//!
//! Stability is only ever set by the stability timer. A disconnect clears it
//! immediately and cancels the timer; a disconnect seen inside a debounce
//! window restarts the timer even if the burst ends connected.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::core::TaskScheduler;
use crate::error::SyncError;
use crate::storage::{keys, Database};

const DEBOUNCE_TASK: &str = "debounce";
const STABILITY_TASK: &str = "stability";
const EVENT_PUMP_TASK: &str = "network-events";

/// Kind of network link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// No link
    None,
    Wifi,
    Ethernet,
    Cellular,
    /// Link present but of unknown kind
    Unknown,
}

/// Cellular radio generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellularGeneration {
    #[serde(rename = "2g")]
    Gen2,
    #[serde(rename = "3g")]
    Gen3,
    #[serde(rename = "4g")]
    Gen4,
    #[serde(rename = "5g")]
    Gen5,
}

/// Quality tier, ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Offline,
    Poor,
    Good,
    Excellent,
}

impl std::fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Offline => "offline",
            Self::Poor => "poor",
            Self::Good => "good",
            Self::Excellent => "excellent",
        };
        write!(f, "{s}")
    }
}

/// A raw reachability reading from the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkReading {
    pub is_connected: bool,
    pub connection_type: ConnectionType,
    pub cellular_generation: Option<CellularGeneration>,
    pub is_metered: bool,
    /// Normalized 0..1 strength if the platform reports one.
    pub signal_strength: Option<f64>,
}

impl NetworkReading {
    #[must_use]
    pub const fn offline() -> Self {
        Self {
            is_connected: false,
            connection_type: ConnectionType::None,
            cellular_generation: None,
            is_metered: false,
            signal_strength: None,
        }
    }

    #[must_use]
    pub const fn wifi() -> Self {
        Self {
            is_connected: true,
            connection_type: ConnectionType::Wifi,
            cellular_generation: None,
            is_metered: false,
            signal_strength: None,
        }
    }

    /// A metered cellular link of the given generation.
    #[must_use]
    pub const fn cellular(generation: CellularGeneration) -> Self {
        Self {
            is_connected: true,
            connection_type: ConnectionType::Cellular,
            cellular_generation: Some(generation),
            is_metered: true,
            signal_strength: None,
        }
    }

    #[must_use]
    pub const fn with_signal(mut self, strength: f64) -> Self {
        self.signal_strength = Some(strength);
        self
    }

    #[must_use]
    pub const fn metered(mut self, is_metered: bool) -> Self {
        self.is_metered = is_metered;
        self
    }
}

/// The tracked connection state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub is_connected: bool,
    pub connection_type: ConnectionType,
    pub connection_quality: ConnectionQuality,
    pub signal_strength: f64,
    pub is_metered: bool,
    pub last_state_change: DateTime<Utc>,
    pub stable_connection: bool,
}

impl ConnectionState {
    fn offline() -> Self {
        Self {
            is_connected: false,
            connection_type: ConnectionType::None,
            connection_quality: ConnectionQuality::Offline,
            signal_strength: 0.0,
            is_metered: false,
            last_state_change: Utc::now(),
            stable_connection: false,
        }
    }
}

/// A state transition delivered to listeners.
#[derive(Debug, Clone)]
pub struct ConnectionChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
}

impl ConnectionChange {
    /// The connection just became stable.
    #[must_use]
    pub const fn became_stable(&self) -> bool {
        !self.previous.stable_connection && self.current.stable_connection
    }

    /// The connection was just lost.
    #[must_use]
    pub const fn went_offline(&self) -> bool {
        self.previous.is_connected && !self.current.is_connected
    }
}

/// One entry of the diagnostic history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub timestamp: DateTime<Utc>,
    pub is_connected: bool,
    pub connection_type: ConnectionType,
    pub quality: ConnectionQuality,
}

/// Source of reachability readings.
pub trait NetworkMonitor: Send + Sync {
    /// Read the current state synchronously.
    fn current(&self) -> NetworkReading;

    /// Stream of subsequent readings.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<NetworkReading>;
}

/// A [`NetworkMonitor`] fed by the host platform through [`publish`](Self::publish).
#[derive(Debug)]
pub struct ChannelNetworkMonitor {
    current: Mutex<NetworkReading>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<NetworkReading>>>,
}

impl ChannelNetworkMonitor {
    #[must_use]
    pub fn new(initial: NetworkReading) -> Self {
        Self {
            current: Mutex::new(initial),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Record a new reading and forward it to subscribers.
    pub fn publish(&self, reading: NetworkReading) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = reading.clone();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(reading.clone()).is_ok());
    }
}

impl NetworkMonitor for ChannelNetworkMonitor {
    fn current(&self) -> NetworkReading {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<NetworkReading> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }
}

/// Callback invoked on every state change.
pub type StateListener = Arc<dyn Fn(&ConnectionChange) -> Result<(), SyncError> + Send + Sync>;

/// Handle returned by [`ConnectionStateManager::on_state_change`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Remove the listener. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.shared.upgrade().is_some_and(|shared| {
            let mut listeners = shared.listeners();
            let before = listeners.len();
            listeners.retain(|(id, _)| *id != self.id);
            listeners.len() != before
        })
    }
}

struct Tracker {
    state: ConnectionState,
    last_change: Option<Instant>,
    deferred: Option<NetworkReading>,
    flapped_in_window: bool,
    history: VecDeque<ConnectionSnapshot>,
    generation: u64,
}

struct Shared {
    config: ConnectionConfig,
    db: Option<Database>,
    tracker: Mutex<Tracker>,
    listeners: Mutex<Vec<(u64, StateListener)>>,
    next_listener_id: AtomicU64,
    initialized: AtomicBool,
    timers: TaskScheduler,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared").finish_non_exhaustive()
    }
}

impl Shared {
    fn tracker(&self) -> MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(u64, StateListener)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Single source of truth for connectivity.
#[derive(Clone, Debug)]
pub struct ConnectionStateManager {
    shared: Arc<Shared>,
}

impl ConnectionStateManager {
    /// Create a manager without persisted history.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a manager that persists its history to `db`.
    #[must_use]
    pub fn with_database(config: ConnectionConfig, db: Database) -> Self {
        Self::build(config, Some(db))
    }

    fn build(config: ConnectionConfig, db: Option<Database>) -> Self {
        let tracker = Tracker {
            state: ConnectionState::offline(),
            last_change: None,
            deferred: None,
            flapped_in_window: false,
            history: VecDeque::with_capacity(config.history_size),
            generation: 0,
        };
        Self {
            shared: Arc::new(Shared {
                config,
                db,
                tracker: Mutex::new(tracker),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                initialized: AtomicBool::new(false),
                timers: TaskScheduler::new(),
            }),
        }
    }

    /// Seed state from `monitor` and start following its events.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted history exists but cannot be read.
    pub fn initialize(&self, monitor: &dyn NetworkMonitor) -> Result<(), SyncError> {
        if let Some(db) = &self.shared.db {
            let stored: Vec<ConnectionSnapshot> =
                db.get_document(keys::CONNECTION_HISTORY)?.unwrap_or_default();
            let mut tracker = self.shared.tracker();
            let skip = stored.len().saturating_sub(self.shared.config.history_size);
            tracker.history = stored.into_iter().skip(skip).collect();
        }

        self.apply_reading(monitor.current(), true);

        let mut events = monitor.subscribe();
        let weak = Arc::downgrade(&self.shared);
        self.shared
            .timers
            .schedule_after(EVENT_PUMP_TASK, Duration::ZERO, async move {
                while let Some(reading) = events.recv().await {
                    let Some(shared) = weak.upgrade() else { break };
                    Self { shared }.handle_network_event(reading);
                }
            });

        self.shared.initialized.store(true, Ordering::SeqCst);
        info!(state = ?self.get_connection_state().connection_quality, "connection tracking initialized");
        Ok(())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::SeqCst)
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn get_connection_state(&self) -> ConnectionState {
        self.shared.tracker().state.clone()
    }

    /// Whether conditions currently favour a sync cycle.
    #[must_use]
    pub fn is_sync_recommended(&self) -> bool {
        let state = self.get_connection_state();
        state.is_connected
            && state.connection_quality > ConnectionQuality::Poor
            && state.stable_connection
            && !(state.is_metered && state.connection_quality < ConnectionQuality::Excellent)
    }

    /// Register a listener for state changes.
    pub fn on_state_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionChange) -> Result<(), SyncError> + Send + Sync + 'static,
    {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.shared.listeners().push((id, Arc::new(listener)));
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Process a reading from the platform.
    ///
    /// Readings that arrive within the debounce window of the previous state
    /// change are held back and the latest one is applied when the window
    /// closes.
    pub fn handle_network_event(&self, reading: NetworkReading) {
        let debounce = self.shared.config.debounce();
        let now = Instant::now();
        {
            let mut tracker = self.shared.tracker();
            let elapsed = tracker
                .last_change
                .map(|last| now.saturating_duration_since(last));
            let in_window = elapsed.is_some_and(|e| e < debounce);

            if in_window || tracker.deferred.is_some() {
                if !reading.is_connected {
                    tracker.flapped_in_window = true;
                }
                let first = tracker.deferred.replace(reading).is_none();
                if first {
                    let wait = debounce.saturating_sub(elapsed.unwrap_or_default());
                    let weak = Arc::downgrade(&self.shared);
                    self.shared
                        .timers
                        .schedule_after(DEBOUNCE_TASK, wait, async move {
                            if let Some(shared) = weak.upgrade() {
                                Self { shared }.apply_deferred();
                            }
                        });
                }
                debug!("connection event deferred by debounce");
                return;
            }
        }

        self.apply_reading(reading, false);
    }

    fn apply_deferred(&self) {
        let deferred = {
            let mut tracker = self.shared.tracker();
            tracker
                .deferred
                .take()
                .map(|reading| (reading, std::mem::take(&mut tracker.flapped_in_window)))
        };
        if let Some((reading, flapped)) = deferred {
            self.apply_with(reading, flapped, false);
        }
    }

    fn apply_reading(&self, reading: NetworkReading, seed: bool) {
        self.apply_with(reading, false, seed);
    }

    fn apply_with(&self, reading: NetworkReading, flapped: bool, seed: bool) {
        let config = &self.shared.config;
        let quality = assess_quality(&reading, config.poor_signal_threshold);
        let strength = signal_strength(&reading);

        let outcome = {
            let mut tracker = self.shared.tracker();
            let previous = tracker.state.clone();
            tracker.state.signal_strength = strength;

            let changed = seed
                || flapped
                || previous.is_connected != reading.is_connected
                || previous.connection_type != reading.connection_type
                || previous.connection_quality != quality
                || previous.is_metered != reading.is_metered;
            if !changed {
                return;
            }

            tracker.state.is_connected = reading.is_connected;
            tracker.state.connection_type = if reading.is_connected {
                reading.connection_type
            } else {
                ConnectionType::None
            };
            tracker.state.connection_quality = quality;
            tracker.state.is_metered = reading.is_metered;
            tracker.state.last_state_change = Utc::now();
            tracker.last_change = Some(Instant::now());

            if !reading.is_connected {
                tracker.generation += 1;
                tracker.state.stable_connection = false;
                self.shared.timers.cancel(STABILITY_TASK);
            } else if !previous.is_connected || flapped || seed {
                tracker.generation += 1;
                tracker.state.stable_connection = false;
                self.arm_stability_timer(tracker.generation);
            }

            let snapshot = ConnectionSnapshot {
                timestamp: tracker.state.last_state_change,
                is_connected: tracker.state.is_connected,
                connection_type: tracker.state.connection_type,
                quality,
            };
            if tracker.history.len() >= config.history_size.max(1) {
                tracker.history.pop_front();
            }
            tracker.history.push_back(snapshot);

            let history: Vec<ConnectionSnapshot> = tracker.history.iter().cloned().collect();
            (
                ConnectionChange {
                    previous,
                    current: tracker.state.clone(),
                },
                history,
            )
        };

        let (change, history) = outcome;
        info!(
            connected = change.current.is_connected,
            quality = %change.current.connection_quality,
            metered = change.current.is_metered,
            "connection state changed"
        );
        self.persist_history(&history);
        self.notify(&change);
    }

    fn arm_stability_timer(&self, generation: u64) {
        let weak = Arc::downgrade(&self.shared);
        self.shared.timers.schedule_after(
            STABILITY_TASK,
            self.shared.config.stability_window(),
            async move {
                let Some(shared) = weak.upgrade() else { return };
                let manager = Self { shared };
                let change = {
                    let mut tracker = manager.shared.tracker();
                    if tracker.generation != generation
                        || !tracker.state.is_connected
                        || tracker.state.stable_connection
                    {
                        return;
                    }
                    let previous = tracker.state.clone();
                    tracker.state.stable_connection = true;
                    ConnectionChange {
                        previous,
                        current: tracker.state.clone(),
                    }
                };
                info!("connection is stable");
                manager.notify(&change);
            },
        );
    }

    fn notify(&self, change: &ConnectionChange) {
        let listeners: Vec<(u64, StateListener)> = self.shared.listeners().clone();
        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(change))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(listener = id, error = %e, "connection listener failed"),
                Err(_) => warn!(listener = id, "connection listener panicked"),
            }
        }
    }

    fn persist_history(&self, history: &[ConnectionSnapshot]) {
        if let Some(db) = &self.shared.db {
            if let Err(e) = db.put_document(keys::CONNECTION_HISTORY, history) {
                warn!(error = %e, "failed to persist connection history");
            }
        }
    }

    /// Recent connectivity snapshots, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<ConnectionSnapshot> {
        self.shared.tracker().history.iter().cloned().collect()
    }

    /// Fraction of recent transitions that flipped connectivity.
    #[must_use]
    pub fn flap_ratio(&self) -> f64 {
        let tracker = self.shared.tracker();
        let transitions = tracker.history.len().saturating_sub(1);
        if transitions == 0 {
            return 0.0;
        }
        let flips = tracker
            .history
            .iter()
            .zip(tracker.history.iter().skip(1))
            .filter(|(a, b)| a.is_connected != b.is_connected)
            .count();
        #[allow(clippy::cast_precision_loss)]
        let ratio = flips as f64 / transitions as f64;
        ratio
    }

    /// `1.0` for a steady link, approaching `0.0` as it flaps.
    #[must_use]
    pub fn stability_score(&self) -> f64 {
        1.0 - self.flap_ratio()
    }

    /// Cancel timers and stop following platform events.
    pub fn shutdown(&self) {
        self.shared.timers.shutdown();
        self.shared.initialized.store(false, Ordering::SeqCst);
    }
}

fn assess_quality(reading: &NetworkReading, poor_signal_threshold: f64) -> ConnectionQuality {
    if !reading.is_connected {
        return ConnectionQuality::Offline;
    }

    let by_type = match reading.connection_type {
        ConnectionType::Wifi | ConnectionType::Ethernet => ConnectionQuality::Excellent,
        ConnectionType::Cellular => match reading.cellular_generation {
            Some(CellularGeneration::Gen5) => ConnectionQuality::Excellent,
            Some(CellularGeneration::Gen4) | None => ConnectionQuality::Good,
            Some(CellularGeneration::Gen3 | CellularGeneration::Gen2) => ConnectionQuality::Poor,
        },
        ConnectionType::Unknown | ConnectionType::None => ConnectionQuality::Good,
    };

    match reading.signal_strength {
        Some(strength) if strength < poor_signal_threshold => ConnectionQuality::Poor,
        _ => by_type,
    }
}

fn signal_strength(reading: &NetworkReading) -> f64 {
    if !reading.is_connected {
        return 0.0;
    }
    reading.signal_strength.map_or_else(
        || match reading.connection_type {
            ConnectionType::Wifi | ConnectionType::Ethernet => 1.0,
            ConnectionType::Cellular => match reading.cellular_generation {
                Some(CellularGeneration::Gen5) => 0.9,
                Some(CellularGeneration::Gen4) => 0.75,
                Some(CellularGeneration::Gen3) => 0.5,
                Some(CellularGeneration::Gen2) => 0.25,
                None => 0.5,
            },
            ConnectionType::Unknown | ConnectionType::None => 0.5,
        },
        |s| s.clamp(0.0, 1.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn manager() -> ConnectionStateManager {
        ConnectionStateManager::new(ConnectionConfig::default())
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_quality_by_connection_type() {
        let threshold = 0.25;
        assert_eq!(assess_quality(&NetworkReading::wifi(), threshold), ConnectionQuality::Excellent);
        assert_eq!(
            assess_quality(&NetworkReading::cellular(CellularGeneration::Gen4), threshold),
            ConnectionQuality::Good
        );
        assert_eq!(
            assess_quality(&NetworkReading::cellular(CellularGeneration::Gen3), threshold),
            ConnectionQuality::Poor
        );
        assert_eq!(assess_quality(&NetworkReading::offline(), threshold), ConnectionQuality::Offline);

        let unknown = NetworkReading {
            connection_type: ConnectionType::Unknown,
            ..NetworkReading::wifi()
        };
        assert_eq!(assess_quality(&unknown, threshold), ConnectionQuality::Good);
    }

    #[test]
    fn test_weak_signal_is_poor() {
        let weak = NetworkReading::wifi().with_signal(0.1);
        assert_eq!(assess_quality(&weak, 0.25), ConnectionQuality::Poor);
        assert!((signal_strength(&weak) - 0.1).abs() < f64::EPSILON);
        assert!((signal_strength(&NetworkReading::offline())).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_becomes_stable_after_window() {
        let manager = manager();
        let monitor = ChannelNetworkMonitor::new(NetworkReading::wifi());
        manager.initialize(&monitor).unwrap();

        let state = manager.get_connection_state();
        assert!(state.is_connected);
        assert!(!state.stable_connection);
        assert!(!manager.is_sync_recommended());

        sleep(ms(2900)).await;
        assert!(!manager.get_connection_state().stable_connection);

        sleep(ms(200)).await;
        assert!(manager.get_connection_state().stable_connection);
        assert!(manager.is_sync_recommended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_clears_stability_immediately() {
        let manager = manager();
        manager.initialize(&ChannelNetworkMonitor::new(NetworkReading::wifi())).unwrap();
        sleep(ms(3100)).await;
        assert!(manager.get_connection_state().stable_connection);

        manager.handle_network_event(NetworkReading::offline());
        let state = manager.get_connection_state();
        assert!(!state.is_connected);
        assert!(!state.stable_connection);
        assert_eq!(state.connection_quality, ConnectionQuality::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_flapping_never_reports_stable() {
        let manager = manager();
        manager.initialize(&ChannelNetworkMonitor::new(NetworkReading::wifi())).unwrap();
        sleep(ms(3100)).await;
        assert!(manager.get_connection_state().stable_connection);

        // First flap: offline, back online 400ms later.
        manager.handle_network_event(NetworkReading::offline());
        assert!(!manager.get_connection_state().stable_connection);
        sleep(ms(400)).await;
        manager.handle_network_event(NetworkReading::wifi());
        sleep(ms(700)).await;
        assert!(manager.get_connection_state().is_connected);
        assert!(!manager.get_connection_state().stable_connection);

        // Second flap inside the debounce window.
        manager.handle_network_event(NetworkReading::offline());
        sleep(ms(400)).await;
        manager.handle_network_event(NetworkReading::wifi());

        // Sample through the period where an unreset timer would have fired.
        for _ in 0..6 {
            sleep(ms(500)).await;
            assert!(!manager.get_connection_state().stable_connection);
        }

        // Three uninterrupted seconds after the last burst settles.
        sleep(ms(1000)).await;
        assert!(manager.get_connection_state().stable_connection);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_event_is_applied_when_window_closes() {
        let manager = manager();
        manager.initialize(&ChannelNetworkMonitor::new(NetworkReading::offline())).unwrap();

        manager.handle_network_event(NetworkReading::wifi());
        assert!(!manager.get_connection_state().is_connected);

        sleep(ms(1100)).await;
        assert!(manager.get_connection_state().is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_errors_do_not_block_others() {
        let manager = manager();
        let calls = Arc::new(AtomicUsize::new(0));

        let _failing = manager.on_state_change(|_| Err(SyncError::Validation("boom".to_string())));
        let _panicking = manager.on_state_change(|_| panic!("listener bug"));
        let counter = Arc::clone(&calls);
        let _counting = manager.on_state_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        manager.initialize(&ChannelNetworkMonitor::new(NetworkReading::wifi())).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        sleep(ms(3100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_stops_notifications() {
        let manager = manager();
        let stable_events = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&stable_events);
        let subscription = manager.on_state_change(move |change| {
            if change.became_stable() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });

        manager.initialize(&ChannelNetworkMonitor::new(NetworkReading::wifi())).unwrap();
        sleep(ms(3100)).await;
        assert_eq!(stable_events.load(Ordering::SeqCst), 1);

        assert!(subscription.unsubscribe());
        manager.handle_network_event(NetworkReading::offline());
        sleep(ms(1100)).await;
        manager.handle_network_event(NetworkReading::wifi());
        sleep(ms(3100)).await;
        assert_eq!(stable_events.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metered_connection_requires_excellent_quality() {
        let manager = manager();
        let monitor = ChannelNetworkMonitor::new(NetworkReading::cellular(CellularGeneration::Gen4));
        manager.initialize(&monitor).unwrap();
        sleep(ms(3100)).await;

        let state = manager.get_connection_state();
        assert!(state.stable_connection);
        assert!(state.is_metered);
        assert!(!manager.is_sync_recommended());

        manager.handle_network_event(NetworkReading::cellular(CellularGeneration::Gen5));
        assert_eq!(manager.get_connection_state().connection_quality, ConnectionQuality::Excellent);
        // Still connected, so stability carries over.
        assert!(manager.is_sync_recommended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_events_are_followed() {
        let manager = manager();
        let monitor = ChannelNetworkMonitor::new(NetworkReading::wifi());
        manager.initialize(&monitor).unwrap();

        sleep(ms(1500)).await;
        monitor.publish(NetworkReading::offline());
        sleep(ms(10)).await;

        assert!(!manager.get_connection_state().is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_bounded_and_scored() {
        let config = ConnectionConfig {
            history_size: 4,
            ..ConnectionConfig::default()
        };
        let manager = ConnectionStateManager::new(config);
        manager.initialize(&ChannelNetworkMonitor::new(NetworkReading::wifi())).unwrap();
        assert!((manager.stability_score() - 1.0).abs() < f64::EPSILON);

        for i in 0..6 {
            sleep(ms(1100)).await;
            let reading = if i % 2 == 0 { NetworkReading::offline() } else { NetworkReading::wifi() };
            manager.handle_network_event(reading);
        }

        assert_eq!(manager.history().len(), 4);
        assert!((manager.flap_ratio() - 1.0).abs() < f64::EPSILON);
        assert!(manager.stability_score().abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_persists_across_restart() {
        let db = Database::open_in_memory().unwrap();
        {
            let manager = ConnectionStateManager::with_database(ConnectionConfig::default(), db.clone());
            manager.initialize(&ChannelNetworkMonitor::new(NetworkReading::wifi())).unwrap();
            sleep(ms(1100)).await;
            manager.handle_network_event(NetworkReading::offline());
            manager.shutdown();
        }

        let manager = ConnectionStateManager::with_database(ConnectionConfig::default(), db);
        manager.initialize(&ChannelNetworkMonitor::new(NetworkReading::wifi())).unwrap();
        // Two restored entries plus the seed reading.
        assert_eq!(manager.history().len(), 3);
    }
}
