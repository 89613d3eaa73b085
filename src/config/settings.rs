//! Configuration settings for medsync.
//!
//! Settings are loaded from `~/.medsync/config.yaml`. Every field has a
//! default, so a partial file only overrides what it names.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cli::args::OutputFormat;
use crate::config::Paths;
use crate::error::SyncError;
use crate::sync::ResolutionStrategy;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// General settings.
    pub general: GeneralConfig,
    /// Connection tracking settings.
    pub connection: ConnectionConfig,
    /// Operation queue settings.
    pub queue: QueueConfig,
    /// Delta sync settings.
    pub incremental: IncrementalConfig,
    /// Orchestrator settings.
    pub sync: SyncConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level filter (`error`, `warn`, `info`, `debug`, `trace`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Default output format for the CLI.
    #[serde(default = "default_output_format")]
    pub default_output: OutputFormat,
}

/// Connection tracking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Events closer together than this are coalesced.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// How long a connection must persist before it counts as stable.
    #[serde(default = "default_stability_window_ms")]
    pub stability_window_ms: u64,
    /// Number of recent states kept for diagnostics.
    #[serde(default = "default_connection_history")]
    pub history_size: usize,
    /// Signal strength below which a live connection is rated poor.
    #[serde(default = "default_poor_signal")]
    pub poor_signal_threshold: f64,
}

/// Operation queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue size at which old entries are pruned on enqueue.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Group pending operations into batches.
    #[serde(default = "default_true")]
    pub batching_enabled: bool,
    /// Maximum operations in a bulk batch.
    #[serde(default = "default_queue_batch_size")]
    pub batch_size: usize,
    /// Priority at or above which operations are sent outside bulk batches.
    #[serde(default = "default_high_priority")]
    pub high_priority_threshold: u8,
    /// Maximum operations in a batch of high-priority operations.
    #[serde(default = "default_urgent_batch_size")]
    pub urgent_batch_size: usize,
    /// Attempts before an operation is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retry_attempts: u32,
    /// Base delay for exponential backoff.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_delay_ms: u64,
    /// Upper bound of the random jitter added to each retry delay.
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,
    /// Completed operations older than this are purged.
    #[serde(default = "default_completed_retention_hours")]
    pub completed_retention_hours: i64,
    /// Maximum completed operations kept for inspection.
    #[serde(default = "default_completed_history_limit")]
    pub completed_history_limit: usize,
}

/// Delta sync settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IncrementalConfig {
    /// Entities per upload call.
    #[serde(default = "default_entity_batch_size")]
    pub batch_size: usize,
    /// Skip downloaded entities whose checksum matches the stored one.
    #[serde(default = "default_true")]
    pub checksum_validation: bool,
    /// Upload attempts before an entity is quarantined.
    #[serde(default = "default_max_retries")]
    pub max_retry_attempts: u32,
    /// Timeout for each upload/download call.
    #[serde(default = "default_transport_timeout_ms")]
    pub transport_timeout_ms: u64,
}

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Start a cycle automatically after local changes when conditions allow.
    #[serde(default = "default_true")]
    pub auto_sync: bool,
    /// Background sync period. Zero disables periodic sync.
    #[serde(default = "default_background_interval")]
    pub background_interval_secs: u64,
    /// Delay between a stable reconnection and the sync it triggers.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Use delta sync rather than a full upload/download pass.
    #[serde(default = "default_true")]
    pub enable_incremental: bool,
    /// Verify local checksums before each cycle.
    #[serde(default = "default_true")]
    pub validate_integrity: bool,
    /// How conflicts are resolved.
    #[serde(default = "default_conflict_policy")]
    pub conflict_policy: ResolutionStrategy,
    /// Number of sync results retained.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Timeout for each operation-queue transmission.
    #[serde(default = "default_transport_timeout_ms")]
    pub transport_timeout_ms: u64,
}

// Default value functions for serde
fn default_log_level() -> String {
    "info".to_string()
}

const fn default_output_format() -> OutputFormat {
    OutputFormat::Pretty
}

const fn default_true() -> bool {
    true
}

const fn default_debounce_ms() -> u64 {
    1000
}

const fn default_stability_window_ms() -> u64 {
    3000
}

const fn default_connection_history() -> usize {
    100
}

const fn default_poor_signal() -> f64 {
    0.25
}

const fn default_max_queue_size() -> usize {
    1000
}

const fn default_queue_batch_size() -> usize {
    10
}

const fn default_high_priority() -> u8 {
    8
}

const fn default_urgent_batch_size() -> usize {
    3
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_retry_base_ms() -> u64 {
    1000
}

const fn default_retry_jitter_ms() -> u64 {
    1000
}

const fn default_completed_retention_hours() -> i64 {
    24
}

const fn default_completed_history_limit() -> usize {
    100
}

const fn default_entity_batch_size() -> usize {
    50
}

const fn default_transport_timeout_ms() -> u64 {
    30_000
}

const fn default_background_interval() -> u64 {
    300
}

const fn default_settle_delay_ms() -> u64 {
    2000
}

const fn default_conflict_policy() -> ResolutionStrategy {
    ResolutionStrategy::IntelligentMerge
}

const fn default_history_limit() -> usize {
    50
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            default_output: default_output_format(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            stability_window_ms: default_stability_window_ms(),
            history_size: default_connection_history(),
            poor_signal_threshold: default_poor_signal(),
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[must_use]
    pub const fn stability_window(&self) -> Duration {
        Duration::from_millis(self.stability_window_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            batching_enabled: default_true(),
            batch_size: default_queue_batch_size(),
            high_priority_threshold: default_high_priority(),
            urgent_batch_size: default_urgent_batch_size(),
            max_retry_attempts: default_max_retries(),
            retry_base_delay_ms: default_retry_base_ms(),
            retry_jitter_ms: default_retry_jitter_ms(),
            completed_retention_hours: default_completed_retention_hours(),
            completed_history_limit: default_completed_history_limit(),
        }
    }
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            batch_size: default_entity_batch_size(),
            checksum_validation: default_true(),
            max_retry_attempts: default_max_retries(),
            transport_timeout_ms: default_transport_timeout_ms(),
        }
    }
}

impl IncrementalConfig {
    #[must_use]
    pub const fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync: default_true(),
            background_interval_secs: default_background_interval(),
            settle_delay_ms: default_settle_delay_ms(),
            enable_incremental: default_true(),
            validate_integrity: default_true(),
            conflict_policy: default_conflict_policy(),
            history_limit: default_history_limit(),
            transport_timeout_ms: default_transport_timeout_ms(),
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Background period, or `None` when periodic sync is disabled.
    #[must_use]
    pub const fn background_interval(&self) -> Option<Duration> {
        if self.background_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.background_interval_secs))
        }
    }

    #[must_use]
    pub const fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }
}

impl Config {
    /// Load configuration from the default path.
    ///
    /// If the config file doesn't exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self, SyncError> {
        let paths = Paths::new()?;
        Self::load_from_path(&paths.config_file)
    }

    /// Load configuration from a specific path.
    ///
    /// If the config file doesn't exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load_from_path(path: &std::path::Path) -> Result<Self, SyncError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        serde_yaml::from_str(&contents).map_err(|e| {
            SyncError::Config(format!(
                "Failed to parse config file {}: {e}",
                path.display()
            ))
        })
    }

    /// Save configuration to a specific path.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save_to_path(&self, path: &std::path::Path) -> Result<(), SyncError> {
        let contents = serde_yaml::to_string(self)
            .map_err(|e| SyncError::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, contents).map_err(|e| {
            SyncError::Config(format!(
                "Failed to write config file {}: {e}",
                path.display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.general.default_output, OutputFormat::Pretty);
        assert_eq!(config.connection.debounce(), Duration::from_secs(1));
        assert_eq!(config.connection.stability_window(), Duration::from_secs(3));
        assert_eq!(config.queue.high_priority_threshold, 8);
        assert_eq!(config.queue.max_retry_attempts, 3);
        assert_eq!(config.sync.settle_delay(), Duration::from_secs(2));
        assert_eq!(config.sync.history_limit, 50);
        assert_eq!(config.sync.conflict_policy, ResolutionStrategy::IntelligentMerge);
    }

    #[test]
    fn test_background_interval_zero_disables() {
        let config = SyncConfig {
            background_interval_secs: 0,
            ..SyncConfig::default()
        };
        assert!(config.background_interval().is_none());
    }

    #[test]
    fn test_load_missing_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let config = Config::load_from_path(&config_path).unwrap();
        assert_eq!(config.queue.batch_size, 10);
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut config = Config::default();
        config.queue.batch_size = 25;
        config.sync.conflict_policy = ResolutionStrategy::UserChoiceRequired;

        config.save_to_path(&config_path).unwrap();
        let loaded = Config::load_from_path(&config_path).unwrap();

        assert_eq!(loaded.queue.batch_size, 25);
        assert_eq!(loaded.sync.conflict_policy, ResolutionStrategy::UserChoiceRequired);
    }

    #[test]
    fn test_partial_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let partial_yaml = r"
sync:
  conflict_policy: server_preference
queue:
  batching_enabled: false
";
        std::fs::write(&config_path, partial_yaml).unwrap();

        let config = Config::load_from_path(&config_path).unwrap();

        assert_eq!(config.sync.conflict_policy, ResolutionStrategy::ServerPreference);
        assert!(!config.queue.batching_enabled);
        // Defaults fill the rest
        assert_eq!(config.queue.batch_size, 10);
        assert!(config.sync.auto_sync);
        assert_eq!(config.general.log_level, "info");
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "queue: [unclosed").unwrap();

        let err = Config::load_from_path(&config_path).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
