//! Sync strategies and their selection.
//!
//! A strategy shapes a cycle: how many operations go per batch, which
//! priorities are worth sending, and whether to download at all. Candidates
//! are filtered by network type, cellular signal and battery, and the
//! highest-priority survivor wins.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::sync::connection::{ConnectionState, ConnectionType};

/// Network a strategy requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkRequirement {
    /// Any live connection
    Any,
    /// Any connection that is not metered
    Unmetered,
    /// Wi-Fi or ethernet
    Wifi,
    Cellular,
}

/// Device state outside of networking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConditions {
    /// 0..1, `None` if unknown
    pub battery_level: Option<f64>,
    pub is_charging: bool,
}

/// How a cycle should behave under given conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStrategy {
    pub name: String,
    /// Higher wins among eligible strategies
    pub priority: u8,
    pub network: NetworkRequirement,
    /// Signal floor, checked only on cellular
    pub min_signal_strength: Option<f64>,
    /// Battery floor, ignored while charging
    pub min_battery_level: Option<f64>,
    /// Operations per queue batch
    pub batch_size: usize,
    /// Skip queued operations below this priority
    pub min_operation_priority: u8,
    /// Fetch server changes
    pub download: bool,
}

impl SyncStrategy {
    /// Whether this strategy may run under the given conditions.
    #[must_use]
    pub fn is_eligible(&self, state: &ConnectionState, device: &DeviceConditions) -> bool {
        if !state.is_connected {
            return false;
        }

        let network_ok = match self.network {
            NetworkRequirement::Any => true,
            NetworkRequirement::Unmetered => !state.is_metered,
            NetworkRequirement::Wifi => matches!(
                state.connection_type,
                ConnectionType::Wifi | ConnectionType::Ethernet
            ),
            NetworkRequirement::Cellular => state.connection_type == ConnectionType::Cellular,
        };
        if !network_ok {
            return false;
        }

        if state.connection_type == ConnectionType::Cellular {
            if let Some(floor) = self.min_signal_strength {
                if state.signal_strength < floor {
                    return false;
                }
            }
        }

        match (self.min_battery_level, device.battery_level) {
            (Some(floor), Some(level)) if !device.is_charging => level >= floor,
            _ => true,
        }
    }

    /// Built-in strategies, best first.
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        vec![
            Self {
                name: "full".to_string(),
                priority: 100,
                network: NetworkRequirement::Wifi,
                min_signal_strength: None,
                min_battery_level: Some(0.15),
                batch_size: 50,
                min_operation_priority: 1,
                download: true,
            },
            Self {
                name: "cellular_standard".to_string(),
                priority: 80,
                network: NetworkRequirement::Cellular,
                min_signal_strength: Some(0.5),
                min_battery_level: Some(0.2),
                batch_size: 20,
                min_operation_priority: 1,
                download: true,
            },
            Self {
                name: "cellular_conservative".to_string(),
                priority: 60,
                network: NetworkRequirement::Cellular,
                min_signal_strength: Some(0.25),
                min_battery_level: Some(0.15),
                batch_size: 5,
                min_operation_priority: 5,
                download: true,
            },
            Self {
                name: "critical_only".to_string(),
                priority: 40,
                network: NetworkRequirement::Any,
                min_signal_strength: None,
                min_battery_level: Some(0.05),
                batch_size: 3,
                min_operation_priority: 8,
                download: false,
            },
        ]
    }

    /// Used when nothing else qualifies: only the most urgent operations,
    /// one at a time.
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            name: "minimal".to_string(),
            priority: 0,
            network: NetworkRequirement::Any,
            min_signal_strength: None,
            min_battery_level: None,
            batch_size: 1,
            min_operation_priority: 10,
            download: false,
        }
    }
}

/// Pick the strategy for a cycle.
///
/// A `hint` naming an eligible strategy takes precedence; otherwise the
/// highest-priority eligible candidate is chosen, then the fallback.
#[must_use]
pub fn select_strategy(
    candidates: &[SyncStrategy],
    state: &ConnectionState,
    device: &DeviceConditions,
    hint: Option<&str>,
) -> SyncStrategy {
    if let Some(name) = hint {
        match candidates.iter().find(|s| s.name == name) {
            Some(s) if s.is_eligible(state, device) => return s.clone(),
            Some(_) => debug!(strategy = name, "hinted strategy not eligible"),
            None => debug!(strategy = name, "unknown strategy hint"),
        }
    }

    candidates
        .iter()
        .filter(|s| s.is_eligible(state, device))
        .max_by_key(|s| s.priority)
        .cloned()
        .unwrap_or_else(SyncStrategy::fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::connection::ConnectionQuality;
    use chrono::Utc;

    fn state(connection_type: ConnectionType, signal: f64, metered: bool) -> ConnectionState {
        ConnectionState {
            is_connected: true,
            connection_type,
            connection_quality: ConnectionQuality::Good,
            signal_strength: signal,
            is_metered: metered,
            last_state_change: Utc::now(),
            stable_connection: true,
        }
    }

    fn pick(state: &ConnectionState, device: &DeviceConditions, hint: Option<&str>) -> String {
        select_strategy(&SyncStrategy::defaults(), state, device, hint).name
    }

    #[test]
    fn test_wifi_selects_full() {
        let wifi = state(ConnectionType::Wifi, 1.0, false);
        assert_eq!(pick(&wifi, &DeviceConditions::default(), None), "full");
    }

    #[test]
    fn test_cellular_signal_floor() {
        let device = DeviceConditions::default();
        assert_eq!(
            pick(&state(ConnectionType::Cellular, 0.75, true), &device, None),
            "cellular_standard"
        );
        assert_eq!(
            pick(&state(ConnectionType::Cellular, 0.3, true), &device, None),
            "cellular_conservative"
        );
        assert_eq!(
            pick(&state(ConnectionType::Cellular, 0.1, true), &device, None),
            "critical_only"
        );
    }

    #[test]
    fn test_low_battery_falls_back() {
        let wifi = state(ConnectionType::Wifi, 1.0, false);
        let low = DeviceConditions {
            battery_level: Some(0.02),
            is_charging: false,
        };
        assert_eq!(pick(&wifi, &low, None), "minimal");

        let charging = DeviceConditions {
            is_charging: true,
            ..low
        };
        assert_eq!(pick(&wifi, &charging, None), "full");
    }

    #[test]
    fn test_hint_only_when_eligible() {
        let wifi = state(ConnectionType::Wifi, 1.0, false);
        let device = DeviceConditions::default();
        assert_eq!(pick(&wifi, &device, Some("critical_only")), "critical_only");
        assert_eq!(pick(&wifi, &device, Some("cellular_standard")), "full");
        assert_eq!(pick(&wifi, &device, Some("nonexistent")), "full");
    }

    #[test]
    fn test_offline_is_never_eligible() {
        let mut offline = state(ConnectionType::Wifi, 1.0, false);
        offline.is_connected = false;
        assert!(SyncStrategy::defaults()
            .iter()
            .all(|s| !s.is_eligible(&offline, &DeviceConditions::default())));
    }
}
