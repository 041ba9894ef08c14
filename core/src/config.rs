//! Link configuration
//!
//! All timeouts are kept as milliseconds in the serialized form so the file
//! stays hand-editable; accessors hand out [`Duration`]s.

use crate::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ============================================================================
// SECTIONS
// ============================================================================

/// Adapter, scanner and arbitration timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Delay imposed after pausing and before resuming the scan
    pub settle_delay_ms: u64,
    /// How long to wait for the adapter to power on
    pub enable_timeout_ms: u64,
    /// Upper bound on acquiring connection arbitration
    pub arbitration_timeout_ms: u64,
    /// How long scan results are replayed to late subscribers
    pub replay_window_ms: u64,
    /// How long a native-device lookup may wait on a discovery pass
    pub discovery_timeout_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 500,
            enable_timeout_ms: 5_000,
            arbitration_timeout_ms: 30_000,
            replay_window_ms: 10_000,
            discovery_timeout_ms: 30_000,
        }
    }
}

impl AdapterConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn enable_timeout(&self) -> Duration {
        Duration::from_millis(self.enable_timeout_ms)
    }

    pub fn arbitration_timeout(&self) -> Duration {
        Duration::from_millis(self.arbitration_timeout_ms)
    }

    pub fn replay_window(&self) -> Duration {
        Duration::from_millis(self.replay_window_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}

/// Peripheral lease timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub connect_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,
    pub characteristic_timeout_ms: u64,
    /// Ask the native stack to reconnect on its own after a link loss
    pub auto_reconnect: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            disconnect_timeout_ms: 5_000,
            characteristic_timeout_ms: 5_000,
            auto_reconnect: false,
        }
    }
}

impl LeaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn characteristic_timeout(&self) -> Duration {
        Duration::from_millis(self.characteristic_timeout_ms)
    }
}

/// Request queue policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Bound on one command/response round-trip
    pub exchange_timeout_ms: u64,
    /// Bound on finding and connecting one candidate radio
    pub radio_select_timeout_ms: u64,
    /// Keep the link up between consecutive queued requests
    pub hold_connection_while_pending: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            exchange_timeout_ms: 10_000,
            radio_select_timeout_ms: 20_000,
            hold_connection_while_pending: true,
        }
    }
}

impl QueueConfig {
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    pub fn radio_select_timeout(&self) -> Duration {
        Duration::from_millis(self.radio_select_timeout_ms)
    }
}

/// Probe scheduling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Delay before the first probe after a pod is loaded
    pub initial_delay_ms: u64,
    /// Consecutive failures before the pod is reported unreachable
    pub alert_after_failures: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 10_000,
            alert_after_failures: 5,
        }
    }
}

impl ProbeConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

/// Per-radio status check intervals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioOptions {
    /// Probe interval after a successful status check
    pub status_check_interval_good_ms: u64,
    /// Probe interval after a failed status check
    pub status_check_interval_bad_ms: u64,
}

impl Default for RadioOptions {
    fn default() -> Self {
        Self {
            status_check_interval_good_ms: 60_000,
            status_check_interval_bad_ms: 15_000,
        }
    }
}

impl RadioOptions {
    pub fn good_interval(&self) -> Duration {
        Duration::from_millis(self.status_check_interval_good_ms)
    }

    pub fn bad_interval(&self) -> Duration {
        Duration::from_millis(self.status_check_interval_bad_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.status_check_interval_bad_ms == 0 {
            return Err(LinkError::InvalidConfig(
                "status_check_interval_bad_ms must be > 0".to_string(),
            ));
        }
        if self.status_check_interval_bad_ms >= self.status_check_interval_good_ms {
            return Err(LinkError::InvalidConfig(
                "status_check_interval_bad_ms must be shorter than the good interval".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// TOP LEVEL
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub adapter: AdapterConfig,
    pub lease: LeaseConfig,
    pub queue: QueueConfig,
    pub probe: ProbeConfig,
    /// Options given to newly registered radios
    pub radio: RadioOptions,
}

impl LinkConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("adapter.enable_timeout_ms", self.adapter.enable_timeout_ms),
            ("adapter.arbitration_timeout_ms", self.adapter.arbitration_timeout_ms),
            ("adapter.replay_window_ms", self.adapter.replay_window_ms),
            ("adapter.discovery_timeout_ms", self.adapter.discovery_timeout_ms),
            ("lease.connect_timeout_ms", self.lease.connect_timeout_ms),
            ("lease.disconnect_timeout_ms", self.lease.disconnect_timeout_ms),
            ("lease.characteristic_timeout_ms", self.lease.characteristic_timeout_ms),
            ("queue.exchange_timeout_ms", self.queue.exchange_timeout_ms),
            ("queue.radio_select_timeout_ms", self.queue.radio_select_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(LinkError::InvalidConfig(format!("{} must be > 0", name)));
            }
        }
        if self.probe.alert_after_failures == 0 {
            return Err(LinkError::InvalidConfig(
                "probe.alert_after_failures must be > 0".to_string(),
            ));
        }
        self.radio.validate()
    }

    /// Read a JSON configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| LinkError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        let config: LinkConfig = serde_json::from_str(&contents)
            .map_err(|e| LinkError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| LinkError::InvalidConfig(e.to_string()))?;
        std::fs::write(path, contents)
            .map_err(|e| LinkError::InvalidConfig(format!("{}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = LinkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.adapter.settle_delay(), Duration::from_millis(500));
        assert_eq!(config.adapter.replay_window(), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = LinkConfig::default();
        config.queue.exchange_timeout_ms = 0;
        match config.validate() {
            Err(LinkError::InvalidConfig(msg)) => assert!(msg.contains("exchange_timeout_ms")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_bad_interval_must_be_shorter() {
        let mut config = LinkConfig::default();
        config.radio.status_check_interval_bad_ms = config.radio.status_check_interval_good_ms;
        assert!(matches!(config.validate(), Err(LinkError::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: LinkConfig =
            serde_json::from_str(r#"{ "queue": { "exchange_timeout_ms": 2500 } }"#).unwrap();
        assert_eq!(config.queue.exchange_timeout(), Duration::from_millis(2500));
        assert!(config.queue.hold_connection_while_pending);
        assert_eq!(config.adapter, AdapterConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = LinkConfig::default();
        config.probe.alert_after_failures = 3;
        config.save(&path).unwrap();

        let loaded = LinkConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
