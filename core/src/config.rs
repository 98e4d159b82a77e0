//! Provisioner settings
//!
//! Timing and configuration parameters for a provisioning session. Serialized
//! to/from JSON and validated on every load and save.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerSettings {
    /// Attention timer sent with the Invite, in seconds
    pub attention_duration_s: u8,

    /// Delay between Provisioning Complete and the start of the proxy scan
    pub reconnect_grace_ms: u64,

    /// How long to look for the node's identity advertisement
    pub reconnect_scan_timeout_ms: u64,

    /// Wait between a matching advertisement and the first connect attempt.
    /// Some stacks refuse a connection issued right after the scan stops.
    pub pre_connect_delay_ms: u64,

    /// Connection attempts after a match (minimum 1)
    pub connect_attempts: u32,

    /// Delay between failed connection attempts
    pub connect_retry_delay_ms: u64,

    /// Deadline for each configuration message
    pub transaction_timeout_ms: u64,

    /// Network Transmit Set: transmissions per message (1-8)
    pub network_transmit_count: u8,

    /// Network Transmit Set: interval in 10 ms steps minus one (0-31)
    pub network_transmit_interval_steps: u8,

    /// Composition Data page requested after provisioning
    pub composition_data_page: u8,

    /// Warn when a session log grows past this many entries
    pub log_warn_threshold: usize,
}

impl Default for ProvisionerSettings {
    fn default() -> Self {
        Self {
            attention_duration_s: 5,
            reconnect_grace_ms: 1_000,
            reconnect_scan_timeout_ms: 20_000,
            pre_connect_delay_ms: 2_000,
            connect_attempts: 3,
            connect_retry_delay_ms: 200,
            transaction_timeout_ms: 10_000,
            network_transmit_count: 2,
            network_transmit_interval_steps: 1,
            composition_data_page: 0,
            log_warn_threshold: 64,
        }
    }
}

impl ProvisionerSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.connect_attempts == 0 {
            return Err(SettingsError::ConfigError(
                "connect_attempts must be at least 1".to_string(),
            ));
        }

        if self.reconnect_scan_timeout_ms == 0 {
            return Err(SettingsError::ConfigError(
                "reconnect_scan_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.transaction_timeout_ms == 0 {
            return Err(SettingsError::ConfigError(
                "transaction_timeout_ms must be > 0".to_string(),
            ));
        }

        if !(1..=8).contains(&self.network_transmit_count) {
            return Err(SettingsError::ConfigError(format!(
                "network_transmit_count must be 1-8, got {}",
                self.network_transmit_count
            )));
        }

        if self.network_transmit_interval_steps > 31 {
            return Err(SettingsError::ConfigError(format!(
                "network_transmit_interval_steps must be 0-31, got {}",
                self.network_transmit_interval_steps
            )));
        }

        Ok(())
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.reconnect_grace_ms)
    }

    pub fn reconnect_scan_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_scan_timeout_ms)
    }

    pub fn pre_connect_delay(&self) -> Duration {
        Duration::from_millis(self.pre_connect_delay_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    /// Load settings from JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_string(&content)
    }

    /// Save settings to JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SettingsError> {
        let json = self.to_json_string()?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn to_json_string(&self) -> Result<String, SettingsError> {
        self.validate()?;
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_string(json: &str) -> Result<Self, SettingsError> {
        let settings: ProvisionerSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }
}
