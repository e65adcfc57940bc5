/// Host configuration
///
/// Scan parameter profiles for the two discovery modes plus a few behaviour
/// switches. Every field has a default so partial JSON documents load.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for configuration validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid scan parameters ({profile}): {reason}")]
    InvalidScanParameters {
        profile: &'static str,
        reason: String,
    },
}

/// Parameter profile handed to the Link Engine when discovery starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanParameters {
    /// Active scanning sends scan requests; passive only listens
    pub active: bool,
    /// Scan interval in milliseconds
    pub interval_ms: u32,
    /// Scan window in milliseconds
    pub window_ms: u32,
}

impl ScanParameters {
    /// Default profile for client-requested discovery
    pub fn default_active() -> Self {
        Self {
            active: true,
            interval_ms: 60,
            window_ms: 30,
        }
    }

    /// Default profile for background re-acquisition of paired devices
    pub fn default_passive() -> Self {
        Self {
            active: false,
            interval_ms: 1280,
            window_ms: 30,
        }
    }

    /// Validate the parameters
    pub fn validate(&self, profile: &'static str) -> Result<(), ConfigError> {
        if self.interval_ms == 0 || self.window_ms == 0 {
            return Err(ConfigError::InvalidScanParameters {
                profile,
                reason: "scan interval and window must be > 0".to_string(),
            });
        }
        if self.window_ms > self.interval_ms {
            return Err(ConfigError::InvalidScanParameters {
                profile,
                reason: "scan window must be <= scan interval".to_string(),
            });
        }
        Ok(())
    }
}

/// Both discovery profiles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "ScanParameters::default_active")]
    pub active: ScanParameters,
    #[serde(default = "ScanParameters::default_passive")]
    pub passive: ScanParameters,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            active: ScanParameters::default_active(),
            passive: ScanParameters::default_passive(),
        }
    }
}

/// Configuration of the session and state management core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub scan: ScanConfig,

    /// Reconnect paired devices when they show up in discovery results
    #[serde(default = "default_true")]
    pub auto_reconnect_paired: bool,

    /// Ask the Link Engine for a HID attachment once GATT is connected
    #[serde(default = "default_true")]
    pub attach_hid: bool,

    /// Export the Link Engine's stored paired devices at start of day
    #[serde(default = "default_true")]
    pub load_known_devices: bool,
}

fn default_true() -> bool {
    true
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            scan: ScanConfig::default(),
            auto_reconnect_paired: true,
            attach_hid: true,
            load_known_devices: true,
        }
    }
}

impl HostConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scan.active.validate("active")?;
        self.scan.passive.validate("passive")?;
        Ok(())
    }
}
