//! Host configuration.
//!
//! Describes the devices on the bus and the timing the session layer hands
//! to each port. Loaded from JSON or built in code.

use crate::registry::{CompanionAddress, DeviceAddress, DeviceType};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// One primary device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Bus address nibble.
    #[serde(default)]
    pub address: DeviceAddress,
    /// Device family member.
    pub device_type: DeviceType,
}

/// One companion chip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanionConfig {
    /// Bus address byte.
    pub address: CompanionAddress,
}

/// Session timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Ready-poll timeout for primary device commands in milliseconds.
    pub ready_timeout_ms: u64,
    /// Ready-poll timeout for companion commands in milliseconds.
    pub companion_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: 20,
            companion_timeout_ms: 100,
        }
    }
}

impl SessionConfig {
    /// Ready-poll timeout for primary device commands.
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Ready-poll timeout for companion commands.
    pub fn companion_timeout(&self) -> Duration {
        Duration::from_millis(self.companion_timeout_ms)
    }

    /// Reject zero timeouts.
    pub fn validate(&self) -> Result<()> {
        if self.ready_timeout_ms == 0 || self.companion_timeout_ms == 0 {
            return Err(Error::InvalidConfig("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

/// Complete host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Primary devices in table order.
    pub devices: Vec<DeviceConfig>,
    /// Companion chips in table order.
    pub companions: Vec<CompanionConfig>,
    /// Session timing.
    pub session: SessionConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            devices: vec![DeviceConfig {
                address: DeviceAddress::DEFAULT,
                device_type: DeviceType::At88sc0104c,
            }],
            companions: Vec::new(),
            session: SessionConfig::default(),
        }
    }
}

impl HostConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject empty tables and duplicate addresses.
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() && self.companions.is_empty() {
            return Err(Error::InvalidConfig("no devices configured".into()));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.address) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate device address {:#04x}",
                    device.address.get()
                )));
            }
        }

        let mut seen = HashSet::new();
        for companion in &self.companions {
            if !seen.insert(companion.address) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate companion address {:#04x}",
                    companion.address.get()
                )));
            }
        }

        self.session.validate()
    }
}
