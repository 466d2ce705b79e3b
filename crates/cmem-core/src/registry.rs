//! Device addressing and type identification.
//!
//! Primary devices answer on a 4-bit bus address (default 0xB); companion
//! chips on an even 8-bit address. The registry is built once from
//! configuration and maps table indexes to addresses and device types.

use crate::config::HostConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// 4-bit bus address of a primary device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct DeviceAddress(u8);

impl DeviceAddress {
    /// Factory default address.
    pub const DEFAULT: Self = Self(0x0B);
    /// Highest valid address.
    pub const MAX: u8 = 0x0F;

    /// Validate a device address.
    pub fn new(address: u8) -> Result<Self> {
        if address > Self::MAX {
            return Err(Error::InvalidArgument(format!(
                "device address {address:#04x} exceeds {:#04x}",
                Self::MAX
            )));
        }
        Ok(Self(address))
    }

    /// Raw address nibble.
    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for DeviceAddress {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u8> for DeviceAddress {
    type Error = Error;

    fn try_from(address: u8) -> Result<Self> {
        Self::new(address)
    }
}

impl From<DeviceAddress> for u8 {
    fn from(address: DeviceAddress) -> u8 {
        address.0
    }
}

/// 8-bit bus address of a companion chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct CompanionAddress(u8);

impl CompanionAddress {
    /// Highest valid address.
    pub const MAX: u8 = 0xFE;

    /// Validate a companion address: even, non-zero, at most 0xFE.
    pub fn new(address: u8) -> Result<Self> {
        if address == 0 || address & 0x01 != 0 || address > Self::MAX {
            return Err(Error::InvalidArgument(format!(
                "companion address {address:#04x} must be even and in 0x02..=0xFE"
            )));
        }
        Ok(Self(address))
    }

    /// Raw address byte.
    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for CompanionAddress {
    type Error = Error;

    fn try_from(address: u8) -> Result<Self> {
        Self::new(address)
    }
}

impl From<CompanionAddress> for u8 {
    fn from(address: CompanionAddress) -> u8 {
        address.0
    }
}

/// CryptoMemory device family members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceType {
    /// 1 Kbit user memory.
    At88sc0104c,
    /// 2 Kbit user memory.
    At88sc0204c,
    /// 4 Kbit user memory.
    At88sc0404c,
    /// 8 Kbit user memory.
    At88sc0808c,
    /// 16 Kbit user memory.
    At88sc1616c,
    /// 32 Kbit user memory.
    At88sc3216c,
    /// 64 Kbit user memory.
    At88sc6416c,
    /// 128 Kbit user memory.
    At88sc12816c,
    /// 256 Kbit user memory.
    At88sc25616c,
}

const ALL_TYPES: [DeviceType; 9] = [
    DeviceType::At88sc0104c,
    DeviceType::At88sc0204c,
    DeviceType::At88sc0404c,
    DeviceType::At88sc0808c,
    DeviceType::At88sc1616c,
    DeviceType::At88sc3216c,
    DeviceType::At88sc6416c,
    DeviceType::At88sc12816c,
    DeviceType::At88sc25616c,
];

impl DeviceType {
    /// Every supported type.
    pub fn all() -> &'static [DeviceType] {
        &ALL_TYPES
    }

    /// Number of user zones.
    pub fn zone_count(self) -> u8 {
        match self {
            DeviceType::At88sc0104c | DeviceType::At88sc0204c | DeviceType::At88sc0404c => 4,
            DeviceType::At88sc0808c => 8,
            _ => 16,
        }
    }

    /// Size of one user zone in bytes.
    pub fn zone_size(self) -> usize {
        match self {
            DeviceType::At88sc0104c => 32,
            DeviceType::At88sc0204c => 64,
            DeviceType::At88sc0404c | DeviceType::At88sc0808c | DeviceType::At88sc1616c => 128,
            DeviceType::At88sc3216c => 256,
            DeviceType::At88sc6416c => 512,
            DeviceType::At88sc12816c => 1024,
            DeviceType::At88sc25616c => 2048,
        }
    }

    /// Largest single write in bytes.
    pub fn page_size(self) -> usize {
        match self {
            DeviceType::At88sc3216c
            | DeviceType::At88sc6416c
            | DeviceType::At88sc12816c
            | DeviceType::At88sc25616c => 64,
            _ => 16,
        }
    }

    /// Total user memory in bytes.
    pub fn capacity(self) -> usize {
        self.zone_count() as usize * self.zone_size()
    }

    /// Factory write-7 password (secure code).
    pub fn secure_code(self) -> [u8; 3] {
        match self {
            DeviceType::At88sc0104c => [0xDD, 0x42, 0x97],
            DeviceType::At88sc0204c => [0xE5, 0x47, 0x47],
            DeviceType::At88sc0404c => [0x60, 0x57, 0x34],
            DeviceType::At88sc0808c => [0x22, 0xE8, 0x3F],
            DeviceType::At88sc1616c => [0x20, 0x0C, 0xE0],
            DeviceType::At88sc3216c => [0xCB, 0x28, 0x50],
            DeviceType::At88sc6416c => [0xF7, 0x62, 0x0B],
            DeviceType::At88sc12816c => [0x22, 0xEF, 0x67],
            DeviceType::At88sc25616c => [0x17, 0xC3, 0x3A],
        }
    }

    /// Factory answer-to-reset.
    pub fn atr(self) -> [u8; 8] {
        let (high, code) = self.density_code();
        if self.page_size() == 16 {
            [0x3B, 0xB2, 0x11, 0x00, 0x10, 0x80, high, code]
        } else {
            [0x3B, 0xB3, 0x11, 0x00, 0x00, 0x00, high, code]
        }
    }

    /// Identify a device from the last two answer-to-reset bytes.
    pub fn from_atr(atr: &[u8; 8]) -> Option<Self> {
        ALL_TYPES
            .iter()
            .copied()
            .find(|t| t.density_code() == (atr[6], atr[7]))
    }

    fn density_code(self) -> (u8, u8) {
        match self {
            DeviceType::At88sc0104c => (0x00, 0x01),
            DeviceType::At88sc0204c => (0x00, 0x02),
            DeviceType::At88sc0404c => (0x00, 0x04),
            DeviceType::At88sc0808c => (0x00, 0x08),
            DeviceType::At88sc1616c => (0x00, 0x16),
            DeviceType::At88sc3216c => (0x00, 0x32),
            DeviceType::At88sc6416c => (0x00, 0x64),
            DeviceType::At88sc12816c => (0x01, 0x28),
            DeviceType::At88sc25616c => (0x02, 0x56),
        }
    }
}

/// Address and type tables for every device on the bus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRegistry {
    devices: Vec<(DeviceAddress, DeviceType)>,
    companions: Vec<CompanionAddress>,
}

impl DeviceRegistry {
    /// Build the registry from a validated configuration.
    pub fn from_config(config: &HostConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            devices: config
                .devices
                .iter()
                .map(|d| (d.address, d.device_type))
                .collect(),
            companions: config.companions.iter().map(|c| c.address).collect(),
        })
    }

    /// Address of the device at `index`.
    pub fn address_for_index(&self, index: usize) -> Option<DeviceAddress> {
        self.devices.get(index).map(|(address, _)| *address)
    }

    /// Table index of `address`.
    pub fn index_for_address(&self, address: DeviceAddress) -> Option<usize> {
        self.devices.iter().position(|(a, _)| *a == address)
    }

    /// Type of the device at `index`.
    pub fn type_for_index(&self, index: usize) -> Option<DeviceType> {
        self.devices.get(index).map(|(_, device_type)| *device_type)
    }

    /// Type of the device at `address`.
    pub fn type_for_address(&self, address: DeviceAddress) -> Result<DeviceType> {
        self.devices
            .iter()
            .find(|(a, _)| *a == address)
            .map(|(_, device_type)| *device_type)
            .ok_or(Error::UnknownDevice(address.get()))
    }

    /// Address of the companion chip at `index`.
    pub fn companion_address_for_index(&self, index: usize) -> Option<CompanionAddress> {
        self.companions.get(index).copied()
    }

    /// Table index of a companion chip.
    pub fn companion_index_for_address(&self, address: CompanionAddress) -> Option<usize> {
        self.companions.iter().position(|a| *a == address)
    }

    /// Configured primary devices in table order.
    pub fn devices(&self) -> impl Iterator<Item = (DeviceAddress, DeviceType)> + '_ {
        self.devices.iter().copied()
    }

    /// Configured companion chips in table order.
    pub fn companions(&self) -> impl Iterator<Item = CompanionAddress> + '_ {
        self.companions.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompanionConfig, DeviceConfig};

    #[test]
    fn test_device_address_range() {
        assert_eq!(DeviceAddress::default().get(), 0x0B);
        assert!(DeviceAddress::new(0x0F).is_ok());
        assert!(DeviceAddress::new(0x10).is_err());
    }

    #[test]
    fn test_companion_address_must_be_even() {
        assert!(CompanionAddress::new(0xC8).is_ok());
        assert!(CompanionAddress::new(0xC9).is_err());
        assert!(CompanionAddress::new(0x00).is_err());
        assert!(CompanionAddress::new(0xFF).is_err());
    }

    #[test]
    fn test_device_type_geometry() {
        assert_eq!(DeviceType::At88sc0104c.zone_count(), 4);
        assert_eq!(DeviceType::At88sc0104c.capacity(), 128);
        assert_eq!(DeviceType::At88sc0808c.capacity(), 1024);
        assert_eq!(DeviceType::At88sc25616c.capacity(), 32 * 1024);
        assert_eq!(DeviceType::At88sc6416c.page_size(), 64);
    }

    #[test]
    fn test_every_type_identifies_from_its_atr() {
        for device_type in DeviceType::all() {
            assert_eq!(DeviceType::from_atr(&device_type.atr()), Some(*device_type));
        }
        assert_eq!(DeviceType::from_atr(&[0u8; 8]), None);
    }

    #[test]
    fn test_atr_matches_published_values() {
        assert_eq!(
            hex::encode(DeviceType::At88sc0104c.atr()),
            "3bb2110010800001"
        );
        assert_eq!(
            hex::encode(DeviceType::At88sc12816c.atr()),
            "3bb3110000000128"
        );
    }

    #[test]
    fn test_registry_lookups() {
        let config = HostConfig {
            devices: vec![
                DeviceConfig {
                    address: DeviceAddress::new(0x0B).unwrap(),
                    device_type: DeviceType::At88sc0104c,
                },
                DeviceConfig {
                    address: DeviceAddress::new(0x03).unwrap(),
                    device_type: DeviceType::At88sc1616c,
                },
            ],
            companions: vec![CompanionConfig {
                address: CompanionAddress::new(0xC8).unwrap(),
            }],
            ..HostConfig::default()
        };
        let registry = DeviceRegistry::from_config(&config).unwrap();

        let second = DeviceAddress::new(0x03).unwrap();
        assert_eq!(registry.address_for_index(1), Some(second));
        assert_eq!(registry.index_for_address(second), Some(1));
        assert_eq!(registry.type_for_index(1), Some(DeviceType::At88sc1616c));
        assert_eq!(registry.address_for_index(2), None);
        assert!(matches!(
            registry.type_for_address(DeviceAddress::new(0x01).unwrap()),
            Err(Error::UnknownDevice(0x01))
        ));
        assert_eq!(
            registry.companion_index_for_address(CompanionAddress::new(0xC8).unwrap()),
            Some(0)
        );
    }

    #[test]
    fn test_device_type_serde_names() {
        let json = serde_json::to_string(&DeviceType::At88sc0808c).unwrap();
        assert_eq!(json, "\"AT88SC0808C\"");
        let parsed: DeviceType = serde_json::from_str("\"AT88SC25616C\"").unwrap();
        assert_eq!(parsed, DeviceType::At88sc25616c);
    }
}
