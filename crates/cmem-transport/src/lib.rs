//! Port implementations for CryptoMemory hosts.
//!
//! Provides simulated devices that speak the same wire protocol as the
//! hardware:
//! - `SimulatedCryptoMemory`: primary device with passwords, authentication,
//!   encryption, checksums, zones and fuses
//! - `SimulatedCompanion`: companion chip with start-up challenge, flash
//!   check, counters and EEPROM
//! - `SimBus`: routes frames to the addressed device
//!
//! Each simulated device is a [`cmem_platform::Port`] on its own, so a
//! `Session` can talk to one directly or through a shared bus.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod sim;

pub use bus::{BusPort, SimBus};
pub use sim::{SimulatedCompanion, SimulatedCryptoMemory, ZonePolicy};
