//! Simulated devices.

pub mod companion;
pub mod cryptomem;

pub use companion::SimulatedCompanion;
pub use cryptomem::{SimulatedCryptoMemory, ZonePolicy};
