//! Security fuses.
//!
//! Four one-way fuses lock regions of configuration memory:
//! - SEC (bit 3): lot history code, `0x10..=0x17`
//! - FAB (bit 2): answer-to-reset and fab code, `0x00..=0x09`
//! - CMA (bit 1): card manufacturer code, `0x0C..=0x0F`
//! - PER (bit 0): the rest of configuration memory
//!
//! A blown fuse never returns to zero.

use crate::command::Command;
use crate::session::Session;
use crate::{Error, Result};
use cmem_platform::{Port, RandomSource};
use tracing::{info, warn};

/// Fuse byte state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fuses(u8);

impl Fuses {
    /// SEC fuse bit.
    pub const SEC: u8 = 0x08;
    /// FAB fuse bit.
    pub const FAB: u8 = 0x04;
    /// CMA fuse bit.
    pub const CMA: u8 = 0x02;
    /// PER fuse bit.
    pub const PER: u8 = 0x01;
    /// All fuse bits.
    pub const MASK: u8 = 0x0F;

    /// Fuse state from the low nibble of `bits`.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::MASK)
    }

    /// Raw fuse nibble.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit in `mask` is blown.
    pub fn is_blown(self, mask: u8) -> bool {
        self.0 & mask == mask
    }

    /// Whether moving to `requested` keeps every blown fuse blown.
    pub fn can_transition_to(self, requested: u8) -> bool {
        self.0 & !requested == 0
    }

    /// Fuse bit guarding a configuration address.
    pub fn guard_for(address: u8) -> u8 {
        match address {
            0x00..=0x09 => Self::FAB,
            0x0C..=0x0F => Self::CMA,
            0x10..=0x17 => Self::SEC,
            _ => Self::PER,
        }
    }

    /// Whether a configuration address is locked.
    pub fn locks(self, address: u8) -> bool {
        self.is_blown(Self::guard_for(address))
    }

    /// First locked address in `address..address + len`.
    pub fn first_locked(self, address: u8, len: usize) -> Option<u8> {
        (address as usize..(address as usize + len).min(0x100))
            .map(|a| a as u8)
            .find(|a| self.locks(*a))
    }
}

impl<P: Port, R: RandomSource> Session<P, R> {
    /// Blow fuses.
    ///
    /// `value` is the complete requested fuse nibble. Reads the fuse byte first
    /// if it is not cached.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidArgument` if `value` does not fit in 4 bits
    /// - `Error::InvalidFuseTransition` if a blown fuse would be cleared; nothing is sent
    pub fn write_fuse(&mut self, value: u8) -> Result<()> {
        if value & !Fuses::MASK != 0 {
            return Err(Error::InvalidArgument(format!(
                "fuse value {value:#04x} exceeds 4 bits"
            )));
        }
        let current = match self.cached_fuses() {
            Some(fuses) => fuses,
            None => self.read_fuse()?,
        };
        if !current.can_transition_to(value) {
            warn!(
                current = current.bits(),
                requested = value,
                "refusing fuse transition"
            );
            return Err(Error::InvalidFuseTransition {
                current: current.bits(),
                requested: value,
            });
        }
        self.exchange(&Command::WriteFuse { fuses: value })?;
        self.set_cached_fuses(Fuses::from_bits(value));
        info!(address = self.address().get(), fuses = value, "fuses written");
        Ok(())
    }

    /// Read the fuse byte and refresh the cached state.
    pub fn read_fuse(&mut self) -> Result<Fuses> {
        let response = self.exchange(&Command::ReadFuse)?;
        let fuses = Fuses::from_bits(response[0]);
        self.set_cached_fuses(fuses);
        Ok(fuses)
    }
}
