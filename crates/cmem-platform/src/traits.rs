//! Collaborator traits for talking to devices.
//!
//! Protocol code is written against these traits so it can run over a real
//! two-wire bus, a simulated device, or a scripted mock.

use crate::error::{PortResult, Result};
use std::time::Duration;

/// Byte-level command/response link to one device.
///
/// Implementations own framing and timing on the wire:
/// - Hardware buses: start/stop conditions, acknowledge polling
/// - Simulators: an in-process device model
/// - Testing: scripted responses (ScriptedPort)
///
/// # Contract
///
/// - `send` transmits a complete command frame or fails
/// - `receive` returns exactly `count` bytes or fails
/// - `wait_ready` polls until the device finishes its internal operation
pub trait Port: Send {
    /// Transmit one command frame.
    ///
    /// # Errors
    ///
    /// - `PortError::Nack` if the device rejects the frame
    /// - `PortError::Io` on bus failure
    fn send(&mut self, frame: &[u8]) -> PortResult<()>;

    /// Receive exactly `count` response bytes.
    ///
    /// # Errors
    ///
    /// - `PortError::Short` if fewer bytes are available
    /// - `PortError::Nack` if the device refuses to answer
    fn receive(&mut self, count: usize) -> PortResult<Vec<u8>>;

    /// Wait until the device is ready for the next transfer.
    ///
    /// Returns `false` if the device stayed busy for the whole timeout.
    fn wait_ready(&mut self, timeout: Duration) -> bool;
}

impl<P: Port + ?Sized> Port for Box<P> {
    fn send(&mut self, frame: &[u8]) -> PortResult<()> {
        (**self).send(frame)
    }

    fn receive(&mut self, count: usize) -> PortResult<Vec<u8>> {
        (**self).receive(count)
    }

    fn wait_ready(&mut self, timeout: Duration) -> bool {
        (**self).wait_ready(timeout)
    }
}

/// Source of host random values (challenge randoms, nonces).
pub trait RandomSource: Send {
    /// Fill `dest` with random bytes.
    ///
    /// # Errors
    ///
    /// - `Error::Random` if the underlying source fails
    fn fill_bytes(&mut self, dest: &mut [u8]) -> Result<()>;
}

impl<R: RandomSource + ?Sized> RandomSource for Box<R> {
    fn fill_bytes(&mut self, dest: &mut [u8]) -> Result<()> {
        (**self).fill_bytes(dest)
    }
}
