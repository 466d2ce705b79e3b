//! Platform integration errors.

use thiserror::Error;

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;

/// Result type alias for port transfers.
pub type PortResult<T> = core::result::Result<T, PortError>;

/// Platform errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Random source failed to produce bytes.
    #[error("Random source failure: {0}")]
    Random(String),
}

/// Transport port failures.
///
/// A port only moves bytes; it never interprets them. Every variant means
/// the exchange did not complete as framed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    /// Device did not acknowledge a byte.
    #[error("Device did not acknowledge")]
    Nack,

    /// Device did not become ready in time.
    #[error("Timed out waiting for device")]
    Timeout,

    /// Fewer bytes arrived than requested.
    #[error("Short transfer: expected {expected} bytes, got {actual}")]
    Short {
        /// Bytes requested.
        expected: usize,
        /// Bytes received.
        actual: usize,
    },

    /// Underlying bus error.
    #[error("Bus error: {0}")]
    Io(String),
}
