//! Error types for cryptographic operations.

use thiserror::Error;

/// Result type alias for cryptographic operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Cryptographic operation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid input length.
    #[error("Invalid input length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length in bytes.
        expected: usize,
        /// Actual length received in bytes.
        actual: usize,
    },

    /// Key set index outside the device range.
    #[error("Invalid key set index: {0}")]
    InvalidKeySet(u8),

    /// Keystream request larger than a single digest.
    #[error("Keystream too long: {0} bytes")]
    KeystreamTooLong(usize),
}
