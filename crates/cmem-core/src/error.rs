//! Error types for session operations.

use crate::companion::CompanionStatus;
use cmem_platform::PortError;
use thiserror::Error;

/// Result type alias for session operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Session operation errors.
///
/// Every error maps to a numeric status through [`Error::code`].
#[derive(Debug, Error)]
pub enum Error {
    /// Transfer did not complete (0x16).
    #[error("Transport fault: {0}")]
    TransportFault(#[from] PortError),

    /// Password rejected; the attempts counter was decremented (0x1C).
    #[error("Password not accepted (attempts counter {counter:#04x})")]
    PasswordNotAccepted {
        /// PAC value read back from the device.
        counter: u8,
    },

    /// Password attempts exhausted (0x20).
    #[error("Password set {set} permanently disabled")]
    PasswordPermanentlyDisabled {
        /// Password set index.
        set: u8,
    },

    /// Cryptogram mismatch during authentication (0x21).
    #[error("Authentication failed (attempts counter {counter:#04x})")]
    AuthenticationFailed {
        /// AAC value read back from the device.
        counter: u8,
    },

    /// Authentication attempts exhausted (0x22).
    #[error("Key set {key_set} permanently disabled")]
    KeySetPermanentlyDisabled {
        /// Key set index.
        key_set: u8,
    },

    /// Cryptogram mismatch during encryption activation (0x23).
    #[error("Encryption activation failed")]
    EncryptionActivationFailed,

    /// Device rejected the checksum; the write was dropped (0x24).
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Fuse write would clear a blown fuse (0x25).
    #[error("Invalid fuse transition: {current:#04x} -> {requested:#04x}")]
    InvalidFuseTransition {
        /// Current fuse bits.
        current: u8,
        /// Requested fuse bits.
        requested: u8,
    },

    /// Target region is locked (0x26).
    #[error("Address {address:#05x} is locked")]
    ZoneLocked {
        /// First locked address touched by the request.
        address: u16,
    },

    /// Address not present in the registry (0x19).
    #[error("Unknown device {0:#04x}")]
    UnknownDevice(u8),

    /// Zone index outside the device range (0x1D).
    #[error("Invalid user zone {0}")]
    InvalidUserZone(u8),

    /// User zone access without a selected zone (0x28).
    #[error("No user zone selected")]
    NoZoneSelected,

    /// Write length out of range (0x1E).
    #[error("Invalid write length: {0} bytes")]
    InvalidWriteLength(usize),

    /// Read length out of range (0x1F).
    #[error("Invalid read length: {0} bytes")]
    InvalidReadLength(usize),

    /// Malformed argument or frame (0x2A).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Companion start challenge failed (0x0A).
    #[error("Companion challenge failed")]
    ChallengeFailed,

    /// Companion chip is locked (0x27).
    #[error("Companion chip is locked")]
    CompanionLocked,

    /// Companion chip returned a failure status.
    #[error("Companion status: {0:?}")]
    Companion(CompanionStatus),

    /// Device lock poisoned by an interrupted exchange (0x29).
    #[error("Session desynchronized; reset the device")]
    Desynchronized,

    /// Configuration rejected (0x2B).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Cryptographic error (0x14).
    #[error("Crypto error: {0}")]
    Crypto(#[from] cmem_crypto::Error),

    /// Random source failure (0x14).
    #[error("Platform error: {0}")]
    Platform(#[from] cmem_platform::Error),
}

impl Error {
    /// Numeric status for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::TransportFault(_) => ErrorCode::FailCommandSend,
            Error::PasswordNotAccepted { .. } => ErrorCode::PasswordNotAccepted,
            Error::PasswordPermanentlyDisabled { .. } => ErrorCode::PasswordPermanentlyDisabled,
            Error::AuthenticationFailed { .. } => ErrorCode::AuthenticationFailed,
            Error::KeySetPermanentlyDisabled { .. } => ErrorCode::KeySetPermanentlyDisabled,
            Error::EncryptionActivationFailed => ErrorCode::EncryptionActivationFailed,
            Error::ChecksumMismatch => ErrorCode::ChecksumMismatch,
            Error::InvalidFuseTransition { .. } => ErrorCode::InvalidFuseTransition,
            Error::ZoneLocked { .. } => ErrorCode::ZoneLocked,
            Error::UnknownDevice(_) => ErrorCode::UnknownDevice,
            Error::InvalidUserZone(_) => ErrorCode::InvalidUserZone,
            Error::NoZoneSelected => ErrorCode::NoZoneSelected,
            Error::InvalidWriteLength(_) => ErrorCode::InvalidWriteLength,
            Error::InvalidReadLength(_) => ErrorCode::InvalidReadLength,
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::ChallengeFailed => ErrorCode::CompanionResponseFailed,
            Error::CompanionLocked => ErrorCode::CompanionLocked,
            Error::Companion(status) => status.code(),
            Error::Desynchronized => ErrorCode::Desynchronized,
            Error::InvalidConfig(_) => ErrorCode::InvalidConfig,
            Error::Crypto(_) | Error::Platform(_) => ErrorCode::Failed,
        }
    }
}

/// Numeric status codes.
///
/// Values below 0x20 follow the established CryptoMemory library return
/// codes; companion statuses reuse the chip's own status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    /// Companion reset locked until power cycle (0x01).
    CompanionResetLocked = 0x01,
    /// Companion command format or operand bad (0x02).
    CompanionBadCommand = 0x02,
    /// Companion disabled for a time delay (0x03).
    CompanionTimeDelay = 0x03,
    /// Companion authentication required or failed (0x04).
    CompanionAuthFail = 0x04,
    /// Companion permanently locked (0x07).
    CompanionPermLocked = 0x07,
    /// Companion start-up response failed (0x0A).
    CompanionResponseFailed = 0x0A,
    /// Companion busy (0x0B).
    CompanionBusy = 0x0B,
    /// Companion data not available (0x0C).
    CompanionDataNotAvailable = 0x0C,
    /// Companion start-up challenge not done (0x0D).
    CompanionStartupNotDone = 0x0D,
    /// General failure (0x14).
    Failed = 0x14,
    /// Failed to send a command (0x16).
    FailCommandSend = 0x16,
    /// Invalid device number (0x19).
    UnknownDevice = 0x19,
    /// Password not accepted (0x1C).
    PasswordNotAccepted = 0x1C,
    /// Wrong user zone (0x1D).
    InvalidUserZone = 0x1D,
    /// Number of bytes to write out of range (0x1E).
    InvalidWriteLength = 0x1E,
    /// Number of bytes to read out of range (0x1F).
    InvalidReadLength = 0x1F,
    /// Password permanently disabled (0x20).
    PasswordPermanentlyDisabled = 0x20,
    /// Authentication failed (0x21).
    AuthenticationFailed = 0x21,
    /// Key set permanently disabled (0x22).
    KeySetPermanentlyDisabled = 0x22,
    /// Encryption activation failed (0x23).
    EncryptionActivationFailed = 0x23,
    /// Checksum mismatch (0x24).
    ChecksumMismatch = 0x24,
    /// Invalid fuse transition (0x25).
    InvalidFuseTransition = 0x25,
    /// Region locked (0x26).
    ZoneLocked = 0x26,
    /// Companion chip locked (0x27).
    CompanionLocked = 0x27,
    /// No zone selected (0x28).
    NoZoneSelected = 0x28,
    /// Session desynchronized (0x29).
    Desynchronized = 0x29,
    /// Invalid argument (0x2A).
    InvalidArgument = 0x2A,
    /// Invalid configuration (0x2B).
    InvalidConfig = 0x2B,
}

impl ErrorCode {
    /// Convert to the numeric status.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Convert from the numeric status.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::CompanionResetLocked),
            0x02 => Some(Self::CompanionBadCommand),
            0x03 => Some(Self::CompanionTimeDelay),
            0x04 => Some(Self::CompanionAuthFail),
            0x07 => Some(Self::CompanionPermLocked),
            0x0A => Some(Self::CompanionResponseFailed),
            0x0B => Some(Self::CompanionBusy),
            0x0C => Some(Self::CompanionDataNotAvailable),
            0x0D => Some(Self::CompanionStartupNotDone),
            0x14 => Some(Self::Failed),
            0x16 => Some(Self::FailCommandSend),
            0x19 => Some(Self::UnknownDevice),
            0x1C => Some(Self::PasswordNotAccepted),
            0x1D => Some(Self::InvalidUserZone),
            0x1E => Some(Self::InvalidWriteLength),
            0x1F => Some(Self::InvalidReadLength),
            0x20 => Some(Self::PasswordPermanentlyDisabled),
            0x21 => Some(Self::AuthenticationFailed),
            0x22 => Some(Self::KeySetPermanentlyDisabled),
            0x23 => Some(Self::EncryptionActivationFailed),
            0x24 => Some(Self::ChecksumMismatch),
            0x25 => Some(Self::InvalidFuseTransition),
            0x26 => Some(Self::ZoneLocked),
            0x27 => Some(Self::CompanionLocked),
            0x28 => Some(Self::NoZoneSelected),
            0x29 => Some(Self::Desynchronized),
            0x2A => Some(Self::InvalidArgument),
            0x2B => Some(Self::InvalidConfig),
            _ => None,
        }
    }
}
