//! Cryptographic primitives for CryptoMemory and CryptoCompanion devices.
//!
//! This crate implements the host half of the device cryptography:
//! - The cryptoengine: the three-register GPA stream cipher shared by host and device
//! - Challenge-response authentication (cryptogram, challenge and session key derivation)
//! - Encrypted checksums gating authenticated writes
//! - SHA-1 digests used by the companion chip protocol
//!
//! Security requirements:
//! - No unsafe code
//! - Secret seeds, session keys and engine state are zeroized on drop
//! - Constant-time comparisons via subtle crate
//! - No logging of key material

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod checksum;
pub mod digest;
pub mod error;
pub mod gpa;

pub use auth::{AuthExchange, Secret, SessionKey};
pub use checksum::{compute_checksum, validate_checksum, Checksum};
pub use error::{Error, Result};
pub use gpa::CryptoEngine;
