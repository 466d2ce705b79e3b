//! Host platform integrations for CryptoMemory devices.
//!
//! Implements:
//! - Transport port: the byte-level command/response link to a device
//! - Random sources: OS-backed entropy and deterministic test sequences
//! - Scripted mocks for exercising protocol code without hardware

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod mock;
pub mod os;
pub mod traits;

pub use error::{Error, PortError, PortResult, Result};
pub use os::OsRandom;
pub use traits::{Port, RandomSource};
