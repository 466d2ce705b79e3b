//! Security session engine for CryptoMemory devices.
//!
//! This crate implements the host side of the CryptoMemory security protocol:
//! - Command framing for primary devices and companion chips
//! - Security session state machine (Standard, Authenticated, Encrypted)
//! - Password verification with attempt-counter lockout
//! - Mutual authentication, encryption activation and encrypted checksums
//! - Zone access control with anti-tearing and fuse locks
//! - Companion chip challenge, flash check, counters and memory access
//!
//! Byte transport and randomness are injected through `cmem-platform` traits.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod command;
pub mod companion;
pub mod config;
pub mod error;
pub mod fuse;
pub mod host;
pub mod registry;
pub mod session;
pub mod zone;

pub use command::{Command, CompanionCommand};
pub use companion::{Companion, CompanionStatus, FlashCheck, ManufacturingId};
pub use config::{CompanionConfig, DeviceConfig, HostConfig, SessionConfig};
pub use error::{Error, ErrorCode, Result};
pub use fuse::Fuses;
pub use host::{Endpoint, Host};
pub use registry::{CompanionAddress, DeviceAddress, DeviceRegistry, DeviceType};
pub use session::{KeySet, PasswordKind, PendingWrite, SecurityMode, Session, ZoneSelection};
