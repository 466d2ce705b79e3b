//! Companion chip engine.
//!
//! The companion chip authenticates the host processor, checks firmware
//! digests, keeps four monotonic counters and stores a small EEPROM:
//!
//! ```text
//! 0x000..=0x0FF  secret      (unreadable once locked)
//! 0x100..=0x17F  read-only   (first 16 bytes writable with authorization)
//! 0x180..=0x1FF  read/write
//! ```
//!
//! Locking is permanent. The engine tracks it and refuses encrypted writes
//! and digest reads afterwards without contacting the chip.

use crate::command::{transmit, transmit_companion, CompanionCommand};
use crate::config::SessionConfig;
use crate::error::ErrorCode;
use crate::registry::CompanionAddress;
use crate::{Error, Result};
use cmem_crypto::auth::{system_response, verify_companion_proof};
use cmem_crypto::digest::{
    apply_keystream, block_digest, flash_signature, page_keystream, BLOCK_LEN, DIGEST_LEN,
    PAGE_LEN,
};
use cmem_platform::{Port, RandomSource};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

pub use cmem_crypto::digest::sha1;

/// Address mask; the 7 most significant bits are ignored.
pub const ADDRESS_MASK: u16 = 0x1FF;
/// Largest single memory read or write.
pub const MAX_TRANSFER: usize = 16;
/// Number of counters.
pub const COUNTER_COUNT: u8 = 4;

const PAGE_MASK: u16 = 0x1F0;
const BLOCK_MASK: u16 = 0x1E0;
const AUTHORIZED_START: u16 = 0x100;
const AUTHORIZED_END: u16 = 0x10F;
const SEED_LEN: usize = 16;
const MODE_SIGNED: u8 = 0x01;

/// Failure status reported by a companion chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanionStatus {
    /// Disabled until power or reset cycle.
    ResetLocked,
    /// Command format or operand bad.
    BadCommand,
    /// Disabled for a time delay.
    TimeDelay,
    /// Authentication required or failed.
    AuthFail,
    /// Permanently locked.
    PermLocked,
    /// Start-up response failed.
    ResponseFailed,
    /// Busy.
    Busy,
    /// Data not available.
    DataNotAvailable,
    /// Start-up challenge not done.
    StartupNotDone,
    /// Unrecognized status byte.
    Other(u8),
}

impl CompanionStatus {
    /// Parse a status byte. Zero is success and yields `None`.
    pub fn from_u8(status: u8) -> Option<Self> {
        Some(match status {
            0x00 => return None,
            0x01 => Self::ResetLocked,
            0x02 => Self::BadCommand,
            0x03 => Self::TimeDelay,
            0x04 => Self::AuthFail,
            0x07 => Self::PermLocked,
            0x0A => Self::ResponseFailed,
            0x0B => Self::Busy,
            0x0C => Self::DataNotAvailable,
            0x0D => Self::StartupNotDone,
            other => Self::Other(other),
        })
    }

    /// Status byte.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::ResetLocked => 0x01,
            Self::BadCommand => 0x02,
            Self::TimeDelay => 0x03,
            Self::AuthFail => 0x04,
            Self::PermLocked => 0x07,
            Self::ResponseFailed => 0x0A,
            Self::Busy => 0x0B,
            Self::DataNotAvailable => 0x0C,
            Self::StartupNotDone => 0x0D,
            Self::Other(other) => other,
        }
    }

    /// Matching result code.
    pub fn code(self) -> ErrorCode {
        match self {
            Self::ResetLocked => ErrorCode::CompanionResetLocked,
            Self::BadCommand => ErrorCode::CompanionBadCommand,
            Self::TimeDelay => ErrorCode::CompanionTimeDelay,
            Self::AuthFail => ErrorCode::CompanionAuthFail,
            Self::PermLocked => ErrorCode::CompanionPermLocked,
            Self::ResponseFailed => ErrorCode::CompanionResponseFailed,
            Self::Busy => ErrorCode::CompanionBusy,
            Self::DataNotAvailable => ErrorCode::CompanionDataNotAvailable,
            Self::StartupNotDone => ErrorCode::CompanionStartupNotDone,
            Self::Other(_) => ErrorCode::Failed,
        }
    }
}

/// Companion memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegion {
    /// Secret region, `0x000..=0x0FF`.
    Secret,
    /// Read-only region, `0x100..=0x17F`.
    ReadOnly,
    /// Read/write region, `0x180..=0x1FF`.
    ReadWrite,
}

impl MemoryRegion {
    /// Region holding `address` after masking.
    pub fn of(address: u16) -> Self {
        match address & ADDRESS_MASK {
            0x000..=0x0FF => Self::Secret,
            0x100..=0x17F => Self::ReadOnly,
            _ => Self::ReadWrite,
        }
    }
}

/// How [`Companion::verify_flash`] proves the system digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashCheck {
    /// Compare the digest with the stored flash digest.
    Direct,
    /// Send SHA-1(digest || flash digest) as a signature.
    Signed {
        /// Flash digest known to the host.
        flash_digest: [u8; DIGEST_LEN],
    },
}

/// Manufacturing id and lock byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManufacturingId([u8; 16]);

impl ManufacturingId {
    /// Wrap the 16 bytes returned by the chip.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lock byte (last byte).
    pub fn lock_byte(&self) -> u8 {
        self.0[15]
    }

    /// Whether the chip reports itself locked.
    pub fn is_locked(&self) -> bool {
        self.lock_byte() != 0
    }
}

/// Engine for one companion chip.
pub struct Companion<P, R> {
    address: CompanionAddress,
    port: P,
    random: R,
    config: SessionConfig,
    locked: bool,
}

impl<P, R> core::fmt::Debug for Companion<P, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Companion")
            .field("address", &self.address)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

impl<P, R> Companion<P, R> {
    /// Create an engine for the chip at `address`, assumed unlocked.
    ///
    /// A lock set earlier is only seen after [`Companion::read_manuf_id`];
    /// [`crate::Host::init`] does that for every configured chip.
    pub fn new(address: CompanionAddress, port: P, random: R, config: SessionConfig) -> Self {
        Self {
            address,
            port,
            random,
            config,
            locked: false,
        }
    }

    /// Chip bus address.
    pub fn address(&self) -> CompanionAddress {
        self.address
    }

    /// Whether the chip is known to be locked.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Borrow the port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Mutably borrow the port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
}

impl<P: Port, R: RandomSource> Companion<P, R> {
    fn transact(&mut self, command: &CompanionCommand) -> Result<Vec<u8>> {
        transmit_companion(
            &mut self.port,
            self.address,
            command,
            self.config.companion_timeout(),
        )
    }

    fn ensure_unlocked(&self, operation: &str) -> Result<()> {
        if self.locked {
            warn!(address = self.address.get(), operation, "companion locked");
            return Err(Error::CompanionLocked);
        }
        Ok(())
    }

    /// Mutually authenticate host and chip.
    ///
    /// The chip proves knowledge of the CMC seed; the host answers with a
    /// response over the system seed. Returns the chip's challenge.
    ///
    /// # Errors
    ///
    /// `Error::ChallengeFailed` if the chip's proof does not match `cmc_seed`
    /// (no response is sent) or the chip rejects the response.
    pub fn start_challenge(
        &mut self,
        cmc_seed: &[u8; SEED_LEN],
        system_seed: &[u8; SEED_LEN],
    ) -> Result<[u8; DIGEST_LEN]> {
        let response = self.transact(&CompanionCommand::StartChallenge)?;
        let challenge: [u8; DIGEST_LEN] = to_array(&response[..DIGEST_LEN])?;
        let proof: [u8; DIGEST_LEN] = to_array(&response[DIGEST_LEN..])?;

        if !verify_companion_proof(&challenge, cmc_seed, &proof) {
            warn!(address = self.address.get(), "companion proof rejected");
            return Err(Error::ChallengeFailed);
        }

        let reply = CompanionCommand::ChallengeResponse {
            response: system_response(&proof, system_seed),
        };
        match self.transact(&reply) {
            Ok(_) => {
                info!(address = self.address.get(), "companion authenticated");
                Ok(challenge)
            }
            Err(Error::Companion(status)) => {
                warn!(address = self.address.get(), ?status, "system response rejected");
                Err(Error::ChallengeFailed)
            }
            Err(e) => Err(e),
        }
    }

    /// Check a system digest against the chip's flash digest.
    pub fn verify_flash(&mut self, digest: &[u8; DIGEST_LEN], check: FlashCheck) -> Result<()> {
        let command = match check {
            FlashCheck::Direct => CompanionCommand::VerifyFlash {
                mode: 0,
                digest: *digest,
                signature: None,
            },
            FlashCheck::Signed { flash_digest } => CompanionCommand::VerifyFlash {
                mode: MODE_SIGNED,
                digest: *digest,
                signature: Some(flash_signature(digest, &flash_digest)),
            },
        };
        self.transact(&command).map(|_| ())
    }

    /// 20 random bytes from the chip.
    pub fn get_random(&mut self) -> Result<[u8; DIGEST_LEN]> {
        let response = self.transact(&CompanionCommand::GetRandom)?;
        to_array(&response)
    }

    /// Increment counter `selector` by one.
    pub fn increment_counter(&mut self, selector: u8) -> Result<()> {
        check_selector(selector)?;
        self.transact(&CompanionCommand::IncrementCounter { selector })?;
        debug!(address = self.address.get(), selector, "counter incremented");
        Ok(())
    }

    /// Low 32 bits of counter `selector`.
    pub fn read_counter(&mut self, selector: u8) -> Result<u32> {
        check_selector(selector)?;
        let response = self.transact(&CompanionCommand::ReadCounter { selector })?;
        Ok(u32::from_le_bytes(to_array(&response)?))
    }

    /// Write up to 16 clear bytes.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidWriteLength` if `data` is empty, longer than 16 bytes
    ///   or runs past the end of memory
    /// - `Error::ZoneLocked` once locked, for any byte outside the read/write region
    pub fn write_memory(&mut self, address: u16, data: &[u8]) -> Result<()> {
        let address = address & ADDRESS_MASK;
        if !span_fits(address, data.len()) {
            return Err(Error::InvalidWriteLength(data.len()));
        }
        if self.locked {
            if let Some(target) = span(address, data.len())
                .find(|a| MemoryRegion::of(*a) != MemoryRegion::ReadWrite)
            {
                warn!(address = self.address.get(), target, "write outside read/write region");
                return Err(Error::ZoneLocked { address: target });
            }
        }
        self.transact(&CompanionCommand::WriteMemory {
            address,
            data: data.to_vec(),
        })
        .map(|_| ())
    }

    /// Write one byte in the first 16 bytes of the read-only region.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` if `address` lies outside `0x100..=0x10F`.
    pub fn write_memory_authorized(&mut self, address: u16, data: u8, f0: &[u8; 8]) -> Result<()> {
        let address = address & ADDRESS_MASK;
        if !(AUTHORIZED_START..=AUTHORIZED_END).contains(&address) {
            return Err(Error::InvalidArgument(format!(
                "authorized write at {address:#05x} outside {AUTHORIZED_START:#05x}..={AUTHORIZED_END:#05x}"
            )));
        }
        self.transact(&CompanionCommand::WriteMemoryAuthorized {
            address,
            data,
            f0: *f0,
        })
        .map(|_| ())
    }

    /// Write one 16-byte page encrypted under `enc_key`.
    ///
    /// The low 4 address bits are ignored. `nonce` seeds the keystream; `None`
    /// draws it from the random source.
    ///
    /// # Errors
    ///
    /// `Error::CompanionLocked` once the chip is locked; nothing is sent.
    pub fn write_memory_encrypted(
        &mut self,
        address: u16,
        data: &[u8; PAGE_LEN],
        nonce: Option<[u8; DIGEST_LEN]>,
        enc_key: &[u8; SEED_LEN],
    ) -> Result<()> {
        self.ensure_unlocked("encrypted write")?;
        let page = address & PAGE_MASK;
        let nonce = match nonce {
            Some(nonce) => nonce,
            None => {
                let mut nonce = [0u8; DIGEST_LEN];
                self.random.fill_bytes(&mut nonce)?;
                nonce
            }
        };

        let keystream = page_keystream(page, enc_key, &nonce);
        let mut ciphertext = *data;
        apply_keystream(&mut ciphertext, &keystream[..])?;

        self.transact(&CompanionCommand::WriteMemoryEncrypted {
            address: page,
            ciphertext,
            nonce,
        })
        .map(|_| ())
    }

    /// Read up to 16 clear bytes.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidReadLength` if `count` is zero, above 16 or runs past
    ///   the end of memory
    /// - `Error::ZoneLocked` once locked, for any byte of the secret region
    pub fn read_memory(&mut self, address: u16, count: u8) -> Result<Vec<u8>> {
        let address = address & ADDRESS_MASK;
        if !span_fits(address, count as usize) {
            return Err(Error::InvalidReadLength(count as usize));
        }
        if self.locked {
            if let Some(target) = span(address, count as usize)
                .find(|a| MemoryRegion::of(*a) == MemoryRegion::Secret)
            {
                return Err(Error::ZoneLocked { address: target });
            }
        }
        self.transact(&CompanionCommand::ReadMemory { address, count })
    }

    /// SHA-1 digest of the 32-byte block holding `address`.
    ///
    /// # Errors
    ///
    /// `Error::CompanionLocked` once the chip is locked; nothing is sent.
    pub fn read_memory_digest(&mut self, address: u16) -> Result<[u8; DIGEST_LEN]> {
        self.ensure_unlocked("digest read")?;
        let response = self.transact(&CompanionCommand::ReadMemoryDigest {
            address: address & BLOCK_MASK,
        })?;
        to_array(&response)
    }

    /// Compare the chip's block digest with the digest of `expected`.
    pub fn verify_memory_digest(&mut self, address: u16, expected: &[u8; BLOCK_LEN]) -> Result<bool> {
        let digest = self.read_memory_digest(address)?;
        Ok(digest[..].ct_eq(&block_digest(expected)[..]).into())
    }

    /// Read the manufacturing id and refresh the lock flag.
    pub fn read_manuf_id(&mut self) -> Result<ManufacturingId> {
        let response = self.transact(&CompanionCommand::ReadManufId)?;
        let id = ManufacturingId::from_bytes(to_array(&response)?);
        self.locked = id.is_locked();
        Ok(id)
    }

    /// Lock the chip. Permanent.
    pub fn lock(&mut self) -> Result<()> {
        self.transact(&CompanionCommand::Lock)?;
        self.locked = true;
        info!(address = self.address.get(), "companion locked");
        Ok(())
    }

    /// Read the status byte. `None` means ready.
    pub fn status(&mut self) -> Result<Option<CompanionStatus>> {
        let frame = CompanionCommand::Status.encode(self.address);
        let status = transmit(&mut self.port, &frame, 1, self.config.companion_timeout())?[0];
        Ok(CompanionStatus::from_u8(status))
    }
}

fn check_selector(selector: u8) -> Result<()> {
    if selector >= COUNTER_COUNT {
        return Err(Error::InvalidArgument(format!("counter {selector} exceeds 3")));
    }
    Ok(())
}

fn span_fits(address: u16, len: usize) -> bool {
    len != 0 && len <= MAX_TRANSFER && address as usize + len <= ADDRESS_MASK as usize + 1
}

fn span(address: u16, len: usize) -> impl Iterator<Item = u16> {
    (0..len as u16).map(move |i| address + i)
}

fn to_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| {
        cmem_crypto::Error::InvalidLength {
            expected: N,
            actual: bytes.len(),
        }
        .into()
    })
}
