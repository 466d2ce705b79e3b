//! Command framing for primary devices and companion chips.
//!
//! Primary frames carry a 4-byte header followed by an optional payload:
//!
//! ```text
//! [ (address << 4) | opcode, P1, P2, N ] || payload[N]
//! ```
//!
//! Companion frames are `[address, opcode, operands...]`. Every companion
//! command is answered by one status byte and, on success, the response.
//!
//! The codec only builds and parses frames. It never interprets the content
//! of returned data; that belongs to the session layer.

use crate::companion::CompanionStatus;
use crate::registry::{CompanionAddress, DeviceAddress};
use crate::{Error, Result};
use cmem_platform::{Port, PortError};
use std::time::Duration;
use tracing::debug;

/// Primary command header length.
pub const HEADER_LEN: usize = 4;

/// Write user zone opcode.
pub const OP_WRITE_USER_ZONE: u8 = 0x0;
/// Read user zone opcode.
pub const OP_READ_USER_ZONE: u8 = 0x2;
/// System write opcode.
pub const OP_SYSTEM_WRITE: u8 = 0x4;
/// System read opcode.
pub const OP_SYSTEM_READ: u8 = 0x6;
/// Verify crypto opcode.
pub const OP_VERIFY_CRYPTO: u8 = 0x8;
/// Verify password opcode.
pub const OP_VERIFY_PASSWORD: u8 = 0xA;

// System write/read sub-functions (P1 low bits)
const SYS_CONFIG: u8 = 0x00;
const SYS_FUSE: u8 = 0x01;
const SYS_CHECKSUM: u8 = 0x02;
const SYS_USER_ZONE: u8 = 0x03;

/// Anti-tearing flag in P1 of system writes.
const ANTI_TEARING: u8 = 0x08;
/// Encrypt flag in P1 of verify crypto.
const ENCRYPT: u8 = 0x10;
/// Read flag in P1 of verify password.
const READ_PASSWORD: u8 = 0x10;
/// P1 of reset password.
const RESET_PASSWORD: u8 = 0xFF;
/// N of verify crypto: Q(8) || Ch(8).
const VERIFY_CRYPTO_LEN: u8 = 0x10;

/// Primary device command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Write bytes at an offset in the selected user zone.
    WriteUserZone {
        /// Offset within the zone.
        address: u16,
        /// Data bytes (clear or encrypted on the wire).
        data: Vec<u8>,
    },
    /// Read bytes from the selected user zone.
    ReadUserZone {
        /// Offset within the zone.
        address: u16,
        /// Byte count.
        count: u8,
    },
    /// Write configuration memory.
    WriteConfigZone {
        /// Configuration address.
        address: u8,
        /// Data bytes.
        data: Vec<u8>,
        /// Anti-tearing enabled.
        anti_tearing: bool,
    },
    /// Blow fuses.
    WriteFuse {
        /// Fuse nibble.
        fuses: u8,
    },
    /// Send the encrypted checksum completing a write.
    SendChecksum {
        /// Checksum bytes.
        checksum: [u8; 2],
    },
    /// Select the user zone for following accesses.
    SetUserZone {
        /// Zone index.
        zone: u8,
        /// Anti-tearing enabled.
        anti_tearing: bool,
    },
    /// Read configuration memory.
    ReadConfigZone {
        /// Configuration address.
        address: u8,
        /// Byte count.
        count: u8,
    },
    /// Read the fuse byte.
    ReadFuse,
    /// Read the device checksum.
    ReadChecksum,
    /// Authenticate or activate encryption.
    VerifyCrypto {
        /// Key set index.
        key_set: u8,
        /// Activate encryption instead of authentication.
        encrypt: bool,
        /// Host random Q.
        random: [u8; 8],
        /// Challenge Ch.
        challenge: [u8; 8],
    },
    /// Deactivate the current key set.
    ResetCrypto,
    /// Present a password.
    VerifyPassword {
        /// Password set index.
        set: u8,
        /// Read password instead of write password.
        read: bool,
        /// Password bytes (clear or encrypted on the wire).
        password: [u8; 3],
    },
    /// Deactivate the current password.
    ResetPassword,
}

impl Command {
    /// Opcode nibble.
    pub fn opcode(&self) -> u8 {
        match self {
            Command::WriteUserZone { .. } => OP_WRITE_USER_ZONE,
            Command::ReadUserZone { .. } => OP_READ_USER_ZONE,
            Command::WriteConfigZone { .. }
            | Command::WriteFuse { .. }
            | Command::SendChecksum { .. }
            | Command::SetUserZone { .. } => OP_SYSTEM_WRITE,
            Command::ReadConfigZone { .. } | Command::ReadFuse | Command::ReadChecksum => {
                OP_SYSTEM_READ
            }
            Command::VerifyCrypto { .. } | Command::ResetCrypto => OP_VERIFY_CRYPTO,
            Command::VerifyPassword { .. } | Command::ResetPassword => OP_VERIFY_PASSWORD,
        }
    }

    /// Build the 4-byte header for `address`.
    pub fn header(&self, address: DeviceAddress) -> [u8; HEADER_LEN] {
        let cmd = (address.get() << 4) | self.opcode();
        let at = |flag: bool| if flag { ANTI_TEARING } else { 0 };
        let [p1, p2, n] = match self {
            Command::WriteUserZone { address, data } => {
                let [hi, lo] = address.to_be_bytes();
                [hi, lo, data.len() as u8]
            }
            Command::ReadUserZone { address, count } => {
                let [hi, lo] = address.to_be_bytes();
                [hi, lo, *count]
            }
            Command::WriteConfigZone {
                address,
                data,
                anti_tearing,
            } => [SYS_CONFIG | at(*anti_tearing), *address, data.len() as u8],
            Command::WriteFuse { fuses } => [SYS_FUSE, *fuses, 0x00],
            Command::SendChecksum { .. } => [SYS_CHECKSUM, 0x00, 0x02],
            Command::SetUserZone { zone, anti_tearing } => {
                [SYS_USER_ZONE | at(*anti_tearing), *zone, 0x00]
            }
            Command::ReadConfigZone { address, count } => [SYS_CONFIG, *address, *count],
            Command::ReadFuse => [SYS_FUSE, 0x00, 0x01],
            Command::ReadChecksum => [SYS_CHECKSUM, 0x00, 0x02],
            Command::VerifyCrypto {
                key_set, encrypt, ..
            } => [
                (key_set & 0x03) | if *encrypt { ENCRYPT } else { 0 },
                0x00,
                VERIFY_CRYPTO_LEN,
            ],
            Command::ResetCrypto => [0x00, 0x00, 0x00],
            Command::VerifyPassword { set, read, .. } => [
                (set & 0x07) | if *read { READ_PASSWORD } else { 0 },
                0x00,
                0x03,
            ],
            Command::ResetPassword => [RESET_PASSWORD, 0x00, 0x00],
        };
        [cmd, p1, p2, n]
    }

    /// Outgoing payload bytes.
    pub fn payload(&self) -> Vec<u8> {
        match self {
            Command::WriteUserZone { data, .. } | Command::WriteConfigZone { data, .. } => {
                data.clone()
            }
            Command::SendChecksum { checksum } => checksum.to_vec(),
            Command::VerifyCrypto {
                random, challenge, ..
            } => {
                let mut payload = Vec::with_capacity(16);
                payload.extend_from_slice(random);
                payload.extend_from_slice(challenge);
                payload
            }
            Command::VerifyPassword { password, .. } => password.to_vec(),
            _ => Vec::new(),
        }
    }

    /// Complete frame: header followed by payload.
    pub fn encode(&self, address: DeviceAddress) -> Vec<u8> {
        let mut frame = self.header(address).to_vec();
        frame.extend_from_slice(&self.payload());
        frame
    }

    /// Number of response bytes the device returns.
    pub fn response_len(&self) -> usize {
        match self {
            Command::ReadUserZone { count, .. } | Command::ReadConfigZone { count, .. } => {
                *count as usize
            }
            Command::ReadFuse => 1,
            Command::ReadChecksum => 2,
            _ => 0,
        }
    }

    /// Whether the cryptoengine absorbs this exchange in an authenticated session.
    ///
    /// Only data-carrying commands are absorbed. Verify crypto restarts the
    /// engine; checksum commands extract from it instead.
    pub fn is_absorbed(&self) -> bool {
        matches!(
            self,
            Command::WriteUserZone { .. }
                | Command::ReadUserZone { .. }
                | Command::WriteConfigZone { .. }
                | Command::ReadConfigZone { .. }
                | Command::VerifyPassword { .. }
        )
    }

    /// Whether the outgoing payload is encrypted in encryption mode.
    pub fn encrypts_payload(&self) -> bool {
        matches!(
            self,
            Command::WriteUserZone { .. }
                | Command::WriteConfigZone { .. }
                | Command::VerifyPassword { .. }
        )
    }

    /// Whether the response is encrypted in encryption mode.
    ///
    /// Configuration reads are never encrypted.
    pub fn encrypts_response(&self) -> bool {
        matches!(self, Command::ReadUserZone { .. })
    }

    /// Parse a complete frame.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` if the frame is truncated, carries trailing
    /// bytes, or names an unknown opcode or sub-function.
    pub fn decode(frame: &[u8]) -> Result<(DeviceAddress, Command)> {
        if frame.len() < HEADER_LEN {
            return Err(malformed(format!("frame of {} bytes", frame.len())));
        }
        let (cmd, p1, p2, n) = (frame[0], frame[1], frame[2], frame[3]);
        let address = DeviceAddress::new(cmd >> 4)?;
        let payload = &frame[HEADER_LEN..];

        let expect_payload = |len: usize| exact_len(payload, len);

        let command = match cmd & 0x0F {
            OP_WRITE_USER_ZONE => Command::WriteUserZone {
                address: u16::from_be_bytes([p1, p2]),
                data: expect_payload(n as usize)?.to_vec(),
            },
            OP_READ_USER_ZONE => {
                expect_payload(0)?;
                Command::ReadUserZone {
                    address: u16::from_be_bytes([p1, p2]),
                    count: n,
                }
            }
            OP_SYSTEM_WRITE => {
                let anti_tearing = p1 & ANTI_TEARING != 0;
                match p1 & !ANTI_TEARING {
                    SYS_CONFIG => Command::WriteConfigZone {
                        address: p2,
                        data: expect_payload(n as usize)?.to_vec(),
                        anti_tearing,
                    },
                    SYS_FUSE => {
                        expect_payload(0)?;
                        Command::WriteFuse { fuses: p2 }
                    }
                    SYS_CHECKSUM => {
                        let bytes = expect_payload(2)?;
                        Command::SendChecksum {
                            checksum: [bytes[0], bytes[1]],
                        }
                    }
                    SYS_USER_ZONE => {
                        expect_payload(0)?;
                        Command::SetUserZone {
                            zone: p2,
                            anti_tearing,
                        }
                    }
                    other => return Err(malformed(format!("system write {other:#04x}"))),
                }
            }
            OP_SYSTEM_READ => {
                expect_payload(0)?;
                match p1 {
                    SYS_CONFIG => Command::ReadConfigZone {
                        address: p2,
                        count: n,
                    },
                    SYS_FUSE => Command::ReadFuse,
                    SYS_CHECKSUM => Command::ReadChecksum,
                    other => return Err(malformed(format!("system read {other:#04x}"))),
                }
            }
            OP_VERIFY_CRYPTO => match n {
                0 => {
                    expect_payload(0)?;
                    Command::ResetCrypto
                }
                VERIFY_CRYPTO_LEN => {
                    let bytes = expect_payload(16)?;
                    let mut random = [0u8; 8];
                    let mut challenge = [0u8; 8];
                    random.copy_from_slice(&bytes[..8]);
                    challenge.copy_from_slice(&bytes[8..]);
                    Command::VerifyCrypto {
                        key_set: p1 & 0x03,
                        encrypt: p1 & ENCRYPT != 0,
                        random,
                        challenge,
                    }
                }
                other => return Err(malformed(format!("verify crypto length {other}"))),
            },
            OP_VERIFY_PASSWORD => {
                if p1 == RESET_PASSWORD {
                    expect_payload(0)?;
                    Command::ResetPassword
                } else {
                    let bytes = expect_payload(3)?;
                    Command::VerifyPassword {
                        set: p1 & 0x07,
                        read: p1 & READ_PASSWORD != 0,
                        password: [bytes[0], bytes[1], bytes[2]],
                    }
                }
            }
            other => return Err(malformed(format!("opcode {other:#03x}"))),
        };
        Ok((address, command))
    }
}

fn malformed(detail: String) -> Error {
    Error::InvalidArgument(format!("malformed frame: {detail}"))
}

fn exact_len(bytes: &[u8], len: usize) -> Result<&[u8]> {
    if bytes.len() != len {
        return Err(malformed(format!(
            "{} payload bytes, expected {len}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Send `frame`, wait for the device, and receive exactly `response_len` bytes.
///
/// # Errors
///
/// `Error::TransportFault` on any failed, timed-out or short transfer.
pub fn transmit<P: Port + ?Sized>(
    port: &mut P,
    frame: &[u8],
    response_len: usize,
    timeout: Duration,
) -> Result<Vec<u8>> {
    port.send(frame)?;
    if !port.wait_ready(timeout) {
        return Err(PortError::Timeout.into());
    }
    if response_len == 0 {
        return Ok(Vec::new());
    }
    let response = port.receive(response_len)?;
    if response.len() != response_len {
        return Err(PortError::Short {
            expected: response_len,
            actual: response.len(),
        }
        .into());
    }
    Ok(response)
}

/// Companion command opcodes.
pub mod companion_op {
    /// Start challenge.
    pub const START_CHALLENGE: u8 = 0x01;
    /// Challenge response.
    pub const CHALLENGE_RESPONSE: u8 = 0x02;
    /// Verify flash digest.
    pub const VERIFY_FLASH: u8 = 0x03;
    /// Get random.
    pub const GET_RANDOM: u8 = 0x04;
    /// Increment counter.
    pub const INCREMENT_COUNTER: u8 = 0x05;
    /// Read counter.
    pub const READ_COUNTER: u8 = 0x06;
    /// Write memory.
    pub const WRITE_MEMORY: u8 = 0x07;
    /// Authorized single-byte write.
    pub const WRITE_MEMORY_AUTHORIZED: u8 = 0x08;
    /// Encrypted page write.
    pub const WRITE_MEMORY_ENCRYPTED: u8 = 0x09;
    /// Read memory.
    pub const READ_MEMORY: u8 = 0x0A;
    /// Read block digest.
    pub const READ_MEMORY_DIGEST: u8 = 0x0B;
    /// Read manufacturing id and lock byte.
    pub const READ_MANUF_ID: u8 = 0x0C;
    /// Lock.
    pub const LOCK: u8 = 0x0D;
    /// Status.
    pub const STATUS: u8 = 0x0E;
}

/// Companion chip command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompanionCommand {
    /// Request challenge C and proof.
    StartChallenge,
    /// Answer the start challenge.
    ChallengeResponse {
        /// SHA-1 response.
        response: [u8; 20],
    },
    /// Check a system digest against the stored flash digest.
    VerifyFlash {
        /// Mode byte; bit 0 selects the signed check.
        mode: u8,
        /// System digest.
        digest: [u8; 20],
        /// Signature, present when mode bit 0 is set.
        signature: Option<[u8; 20]>,
    },
    /// Request 20 random bytes.
    GetRandom,
    /// Increment a counter.
    IncrementCounter {
        /// Counter 0..=3.
        selector: u8,
    },
    /// Read the low 32 bits of a counter.
    ReadCounter {
        /// Counter 0..=3.
        selector: u8,
    },
    /// Write clear bytes.
    WriteMemory {
        /// Start address.
        address: u16,
        /// Data bytes.
        data: Vec<u8>,
    },
    /// Write one byte of the read-only region.
    WriteMemoryAuthorized {
        /// Target address.
        address: u16,
        /// Data byte.
        data: u8,
        /// Authorization value F0.
        f0: [u8; 8],
    },
    /// Write one encrypted 16-byte page.
    WriteMemoryEncrypted {
        /// Page address.
        address: u16,
        /// Encrypted page.
        ciphertext: [u8; 16],
        /// Keystream nonce.
        nonce: [u8; 20],
    },
    /// Read clear bytes.
    ReadMemory {
        /// Start address.
        address: u16,
        /// Byte count.
        count: u8,
    },
    /// Read the digest of a 32-byte block.
    ReadMemoryDigest {
        /// Block address.
        address: u16,
    },
    /// Read the manufacturing id and lock byte.
    ReadManufId,
    /// Lock the chip.
    Lock,
    /// Read the status byte.
    Status,
}

impl CompanionCommand {
    /// Opcode byte.
    pub fn opcode(&self) -> u8 {
        use companion_op::*;
        match self {
            CompanionCommand::StartChallenge => START_CHALLENGE,
            CompanionCommand::ChallengeResponse { .. } => CHALLENGE_RESPONSE,
            CompanionCommand::VerifyFlash { .. } => VERIFY_FLASH,
            CompanionCommand::GetRandom => GET_RANDOM,
            CompanionCommand::IncrementCounter { .. } => INCREMENT_COUNTER,
            CompanionCommand::ReadCounter { .. } => READ_COUNTER,
            CompanionCommand::WriteMemory { .. } => WRITE_MEMORY,
            CompanionCommand::WriteMemoryAuthorized { .. } => WRITE_MEMORY_AUTHORIZED,
            CompanionCommand::WriteMemoryEncrypted { .. } => WRITE_MEMORY_ENCRYPTED,
            CompanionCommand::ReadMemory { .. } => READ_MEMORY,
            CompanionCommand::ReadMemoryDigest { .. } => READ_MEMORY_DIGEST,
            CompanionCommand::ReadManufId => READ_MANUF_ID,
            CompanionCommand::Lock => LOCK,
            CompanionCommand::Status => STATUS,
        }
    }

    /// Complete frame for `address`.
    pub fn encode(&self, address: CompanionAddress) -> Vec<u8> {
        let mut frame = vec![address.get(), self.opcode()];
        match self {
            CompanionCommand::StartChallenge
            | CompanionCommand::GetRandom
            | CompanionCommand::ReadManufId
            | CompanionCommand::Lock
            | CompanionCommand::Status => {}
            CompanionCommand::ChallengeResponse { response } => {
                frame.extend_from_slice(response);
            }
            CompanionCommand::VerifyFlash {
                mode,
                digest,
                signature,
            } => {
                frame.push(*mode);
                frame.extend_from_slice(digest);
                if let Some(signature) = signature {
                    frame.extend_from_slice(signature);
                }
            }
            CompanionCommand::IncrementCounter { selector }
            | CompanionCommand::ReadCounter { selector } => frame.push(*selector),
            CompanionCommand::WriteMemory { address, data } => {
                frame.extend_from_slice(&address.to_be_bytes());
                frame.push(data.len() as u8);
                frame.extend_from_slice(data);
            }
            CompanionCommand::WriteMemoryAuthorized { address, data, f0 } => {
                frame.extend_from_slice(&address.to_be_bytes());
                frame.push(*data);
                frame.extend_from_slice(f0);
            }
            CompanionCommand::WriteMemoryEncrypted {
                address,
                ciphertext,
                nonce,
            } => {
                frame.extend_from_slice(&address.to_be_bytes());
                frame.extend_from_slice(ciphertext);
                frame.extend_from_slice(nonce);
            }
            CompanionCommand::ReadMemory { address, count } => {
                frame.extend_from_slice(&address.to_be_bytes());
                frame.push(*count);
            }
            CompanionCommand::ReadMemoryDigest { address } => {
                frame.extend_from_slice(&address.to_be_bytes());
            }
        }
        frame
    }

    /// Number of response bytes following a success status.
    pub fn response_len(&self) -> usize {
        match self {
            CompanionCommand::StartChallenge => 40,
            CompanionCommand::GetRandom | CompanionCommand::ReadMemoryDigest { .. } => 20,
            CompanionCommand::ReadCounter { .. } => 4,
            CompanionCommand::ReadMemory { count, .. } => *count as usize,
            CompanionCommand::ReadManufId => 16,
            _ => 0,
        }
    }

    /// Parse a complete frame.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` on unknown opcodes, wrong operand lengths,
    /// or an invalid companion address.
    pub fn decode(frame: &[u8]) -> Result<(CompanionAddress, CompanionCommand)> {
        use companion_op::*;
        if frame.len() < 2 {
            return Err(malformed(format!("companion frame of {} bytes", frame.len())));
        }
        let address = CompanionAddress::new(frame[0])?;
        let operands = &frame[2..];
        let exact = |len: usize| exact_len(operands, len);
        let addr = |bytes: &[u8]| u16::from_be_bytes([bytes[0], bytes[1]]);
        let array20 = |bytes: &[u8]| {
            let mut out = [0u8; 20];
            out.copy_from_slice(&bytes[..20]);
            out
        };

        let command = match frame[1] {
            START_CHALLENGE => {
                exact(0)?;
                CompanionCommand::StartChallenge
            }
            CHALLENGE_RESPONSE => CompanionCommand::ChallengeResponse {
                response: array20(exact(20)?),
            },
            VERIFY_FLASH => {
                let mode = *operands
                    .first()
                    .ok_or_else(|| malformed("verify flash without mode".into()))?;
                let signed = mode & 0x01 != 0;
                let bytes = exact(if signed { 41 } else { 21 })?;
                CompanionCommand::VerifyFlash {
                    mode,
                    digest: array20(&bytes[1..21]),
                    signature: signed.then(|| array20(&bytes[21..41])),
                }
            }
            GET_RANDOM => {
                exact(0)?;
                CompanionCommand::GetRandom
            }
            INCREMENT_COUNTER => CompanionCommand::IncrementCounter {
                selector: exact(1)?[0],
            },
            READ_COUNTER => CompanionCommand::ReadCounter {
                selector: exact(1)?[0],
            },
            WRITE_MEMORY => {
                if operands.len() < 3 {
                    return Err(malformed("write memory header".into()));
                }
                let count = operands[2] as usize;
                let bytes = exact(3 + count)?;
                CompanionCommand::WriteMemory {
                    address: addr(bytes),
                    data: bytes[3..].to_vec(),
                }
            }
            WRITE_MEMORY_AUTHORIZED => {
                let bytes = exact(11)?;
                let mut f0 = [0u8; 8];
                f0.copy_from_slice(&bytes[3..11]);
                CompanionCommand::WriteMemoryAuthorized {
                    address: addr(bytes),
                    data: bytes[2],
                    f0,
                }
            }
            WRITE_MEMORY_ENCRYPTED => {
                let bytes = exact(38)?;
                let mut ciphertext = [0u8; 16];
                ciphertext.copy_from_slice(&bytes[2..18]);
                CompanionCommand::WriteMemoryEncrypted {
                    address: addr(bytes),
                    ciphertext,
                    nonce: array20(&bytes[18..38]),
                }
            }
            READ_MEMORY => {
                let bytes = exact(3)?;
                CompanionCommand::ReadMemory {
                    address: addr(bytes),
                    count: bytes[2],
                }
            }
            READ_MEMORY_DIGEST => CompanionCommand::ReadMemoryDigest {
                address: addr(exact(2)?),
            },
            READ_MANUF_ID => {
                exact(0)?;
                CompanionCommand::ReadManufId
            }
            LOCK => {
                exact(0)?;
                CompanionCommand::Lock
            }
            STATUS => {
                exact(0)?;
                CompanionCommand::Status
            }
            other => return Err(malformed(format!("companion opcode {other:#04x}"))),
        };
        Ok((address, command))
    }
}

/// Send a companion command and collect its response.
///
/// Reads the status byte first; the response bytes follow only on success.
///
/// # Errors
///
/// - `Error::TransportFault` on a failed transfer
/// - `Error::Companion` when the chip reports a failure status
pub fn transmit_companion<P: Port + ?Sized>(
    port: &mut P,
    address: CompanionAddress,
    command: &CompanionCommand,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let frame = command.encode(address);
    debug!(
        address = address.get(),
        opcode = command.opcode(),
        len = frame.len(),
        "companion command"
    );
    let status = transmit(port, &frame, 1, timeout)?[0];
    if let Some(status) = CompanionStatus::from_u8(status) {
        return Err(Error::Companion(status));
    }
    let len = command.response_len();
    if len == 0 {
        return Ok(Vec::new());
    }
    let response = port.receive(len)?;
    if response.len() != len {
        return Err(PortError::Short {
            expected: len,
            actual: response.len(),
        }
        .into());
    }
    Ok(response)
}
