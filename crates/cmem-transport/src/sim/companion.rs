//! Simulated CryptoCompanion chip.
//!
//! Secrets live in the secret region so they can be personalized with
//! ordinary memory writes before the chip is locked:
//!
//! ```text
//! 0x000..0x010  CMC seed
//! 0x010..0x020  system seed
//! 0x020..0x030  encryption key
//! 0x030..0x044  flash digest
//! 0x044..0x04C  authorization value F0
//! ```

use cmem_core::command::CompanionCommand;
use cmem_core::companion::{CompanionStatus, MemoryRegion, ADDRESS_MASK, COUNTER_COUNT, MAX_TRANSFER};
use cmem_core::registry::CompanionAddress;
use cmem_crypto::auth::{companion_proof, system_response};
use cmem_crypto::digest::{
    apply_keystream, block_digest, flash_signature, page_keystream, sha1_parts, BLOCK_LEN,
    DIGEST_LEN, PAGE_LEN,
};
use cmem_platform::{Port, PortError, PortResult};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

const MEMORY_SIZE: usize = ADDRESS_MASK as usize + 1;
const CMC_SEED_AT: usize = 0x000;
const SYSTEM_SEED_AT: usize = 0x010;
const ENC_KEY_AT: usize = 0x020;
const FLASH_DIGEST_AT: usize = 0x030;
const AUTHORIZATION_AT: usize = 0x044;
const SEED_LEN: usize = 16;
const AUTHORIZED: core::ops::RangeInclusive<usize> = 0x100..=0x10F;
const PAGE_MASK: usize = 0x1F0;
const BLOCK_MASK: usize = 0x1E0;
const LOCKED: u8 = 0xFF;

struct Chip {
    address: CompanionAddress,
    memory: [u8; MEMORY_SIZE],
    counters: [u64; COUNTER_COUNT as usize],
    manuf_id: [u8; 15],
    locked: bool,
    expected_response: Option<[u8; DIGEST_LEN]>,
    authenticated: bool,
    nonce: u64,
    response: Vec<u8>,
    busy: bool,
    frames: usize,
}

type Outcome = core::result::Result<Vec<u8>, CompanionStatus>;

impl Chip {
    fn read<const N: usize>(&self, at: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.memory[at..at + N]);
        out
    }

    fn next_digest(&mut self, label: &[u8]) -> [u8; DIGEST_LEN] {
        self.nonce += 1;
        sha1_parts(&[label, &self.address.get().to_be_bytes(), &self.nonce.to_be_bytes()])
    }

    fn handle(&mut self, command: CompanionCommand) -> Outcome {
        match command {
            CompanionCommand::StartChallenge => {
                let challenge = self.next_digest(b"challenge");
                let proof = companion_proof(&challenge, &self.read::<SEED_LEN>(CMC_SEED_AT));
                self.expected_response =
                    Some(system_response(&proof, &self.read::<SEED_LEN>(SYSTEM_SEED_AT)));
                self.authenticated = false;
                Ok([challenge, proof].concat())
            }
            CompanionCommand::ChallengeResponse { response } => {
                let expected = self
                    .expected_response
                    .take()
                    .ok_or(CompanionStatus::StartupNotDone)?;
                if expected != response {
                    warn!(address = self.address.get(), "system response rejected");
                    return Err(CompanionStatus::ResponseFailed);
                }
                self.authenticated = true;
                Ok(Vec::new())
            }
            CompanionCommand::VerifyFlash {
                digest, signature, ..
            } => {
                let flash_digest = self.read::<DIGEST_LEN>(FLASH_DIGEST_AT);
                let valid = match signature {
                    None => digest == flash_digest,
                    Some(signature) => signature == flash_signature(&digest, &flash_digest),
                };
                if valid {
                    Ok(Vec::new())
                } else {
                    Err(CompanionStatus::AuthFail)
                }
            }
            CompanionCommand::GetRandom => Ok(self.next_digest(b"random").to_vec()),
            CompanionCommand::IncrementCounter { selector } => {
                let counter = self
                    .counters
                    .get_mut(selector as usize)
                    .ok_or(CompanionStatus::BadCommand)?;
                *counter += 1;
                Ok(Vec::new())
            }
            CompanionCommand::ReadCounter { selector } => {
                let counter = self
                    .counters
                    .get(selector as usize)
                    .ok_or(CompanionStatus::BadCommand)?;
                Ok((*counter as u32).to_le_bytes().to_vec())
            }
            CompanionCommand::WriteMemory { address, data } => {
                let start = self.span(address, data.len())?;
                if self.locked
                    && (start..start + data.len())
                        .any(|a| MemoryRegion::of(a as u16) != MemoryRegion::ReadWrite)
                {
                    return Err(CompanionStatus::PermLocked);
                }
                self.memory[start..start + data.len()].copy_from_slice(&data);
                Ok(Vec::new())
            }
            CompanionCommand::WriteMemoryAuthorized { address, data, f0 } => {
                let target = (address & ADDRESS_MASK) as usize;
                if !AUTHORIZED.contains(&target) || f0 != self.read::<8>(AUTHORIZATION_AT) {
                    return Err(CompanionStatus::AuthFail);
                }
                self.memory[target] = data;
                Ok(Vec::new())
            }
            CompanionCommand::WriteMemoryEncrypted {
                address,
                mut ciphertext,
                nonce,
            } => {
                if self.locked {
                    return Err(CompanionStatus::PermLocked);
                }
                let page = address as usize & PAGE_MASK;
                let enc_key = self.read::<SEED_LEN>(ENC_KEY_AT);
                let keystream = page_keystream(page as u16, &enc_key, &nonce);
                apply_keystream(&mut ciphertext, &keystream[..])
                    .map_err(|_| CompanionStatus::BadCommand)?;
                self.memory[page..page + PAGE_LEN].copy_from_slice(&ciphertext);
                Ok(Vec::new())
            }
            CompanionCommand::ReadMemory { address, count } => {
                let start = self.span(address, count as usize)?;
                let end = start + count as usize;
                if self.locked && (start..end).any(|a| MemoryRegion::of(a as u16) == MemoryRegion::Secret) {
                    return Err(CompanionStatus::PermLocked);
                }
                Ok(self.memory[start..end].to_vec())
            }
            CompanionCommand::ReadMemoryDigest { address } => {
                if self.locked {
                    return Err(CompanionStatus::PermLocked);
                }
                let block = address as usize & BLOCK_MASK;
                Ok(block_digest(&self.read::<BLOCK_LEN>(block)).to_vec())
            }
            CompanionCommand::ReadManufId => {
                let mut id = self.manuf_id.to_vec();
                id.push(if self.locked { LOCKED } else { 0 });
                Ok(id)
            }
            CompanionCommand::Lock => {
                self.locked = true;
                Ok(Vec::new())
            }
            CompanionCommand::Status => Ok(Vec::new()),
        }
    }

    fn span(&self, address: u16, len: usize) -> core::result::Result<usize, CompanionStatus> {
        let start = (address & ADDRESS_MASK) as usize;
        if len == 0 || len > MAX_TRANSFER || start + len > MEMORY_SIZE {
            return Err(CompanionStatus::BadCommand);
        }
        Ok(start)
    }
}

/// Handle to a simulated companion chip. Clones share the chip.
#[derive(Clone)]
pub struct SimulatedCompanion {
    chip: Arc<Mutex<Chip>>,
}

impl core::fmt::Debug for SimulatedCompanion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let chip = self.chip();
        f.debug_struct("SimulatedCompanion")
            .field("address", &chip.address)
            .field("locked", &chip.locked)
            .finish_non_exhaustive()
    }
}

impl SimulatedCompanion {
    /// Unlocked chip with zeroed memory and counters.
    pub fn new(address: CompanionAddress) -> Self {
        Self {
            chip: Arc::new(Mutex::new(Chip {
                address,
                memory: [0u8; MEMORY_SIZE],
                counters: [0; COUNTER_COUNT as usize],
                manuf_id: [0u8; 15],
                locked: false,
                expected_response: None,
                authenticated: false,
                nonce: 0,
                response: Vec::new(),
                busy: false,
                frames: 0,
            })),
        }
    }

    fn chip(&self) -> MutexGuard<'_, Chip> {
        self.chip.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(self, at: usize, bytes: &[u8]) -> Self {
        self.chip().memory[at..at + bytes.len()].copy_from_slice(bytes);
        self
    }

    /// Personalize the start-up seeds.
    pub fn with_seeds(self, cmc_seed: [u8; SEED_LEN], system_seed: [u8; SEED_LEN]) -> Self {
        self.store(CMC_SEED_AT, &cmc_seed)
            .store(SYSTEM_SEED_AT, &system_seed)
    }

    /// Personalize the encrypted write key.
    pub fn with_enc_key(self, enc_key: [u8; SEED_LEN]) -> Self {
        self.store(ENC_KEY_AT, &enc_key)
    }

    /// Personalize the flash digest.
    pub fn with_flash_digest(self, digest: [u8; DIGEST_LEN]) -> Self {
        self.store(FLASH_DIGEST_AT, &digest)
    }

    /// Personalize the authorization value for authorized writes.
    pub fn with_authorization(self, f0: [u8; 8]) -> Self {
        self.store(AUTHORIZATION_AT, &f0)
    }

    /// Set the manufacturing id.
    pub fn with_manuf_id(self, id: [u8; 15]) -> Self {
        self.chip().manuf_id = id;
        self
    }

    /// Bus address.
    pub fn address(&self) -> CompanionAddress {
        self.chip().address
    }

    /// Raw memory, secrets included.
    pub fn memory(&self, address: u16, len: usize) -> Vec<u8> {
        let start = (address & ADDRESS_MASK) as usize;
        let end = (start + len).min(MEMORY_SIZE);
        self.chip().memory[start..end].to_vec()
    }

    /// Full counter value.
    pub fn counter(&self, selector: u8) -> u64 {
        self.chip()
            .counters
            .get(selector as usize)
            .copied()
            .unwrap_or_default()
    }

    /// Set a counter, e.g. near the 32-bit boundary.
    pub fn set_counter(&self, selector: u8, value: u64) {
        if let Some(counter) = self.chip().counters.get_mut(selector as usize) {
            *counter = value;
        }
    }

    /// Whether the chip is locked.
    pub fn is_locked(&self) -> bool {
        self.chip().locked
    }

    /// Whether the last start-up exchange succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.chip().authenticated
    }

    /// Frames received so far.
    pub fn frames_received(&self) -> usize {
        self.chip().frames
    }

    /// Report Busy to every command.
    pub fn set_busy(&self, busy: bool) {
        self.chip().busy = busy;
    }
}

impl Port for SimulatedCompanion {
    fn send(&mut self, frame: &[u8]) -> PortResult<()> {
        let mut chip = self.chip();
        chip.frames += 1;
        chip.response.clear();
        let (address, command) = CompanionCommand::decode(frame).map_err(|_| PortError::Nack)?;
        if address != chip.address {
            return Err(PortError::Nack);
        }
        debug!(address = address.get(), ?command, "companion received command");

        let outcome = if chip.busy {
            Err(CompanionStatus::Busy)
        } else {
            chip.handle(command)
        };
        chip.response = match outcome {
            Ok(data) => [vec![0x00], data].concat(),
            Err(status) => vec![status.to_u8()],
        };
        Ok(())
    }

    fn receive(&mut self, count: usize) -> PortResult<Vec<u8>> {
        let mut chip = self.chip();
        if chip.response.len() < count {
            let actual = chip.response.len();
            chip.response.clear();
            return Err(PortError::Short {
                expected: count,
                actual,
            });
        }
        Ok(chip.response.drain(..count).collect())
    }

    fn wait_ready(&mut self, _timeout: Duration) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> CompanionAddress {
        CompanionAddress::new(0xC8).unwrap()
    }

    fn exchange(chip: &mut SimulatedCompanion, command: CompanionCommand) -> Vec<u8> {
        chip.send(&command.encode(address())).unwrap();
        let status = chip.receive(1).unwrap();
        let len = if status[0] == 0 { command.response_len() } else { 0 };
        [status, chip.receive(len).unwrap()].concat()
    }

    #[test]
    fn test_response_without_challenge() {
        let mut chip = SimulatedCompanion::new(address());
        let reply = exchange(
            &mut chip,
            CompanionCommand::ChallengeResponse {
                response: [0; 20],
            },
        );
        assert_eq!(reply, vec![CompanionStatus::StartupNotDone.to_u8()]);
    }

    #[test]
    fn test_counter_selector_out_of_range() {
        let mut chip = SimulatedCompanion::new(address());
        let reply = exchange(&mut chip, CompanionCommand::IncrementCounter { selector: 4 });
        assert_eq!(reply, vec![CompanionStatus::BadCommand.to_u8()]);
    }

    #[test]
    fn test_locked_chip_hides_secret_region() {
        let mut chip = SimulatedCompanion::new(address()).with_seeds([1; 16], [2; 16]);
        exchange(&mut chip, CompanionCommand::Lock);
        let reply = exchange(
            &mut chip,
            CompanionCommand::ReadMemory {
                address: 0x000,
                count: 4,
            },
        );
        assert_eq!(reply, vec![CompanionStatus::PermLocked.to_u8()]);
        assert_eq!(chip.memory(0x000, 2), vec![1, 1]);
    }

    #[test]
    fn test_busy_status() {
        let mut chip = SimulatedCompanion::new(address());
        chip.set_busy(true);
        assert_eq!(
            exchange(&mut chip, CompanionCommand::Status),
            vec![CompanionStatus::Busy.to_u8()]
        );
    }
}
