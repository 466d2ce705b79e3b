//! Simulated CryptoMemory device.
//!
//! Behaves like a personalized device on the bus: it decodes every frame,
//! enforces passwords, authentication, zone policies and fuses, and runs its
//! own cryptoengine alongside the host's. Writes made in an authenticated
//! session are held until the checksum of their clear payload under the
//! session key arrives. User zone writes wrap around inside their page.

use cmem_core::command::{Command, HEADER_LEN};
use cmem_core::fuse::Fuses;
use cmem_core::registry::{DeviceAddress, DeviceType};
use cmem_core::session::{
    cryptogram_address, pac_address, seed_address, session_key_address, PasswordKind, ATR_ADDRESS,
    MAX_PASSWORD_SET,
};
use cmem_crypto::auth::{cryptograms_match, AuthExchange, CRYPTOGRAM_LEN, KEY_LEN};
use cmem_crypto::{compute_checksum, validate_checksum, CryptoEngine, SessionKey};
use cmem_platform::{Port, PortError, PortResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

const CONFIG_SIZE: usize = 0x100;
/// Unreadable configuration bytes: session keys and secret seeds.
const SECRET_REGION: core::ops::Range<usize> = 0x70..0xB0;
const PASSWORD_REGION_START: usize = 0xB0;
const ERASED: u8 = 0xFF;

/// Next value of an attempts counter after a failed attempt.
fn decrement(counter: u8) -> u8 {
    match counter {
        0xFF => 0xEE,
        0xEE => 0xCC,
        0xCC => 0x88,
        _ => 0x00,
    }
}

/// Access rules for one user zone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZonePolicy {
    /// Password set guarding the zone.
    pub password: Option<u8>,
    /// Key set that must be authenticated.
    pub key_set: Option<u8>,
    /// Require encryption in addition to authentication.
    pub encrypted: bool,
}

struct DeviceCrypto {
    key_set: u8,
    encrypted: bool,
    engine: CryptoEngine,
    session_key: SessionKey,
}

enum Staged {
    User {
        zone: usize,
        offset: usize,
        data: Vec<u8>,
    },
    Config {
        address: usize,
        data: Vec<u8>,
    },
}

impl Staged {
    fn data(&self) -> &[u8] {
        match self {
            Staged::User { data, .. } | Staged::Config { data, .. } => data,
        }
    }
}

struct Device {
    address: DeviceAddress,
    device_type: DeviceType,
    config: [u8; CONFIG_SIZE],
    zones: Vec<Vec<u8>>,
    policies: Vec<ZonePolicy>,
    fuses: Fuses,
    zone: Option<usize>,
    password: Option<(u8, PasswordKind)>,
    crypto: Option<DeviceCrypto>,
    staged: Option<Staged>,
    response: Vec<u8>,
    send_faults: VecDeque<PortError>,
    busy: bool,
    frames: usize,
}

impl Device {
    fn new(address: DeviceAddress, device_type: DeviceType) -> Self {
        let mut config = [0u8; CONFIG_SIZE];
        config[ATR_ADDRESS as usize..ATR_ADDRESS as usize + 8].copy_from_slice(&device_type.atr());
        for key_set in 0..4 {
            config[cryptogram_address(key_set) as usize] = ERASED;
        }
        for set in 0..=MAX_PASSWORD_SET {
            for kind in [PasswordKind::Write, PasswordKind::Read] {
                let at = pac_address(set, kind) as usize;
                config[at..at + 4].fill(ERASED);
            }
        }
        let at = pac_address(MAX_PASSWORD_SET, PasswordKind::Write) as usize;
        config[at + 1..at + 4].copy_from_slice(&device_type.secure_code());

        let zones = usize::from(device_type.zone_count());
        Self {
            address,
            device_type,
            config,
            zones: vec![vec![ERASED; device_type.zone_size()]; zones],
            policies: vec![ZonePolicy::default(); zones],
            fuses: Fuses::default(),
            zone: None,
            password: None,
            crypto: None,
            staged: None,
            response: Vec::new(),
            send_faults: VecDeque::new(),
            busy: false,
            frames: 0,
        }
    }

    fn config_byte(&self, address: usize) -> u8 {
        let hidden = SECRET_REGION.contains(&address)
            || (address >= PASSWORD_REGION_START && (address - PASSWORD_REGION_START) % 4 != 0);
        if hidden {
            ERASED
        } else {
            self.config[address]
        }
    }

    fn check_access(&self, zone: usize, kind: PasswordKind) -> PortResult<()> {
        let policy = self.policies[zone];
        if let Some(set) = policy.password {
            let granted = match self.password {
                Some((active, active_kind)) if active == set => {
                    kind == PasswordKind::Read || active_kind == PasswordKind::Write
                }
                _ => false,
            };
            if !granted {
                debug!(zone, ?kind, "zone access denied: password");
                return Err(PortError::Nack);
            }
        }
        if let Some(key_set) = policy.key_set {
            match &self.crypto {
                Some(crypto) if crypto.key_set == key_set && (crypto.encrypted || !policy.encrypted) => {}
                _ => {
                    debug!(zone, ?kind, "zone access denied: authentication");
                    return Err(PortError::Nack);
                }
            }
        }
        Ok(())
    }

    fn commit(&mut self, staged: Staged) {
        match staged {
            Staged::User { zone, offset, data } => {
                let page = self.device_type.page_size();
                let base = offset - offset % page;
                for (i, byte) in data.into_iter().enumerate() {
                    self.zones[zone][base + (offset % page + i) % page] = byte;
                }
            }
            Staged::Config { address, data } => {
                self.config[address..address + data.len()].copy_from_slice(&data);
            }
        }
    }

    fn store_or_stage(&mut self, operands: &[u8], mut data: Vec<u8>, staged: impl FnOnce(Vec<u8>) -> Staged) {
        match self.crypto.as_mut() {
            Some(crypto) => {
                crypto.engine.absorb_operands(operands);
                crypto.engine.open(&mut data, crypto.encrypted);
                self.staged = Some(staged(data));
            }
            None => {
                let write = staged(data);
                self.commit(write);
            }
        }
    }

    fn respond(&mut self, operands: &[u8], mut data: Vec<u8>, encrypt: bool) {
        if let Some(crypto) = self.crypto.as_mut() {
            crypto.engine.absorb_operands(operands);
            crypto.engine.seal(&mut data, encrypt && crypto.encrypted);
        }
        self.response = data;
    }

    fn handle(&mut self, frame: &[u8]) -> PortResult<()> {
        self.response.clear();
        let (address, command) = Command::decode(frame).map_err(|_| PortError::Nack)?;
        if address != self.address {
            return Err(PortError::Nack);
        }
        let operands = &frame[1..HEADER_LEN];
        debug!(address = address.get(), ?command, "device received command");

        // Staged data survives only until the next command.
        if !matches!(command, Command::SendChecksum { .. }) {
            self.staged = None;
        }

        match command {
            Command::WriteUserZone { address, data } => {
                let zone = self.zone.ok_or(PortError::Nack)?;
                self.check_access(zone, PasswordKind::Write)?;
                let offset = address as usize;
                if offset >= self.device_type.zone_size()
                    || data.len() > self.device_type.page_size()
                {
                    return Err(PortError::Nack);
                }
                self.store_or_stage(operands, data, |data| Staged::User { zone, offset, data });
            }
            Command::ReadUserZone { address, count } => {
                let zone = self.zone.ok_or(PortError::Nack)?;
                self.check_access(zone, PasswordKind::Read)?;
                let offset = address as usize;
                let end = offset + count as usize;
                if end > self.device_type.zone_size() {
                    return Err(PortError::Nack);
                }
                let data = self.zones[zone][offset..end].to_vec();
                self.respond(operands, data, true);
            }
            Command::WriteConfigZone { address, data, .. } => {
                let start = address as usize;
                if start + data.len() > CONFIG_SIZE
                    || self.fuses.first_locked(address, data.len()).is_some()
                {
                    return Err(PortError::Nack);
                }
                self.store_or_stage(operands, data, |data| Staged::Config {
                    address: start,
                    data,
                });
            }
            Command::WriteFuse { fuses } => {
                if fuses & !Fuses::MASK != 0 || !self.fuses.can_transition_to(fuses) {
                    return Err(PortError::Nack);
                }
                self.fuses = Fuses::from_bits(fuses);
            }
            Command::SendChecksum { checksum } => {
                let staged = self.staged.take();
                let expected = match self.crypto.as_ref() {
                    Some(crypto) => compute_checksum(
                        staged.as_ref().map_or(&[][..], Staged::data),
                        &crypto.session_key,
                    ),
                    None => return Err(PortError::Nack),
                };
                if !validate_checksum(&expected, &checksum) {
                    warn!(address = self.address.get(), "checksum mismatch; write discarded");
                    self.crypto = None;
                    return Err(PortError::Nack);
                }
                if let Some(staged) = staged {
                    self.commit(staged);
                }
            }
            Command::SetUserZone { zone, .. } => {
                if zone >= self.device_type.zone_count() {
                    return Err(PortError::Nack);
                }
                self.zone = Some(zone as usize);
            }
            Command::ReadConfigZone { address, count } => {
                let start = address as usize;
                let end = start + count as usize;
                if end > CONFIG_SIZE {
                    return Err(PortError::Nack);
                }
                let data = (start..end).map(|a| self.config_byte(a)).collect();
                self.respond(operands, data, false);
            }
            Command::ReadFuse => self.response = vec![self.fuses.bits()],
            Command::ReadChecksum => {
                let checksum = match self.crypto.take() {
                    Some(mut crypto) => crypto.engine.checksum(),
                    None => CryptoEngine::new().checksum(),
                };
                self.response = checksum.to_vec();
            }
            Command::VerifyCrypto {
                key_set,
                encrypt,
                random,
                challenge,
            } => self.verify_crypto(key_set, encrypt, &random, &challenge),
            Command::ResetCrypto => self.crypto = None,
            Command::VerifyPassword {
                set,
                read,
                mut password,
            } => {
                if let Some(crypto) = self.crypto.as_mut() {
                    crypto.engine.absorb_operands(operands);
                    crypto.engine.open(&mut password, crypto.encrypted);
                }
                let kind = if read {
                    PasswordKind::Read
                } else {
                    PasswordKind::Write
                };
                let at = pac_address(set, kind) as usize;
                let pac = self.config[at];
                self.password = None;
                if pac != 0 && self.config[at + 1..at + 4] == password {
                    self.config[at] = 0xFF;
                    self.password = Some((set, kind));
                } else {
                    self.config[at] = decrement(pac);
                    warn!(address = self.address.get(), set, ?kind, "wrong password");
                }
            }
            Command::ResetPassword => self.password = None,
        }
        Ok(())
    }

    fn verify_crypto(&mut self, key_set: u8, encrypt: bool, random: &[u8; 8], challenge: &[u8; 8]) {
        let record = cryptogram_address(key_set) as usize;
        let mut cryptogram = [0u8; CRYPTOGRAM_LEN];
        cryptogram.copy_from_slice(&self.config[record..record + CRYPTOGRAM_LEN]);

        let active_key_set = self.crypto.take().map(|crypto| crypto.key_set);
        if cryptogram[0] == 0 {
            return;
        }

        let key_at = if encrypt {
            session_key_address(key_set)
        } else {
            seed_address(key_set)
        } as usize;
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&self.config[key_at..key_at + KEY_LEN]);

        let exchange = AuthExchange::compute(&cryptogram, &key, random);
        let allowed = !encrypt || active_key_set == Some(key_set);
        if allowed && cryptograms_match(&exchange.challenge, challenge) {
            self.config[record..record + CRYPTOGRAM_LEN].copy_from_slice(&exchange.next_cryptogram);
            let session_key = session_key_address(key_set) as usize;
            self.config[session_key..session_key + KEY_LEN]
                .copy_from_slice(exchange.session_key.as_bytes());
            self.crypto = Some(DeviceCrypto {
                key_set,
                encrypted: encrypt,
                engine: exchange.engine,
                session_key: exchange.session_key,
            });
        } else {
            self.config[record] = decrement(cryptogram[0]);
            warn!(address = self.address.get(), key_set, encrypt, "challenge rejected");
        }
    }
}

/// Handle to a simulated CryptoMemory device.
///
/// Clones share the device, so tests keep a handle for inspection after
/// moving a port into a session.
#[derive(Clone)]
pub struct SimulatedCryptoMemory {
    device: Arc<Mutex<Device>>,
}

impl core::fmt::Debug for SimulatedCryptoMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let device = self.device();
        f.debug_struct("SimulatedCryptoMemory")
            .field("address", &device.address)
            .field("device_type", &device.device_type)
            .finish_non_exhaustive()
    }
}

impl SimulatedCryptoMemory {
    /// Fresh device: counters at 0xFF, zones erased, no fuses blown.
    ///
    /// Write password 7 holds the device type's secure code.
    pub fn new(address: DeviceAddress, device_type: DeviceType) -> Self {
        Self {
            device: Arc::new(Mutex::new(Device::new(address, device_type))),
        }
    }

    fn device(&self) -> MutexGuard<'_, Device> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set a password and reset its attempts counter.
    pub fn with_password(self, set: u8, kind: PasswordKind, password: [u8; 3]) -> Self {
        {
            let mut device = self.device();
            let at = pac_address(set, kind) as usize;
            device.config[at] = 0xFF;
            device.config[at + 1..at + 4].copy_from_slice(&password);
        }
        self
    }

    /// Set the secret seed of a key set.
    pub fn with_secret(self, key_set: u8, seed: [u8; KEY_LEN]) -> Self {
        {
            let mut device = self.device();
            let at = seed_address(key_set) as usize;
            device.config[at..at + KEY_LEN].copy_from_slice(&seed);
        }
        self
    }

    /// Set the cryptogram record of a key set, AAC included.
    pub fn with_cryptogram(self, key_set: u8, cryptogram: [u8; CRYPTOGRAM_LEN]) -> Self {
        {
            let mut device = self.device();
            let at = cryptogram_address(key_set) as usize;
            device.config[at..at + CRYPTOGRAM_LEN].copy_from_slice(&cryptogram);
        }
        self
    }

    /// Set the access rules of a user zone.
    pub fn with_zone_policy(self, zone: u8, policy: ZonePolicy) -> Self {
        if let Some(slot) = self.device().policies.get_mut(zone as usize) {
            *slot = policy;
        }
        self
    }

    /// Blow fuses.
    pub fn with_fuses(self, bits: u8) -> Self {
        self.device().fuses = Fuses::from_bits(bits);
        self
    }

    /// Bus address.
    pub fn address(&self) -> DeviceAddress {
        self.device().address
    }

    /// Committed contents of a user zone.
    pub fn user_zone(&self, zone: u8) -> Vec<u8> {
        self.device()
            .zones
            .get(zone as usize)
            .cloned()
            .unwrap_or_default()
    }

    /// Raw configuration bytes, secrets included.
    pub fn config(&self, address: u8, len: usize) -> Vec<u8> {
        let start = address as usize;
        let end = (start + len).min(CONFIG_SIZE);
        self.device().config[start..end].to_vec()
    }

    /// Current fuse state.
    pub fn fuses(&self) -> Fuses {
        self.device().fuses
    }

    /// Password attempts counter.
    pub fn pac(&self, set: u8, kind: PasswordKind) -> u8 {
        self.device().config[pac_address(set, kind) as usize]
    }

    /// Authentication attempts counter.
    pub fn aac(&self, key_set: u8) -> u8 {
        self.device().config[cryptogram_address(key_set) as usize]
    }

    /// Active key set and whether encryption is on.
    pub fn crypto_state(&self) -> Option<(u8, bool)> {
        self.device()
            .crypto
            .as_ref()
            .map(|crypto| (crypto.key_set, crypto.encrypted))
    }

    /// Password accepted by the device.
    pub fn active_password(&self) -> Option<(u8, PasswordKind)> {
        self.device().password
    }

    /// Frames received so far, rejected ones included.
    pub fn frames_received(&self) -> usize {
        self.device().frames
    }

    /// Make the next `send` fail with `error` without processing the frame.
    pub fn fail_next_send(&self, error: PortError) {
        self.device().send_faults.push_back(error);
    }

    /// Keep the device busy so `wait_ready` times out.
    pub fn set_busy(&self, busy: bool) {
        self.device().busy = busy;
    }
}

impl Port for SimulatedCryptoMemory {
    fn send(&mut self, frame: &[u8]) -> PortResult<()> {
        let mut device = self.device();
        device.frames += 1;
        if let Some(error) = device.send_faults.pop_front() {
            return Err(error);
        }
        device.handle(frame)
    }

    fn receive(&mut self, count: usize) -> PortResult<Vec<u8>> {
        let mut device = self.device();
        if device.response.len() < count {
            let actual = device.response.len();
            device.response.clear();
            return Err(PortError::Short {
                expected: count,
                actual,
            });
        }
        Ok(device.response.drain(..count).collect())
    }

    fn wait_ready(&mut self, _timeout: Duration) -> bool {
        !self.device().busy
    }
}
