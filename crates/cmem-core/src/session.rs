//! Security session state machine.
//!
//! Implements:
//! - Communication modes: Standard, Authenticated, Encrypted
//! - Password verification with attempt-counter lockout
//! - Mutual authentication and encryption activation
//! - Encrypted checksums completing authenticated writes
//!
//! Once a key set is active, host and device feed every data-carrying
//! exchange through identical cryptoengines. Both sides must see the same
//! transcript; any rejected checksum or failed verification drops the
//! session back to Standard.

use crate::command::{transmit, Command, HEADER_LEN};
use crate::config::SessionConfig;
use crate::fuse::Fuses;
use crate::registry::{DeviceAddress, DeviceType};
use crate::{Error, Result};
use cmem_crypto::auth::{cryptograms_match, CRYPTOGRAM_LEN, RANDOM_LEN};
use cmem_crypto::{
    compute_checksum, validate_checksum, AuthExchange, Checksum, CryptoEngine, Secret, SessionKey,
};
use cmem_platform::{Port, PortError, RandomSource};
use std::collections::HashSet;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

/// Configuration address of the answer-to-reset.
pub const ATR_ADDRESS: u8 = 0x00;
/// Configuration address of the first cryptogram record.
pub const CRYPTOGRAM_BASE: u8 = 0x50;
/// Configuration address of the first session key record.
pub const SESSION_KEY_BASE: u8 = 0x70;
/// Configuration address of the first secret seed record.
pub const SEED_BASE: u8 = 0x90;
/// Configuration address of the first password record.
pub const PASSWORD_BASE: u8 = 0xB0;

/// Highest password set index.
pub const MAX_PASSWORD_SET: u8 = 7;

/// Attempts counter value after a successful verification.
const COUNTER_FRESH: u8 = 0xFF;
/// Attempts counter value of a permanently disabled credential.
const COUNTER_EXHAUSTED: u8 = 0x00;

/// Configuration address of the attempts counter of a password.
///
/// Each set occupies 8 bytes: `[PAC_w, W0, W1, W2, PAC_r, R0, R1, R2]`.
pub fn pac_address(set: u8, kind: PasswordKind) -> u8 {
    let offset = match kind {
        PasswordKind::Write => 0,
        PasswordKind::Read => 4,
    };
    PASSWORD_BASE + 8 * (set & MAX_PASSWORD_SET) + offset
}

/// Configuration address of a key set's cryptogram record (AAC first).
pub fn cryptogram_address(key_set: u8) -> u8 {
    CRYPTOGRAM_BASE + 8 * (key_set & KeySet::MAX_INDEX)
}

/// Configuration address of a key set's session key.
pub fn session_key_address(key_set: u8) -> u8 {
    SESSION_KEY_BASE + 8 * (key_set & KeySet::MAX_INDEX)
}

/// Configuration address of a key set's secret seed.
pub fn seed_address(key_set: u8) -> u8 {
    SEED_BASE + 8 * (key_set & KeySet::MAX_INDEX)
}

/// Authentication key set.
///
/// The lower nibble selects one of the device's four key sets. Systems with
/// a companion chip carry the companion index in the upper nibble; it feeds
/// secret diversification only and never reaches the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeySet {
    index: u8,
    companion: Option<u8>,
}

impl KeySet {
    /// Highest key set index.
    pub const MAX_INDEX: u8 = 3;

    /// Key set without companion diversification.
    pub fn new(index: u8) -> Result<Self> {
        if index > Self::MAX_INDEX {
            return Err(cmem_crypto::Error::InvalidKeySet(index).into());
        }
        Ok(Self {
            index,
            companion: None,
        })
    }

    /// Key set diversified through companion `companion`.
    pub fn with_companion(index: u8, companion: u8) -> Result<Self> {
        if companion > 0x0F {
            return Err(Error::InvalidArgument(format!(
                "companion index {companion} exceeds 15"
            )));
        }
        Ok(Self {
            companion: Some(companion),
            ..Self::new(index)?
        })
    }

    /// Parse the two-nibble form. A zero upper nibble means no companion.
    pub fn from_byte(byte: u8) -> Result<Self> {
        let index = byte & 0x0F;
        match byte >> 4 {
            0 => Self::new(index),
            companion => Self::with_companion(index, companion),
        }
    }

    /// Two-nibble form.
    pub fn to_byte(self) -> u8 {
        (self.companion.unwrap_or(0) << 4) | self.index
    }

    /// Key set index.
    pub fn index(self) -> u8 {
        self.index
    }

    /// Companion index, if diversified.
    pub fn companion(self) -> Option<u8> {
        self.companion
    }
}

/// Password kind within a password set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PasswordKind {
    /// Read password.
    Read,
    /// Write password (also grants read).
    Write,
}

/// Communication security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// No key set active.
    Standard,
    /// Key set authenticated; writes need a checksum.
    Authenticated(KeySet),
    /// Authenticated with encrypted payloads.
    Encrypted(KeySet),
}

impl SecurityMode {
    /// Whether a key set is active.
    pub fn is_active(self) -> bool {
        !matches!(self, SecurityMode::Standard)
    }

    /// Active key set.
    pub fn key_set(self) -> Option<KeySet> {
        match self {
            SecurityMode::Standard => None,
            SecurityMode::Authenticated(k) | SecurityMode::Encrypted(k) => Some(k),
        }
    }
}

/// Selected user zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneSelection {
    /// Zone index.
    pub zone: u8,
    /// Anti-tearing enabled for writes.
    pub anti_tearing: bool,
}

struct CryptoSession {
    key_set: KeySet,
    encrypted: bool,
    engine: CryptoEngine,
    session_key: SessionKey,
    /// Clear payload of the write awaiting its checksum.
    last_write: Zeroizing<Vec<u8>>,
}

enum SessionState {
    Standard,
    Active(CryptoSession),
}

/// Security session with one primary device.
///
/// Owns the port and random source for that device. All operations are
/// synchronous and run to completion; none is retried.
pub struct Session<P, R> {
    address: DeviceAddress,
    device_type: DeviceType,
    port: P,
    random: R,
    config: SessionConfig,
    state: SessionState,
    active_password: Option<(u8, PasswordKind)>,
    disabled_passwords: HashSet<(u8, PasswordKind)>,
    disabled_key_sets: HashSet<u8>,
    zone: Option<ZoneSelection>,
    fuses: Option<Fuses>,
}

impl<P, R> core::fmt::Debug for Session<P, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.address)
            .field("device_type", &self.device_type)
            .field("mode", &self.mode())
            .field("zone", &self.zone)
            .finish_non_exhaustive()
    }
}

impl<P, R> Session<P, R> {
    /// Create a session in Standard mode.
    pub fn new(
        address: DeviceAddress,
        device_type: DeviceType,
        port: P,
        random: R,
        config: SessionConfig,
    ) -> Self {
        Self {
            address,
            device_type,
            port,
            random,
            config,
            state: SessionState::Standard,
            active_password: None,
            disabled_passwords: HashSet::new(),
            disabled_key_sets: HashSet::new(),
            zone: None,
            fuses: None,
        }
    }

    /// Device bus address.
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Device type.
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// Current security mode.
    pub fn mode(&self) -> SecurityMode {
        match &self.state {
            SessionState::Standard => SecurityMode::Standard,
            SessionState::Active(c) if c.encrypted => SecurityMode::Encrypted(c.key_set),
            SessionState::Active(c) => SecurityMode::Authenticated(c.key_set),
        }
    }

    /// Password accepted by the last verification.
    pub fn active_password(&self) -> Option<(u8, PasswordKind)> {
        self.active_password
    }

    /// Selected user zone.
    pub fn selected_zone(&self) -> Option<ZoneSelection> {
        self.zone
    }

    /// Last known fuse state.
    pub fn cached_fuses(&self) -> Option<Fuses> {
        self.fuses
    }

    /// Session timing.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Borrow the port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Mutably borrow the port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub(crate) fn set_cached_fuses(&mut self, fuses: Fuses) {
        self.fuses = Some(fuses);
    }

    pub(crate) fn set_zone(&mut self, zone: ZoneSelection) {
        self.zone = Some(zone);
    }

    /// Remember the payload the next checksum covers.
    pub(crate) fn record_write(&mut self, data: &[u8]) {
        if let SessionState::Active(crypto) = &mut self.state {
            crypto.last_write.zeroize();
            crypto.last_write.extend_from_slice(data);
        }
    }

    /// Drop any active key set locally.
    pub(crate) fn force_standard(&mut self) {
        if let SessionState::Active(crypto) = &self.state {
            info!(
                address = self.address.get(),
                key_set = crypto.key_set.index(),
                "session returned to standard mode"
            );
        }
        self.state = SessionState::Standard;
    }
}

impl<P: Port, R: RandomSource> Session<P, R> {
    /// Run one command through the cryptoengine and the port.
    ///
    /// In an active session the engine absorbs the operands and payload of
    /// data-carrying commands, encrypting or decrypting as the mode requires.
    /// The advanced engine is kept only if the whole exchange completes.
    pub(crate) fn exchange(&mut self, command: &Command) -> Result<Vec<u8>> {
        let header = command.header(self.address);
        let mut payload = Zeroizing::new(command.payload());

        let mut pending = match &self.state {
            SessionState::Active(crypto) if command.is_absorbed() => {
                Some((crypto.engine.clone(), crypto.encrypted))
            }
            _ => None,
        };
        if let Some((engine, encrypted)) = pending.as_mut() {
            engine.absorb_operands(&header[1..]);
            engine.seal(&mut payload[..], *encrypted && command.encrypts_payload());
        }

        let mut frame = Zeroizing::new(Vec::with_capacity(HEADER_LEN + payload.len()));
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&payload);

        debug!(
            address = self.address.get(),
            cmd = header[0],
            p1 = header[1],
            p2 = header[2],
            n = header[3],
            "device command"
        );
        let mut response = transmit(
            &mut self.port,
            &frame,
            command.response_len(),
            self.config.ready_timeout(),
        )?;

        if let Some((mut engine, encrypted)) = pending {
            engine.open(&mut response, encrypted && command.encrypts_response());
            if let SessionState::Active(crypto) = &mut self.state {
                crypto.engine = engine;
            }
        }
        Ok(response)
    }

    fn fresh_random(&mut self) -> Result<[u8; RANDOM_LEN]> {
        let mut random = [0u8; RANDOM_LEN];
        self.random.fill_bytes(&mut random)?;
        Ok(random)
    }

    fn read_cryptogram(&mut self, key_set: u8) -> Result<[u8; CRYPTOGRAM_LEN]> {
        let response = self.exchange(&Command::ReadConfigZone {
            address: cryptogram_address(key_set),
            count: CRYPTOGRAM_LEN as u8,
        })?;
        to_array(&response)
    }

    fn disable_key_set(&mut self, key_set: u8) -> Error {
        warn!(
            address = self.address.get(),
            key_set, "key set permanently disabled"
        );
        self.disabled_key_sets.insert(key_set);
        Error::KeySetPermanentlyDisabled { key_set }
    }

    /// Present a password.
    ///
    /// The password travels encrypted when encryption is active. The attempts
    /// counter is read back to decide the outcome.
    ///
    /// # Errors
    ///
    /// - `Error::PasswordNotAccepted` with the decremented counter
    /// - `Error::PasswordPermanentlyDisabled` once the counter reaches zero;
    ///   later calls for the same password fail without any transfer
    pub fn verify_password(&mut self, password: &[u8; 3], set: u8, kind: PasswordKind) -> Result<()> {
        if set > MAX_PASSWORD_SET {
            return Err(Error::InvalidArgument(format!("password set {set} exceeds 7")));
        }
        if self.disabled_passwords.contains(&(set, kind)) {
            warn!(address = self.address.get(), set, ?kind, "password disabled");
            return Err(Error::PasswordPermanentlyDisabled { set });
        }

        self.exchange(&Command::VerifyPassword {
            set,
            read: kind == PasswordKind::Read,
            password: *password,
        })?;
        // The device drops its active password once a verify arrives.
        self.active_password = None;
        let counter = self.exchange(&Command::ReadConfigZone {
            address: pac_address(set, kind),
            count: 1,
        })?[0];

        match counter {
            COUNTER_FRESH => {
                info!(address = self.address.get(), set, ?kind, "password accepted");
                self.active_password = Some((set, kind));
                Ok(())
            }
            COUNTER_EXHAUSTED => {
                warn!(address = self.address.get(), set, ?kind, "password permanently disabled");
                self.disabled_passwords.insert((set, kind));
                Err(Error::PasswordPermanentlyDisabled { set })
            }
            counter => {
                warn!(address = self.address.get(), set, ?kind, counter, "password rejected");
                Err(Error::PasswordNotAccepted { counter })
            }
        }
    }

    /// Deactivate the current password. The security mode is untouched.
    pub fn reset_password(&mut self) -> Result<()> {
        self.exchange(&Command::ResetPassword)?;
        self.active_password = None;
        Ok(())
    }

    /// Authenticate with a key set and optionally activate encryption.
    ///
    /// `random` supplies Q for the authentication step; `None` draws it from
    /// the random source. Encryption activation always uses a fresh random.
    /// Any session already active is dropped first.
    ///
    /// # Errors
    ///
    /// - `Error::AuthenticationFailed` on a cryptogram mismatch
    /// - `Error::EncryptionActivationFailed` if encryption activation mismatches
    /// - `Error::KeySetPermanentlyDisabled` once the AAC reaches zero; later
    ///   calls for the key set fail without any transfer
    ///
    /// Every failure leaves the session in Standard mode.
    pub fn verify_authentication(
        &mut self,
        key_set: KeySet,
        secret: &Secret,
        random: Option<[u8; RANDOM_LEN]>,
        activate_encryption: bool,
    ) -> Result<()> {
        let index = key_set.index();
        if self.disabled_key_sets.contains(&index) {
            warn!(address = self.address.get(), key_set = index, "key set disabled");
            return Err(Error::KeySetPermanentlyDisabled { key_set: index });
        }

        self.force_standard();
        let result = self.authenticate(key_set, secret, random, activate_encryption);
        if result.is_err() {
            self.force_standard();
        }
        result
    }

    fn authenticate(
        &mut self,
        key_set: KeySet,
        secret: &Secret,
        random: Option<[u8; RANDOM_LEN]>,
        activate_encryption: bool,
    ) -> Result<()> {
        let index = key_set.index();
        let cryptogram = self.read_cryptogram(index)?;
        if cryptogram[0] == COUNTER_EXHAUSTED {
            return Err(self.disable_key_set(index));
        }

        let seed = secret.resolve(key_set.companion());
        let random = match random {
            Some(random) => random,
            None => self.fresh_random()?,
        };
        let auth = AuthExchange::compute(&cryptogram, &seed, &random);
        let next_cryptogram = auth.next_cryptogram;

        if let Some(counter) = self.verify_crypto(key_set, false, random, auth)? {
            self.force_standard();
            if counter == COUNTER_EXHAUSTED {
                return Err(self.disable_key_set(index));
            }
            warn!(address = self.address.get(), key_set = index, counter, "authentication failed");
            return Err(Error::AuthenticationFailed { counter });
        }
        info!(address = self.address.get(), key_set = index, "authenticated");

        if !activate_encryption {
            return Ok(());
        }

        let session_key = match &self.state {
            SessionState::Active(crypto) => crypto.session_key.clone(),
            SessionState::Standard => return Err(Error::Desynchronized),
        };
        let random = self.fresh_random()?;
        let activation = AuthExchange::compute(&next_cryptogram, session_key.as_bytes(), &random);

        if let Some(counter) = self.verify_crypto(key_set, true, random, activation)? {
            self.force_standard();
            if counter == COUNTER_EXHAUSTED {
                return Err(self.disable_key_set(index));
            }
            warn!(address = self.address.get(), key_set = index, counter, "encryption activation failed");
            return Err(Error::EncryptionActivationFailed);
        }
        info!(address = self.address.get(), key_set = index, "encryption active");
        Ok(())
    }

    /// Send one verify crypto command and read the cryptogram back.
    ///
    /// Returns `None` on a match, or the device's AAC on a mismatch.
    fn verify_crypto(
        &mut self,
        key_set: KeySet,
        encrypt: bool,
        random: [u8; RANDOM_LEN],
        exchange: AuthExchange,
    ) -> Result<Option<u8>> {
        let AuthExchange {
            challenge,
            next_cryptogram,
            session_key,
            engine,
        } = exchange;

        self.exchange(&Command::VerifyCrypto {
            key_set: key_set.index(),
            encrypt,
            random,
            challenge,
        })?;
        self.state = SessionState::Active(CryptoSession {
            key_set,
            encrypted: encrypt,
            engine,
            session_key,
            last_write: Zeroizing::new(Vec::new()),
        });

        let received = self.read_cryptogram(key_set.index())?;
        if cryptograms_match(&next_cryptogram, &received) {
            Ok(None)
        } else {
            Ok(Some(received[0]))
        }
    }

    /// Deactivate the key set on the device and return to Standard.
    ///
    /// The local session is dropped even if the transfer fails.
    pub fn reset_session(&mut self) -> Result<()> {
        let result = self.exchange(&Command::ResetCrypto).map(|_| ());
        self.force_standard();
        result
    }

    /// Read the device checksum.
    ///
    /// Reading the checksum ends the session on the device, so a successful
    /// read also returns the host to Standard.
    pub fn read_checksum(&mut self) -> Result<Checksum> {
        let response = self.exchange(&Command::ReadChecksum)?;
        self.force_standard();
        to_array(&response)
    }

    /// Compare the device checksum with the host engine.
    ///
    /// Ends the session like [`Session::read_checksum`].
    pub fn check_sync(&mut self) -> Result<bool> {
        let expected = match &self.state {
            SessionState::Active(crypto) => crypto.engine.clone().checksum(),
            SessionState::Standard => CryptoEngine::new().checksum(),
        };
        let received = self.read_checksum()?;
        let in_sync = validate_checksum(&expected, &received);
        if !in_sync {
            warn!(address = self.address.get(), "cryptoengines out of sync");
        }
        Ok(in_sync)
    }

    /// Send the checksum completing a staged write.
    ///
    /// The checksum covers the clear payload of the most recent write under
    /// the session key. `explicit` replaces the computed value and is sent in
    /// any mode. Without an explicit value nothing is pending in Standard
    /// mode, so nothing is sent.
    ///
    /// # Errors
    ///
    /// - `Error::ChecksumMismatch` if the device rejects the checksum; the
    ///   write is dropped and the session returns to Standard
    /// - `Error::TransportFault` on any other transfer failure; the mode is
    ///   left unchanged
    pub fn send_checksum(&mut self, explicit: Option<Checksum>) -> Result<()> {
        let checksum = match (&self.state, explicit) {
            (_, Some(explicit)) => explicit,
            (SessionState::Active(crypto), None) => {
                compute_checksum(&crypto.last_write, &crypto.session_key)
            }
            (SessionState::Standard, None) => {
                debug!(address = self.address.get(), "no active session; checksum skipped");
                return Ok(());
            }
        };
        let command = Command::SendChecksum { checksum };

        match transmit(
            &mut self.port,
            &command.encode(self.address),
            0,
            self.config.ready_timeout(),
        ) {
            Ok(_) => {
                if let SessionState::Active(crypto) = &mut self.state {
                    crypto.last_write.zeroize();
                }
                debug!(address = self.address.get(), "checksum accepted");
                Ok(())
            }
            Err(Error::TransportFault(PortError::Nack)) => {
                warn!(address = self.address.get(), "checksum rejected; write dropped");
                self.force_standard();
                Err(Error::ChecksumMismatch)
            }
            Err(e) => Err(e),
        }
    }

    /// Read the answer-to-reset and identify the device type.
    ///
    /// # Errors
    ///
    /// `Error::UnknownDevice` if the answer-to-reset matches no known type.
    pub fn identify(&mut self) -> Result<DeviceType> {
        let response = self.exchange(&Command::ReadConfigZone {
            address: ATR_ADDRESS,
            count: 8,
        })?;
        let atr: [u8; 8] = to_array(&response)?;
        let device_type =
            DeviceType::from_atr(&atr).ok_or(Error::UnknownDevice(self.address.get()))?;
        self.device_type = device_type;
        Ok(device_type)
    }
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

/// A write awaiting its checksum.
///
/// In an authenticated session the device holds written data until the
/// matching checksum arrives. `commit` sends it. Dropping the guard
/// uncommitted resets the device session, discarding the staged data.
#[must_use = "an uncommitted write is discarded and ends the session"]
pub struct PendingWrite<'a, P: Port, R: RandomSource> {
    session: &'a mut Session<P, R>,
    committed: bool,
}

impl<'a, P: Port, R: RandomSource> PendingWrite<'a, P, R> {
    pub(crate) fn new(session: &'a mut Session<P, R>) -> Self {
        Self {
            session,
            committed: false,
        }
    }

    /// Mode the write was staged in.
    pub fn mode(&self) -> SecurityMode {
        self.session.mode()
    }

    /// Send the checksum, `explicit` overriding the computed value.
    pub fn commit(mut self, explicit: Option<Checksum>) -> Result<()> {
        self.committed = true;
        self.session.send_checksum(explicit)
    }
}

impl<P: Port, R: RandomSource> Drop for PendingWrite<'_, P, R> {
    fn drop(&mut self) {
        if self.committed || !self.session.mode().is_active() {
            return;
        }
        warn!(
            address = self.session.address().get(),
            "staged write abandoned; resetting session"
        );
        if let Err(e) = self.session.reset_session() {
            warn!(address = self.session.address().get(), error = %e, "session reset failed");
        }
    }
}
