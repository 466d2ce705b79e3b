//! Challenge-response authentication.
//!
//! Implements the host side of the mutual authentication exchanges:
//! - Primary device: cryptogram, challenge and session key derivation on the
//!   cryptoengine. The same derivation activates encryption, with the
//!   session key taking the place of the secret seed.
//! - Companion chip: SHA-1 based start-challenge proofs over the 16-byte
//!   CMC and system seeds.
//!
//! The derivation is symmetric: the device runs the identical computation,
//! so a matching cryptogram read back from the device proves both sides
//! hold the same secret.

use crate::{digest, CryptoEngine, Error, Result};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of a cryptogram record (AAC byte followed by 7 cryptogram bytes).
pub const CRYPTOGRAM_LEN: usize = 8;
/// Length of a secret seed or session key.
pub const KEY_LEN: usize = 8;
/// Length of the host random value Q.
pub const RANDOM_LEN: usize = 8;

/// AAC value of a key set that has never failed.
pub const AAC_UNUSED: u8 = 0xFF;

/// Clocks before each challenge byte.
const CLOCKS_CHALLENGE: usize = 6;
/// Clocks before each new cryptogram byte.
const CLOCKS_CRYPTOGRAM: usize = 7;
/// Clocks before each session key byte.
const CLOCKS_SESSION_KEY: usize = 2;

/// Domain separator for the companion chip proof.
const COMPANION_PROOF_TAG: &[u8] = b"CMC";
/// Domain separator for the system response.
const SYSTEM_RESPONSE_TAG: &[u8] = b"SYS";

/// Session key derived after a successful authentication.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// Wrap raw session key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Borrow the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl TryFrom<&[u8]> for SessionKey {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| Error::InvalidLength {
            expected: KEY_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(key))
    }
}

impl core::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// Secret material for a key set.
///
/// Stand-alone devices use the 8-byte secret seed G directly. Systems with a
/// companion chip diversify G per device from a 16-byte secret key
/// identifier and the device's serial number.
pub enum Secret {
    /// Secret seed G.
    Seed(Zeroizing<[u8; KEY_LEN]>),
    /// Diversified seed: G = SHA-1(kid || companion index || device id)[..8].
    Diversified {
        /// Secret key identifier.
        kid: Zeroizing<[u8; 16]>,
        /// Serial or identification number of the device.
        device_id: [u8; 8],
    },
}

impl Secret {
    /// Secret seed G.
    pub fn seed(seed: [u8; KEY_LEN]) -> Self {
        Self::Seed(Zeroizing::new(seed))
    }

    /// Diversified secret from a key identifier and device id.
    pub fn diversified(kid: [u8; 16], device_id: [u8; 8]) -> Self {
        Self::Diversified {
            kid: Zeroizing::new(kid),
            device_id,
        }
    }

    /// Resolve the 8-byte seed used by the cryptoengine.
    pub fn resolve(&self, companion_index: Option<u8>) -> Zeroizing<[u8; KEY_LEN]> {
        match self {
            Secret::Seed(seed) => Zeroizing::new(**seed),
            Secret::Diversified { kid, device_id } => {
                let mut input = Zeroizing::new(Vec::with_capacity(16 + 1 + 8));
                input.extend_from_slice(&kid[..]);
                input.push(companion_index.unwrap_or(0));
                input.extend_from_slice(device_id);
                let full = Zeroizing::new(digest::sha1(&input));
                let mut seed = Zeroizing::new([0u8; KEY_LEN]);
                seed.copy_from_slice(&full[..KEY_LEN]);
                seed
            }
        }
    }
}

impl core::fmt::Debug for Secret {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Secret::Seed(_) => f.write_str("Secret::Seed(<redacted>)"),
            Secret::Diversified { device_id, .. } => f
                .debug_struct("Secret::Diversified")
                .field("device_id", device_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Result of one challenge-response derivation.
#[derive(Debug)]
pub struct AuthExchange {
    /// Challenge Ch sent to the device together with Q.
    pub challenge: [u8; 8],
    /// Cryptogram the device must hold after accepting the challenge.
    pub next_cryptogram: [u8; CRYPTOGRAM_LEN],
    /// Session key derived from the exchange.
    pub session_key: SessionKey,
    /// Cryptoengine state both sides continue the session with.
    pub engine: CryptoEngine,
}

impl AuthExchange {
    /// Derive challenge, next cryptogram and session key.
    ///
    /// `key` is the secret seed G for authentication or the current session
    /// key when activating encryption. `cryptogram` is the full 8-byte record
    /// read from the device, AAC byte included.
    pub fn compute(
        cryptogram: &[u8; CRYPTOGRAM_LEN],
        key: &[u8; KEY_LEN],
        random: &[u8; RANDOM_LEN],
    ) -> Self {
        let mut engine = CryptoEngine::new();
        for pair in 0..4 {
            let range = 2 * pair..2 * pair + 2;
            engine.absorb(&cryptogram[range.clone()]);
            engine.absorb(&random[range.clone()]);
            engine.absorb(&key[range]);
        }

        let mut challenge = [0u8; 8];
        for byte in challenge.iter_mut() {
            engine.idle(CLOCKS_CHALLENGE);
            *byte = engine.output();
        }

        let mut next_cryptogram = [0u8; CRYPTOGRAM_LEN];
        next_cryptogram[0] = AAC_UNUSED;
        for byte in next_cryptogram[1..].iter_mut() {
            engine.idle(CLOCKS_CRYPTOGRAM);
            *byte = engine.output();
        }

        let mut session_key = [0u8; KEY_LEN];
        for byte in session_key.iter_mut() {
            engine.idle(CLOCKS_SESSION_KEY);
            *byte = engine.output();
        }

        let exchange = Self {
            challenge,
            next_cryptogram,
            session_key: SessionKey(session_key),
            engine,
        };
        session_key.zeroize();
        exchange
    }
}

/// Compare two cryptograms in constant time.
pub fn cryptograms_match(expected: &[u8; CRYPTOGRAM_LEN], received: &[u8; CRYPTOGRAM_LEN]) -> bool {
    expected[..].ct_eq(&received[..]).into()
}

/// Proof the companion chip returns with its start challenge.
pub fn companion_proof(challenge: &[u8; 20], cmc_seed: &[u8; 16]) -> [u8; 20] {
    digest::sha1_parts(&[COMPANION_PROOF_TAG, challenge, cmc_seed])
}

/// Response proving the host holds the system seed.
pub fn system_response(proof: &[u8; 20], system_seed: &[u8; 16]) -> [u8; 20] {
    digest::sha1_parts(&[SYSTEM_RESPONSE_TAG, proof, system_seed])
}

/// Check a companion proof in constant time.
pub fn verify_companion_proof(challenge: &[u8; 20], cmc_seed: &[u8; 16], proof: &[u8; 20]) -> bool {
    let expected = companion_proof(challenge, cmc_seed);
    expected[..].ct_eq(&proof[..]).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CRYPTOGRAM: [u8; 8] = [0xFF, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77];
    const SEED: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF];
    const RANDOM: [u8; 8] = [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7];

    #[test]
    fn test_host_and_device_derive_identical_values() {
        let host = AuthExchange::compute(&CRYPTOGRAM, &SEED, &RANDOM);
        let device = AuthExchange::compute(&CRYPTOGRAM, &SEED, &RANDOM);
        assert_eq!(host.challenge, device.challenge);
        assert_eq!(host.next_cryptogram, device.next_cryptogram);
        assert_eq!(host.session_key, device.session_key);
        assert_eq!(host.engine, device.engine);
    }

    #[test]
    fn test_next_cryptogram_resets_aac() {
        let exchange = AuthExchange::compute(&[0x88, 1, 2, 3, 4, 5, 6, 7], &SEED, &RANDOM);
        assert_eq!(exchange.next_cryptogram[0], AAC_UNUSED);
    }

    #[test]
    fn test_wrong_seed_changes_challenge_and_cryptogram() {
        let good = AuthExchange::compute(&CRYPTOGRAM, &SEED, &RANDOM);
        let mut wrong_seed = SEED;
        wrong_seed[7] ^= 0x01;
        let bad = AuthExchange::compute(&CRYPTOGRAM, &wrong_seed, &RANDOM);
        assert_ne!(good.challenge, bad.challenge);
        assert!(!cryptograms_match(&good.next_cryptogram, &bad.next_cryptogram));
    }

    #[test]
    fn test_fresh_random_changes_session_key() {
        let a = AuthExchange::compute(&CRYPTOGRAM, &SEED, &RANDOM);
        let b = AuthExchange::compute(&CRYPTOGRAM, &SEED, &[0u8; 8]);
        assert_ne!(a.session_key, b.session_key);
    }

    #[test]
    fn test_encryption_derivation_chains_from_session_key() {
        let auth = AuthExchange::compute(&CRYPTOGRAM, &SEED, &RANDOM);
        let enc = AuthExchange::compute(
            &auth.next_cryptogram,
            auth.session_key.as_bytes(),
            &[0x5A; 8],
        );
        assert_ne!(enc.session_key, auth.session_key);
        assert_eq!(enc.next_cryptogram[0], AAC_UNUSED);
    }

    #[test]
    fn test_session_key_try_from_rejects_wrong_length() {
        let err = SessionKey::try_from(&[0u8; 7][..]).unwrap_err();
        assert_eq!(
            err,
            Error::InvalidLength {
                expected: 8,
                actual: 7
            }
        );
        assert!(SessionKey::try_from(&[0u8; 8][..]).is_ok());
    }

    #[test]
    fn test_diversified_secret_depends_on_companion_index() {
        let secret = Secret::diversified([0x42; 16], [1, 2, 3, 4, 5, 6, 7, 8]);
        let g0 = secret.resolve(Some(0));
        let g1 = secret.resolve(Some(1));
        assert_ne!(*g0, *g1);
        assert_eq!(*g0, *secret.resolve(None));
    }

    #[test]
    fn test_seed_secret_resolves_verbatim() {
        let secret = Secret::seed(SEED);
        assert_eq!(*secret.resolve(Some(3)), SEED);
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let rendered = format!("{:?}", Secret::seed(SEED));
        assert!(!rendered.contains("01"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn test_companion_proof_roundtrip() {
        let challenge = [0x33; 20];
        let cmc_seed = [0x44; 16];
        let proof = companion_proof(&challenge, &cmc_seed);
        assert!(verify_companion_proof(&challenge, &cmc_seed, &proof));
        assert!(!verify_companion_proof(&challenge, &[0x45; 16], &proof));

        let response = system_response(&proof, &[0x55; 16]);
        assert_ne!(response, system_response(&proof, &[0x56; 16]));
    }
}
