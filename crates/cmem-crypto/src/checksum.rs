//! Encrypted checksums.
//!
//! After a write in authenticated or encrypted mode the device refuses to
//! commit the data until the host sends [`compute_checksum`] of the clear
//! payload under the current session key. A fresh engine keyed with the
//! session key absorbs the payload and yields the same 2-byte extraction as
//! [`CryptoEngine::checksum`].

use crate::{CryptoEngine, SessionKey};
use subtle::ConstantTimeEq;

/// Length of a checksum in bytes.
pub const CHECKSUM_LEN: usize = 2;

/// Two-byte encrypted checksum.
pub type Checksum = [u8; CHECKSUM_LEN];

/// Compute the checksum of `payload` under `key`.
///
/// Deterministic: identical payload and key always give the same value.
pub fn compute_checksum(payload: &[u8], key: &SessionKey) -> Checksum {
    let mut engine = CryptoEngine::new();
    engine.absorb(key.as_bytes());
    engine.absorb_operands(payload);
    engine.checksum()
}

/// Compare an expected and a received checksum in constant time.
pub fn validate_checksum(expected: &Checksum, received: &Checksum) -> bool {
    expected[..].ct_eq(&received[..]).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::from_bytes([0x3C, 0x1F, 0x77, 0x02, 0xE4, 0x90, 0x5B, 0xA8])
    }

    #[test]
    fn test_checksum_is_deterministic() {
        let payload = [0xDE, 0xAD, 0xBE, 0xEF];
        assert_eq!(compute_checksum(&payload, &key()), compute_checksum(&payload, &key()));
    }

    #[test]
    fn test_checksum_validates_against_itself() {
        let payload = b"zone 3 page 0";
        let checksum = compute_checksum(payload, &key());
        assert!(validate_checksum(&checksum, &checksum));
    }

    #[test]
    fn test_checksum_depends_on_key() {
        let payload = [0x55; 16];
        let other = SessionKey::from_bytes([0u8; 8]);
        let a = compute_checksum(&payload, &key());
        let b = compute_checksum(&payload, &other);
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_checksum_is_rejected() {
        let checksum = compute_checksum(&[1, 2, 3], &key());
        for bit in 0..16 {
            let mut tampered = checksum;
            tampered[bit / 8] ^= 1 << (bit % 8);
            assert!(!validate_checksum(&checksum, &tampered));
        }
    }

    #[test]
    fn test_engine_checksum_matches_one_shot_form() {
        let payload = [0x10, 0x20, 0x30];
        let mut engine = CryptoEngine::new();
        engine.absorb(key().as_bytes());
        engine.absorb_operands(&payload);
        assert_eq!(engine.checksum(), compute_checksum(&payload, &key()));
    }
}
