//! SHA-1 digests used by the companion chip protocol.
//!
//! The companion chip authenticates, signs and encrypts with SHA-1 only:
//! - Flash signature: SHA-1(digest || flash digest)
//! - Page keystream: SHA-1(address || EncKey || nonce), first 16 bytes
//! - Block digest: SHA-1 over a 32-byte memory block

use crate::{Error, Result};
use sha1::{Digest, Sha1};
use zeroize::Zeroizing;

/// SHA-1 output length in bytes.
pub const DIGEST_LEN: usize = 20;
/// Companion chip page size for encrypted writes.
pub const PAGE_LEN: usize = 16;
/// Companion chip block size for digest reads.
pub const BLOCK_LEN: usize = 32;

/// SHA-1 of `data`.
pub fn sha1(data: &[u8]) -> [u8; DIGEST_LEN] {
    Sha1::digest(data).into()
}

/// SHA-1 over the concatenation of `parts`.
pub fn sha1_parts(parts: &[&[u8]]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Signature expected by a signed flash check.
pub fn flash_signature(digest: &[u8; DIGEST_LEN], flash_digest: &[u8; DIGEST_LEN]) -> [u8; DIGEST_LEN] {
    sha1_parts(&[digest, flash_digest])
}

/// Keystream for an encrypted page write.
///
/// The address is hashed big-endian, as sent on the wire.
pub fn page_keystream(
    address: u16,
    enc_key: &[u8; 16],
    nonce: &[u8; DIGEST_LEN],
) -> Zeroizing<[u8; PAGE_LEN]> {
    let full = Zeroizing::new(sha1_parts(&[&address.to_be_bytes(), enc_key, nonce]));
    let mut stream = Zeroizing::new([0u8; PAGE_LEN]);
    stream.copy_from_slice(&full[..PAGE_LEN]);
    stream
}

/// XOR `data` with a keystream of at most one digest.
pub fn apply_keystream(data: &mut [u8], keystream: &[u8]) -> Result<()> {
    if data.len() > DIGEST_LEN {
        return Err(Error::KeystreamTooLong(data.len()));
    }
    if keystream.len() < data.len() {
        return Err(Error::InvalidLength {
            expected: data.len(),
            actual: keystream.len(),
        });
    }
    for (byte, key) in data.iter_mut().zip(keystream) {
        *byte ^= key;
    }
    Ok(())
}

/// Digest of a 32-byte memory block, as returned by a digest read.
pub fn block_digest(block: &[u8; BLOCK_LEN]) -> [u8; DIGEST_LEN] {
    sha1(block)
}
