//! Companion chip tests against a simulated chip.
//!
//! **Test Categories:**
//! 1. Start-up Challenge and Flash Check (5 tests)
//! 2. Counters (2 tests)
//! 3. Memory Access (4 tests)
//! 4. Lock (3 tests)


use cmem_core::companion::sha1;
use cmem_core::{Companion, CompanionAddress, CompanionStatus, Error, FlashCheck, SessionConfig};
use cmem_platform::mock::SequenceRandom;
use cmem_transport::SimulatedCompanion;
use test_helpers::init_tracing;

const CMC_SEED: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f0";
const SYSTEM_SEED: &str = "00112233445566778899aabbccddeeff";
const ENC_KEY: &str = "c0ffee00c0ffee00c0ffee00c0ffee00";
const F0: [u8; 8] = [0xF0; 8];

fn seed(hex_seed: &str) -> [u8; 16] {
    hex::decode(hex_seed).unwrap().try_into().unwrap()
}

fn firmware_digest() -> [u8; 20] {
    sha1(b"firmware image v1")
}

fn chip() -> SimulatedCompanion {
    init_tracing();
    SimulatedCompanion::new(CompanionAddress::new(0xC8).unwrap())
        .with_seeds(seed(CMC_SEED), seed(SYSTEM_SEED))
        .with_enc_key(seed(ENC_KEY))
        .with_flash_digest(firmware_digest())
        .with_authorization(F0)
        .with_manuf_id(*b"CMC-SIM-0000042")
}

fn companion(chip: &SimulatedCompanion) -> Companion<SimulatedCompanion, SequenceRandom> {
    Companion::new(
        chip.address(),
        chip.clone(),
        SequenceRandom::counting(0x80),
        SessionConfig::default(),
    )
}

// ================================================================================================
// CATEGORY 1: Start-up Challenge and Flash Check (5 tests)
// ================================================================================================

/// Test 1: Mutual authentication with the right seeds
#[test]
fn test_start_challenge_succeeds() {
    let chip = chip();
    let mut companion = companion(&chip);

    let first = companion
        .start_challenge(&seed(CMC_SEED), &seed(SYSTEM_SEED))
        .unwrap();
    assert!(chip.is_authenticated());

    let second = companion
        .start_challenge(&seed(CMC_SEED), &seed(SYSTEM_SEED))
        .unwrap();
    assert_ne!(first, second, "challenges are fresh");
}

/// Test 2: Wrong CMC seed rejects the chip's proof
///
/// Expected: `ChallengeFailed` and no response frame sent.
#[test]
fn test_wrong_cmc_seed() {
    let chip = chip();
    let mut companion = companion(&chip);

    let err = companion
        .start_challenge(&[0u8; 16], &seed(SYSTEM_SEED))
        .unwrap_err();
    assert!(matches!(err, Error::ChallengeFailed));
    assert_eq!(chip.frames_received(), 1);
    assert!(!chip.is_authenticated());
}

/// Test 3: Wrong system seed is rejected by the chip
#[test]
fn test_wrong_system_seed() {
    let chip = chip();
    let mut companion = companion(&chip);

    let err = companion
        .start_challenge(&seed(CMC_SEED), &[0u8; 16])
        .unwrap_err();
    assert!(matches!(err, Error::ChallengeFailed));
    assert_eq!(chip.frames_received(), 2);
    assert!(!chip.is_authenticated());
}

/// Test 4: Direct and signed flash checks
#[test]
fn test_verify_flash() {
    let chip = chip();
    let mut companion = companion(&chip);
    let digest = firmware_digest();

    companion.verify_flash(&digest, FlashCheck::Direct).unwrap();
    companion
        .verify_flash(
            &digest,
            FlashCheck::Signed {
                flash_digest: digest,
            },
        )
        .unwrap();
}

/// Test 5: Tampered firmware fails the flash check
#[test]
fn test_verify_flash_tampered() {
    let chip = chip();
    let mut companion = companion(&chip);
    let tampered = sha1(b"firmware image v1 (patched)");

    let err = companion
        .verify_flash(&tampered, FlashCheck::Direct)
        .unwrap_err();
    assert!(matches!(err, Error::Companion(CompanionStatus::AuthFail)));

    let err = companion
        .verify_flash(
            &tampered,
            FlashCheck::Signed {
                flash_digest: firmware_digest(),
            },
        )
        .unwrap_err();
    assert!(matches!(err, Error::Companion(CompanionStatus::AuthFail)));
}

// ================================================================================================
// CATEGORY 2: Counters (2 tests)
// ================================================================================================

/// Test 6: Counters are independent and monotonic
#[test]
fn test_counters() {
    let chip = chip();
    let mut companion = companion(&chip);

    for _ in 0..3 {
        companion.increment_counter(2).unwrap();
    }
    companion.increment_counter(0).unwrap();

    assert_eq!(companion.read_counter(2).unwrap(), 3);
    assert_eq!(companion.read_counter(0).unwrap(), 1);
    assert_eq!(companion.read_counter(1).unwrap(), 0);
    assert!(matches!(
        companion.increment_counter(4),
        Err(Error::InvalidArgument(_))
    ));
}

/// Test 7: Reads return the low 32 bits
#[test]
fn test_counter_low_bits() {
    let chip = chip();
    chip.set_counter(3, 0x1_FFFF_FFFF);
    let mut companion = companion(&chip);

    assert_eq!(companion.read_counter(3).unwrap(), 0xFFFF_FFFF);
    companion.increment_counter(3).unwrap();
    assert_eq!(companion.read_counter(3).unwrap(), 0);
    assert_eq!(chip.counter(3), 0x2_0000_0000);
}

// ================================================================================================
// CATEGORY 3: Memory Access (4 tests)
// ================================================================================================

/// Test 8: Clear write and read in the read/write region
#[test]
fn test_memory_write_read() {
    let chip = chip();
    let mut companion = companion(&chip);

    companion.write_memory(0x1F0, b"0123456789abcdef").unwrap();
    assert_eq!(
        companion.read_memory(0x1F8, 8).unwrap(),
        b"89abcdef".to_vec()
    );
    // Upper address bits are ignored.
    assert_eq!(companion.read_memory(0xFFF0, 2).unwrap(), b"01".to_vec());
}

/// Test 9: Encrypted page write lands as clear text
#[test]
fn test_encrypted_page_write() {
    let chip = chip();
    let mut companion = companion(&chip);
    let page = *b"secret page 0x40";

    companion
        .write_memory_encrypted(0x04B, &page, None, &seed(ENC_KEY))
        .unwrap();
    assert_eq!(chip.memory(0x040, 16), page.to_vec());
}

/// Test 10: Encrypted write under the wrong key stores garbage
#[test]
fn test_encrypted_page_wrong_key() {
    let chip = chip();
    let mut companion = companion(&chip);
    let page = [0x11; 16];

    companion
        .write_memory_encrypted(0x180, &page, Some([0x22; 20]), &[0x33; 16])
        .unwrap();
    assert_ne!(chip.memory(0x180, 16), page.to_vec());
}

/// Test 11: Block digests match the written data
#[test]
fn test_memory_digest() {
    let chip = chip();
    let mut companion = companion(&chip);
    let block: [u8; 32] = core::array::from_fn(|i| i as u8);

    companion.write_memory(0x1A0, &block[..16]).unwrap();
    companion.write_memory(0x1B0, &block[16..]).unwrap();

    assert!(companion.verify_memory_digest(0x1A7, &block).unwrap());
    assert!(!companion.verify_memory_digest(0x1A7, &[0u8; 32]).unwrap());
}

// ================================================================================================
// CATEGORY 4: Lock (3 tests)
// ================================================================================================

/// Test 12: Lock is reported by the manufacturing id
#[test]
fn test_lock_reported() {
    let chip = chip();
    let mut companion = companion(&chip);

    let id = companion.read_manuf_id().unwrap();
    assert_eq!(&id.as_bytes()[..15], b"CMC-SIM-0000042");
    assert!(!id.is_locked());

    companion.lock().unwrap();
    assert!(chip.is_locked());

    let mut fresh = self::companion(&chip);
    assert!(!fresh.is_locked());
    assert!(fresh.read_manuf_id().unwrap().is_locked());
    assert!(fresh.is_locked());
}

/// Test 13: Locked chip refuses secret access without a transfer
#[test]
fn test_locked_refusals_without_io() {
    let chip = chip();
    let mut companion = companion(&chip);
    companion.lock().unwrap();
    let frames = chip.frames_received();

    assert!(matches!(
        companion.write_memory(0x0F8, &[0x00; 16]),
        Err(Error::ZoneLocked { address: 0x0F8 })
    ));
    assert!(matches!(
        companion.read_memory(0x0F0, 4),
        Err(Error::ZoneLocked { address: 0x0F0 })
    ));
    assert!(matches!(
        companion.read_memory_digest(0x180),
        Err(Error::CompanionLocked)
    ));
    assert!(matches!(
        companion.write_memory_encrypted(0x180, &[0; 16], None, &seed(ENC_KEY)),
        Err(Error::CompanionLocked)
    ));
    assert_eq!(chip.frames_received(), frames);

    companion.write_memory(0x180, &[0x5A; 4]).unwrap();
    assert_eq!(companion.read_memory(0x180, 4).unwrap(), vec![0x5A; 4]);
}

/// Test 14: Authorized writes still work after lock
#[test]
fn test_authorized_write_after_lock() {
    let chip = chip();
    let mut companion = companion(&chip);
    companion.lock().unwrap();

    companion.write_memory_authorized(0x105, 0x77, &F0).unwrap();
    assert_eq!(chip.memory(0x105, 1), vec![0x77]);

    let err = companion
        .write_memory_authorized(0x106, 0x77, &[0x00; 8])
        .unwrap_err();
    assert!(matches!(err, Error::Companion(CompanionStatus::AuthFail)));
    assert!(matches!(
        companion.write_memory_authorized(0x110, 0x77, &F0),
        Err(Error::InvalidArgument(_))
    ));
}
