//! Zone access and fuse tests against a simulated device.
//!
//! **Test Categories:**
//! 1. Zone Policies (3 tests)
//! 2. Fuses (3 tests)
//! 3. Identification and Limits (3 tests)


use cmem_core::{DeviceType, Error, Fuses, KeySet, PasswordKind, SecurityMode};
use cmem_crypto::Secret;
use cmem_platform::PortError;
use cmem_transport::{SimulatedCryptoMemory, ZonePolicy};
use test_helpers::{init_tracing, personalized_device, session, session_for, SEED_1};

const READ_2: [u8; 3] = [0x52, 0x45, 0x44];
const WRITE_2: [u8; 3] = [0x57, 0x52, 0x54];

fn guarded_device(policy: ZonePolicy) -> SimulatedCryptoMemory {
    init_tracing();
    personalized_device(DeviceType::At88sc0104c)
        .with_password(2, PasswordKind::Read, READ_2)
        .with_password(2, PasswordKind::Write, WRITE_2)
        .with_zone_policy(0, policy)
}

fn refused<T>(result: cmem_core::Result<T>) -> bool {
    matches!(result, Err(Error::TransportFault(PortError::Nack)))
}

// ================================================================================================
// CATEGORY 1: Zone Policies (3 tests)
// ================================================================================================

/// Test 1: Read password grants reads, write password grants writes
#[test]
fn test_password_guarded_zone() {
    let device = guarded_device(ZonePolicy {
        password: Some(2),
        ..ZonePolicy::default()
    });
    let mut session = session_for(&device, device.clone());
    session.select_user_zone(0, false).unwrap();

    assert!(refused(session.read_user_zone(0x00, 4)));

    session.verify_password(&READ_2, 2, PasswordKind::Read).unwrap();
    assert_eq!(session.read_user_zone(0x00, 4).unwrap(), vec![0xFF; 4]);
    assert!(refused(session.write_user_zone(0x00, &[0x01])));

    session.verify_password(&WRITE_2, 2, PasswordKind::Write).unwrap();
    session.write_user_zone(0x00, &[0x01, 0x02]).unwrap();
    assert_eq!(&device.user_zone(0)[..2], &[0x01, 0x02]);

    session.reset_password().unwrap();
    assert_eq!(session.active_password(), None);
    assert!(refused(session.read_user_zone(0x00, 2)));
}

/// Test 2: Zone requiring encryption under key set 1
///
/// Expected: refused when only authenticated, readable once encrypted; the
/// refusal does not desynchronize the engines.
#[test]
fn test_key_set_guarded_zone() {
    let device = guarded_device(ZonePolicy {
        key_set: Some(1),
        encrypted: true,
        ..ZonePolicy::default()
    });
    let mut session = session_for(&device, device.clone());
    let key_set = KeySet::new(1).unwrap();
    let secret = Secret::seed(SEED_1);
    session.select_user_zone(0, false).unwrap();

    assert!(refused(session.read_user_zone(0x00, 4)));

    session
        .verify_authentication(key_set, &secret, None, false)
        .unwrap();
    assert!(refused(session.read_user_zone(0x00, 4)));
    assert_eq!(session.mode(), SecurityMode::Authenticated(key_set));

    session
        .verify_authentication(key_set, &secret, None, true)
        .unwrap();
    session.write_user_zone(0x08, &[0xC0, 0xDE]).unwrap();
    assert_eq!(session.read_user_zone(0x08, 2).unwrap(), vec![0xC0, 0xDE]);
    assert!(session.check_sync().unwrap());
}

/// Test 3: Other zones stay open
#[test]
fn test_unguarded_zone_open() {
    let device = guarded_device(ZonePolicy {
        password: Some(2),
        ..ZonePolicy::default()
    });
    let mut session = session_for(&device, device.clone());
    session.select_user_zone(1, false).unwrap();
    session.write_user_zone(0x1C, &[0x0F; 4]).unwrap();
    assert_eq!(&device.user_zone(1)[0x1C..], &[0x0F; 4]);
}

// ================================================================================================
// CATEGORY 2: Fuses (3 tests)
// ================================================================================================

/// Test 4: Fuses only ever get blown
///
/// Expected: FAB is blown, clearing it is refused without a transfer, and
/// the FAB region is then refused locally.
#[test]
fn test_fuse_monotonicity() {
    let (mut session, device) = session();

    session.write_fuse(Fuses::FAB).unwrap();
    assert_eq!(device.fuses().bits(), Fuses::FAB);

    let frames = device.frames_received();
    let err = session.write_fuse(0x00).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidFuseTransition {
            current: 0x04,
            requested: 0x00
        }
    ));
    let err = session
        .write_config_zone(0x02, &[0x00; 4], false)
        .unwrap_err();
    assert!(matches!(err, Error::ZoneLocked { address: 0x02 }));
    assert_eq!(device.frames_received(), frames);

    session
        .write_fuse(Fuses::FAB | Fuses::CMA | Fuses::SEC)
        .unwrap();
    assert_eq!(device.fuses().bits(), 0x0E);
    assert_eq!(session.read_fuse().unwrap().bits(), 0x0E);
}

/// Test 5: Device refuses fused writes even without cached fuses
#[test]
fn test_device_enforces_fuses() {
    init_tracing();
    let device = personalized_device(DeviceType::At88sc0104c).with_fuses(Fuses::CMA);
    let mut session = session_for(&device, device.clone());

    assert!(refused(session.write_config_zone(0x0C, &[0x99], false)));
    assert_eq!(device.config(0x0C, 1), vec![0x00]);

    session.write_config_zone(0x18, &[0x99], false).unwrap();
    assert_eq!(device.config(0x18, 1), vec![0x99]);
}

/// Test 6: Personalization fuse locks the rest of configuration memory
#[test]
fn test_per_fuse_locks_configuration() {
    let (mut session, device) = session();
    session.write_fuse(Fuses::MASK).unwrap();

    let err = session
        .write_config_zone(0x20, &[0x01], false)
        .unwrap_err();
    assert!(matches!(err, Error::ZoneLocked { address: 0x20 }));
    assert_eq!(device.config(0x20, 1), vec![0x00]);
}

// ================================================================================================
// CATEGORY 3: Identification and Limits (3 tests)
// ================================================================================================

/// Test 7: Identify reads the answer-to-reset
#[test]
fn test_identify_device_type() {
    init_tracing();
    let device = personalized_device(DeviceType::At88sc0808c);
    let mut session = session_for(&device, device.clone());

    assert!(matches!(
        session.select_user_zone(7, false),
        Err(Error::InvalidUserZone(7))
    ));
    assert_eq!(session.identify().unwrap(), DeviceType::At88sc0808c);
    session.select_user_zone(7, false).unwrap();
    session.write_user_zone(0x70, &[0x07; 16]).unwrap();
    assert_eq!(&device.user_zone(7)[0x70..0x80], &[0x07; 16]);
}

/// Test 8: Anti-tearing caps writes at 8 bytes
#[test]
fn test_anti_tearing_limit() {
    let (mut session, device) = session();
    session.select_user_zone(0, true).unwrap();

    assert!(matches!(
        session.write_user_zone(0x00, &[0x01; 9]),
        Err(Error::InvalidWriteLength(9))
    ));
    session.write_user_zone(0x00, &[0x01; 8]).unwrap();
    assert_eq!(&device.user_zone(0)[..8], &[0x01; 8]);
}

/// Test 9: Secrets read back erased
#[test]
fn test_secrets_not_readable() {
    let (mut session, _device) = session();
    assert_eq!(session.read_config_zone(0x90, 8).unwrap(), vec![0xFF; 8]);
    assert_eq!(session.read_config_zone(0xE9, 3).unwrap(), vec![0xFF; 3]);
}
