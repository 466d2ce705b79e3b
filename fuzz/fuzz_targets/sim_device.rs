#![no_main]

use cmem_core::{CompanionAddress, DeviceAddress, DeviceType};
use cmem_platform::Port;
use cmem_transport::{SimulatedCompanion, SimulatedCryptoMemory};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary frames are refused or answered, never a panic.
    let mut device = SimulatedCryptoMemory::new(DeviceAddress::DEFAULT, DeviceType::At88sc0104c);
    let mut chip = SimulatedCompanion::new(CompanionAddress::new(0xFE).unwrap());
    for frame in data.split(|b| *b == 0x7E) {
        if device.send(frame).is_ok() {
            let _ = device.receive(frame.get(3).copied().unwrap_or(0) as usize);
        }
        if chip.send(frame).is_ok() {
            let _ = chip.receive(1);
        }
    }
});
