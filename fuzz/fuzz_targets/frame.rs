#![no_main]

use cmem_core::{Command, CompanionCommand};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Decoding never panics, and anything decoded survives a re-encode.
    if let Ok((address, command)) = Command::decode(data) {
        let again = Command::decode(&command.encode(address)).map(|(_, c)| c);
        assert_eq!(again.ok(), Some(command));
    }
    if let Ok((address, command)) = CompanionCommand::decode(data) {
        let again = CompanionCommand::decode(&command.encode(address)).map(|(_, c)| c);
        assert_eq!(again.ok(), Some(command));
    }
});
