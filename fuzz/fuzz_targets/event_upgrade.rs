#![no_main]

use libfuzzer_sys::fuzz_target;

use fabula_core::EventVersion;
use fabula_wire::{parse_versioned, upgrade_to_current};

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    let Ok(event) = parse_versioned(&value) else {
        return;
    };
    if let Ok(upgraded) = upgrade_to_current(event) {
        // An upgraded event is always current and always identified.
        assert_eq!(upgraded.version, EventVersion::CURRENT);
        assert!(upgraded.command.is_some());
    }
});
