#![no_main]

use libfuzzer_sys::fuzz_target;

use fabula_core::{AuthorityUri, ChronicleUri};

fuzz_target!(|data: &str| {
    let _ = AuthorityUri::parse(data);
    if let Ok(uri) = ChronicleUri::parse(data) {
        // Anything accepted must reparse from its canonical rendering.
        let reparsed = ChronicleUri::parse(&uri.to_string()).expect("canonical form reparses");
        assert_eq!(uri, reparsed);
    }
});
