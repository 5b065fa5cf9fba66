#![no_main]

use libfuzzer_sys::fuzz_target;
use qnet_core::seed::parse_mnemonic;

fuzz_target!(|data: &[u8]| {
    // Arbitrary UTF-8 typed into the import field must return Ok or Err.
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(mnemonic) = parse_mnemonic(s) {
            // Anything accepted must reparse from its normalized form
            assert!(parse_mnemonic(&mnemonic.to_string()).is_ok());
        }
    }
});
