#![no_main]

use libfuzzer_sys::fuzz_target;
use qnet_core::keys::{decode_bundle, encode_bundle};

fuzz_target!(|data: &[u8]| {
    // Decrypted key bundles of any shape must return Ok or Err.
    if let Ok(keys) = decode_bundle(data) {
        assert_eq!(encode_bundle(&keys).as_slice(), data);
        for k in &keys {
            let _ = k.account();
        }
    }
});
