#![no_main]

use libfuzzer_sys::fuzz_target;
use qnet_core::crypto::{decode_salt, open};
use qnet_core::VaultRecord;

fuzz_target!(|data: &[u8]| {
    // A corrupted vault.json must never panic the loader.
    let Ok(record) = serde_json::from_slice::<VaultRecord>(data) else {
        return;
    };
    let _ = record.primary();
    let _ = decode_salt(&record.salt);

    // Opening under a fixed key exercises nonce and base64 handling
    let key = [7u8; 32];
    let _ = open(&key, &record.encrypted_keys);
    if let Some(seed) = &record.encrypted_seed {
        let _ = open(&key, seed);
    }
});
