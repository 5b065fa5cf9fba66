//! Security-specific tests for the key vault and its inputs.
//!
//! These tests verify:
//! 1. Sealed blobs reject wrong keys and tampering
//! 2. A tampered vault record never unlocks
//! 3. Secrets are wiped after use
//! 4. Malformed inputs don't panic
//! 5. Brute-force attempts are throttled

use std::sync::Arc;

use qnet_core::crypto::{derive_key, generate_salt, open, seal, KdfParams};
use qnet_core::keys::{decode_bundle, eon_address, validate_address, validate_eon_address};
use qnet_core::memory::SecretBuffer;
use qnet_core::seed::parse_mnemonic;
use qnet_core::{
    FileVaultStorage, ManualClock, NetworkKind, RateLimitAction, RateLimiter, SecureKeyManager,
    VaultConfig, VaultError, VaultRecord, VaultStorage,
};
use zeroize::Zeroize;

const PASSWORD: &str = "correct horse battery staple";
const MNEMONIC: &str = "leader monkey parrot ring guide accident before fence cannon height naive bean";

fn fast_kdf() -> KdfParams {
    KdfParams::insecure_fast()
}

fn vault_at(path: &std::path::Path) -> SecureKeyManager {
    SecureKeyManager::new(
        Box::new(FileVaultStorage::new(path)),
        Arc::new(ManualClock::default()),
        VaultConfig {
            kdf: fast_kdf(),
            ..VaultConfig::default()
        },
    )
}

// ============================================================================
// 1. Sealed blob tests
// ============================================================================

#[test]
fn test_wrong_password_fails_decryption() {
    let salt = generate_salt().unwrap();
    let right = derive_key(PASSWORD, &salt, &fast_kdf()).unwrap();
    let wrong = derive_key("wrong horse battery staple", &salt, &fast_kdf()).unwrap();

    let blob = seal(&right, b"secret keys", 0).unwrap();
    assert!(open(&wrong, &blob).is_err());
    assert_eq!(open(&right, &blob).unwrap().as_slice(), b"secret keys");
}

#[test]
fn test_tampered_ciphertext_fails_decryption() {
    let salt = generate_salt().unwrap();
    let key = derive_key(PASSWORD, &salt, &fast_kdf()).unwrap();
    let mut blob = seal(&key, b"secret keys", 0).unwrap();

    // Swap the first base64 character for a different one
    let first = if blob.data.starts_with('A') { "B" } else { "A" };
    blob.data.replace_range(0..1, first);
    assert!(open(&key, &blob).is_err());
}

#[test]
fn test_tampered_nonce_fails_decryption() {
    let salt = generate_salt().unwrap();
    let key = derive_key(PASSWORD, &salt, &fast_kdf()).unwrap();
    let original = seal(&key, b"secret keys", 0).unwrap();

    let other = seal(&key, b"other", 0).unwrap();
    let mut blob = original.clone();
    blob.iv = other.iv;
    assert!(open(&key, &blob).is_err());

    let mut truncated = original;
    truncated.iv.truncate(4);
    assert!(open(&key, &truncated).is_err());
}

#[test]
fn test_same_plaintext_seals_differently() {
    let salt = generate_salt().unwrap();
    let key = derive_key(PASSWORD, &salt, &fast_kdf()).unwrap();
    let a = seal(&key, b"secret keys", 0).unwrap();
    let b = seal(&key, b"secret keys", 0).unwrap();
    assert_ne!(a.iv, b.iv);
    assert_ne!(a.data, b.data);
}

// ============================================================================
// 2. Vault record tampering
// ============================================================================

fn tamper(path: &std::path::Path, edit: impl FnOnce(&mut VaultRecord)) {
    let storage = FileVaultStorage::new(path);
    let mut record = storage.load().unwrap().unwrap();
    edit(&mut record);
    storage.store(&record).unwrap();
}

#[test]
fn test_tampered_vault_records_never_unlock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.json");
    let mut vault = vault_at(&path);
    vault.initialize(PASSWORD, MNEMONIC, true).unwrap();
    vault.lock();
    let pristine = FileVaultStorage::new(&path).load().unwrap().unwrap();

    type Edit = Box<dyn Fn(&mut VaultRecord)>;
    let edits: Vec<(&str, Edit)> = vec![
        ("salt", Box::new(|r| r.salt = "AAAAAAAAAAAAAAAAAAAAAA==".into())),
        ("kdf", Box::new(|r| r.kdf.iterations += 1)),
        ("algorithm", Box::new(|r| r.algorithm = "aes-128-cbc".into())),
        (
            "accounts",
            Box::new(|r| r.accounts[0].addresses.native = eon_address(b"attacker")),
        ),
        (
            "seed",
            Box::new(|r| {
                let iv = r.encrypted_keys.iv.clone();
                if let Some(seed) = r.encrypted_seed.as_mut() {
                    seed.iv = iv;
                }
            }),
        ),
    ];

    for (name, edit) in edits {
        let storage = FileVaultStorage::new(&path);
        storage.store(&pristine).unwrap();
        tamper(&path, |r| edit(r));

        let mut vault = vault_at(&path);
        let err = vault.unlock(PASSWORD, false).unwrap_err();
        assert!(
            matches!(err, VaultError::InvalidCredentials),
            "tampered {} gave {:?}",
            name,
            err
        );
        assert!(!vault.is_unlocked());
    }
}

#[test]
fn test_vault_file_holds_no_plaintext_secrets() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.json");
    let mut vault = vault_at(&path);
    vault.initialize(PASSWORD, MNEMONIC, true).unwrap();
    let key = vault
        .reveal_private_key(PASSWORD, NetworkKind::Native, 0)
        .unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(!raw.contains(MNEMONIC));
    assert!(!raw.contains("monkey parrot"));
    assert!(!raw.contains(key.as_str()));
    assert!(!raw.contains(PASSWORD));
}

// ============================================================================
// 3. Wiping
// ============================================================================

#[test]
fn test_secret_buffer_wipe_zeroes_in_place() {
    let mut buf = SecretBuffer::from_slice(&[0x42u8; 32]);
    buf.wipe();
    assert_eq!(buf.len(), 32);
    assert!(buf.as_slice().iter().all(|&b| b == 0));
}

#[test]
fn test_zeroize_works_on_vec() {
    let mut secret = vec![0xABu8; 64];
    secret.zeroize();
    assert!(secret.is_empty() || secret.iter().all(|&b| b == 0));
}

#[test]
fn test_lock_drops_signing_ability() {
    let dir = tempfile::tempdir().unwrap();
    let mut vault = vault_at(&dir.path().join("vault.json"));
    vault.initialize(PASSWORD, MNEMONIC, false).unwrap();
    assert!(vault.sign(b"payload", NetworkKind::Native, 0).is_ok());

    vault.lock();
    assert!(matches!(
        vault.sign(b"payload", NetworkKind::Native, 0),
        Err(VaultError::Locked)
    ));
    assert!(matches!(
        vault.public_key(NetworkKind::Settlement, 0),
        Err(VaultError::Locked)
    ));
}

// ============================================================================
// 4. Malformed inputs
// ============================================================================

#[test]
fn test_malformed_mnemonics_rejected() {
    let inputs = [
        "",
        "   ",
        "leader monkey parrot",
        "leader monkey parrot ring guide accident before fence cannon height naive",
        "notaword notaword notaword notaword notaword notaword notaword notaword notaword notaword notaword notaword",
        "\u{0}\u{1}\u{2}",
    ];
    for input in inputs {
        assert!(parse_mnemonic(input).is_err(), "accepted {:?}", input);
    }
}

#[test]
fn test_malformed_key_bundles_rejected() {
    assert!(decode_bundle(&[]).is_err());
    assert!(decode_bundle(&[0u8; 67]).is_err());
    assert!(decode_bundle(&[0u8; 69]).is_err());
}

#[test]
fn test_malformed_addresses_rejected() {
    let valid = eon_address(b"some public key");
    assert!(validate_eon_address(&valid));

    let mut bad_checksum = valid.clone();
    let last = if bad_checksum.ends_with('0') { "1" } else { "0" };
    bad_checksum.replace_range(bad_checksum.len() - 1.., last);

    let inputs = [
        String::new(),
        "eon".to_string(),
        valid.to_uppercase(),
        bad_checksum,
        format!("{}0", valid),
        valid.replace("eon", "xyz"),
        "é".repeat(41),
    ];
    for input in &inputs {
        assert!(!validate_eon_address(input), "accepted {:?}", input);
    }

    assert!(!validate_address(NetworkKind::Settlement, "0OIl"));
    assert!(!validate_address(NetworkKind::Settlement, &valid));
}

#[test]
fn test_garbage_vault_json_does_not_panic() {
    let inputs = [
        "",
        "{}",
        "null",
        "[]",
        r#"{"version":1}"#,
        r#"{"version":1,"salt":"","kdf":{},"algorithm":"","encryptedKeys":{},"accounts":[]}"#,
    ];
    for input in inputs {
        assert!(serde_json::from_str::<VaultRecord>(input).is_err());
    }
}

// ============================================================================
// 5. Throttling
// ============================================================================

#[test]
fn test_unlock_guessing_is_throttled() {
    let clock = Arc::new(ManualClock::default());
    let limiter = RateLimiter::new(clock.clone());

    for _ in 0..5 {
        assert!(limiter.check(RateLimitAction::Unlock, "vault").is_ok());
    }
    let limited = limiter.check(RateLimitAction::Unlock, "vault").unwrap_err();
    assert_eq!(limited.retry_after_ms, 15 * 60 * 1000);

    // Other identifiers are unaffected
    assert!(limiter.check(RateLimitAction::Unlock, "other").is_ok());

    clock.advance(std::time::Duration::from_secs(15 * 60));
    assert!(limiter.check(RateLimitAction::Unlock, "vault").is_ok());
}

#[test]
fn test_reveal_is_stricter_than_unlock() {
    let limiter = RateLimiter::new(Arc::new(ManualClock::default()));
    for _ in 0..3 {
        assert!(limiter.check(RateLimitAction::Reveal, "vault").is_ok());
    }
    let limited = limiter.check(RateLimitAction::Reveal, "vault").unwrap_err();
    assert_eq!(limited.retry_after_ms, 30 * 60 * 1000);
}
