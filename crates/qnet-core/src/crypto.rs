//! Cryptographic utilities
//!
//! Password-based encryption for vault storage using Argon2id + AES-256-GCM.
//!
//! # Security Notes
//!
//! - Argon2id is memory-hard (resistant to GPU/ASIC attacks)
//! - AES-256-GCM provides authenticated encryption
//! - Every `seal` call draws a fresh random nonce; salts are fresh per
//!   password generation
//! - An all-zero salt or nonce means the RNG is broken and is never used
//! - Password is never stored

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

/// Argon2id defaults (OWASP recommendation): 64 MiB, 3 passes, 4 lanes.
const ARGON2_M_COST: u32 = 65536;
const ARGON2_T_COST: u32 = 3;
const ARGON2_P_COST: u32 = 4;

/// Weakest Argon2id cost a vault may be sealed with (OWASP floor).
pub const MIN_KDF_MEMORY_KIB: u32 = 19456;
pub const MIN_KDF_ITERATIONS: u32 = 2;

/// 256 bits for AES-256
pub const KEY_LEN: usize = 32;

/// Salt length for Argon2
pub const SALT_LEN: usize = 16;

/// Nonce length for AES-256-GCM
pub const NONCE_LEN: usize = 12;

/// Degenerate draws tolerated before giving up with `WeakEntropy`.
const MAX_ENTROPY_RETRIES: usize = 3;

pub const CIPHER_ALGORITHM: &str = "aes-256-gcm";

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,
    /// Wrong password, tampered ciphertext and malformed blobs all map here.
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),
    #[error("Random number generator produced degenerate output")]
    WeakEntropy,
    #[error("KDF parameters below the minimum: {0}")]
    WeakParameters(String),
}

/// Argon2id cost parameters, stored next to the salt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    pub algorithm: KdfAlgorithm,
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfAlgorithm {
    Argon2id,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            memory_kib: ARGON2_M_COST,
            iterations: ARGON2_T_COST,
            parallelism: ARGON2_P_COST,
        }
    }
}

impl KdfParams {
    /// Refuse parameters cheaper than [`MIN_KDF_MEMORY_KIB`] and
    /// [`MIN_KDF_ITERATIONS`]. Test builds also accept [`insecure_fast`].
    ///
    /// [`insecure_fast`]: Self::insecure_fast
    pub fn check_strength(&self) -> Result<(), CryptoError> {
        #[cfg(any(test, feature = "test-utils"))]
        if *self == Self::insecure_fast() {
            return Ok(());
        }
        if self.memory_kib < MIN_KDF_MEMORY_KIB {
            return Err(CryptoError::WeakParameters(format!(
                "memory {} KiB < {} KiB",
                self.memory_kib, MIN_KDF_MEMORY_KIB
            )));
        }
        if self.iterations < MIN_KDF_ITERATIONS {
            return Err(CryptoError::WeakParameters(format!(
                "{} pass(es) < {}",
                self.iterations, MIN_KDF_ITERATIONS
            )));
        }
        Ok(())
    }

    /// Minimal parameters so test suites can run thousands of derivations.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn insecure_fast() -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// One AEAD output as stored in the vault record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBlob {
    /// Base64 ciphertext + tag
    pub data: String,
    /// Base64 12-byte nonce
    pub iv: String,
    /// Unix seconds at encryption time
    pub timestamp: u64,
}

/// Fill `buf` from the OS RNG, rejecting all-zero output.
fn fill_nonzero(buf: &mut [u8]) -> Result<(), CryptoError> {
    for _ in 0..MAX_ENTROPY_RETRIES {
        OsRng.fill_bytes(buf);
        if buf.iter().any(|&b| b != 0) {
            return Ok(());
        }
        log::warn!("RNG returned an all-zero {} byte block, retrying", buf.len());
    }
    Err(CryptoError::WeakEntropy)
}

/// Generate a random salt.
pub fn generate_salt() -> Result<[u8; SALT_LEN], CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    fill_nonzero(&mut salt)?;
    Ok(salt)
}

/// Generate a random AES-GCM nonce.
pub fn generate_nonce() -> Result<[u8; NONCE_LEN], CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    fill_nonzero(&mut nonce)?;
    Ok(nonce)
}

/// Derive an encryption key from a password using Argon2id
pub fn derive_key(
    password: &str,
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password.as_bytes(), salt, key.as_mut_slice())
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

    Ok(key)
}

/// Encrypt `plaintext` under an already-derived key with a fresh nonce.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8], now_secs: u64) -> Result<SealedBlob, CryptoError> {
    let nonce = generate_nonce()?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(SealedBlob {
        data: BASE64.encode(ciphertext),
        iv: BASE64.encode(nonce),
        timestamp: now_secs,
    })
}

/// Decrypt a blob. Every failure is reported as `DecryptionFailed`.
pub fn open(key: &[u8; KEY_LEN], blob: &SealedBlob) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let nonce = BASE64
        .decode(&blob.iv)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::DecryptionFailed);
    }
    let ciphertext = BASE64
        .decode(&blob.data)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::DecryptionFailed)
}

pub fn encode_salt(salt: &[u8]) -> String {
    BASE64.encode(salt)
}

pub fn decode_salt(encoded: &str) -> Result<Vec<u8>, CryptoError> {
    let salt = BASE64
        .decode(encoded)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    if salt.len() != SALT_LEN {
        return Err(CryptoError::DecryptionFailed);
    }
    Ok(salt)
}
