//! QNet Core
//!
//! Key custody for the QNet dual-network wallet.
//!
//! # Key Derivation
//!
//! From a single BIP-39 seed:
//! - Settlement chain (ed25519, SLIP-10): m/44'/501'/{account}'/0'
//! - Native chain (secp256k1, BIP-32):    m/44'/7731'/{account}'/0/0
//!
//! # Encrypted Storage
//!
//! Private keys (and optionally the mnemonic) are encrypted at rest using
//! Argon2id + AES-256-GCM. Plaintext key material only lives in session
//! memory while the vault is unlocked.

pub mod clock;
pub mod crypto;
pub mod keys;
pub mod memory;
pub mod password;
pub mod ratelimit;
pub mod seed;
pub mod storage;
pub mod vault;

pub use clock::{Clock, SystemClock};
pub use crypto::{CryptoError, KdfParams, SealedBlob};
pub use keys::{Account, AccountKeys, KeyError, NetworkAddresses, NetworkKind};
pub use ratelimit::{LimitProfile, RateLimitAction, RateLimited, RateLimiter};
pub use seed::SeedError;
pub use storage::{FileVaultStorage, MemoryVaultStorage, StorageError, VaultStorage};
pub use vault::{SecureKeyManager, UnlockOutcome, VaultConfig, VaultError, VaultRecord};

#[cfg(any(test, feature = "test-utils"))]
pub use clock::ManualClock;
