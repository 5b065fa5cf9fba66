//! Encrypted key vault with session management
//!
//! [`SecureKeyManager`] owns the persisted [`VaultRecord`] and the in-memory
//! session keys. The record holds only public account data, the salt, KDF
//! parameters and AEAD blobs; plaintext keys exist only between unlock and
//! lock.
//!
//! # Session lifecycle
//!
//! ```text
//! initialize / unlock ──► unlocked (deadline = now + auto_lock)
//!        ▲                    │  sign / public_key / reveal: deadline reset
//!        │                    ▼
//!        └──────────── lock / deadline passed / drop
//! ```
//!
//! The deadline is checked lazily at the start of every operation and
//! proactively by [`SecureKeyManager::tick`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::clock::Clock;
use crate::crypto::{self, CryptoError, KdfParams, SealedBlob, CIPHER_ALGORITHM};
use crate::keys::{decode_bundle, encode_bundle, Account, AccountKeys, KeyError, NetworkKind};
use crate::password::PasswordPolicy;
use crate::seed::{derive_seed, parse_mnemonic, SeedError};
use crate::storage::{StorageError, VaultStorage};

/// Current on-disk record version.
pub const VAULT_VERSION: u32 = 1;

/// Default inactivity period before the session is wiped.
pub const DEFAULT_AUTO_LOCK: Duration = Duration::from_secs(15 * 60);

/// Fresh salts drawn before giving up on producing one that differs from
/// the previous record's.
const MAX_SALT_ATTEMPTS: usize = 3;

#[derive(Error, Debug)]
pub enum VaultError {
    /// Wrong password or a record that cannot be decrypted. The cause is
    /// deliberately not reported.
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Vault is locked")]
    Locked,
    #[error("Random number generator produced degenerate output")]
    WeakEntropy,
    #[error("A vault already exists")]
    AlreadyExists,
    #[error("Not found: {0}")]
    NotFound(&'static str),
    #[error("Password must be at least {min_length} characters")]
    WeakPassword { min_length: usize },
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(#[from] SeedError),
    #[error("Unknown account index {0}")]
    UnknownAccount(u32),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Encryption error: {0}")]
    Crypto(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<CryptoError> for VaultError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::WeakEntropy => VaultError::WeakEntropy,
            CryptoError::DecryptionFailed => VaultError::InvalidCredentials,
            other => VaultError::Crypto(other.to_string()),
        }
    }
}

/// The persisted vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultRecord {
    pub version: u32,
    /// Base64, 16 bytes
    pub salt: String,
    pub kdf: KdfParams,
    pub algorithm: String,
    pub encrypted_keys: SealedBlob,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_seed: Option<SealedBlob>,
    pub accounts: Vec<Account>,
}

impl VaultRecord {
    pub fn has_seed(&self) -> bool {
        self.encrypted_seed.is_some()
    }

    /// Account 0, used for node operations.
    pub fn primary(&self) -> Option<&Account> {
        self.accounts.iter().find(|a| a.index == 0)
    }
}

/// Vault tuning.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub kdf: KdfParams,
    pub auto_lock: Duration,
    pub password_policy: PasswordPolicy,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            auto_lock: DEFAULT_AUTO_LOCK,
            password_policy: PasswordPolicy::default(),
        }
    }
}

/// Result of a successful unlock.
pub struct UnlockOutcome {
    pub accounts: Vec<Account>,
    /// Only present when requested and the seed was persisted.
    pub mnemonic: Option<Zeroizing<String>>,
}

impl fmt::Debug for UnlockOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnlockOutcome")
            .field("accounts", &self.accounts)
            .field("mnemonic", &self.mnemonic.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

struct Session {
    keys: Vec<AccountKeys>,
    accounts: Vec<Account>,
    deadline_ms: u64,
}

impl Session {
    fn keys(&self, index: u32) -> Result<&AccountKeys, VaultError> {
        self.keys
            .iter()
            .find(|k| k.index == index)
            .ok_or(VaultError::UnknownAccount(index))
    }

    fn wipe(&mut self) {
        for keys in self.keys.iter_mut() {
            keys.wipe();
        }
        self.keys.clear();
        self.accounts.clear();
    }
}

/// Decrypted contents of a record.
struct Opened {
    keys: Vec<AccountKeys>,
    mnemonic: Option<Zeroizing<String>>,
}

impl Opened {
    fn wipe(&mut self) {
        for keys in self.keys.iter_mut() {
            keys.wipe();
        }
    }
}

/// Custodian of the encrypted vault and the unlocked session.
pub struct SecureKeyManager {
    storage: Box<dyn VaultStorage>,
    clock: Arc<dyn Clock>,
    config: VaultConfig,
    session: Option<Session>,
}

impl SecureKeyManager {
    pub fn new(storage: Box<dyn VaultStorage>, clock: Arc<dyn Clock>, config: VaultConfig) -> Self {
        Self {
            storage,
            clock,
            config,
            session: None,
        }
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Whether a vault record is persisted.
    pub fn exists(&self) -> Result<bool, VaultError> {
        Ok(self.storage.exists()?)
    }

    /// Create a new vault from a mnemonic and leave it unlocked.
    pub fn initialize(
        &mut self,
        password: &str,
        mnemonic: &str,
        persist_seed: bool,
    ) -> Result<Vec<Account>, VaultError> {
        if self.storage.exists()? {
            return Err(VaultError::AlreadyExists);
        }
        self.check_password(password)?;
        self.config.kdf.check_strength()?;

        let parsed = parse_mnemonic(mnemonic)?;
        let seed = derive_seed(&parsed, "");
        let keys = vec![AccountKeys::derive(&seed, 0)?];
        let accounts = keys
            .iter()
            .map(AccountKeys::account)
            .collect::<Result<Vec<_>, _>>()?;

        let phrase = persist_seed.then(|| Zeroizing::new(parsed.to_string()));
        let record = self.seal_record(
            password,
            &keys,
            phrase.as_ref().map(|p| p.as_str()),
            accounts.clone(),
            None,
        )?;
        self.storage.store(&record)?;

        log::info!(
            "vault initialized ({} account(s), seed persisted: {})",
            accounts.len(),
            persist_seed
        );
        self.start_session(keys, accounts.clone());
        Ok(accounts)
    }

    /// Decrypt the vault into session memory.
    pub fn unlock(&mut self, password: &str, reveal_seed: bool) -> Result<UnlockOutcome, VaultError> {
        let record = self.load_record()?;
        let opened = match self.open_record(&record, password) {
            Ok(opened) => opened,
            Err(e) => {
                log::warn!("vault unlock failed");
                return Err(e);
            }
        };

        self.lock();
        let Opened { keys, mnemonic } = opened;
        self.start_session(keys, record.accounts.clone());
        log::info!("vault unlocked");

        Ok(UnlockOutcome {
            accounts: record.accounts,
            mnemonic: if reveal_seed { mnemonic } else { None },
        })
    }

    /// Wipe and drop the session keys. Safe to call when already locked.
    pub fn lock(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.wipe();
            log::info!("vault locked");
        }
    }

    pub fn is_unlocked(&mut self) -> bool {
        self.enforce_deadline();
        self.session.is_some()
    }

    /// Apply the auto-lock deadline. Returns `true` if this call locked the vault.
    pub fn tick(&mut self) -> bool {
        let was_unlocked = self.session.is_some();
        self.enforce_deadline();
        was_unlocked && self.session.is_none()
    }

    /// Milliseconds until auto-lock, if unlocked.
    pub fn time_until_lock_ms(&self) -> Option<u64> {
        let now = self.clock.now_ms();
        self.session
            .as_ref()
            .map(|s| s.deadline_ms.saturating_sub(now))
    }

    /// Sign `payload` with the key of `account` on `network`.
    pub fn sign(
        &mut self,
        payload: &[u8],
        network: NetworkKind,
        account: u32,
    ) -> Result<Vec<u8>, VaultError> {
        let deadline = self.next_deadline();
        let session = self.active_session()?;
        let signature = session.keys(account)?.sign(network, payload)?;
        session.deadline_ms = deadline;
        Ok(signature)
    }

    pub fn public_key(&mut self, network: NetworkKind, account: u32) -> Result<Vec<u8>, VaultError> {
        let deadline = self.next_deadline();
        let session = self.active_session()?;
        let public_key = session.keys(account)?.public_key(network)?;
        session.deadline_ms = deadline;
        Ok(public_key)
    }

    /// Accounts of the unlocked session.
    pub fn session_accounts(&mut self) -> Result<Vec<Account>, VaultError> {
        Ok(self.active_session()?.accounts.clone())
    }

    /// Accounts from the persisted record. Available while locked.
    pub fn accounts(&self) -> Result<Vec<Account>, VaultError> {
        Ok(self.load_record()?.accounts)
    }

    /// Re-encrypt the vault under a new password, salt and nonces.
    pub fn change_password(&mut self, old: &str, new: &str) -> Result<(), VaultError> {
        self.check_password(new)?;
        self.config.kdf.check_strength()?;
        let record = self.load_record()?;
        let mut opened = self.open_record(&record, old)?;

        let sealed = self.seal_record(
            new,
            &opened.keys,
            opened.mnemonic.as_ref().map(|m| m.as_str()),
            record.accounts.clone(),
            Some(&record.salt),
        );
        opened.wipe();
        self.storage.store(&sealed?)?;

        let deadline = self.next_deadline();
        if let Some(session) = self.session.as_mut() {
            session.deadline_ms = deadline;
        }
        log::info!("vault password changed");
        Ok(())
    }

    /// Export one private key after re-confirming the password.
    pub fn reveal_private_key(
        &mut self,
        password: &str,
        network: NetworkKind,
        account: u32,
    ) -> Result<Zeroizing<String>, VaultError> {
        self.active_session()?;
        let record = self.load_record()?;
        let mut opened = self.open_record(&record, password)?;

        let exported = opened
            .keys
            .iter()
            .find(|k| k.index == account)
            .ok_or(VaultError::UnknownAccount(account))
            .and_then(|k| Ok(network.scheme().export_secret(k.secret(network))?));
        opened.wipe();

        let deadline = self.next_deadline();
        if let Some(session) = self.session.as_mut() {
            session.deadline_ms = deadline;
        }
        log::warn!("private key revealed for {} account {}", network, account);
        exported
    }

    /// Derive the next account from the persisted seed.
    pub fn add_account(&mut self, password: &str) -> Result<Account, VaultError> {
        let record = self.load_record()?;
        let mut opened = self.open_record(&record, password)?;

        let result = self.extend_record(password, &record, &mut opened);
        opened.wipe();
        let (account, new_keys) = result?;

        let deadline = self.next_deadline();
        if let Some(session) = self.session.as_mut() {
            session.keys.push(new_keys);
            session.accounts.push(account.clone());
            session.deadline_ms = deadline;
        }
        log::info!("added account {}", account.index);
        Ok(account)
    }

    fn extend_record(
        &self,
        password: &str,
        record: &VaultRecord,
        opened: &mut Opened,
    ) -> Result<(Account, AccountKeys), VaultError> {
        let phrase = opened
            .mnemonic
            .as_ref()
            .ok_or(VaultError::NotFound("seed was not persisted"))?;
        let seed = derive_seed(&parse_mnemonic(phrase)?, "");

        let index = record
            .accounts
            .iter()
            .map(|a| a.index)
            .max()
            .map_or(0, |i| i + 1);
        let keys = AccountKeys::derive(&seed, index)?;
        let account = keys.account()?;

        opened.keys.push(keys);
        let mut accounts = record.accounts.clone();
        accounts.push(account.clone());
        let sealed = self.seal_record(
            password,
            &opened.keys,
            Some(phrase.as_str()),
            accounts,
            Some(&record.salt),
        )?;
        self.storage.store(&sealed)?;

        Ok((account, AccountKeys::derive(&seed, index)?))
    }

    /// Delete the persisted vault after password confirmation.
    pub fn destroy(&mut self, password: &str) -> Result<(), VaultError> {
        let record = self.load_record()?;
        let mut opened = self.open_record(&record, password)?;
        opened.wipe();
        self.lock();
        self.storage.remove()?;
        log::warn!("vault destroyed");
        Ok(())
    }

    // ------------------------------------------------------------------------

    fn check_password(&self, password: &str) -> Result<(), VaultError> {
        self.config
            .password_policy
            .check(password)
            .map(|_| ())
            .map_err(|min_length| VaultError::WeakPassword { min_length })
    }

    fn load_record(&self) -> Result<VaultRecord, VaultError> {
        self.storage
            .load()?
            .ok_or(VaultError::NotFound("no vault"))
    }

    fn next_deadline(&self) -> u64 {
        let auto_lock = u64::try_from(self.config.auto_lock.as_millis()).unwrap_or(u64::MAX);
        self.clock.now_ms().saturating_add(auto_lock)
    }

    fn start_session(&mut self, keys: Vec<AccountKeys>, accounts: Vec<Account>) {
        let deadline_ms = self.next_deadline();
        self.session = Some(Session {
            keys,
            accounts,
            deadline_ms,
        });
    }

    fn enforce_deadline(&mut self) {
        let now = self.clock.now_ms();
        if self.session.as_ref().is_some_and(|s| now >= s.deadline_ms) {
            log::info!("auto-lock deadline reached");
            self.lock();
        }
    }

    fn active_session(&mut self) -> Result<&mut Session, VaultError> {
        self.enforce_deadline();
        self.session.as_mut().ok_or(VaultError::Locked)
    }

    fn fresh_salt(previous: Option<&str>) -> Result<[u8; crypto::SALT_LEN], VaultError> {
        for _ in 0..MAX_SALT_ATTEMPTS {
            let salt = crypto::generate_salt()?;
            if previous != Some(crypto::encode_salt(&salt).as_str()) {
                return Ok(salt);
            }
            log::warn!("regenerated salt equal to the previous one");
        }
        Err(VaultError::WeakEntropy)
    }

    fn seal_record(
        &self,
        password: &str,
        keys: &[AccountKeys],
        mnemonic: Option<&str>,
        accounts: Vec<Account>,
        previous_salt: Option<&str>,
    ) -> Result<VaultRecord, VaultError> {
        let salt = Self::fresh_salt(previous_salt)?;
        let key = crypto::derive_key(password, &salt, &self.config.kdf)?;
        let now = self.clock.now_secs();

        let bundle = encode_bundle(keys);
        let encrypted_keys = crypto::seal(&key, &bundle, now)?;
        let encrypted_seed = mnemonic
            .map(|m| crypto::seal(&key, m.as_bytes(), now))
            .transpose()?;

        Ok(VaultRecord {
            version: VAULT_VERSION,
            salt: crypto::encode_salt(&salt),
            kdf: self.config.kdf,
            algorithm: CIPHER_ALGORITHM.to_string(),
            encrypted_keys,
            encrypted_seed,
            accounts,
        })
    }

    /// Decrypt a record. Every failure is `InvalidCredentials`.
    fn open_record(&self, record: &VaultRecord, password: &str) -> Result<Opened, VaultError> {
        if record.algorithm != CIPHER_ALGORITHM {
            return Err(VaultError::InvalidCredentials);
        }
        let salt = crypto::decode_salt(&record.salt).map_err(|_| VaultError::InvalidCredentials)?;
        let key = crypto::derive_key(password, &salt, &record.kdf)
            .map_err(|_| VaultError::InvalidCredentials)?;

        let bundle =
            crypto::open(&key, &record.encrypted_keys).map_err(|_| VaultError::InvalidCredentials)?;
        let keys = decode_bundle(&bundle).map_err(|_| VaultError::InvalidCredentials)?;

        // The keys must reproduce the public accounts stored next to them.
        let consistent = keys.len() == record.accounts.len()
            && keys
                .iter()
                .zip(&record.accounts)
                .all(|(k, a)| k.account().map(|derived| &derived == a).unwrap_or(false));
        if !consistent {
            return Err(VaultError::InvalidCredentials);
        }

        let mnemonic = match &record.encrypted_seed {
            Some(blob) => {
                let bytes = crypto::open(&key, blob).map_err(|_| VaultError::InvalidCredentials)?;
                let phrase = std::str::from_utf8(&bytes).map_err(|_| VaultError::InvalidCredentials)?;
                Some(Zeroizing::new(phrase.to_string()))
            }
            None => None,
        };

        Ok(Opened { keys, mnemonic })
    }
}

impl Drop for SecureKeyManager {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.wipe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::keys::validate_eon_address;
    use crate::storage::MemoryVaultStorage;

    const MNEMONIC: &str =
        "leader monkey parrot ring guide accident before fence cannon height naive bean";
    const PASSWORD: &str = "correct horse battery staple";

    struct SharedStorage(Arc<MemoryVaultStorage>);

    impl VaultStorage for SharedStorage {
        fn load(&self) -> Result<Option<VaultRecord>, StorageError> {
            self.0.load()
        }
        fn store(&self, record: &VaultRecord) -> Result<(), StorageError> {
            self.0.store(record)
        }
        fn exists(&self) -> Result<bool, StorageError> {
            self.0.exists()
        }
        fn remove(&self) -> Result<(), StorageError> {
            self.0.remove()
        }
    }

    fn manager() -> (Arc<ManualClock>, Arc<MemoryVaultStorage>, SecureKeyManager) {
        let clock = Arc::new(ManualClock::default());
        let storage = Arc::new(MemoryVaultStorage::new());
        let config = VaultConfig {
            kdf: KdfParams::insecure_fast(),
            ..VaultConfig::default()
        };
        let vault = SecureKeyManager::new(
            Box::new(SharedStorage(storage.clone())),
            clock.clone(),
            config,
        );
        (clock, storage, vault)
    }

    #[test]
    fn test_initialize_then_unlock_roundtrip() {
        let (_clock, _storage, mut vault) = manager();
        let created = vault.initialize(PASSWORD, MNEMONIC, false).unwrap();
        assert_eq!(created.len(), 1);
        assert!(validate_eon_address(&created[0].addresses.native));
        assert!(vault.is_unlocked());

        vault.lock();
        assert!(!vault.is_unlocked());

        let outcome = vault.unlock(PASSWORD, false).unwrap();
        assert_eq!(outcome.accounts, created);
        assert!(outcome.mnemonic.is_none());
        assert!(vault.is_unlocked());
    }

    #[test]
    fn test_second_initialize_rejected() {
        let (_clock, _storage, mut vault) = manager();
        vault.initialize(PASSWORD, MNEMONIC, false).unwrap();
        assert!(matches!(
            vault.initialize(PASSWORD, MNEMONIC, false),
            Err(VaultError::AlreadyExists)
        ));
    }

    #[test]
    fn test_short_password_rejected_before_anything_is_stored() {
        let (_clock, storage, mut vault) = manager();
        assert!(matches!(
            vault.initialize("short", MNEMONIC, false),
            Err(VaultError::WeakPassword { min_length: 8 })
        ));
        assert!(storage.raw().is_none());
    }

    #[test]
    fn test_invalid_mnemonic_rejected() {
        let (_clock, _storage, mut vault) = manager();
        assert!(matches!(
            vault.initialize(PASSWORD, "not a real mnemonic", false),
            Err(VaultError::InvalidMnemonic(_))
        ));
    }

    #[test]
    fn test_wrong_password_leaves_vault_locked() {
        let (_clock, _storage, mut vault) = manager();
        vault.initialize(PASSWORD, MNEMONIC, false).unwrap();
        vault.lock();
        assert!(matches!(
            vault.unlock("not the password", false),
            Err(VaultError::InvalidCredentials)
        ));
        assert!(!vault.is_unlocked());
        assert!(matches!(
            vault.sign(b"x", NetworkKind::Native, 0),
            Err(VaultError::Locked)
        ));
    }

    #[test]
    fn test_record_holds_no_plaintext() {
        let (_clock, storage, mut vault) = manager();
        vault.initialize(PASSWORD, MNEMONIC, true).unwrap();
        let raw = storage.raw().unwrap();
        assert!(!raw.contains("leader"));
        assert!(!raw.contains(PASSWORD));
        assert!(raw.contains("\"encryptedKeys\""));
        assert!(raw.contains("\"encryptedSeed\""));
        assert!(raw.contains("\"memoryKib\""));
        assert!(raw.contains("aes-256-gcm"));
        assert!(raw.contains("argon2id"));
    }

    #[test]
    fn test_seed_only_revealed_when_persisted_and_requested() {
        let (_clock, _storage, mut vault) = manager();
        vault.initialize(PASSWORD, MNEMONIC, true).unwrap();
        assert!(vault.unlock(PASSWORD, false).unwrap().mnemonic.is_none());
        let outcome = vault.unlock(PASSWORD, true).unwrap();
        assert_eq!(outcome.mnemonic.unwrap().as_str(), MNEMONIC);

        let (_clock, _storage, mut no_seed) = manager();
        no_seed.initialize(PASSWORD, MNEMONIC, false).unwrap();
        assert!(no_seed.unlock(PASSWORD, true).unwrap().mnemonic.is_none());
    }

    #[test]
    fn test_sign_produces_verifiable_signatures() {
        let (_clock, _storage, mut vault) = manager();
        vault.initialize(PASSWORD, MNEMONIC, false).unwrap();
        for network in NetworkKind::ALL {
            let sig = vault.sign(b"activate", network, 0).unwrap();
            let pk = vault.public_key(network, 0).unwrap();
            assert!(network.scheme().verify(&pk, b"activate", &sig));
        }
        assert!(matches!(
            vault.sign(b"x", NetworkKind::Native, 7),
            Err(VaultError::UnknownAccount(7))
        ));
    }

    #[test]
    fn test_auto_lock_after_inactivity() {
        let (clock, _storage, mut vault) = manager();
        vault.initialize(PASSWORD, MNEMONIC, false).unwrap();

        clock.advance(Duration::from_secs(14 * 60));
        vault.sign(b"keepalive", NetworkKind::Native, 0).unwrap();

        // Deadline was pushed out by the signature.
        clock.advance(Duration::from_secs(14 * 60));
        assert!(vault.is_unlocked());
        assert!(!vault.tick());

        clock.advance(Duration::from_secs(60));
        assert!(vault.tick());
        assert!(!vault.is_unlocked());
        assert!(matches!(
            vault.sign(b"x", NetworkKind::Native, 0),
            Err(VaultError::Locked)
        ));
    }

    #[test]
    fn test_lazy_auto_lock_without_tick() {
        let (clock, _storage, mut vault) = manager();
        vault.initialize(PASSWORD, MNEMONIC, false).unwrap();
        clock.advance(DEFAULT_AUTO_LOCK);
        assert!(matches!(
            vault.public_key(NetworkKind::Settlement, 0),
            Err(VaultError::Locked)
        ));
        assert_eq!(vault.time_until_lock_ms(), None);
    }

    #[test]
    fn test_change_password() {
        let (_clock, storage, mut vault) = manager();
        let accounts = vault.initialize(PASSWORD, MNEMONIC, true).unwrap();
        let before: VaultRecord = serde_json::from_str(&storage.raw().unwrap()).unwrap();

        assert!(matches!(
            vault.change_password("wrong password", "another long password"),
            Err(VaultError::InvalidCredentials)
        ));
        assert!(matches!(
            vault.change_password(PASSWORD, "tiny"),
            Err(VaultError::WeakPassword { .. })
        ));

        vault.change_password(PASSWORD, "another long password").unwrap();
        let after: VaultRecord = serde_json::from_str(&storage.raw().unwrap()).unwrap();
        assert_ne!(before.salt, after.salt);
        assert_ne!(before.encrypted_keys.iv, after.encrypted_keys.iv);

        vault.lock();
        assert!(matches!(
            vault.unlock(PASSWORD, false),
            Err(VaultError::InvalidCredentials)
        ));
        let outcome = vault.unlock("another long password", true).unwrap();
        assert_eq!(outcome.accounts, accounts);
        assert_eq!(outcome.mnemonic.unwrap().as_str(), MNEMONIC);
    }

    #[test]
    fn test_reveal_private_key_requires_password() {
        let (_clock, _storage, mut vault) = manager();
        vault.initialize(PASSWORD, MNEMONIC, false).unwrap();

        assert!(matches!(
            vault.reveal_private_key("wrong password", NetworkKind::Native, 0),
            Err(VaultError::InvalidCredentials)
        ));

        let exported = vault
            .reveal_private_key(PASSWORD, NetworkKind::Native, 0)
            .unwrap();
        let secret = hex::decode(exported.as_str()).unwrap();
        let pk = NetworkKind::Native.scheme().public_key(&secret).unwrap();
        assert_eq!(pk, vault.public_key(NetworkKind::Native, 0).unwrap());

        vault.lock();
        assert!(matches!(
            vault.reveal_private_key(PASSWORD, NetworkKind::Native, 0),
            Err(VaultError::Locked)
        ));
    }

    #[test]
    fn test_add_account_needs_persisted_seed() {
        let (_clock, _storage, mut vault) = manager();
        vault.initialize(PASSWORD, MNEMONIC, false).unwrap();
        assert!(matches!(
            vault.add_account(PASSWORD),
            Err(VaultError::NotFound(_))
        ));
    }

    #[test]
    fn test_add_account_is_deterministic() {
        let (_clock, _storage, mut vault) = manager();
        vault.initialize(PASSWORD, MNEMONIC, true).unwrap();
        let added = vault.add_account(PASSWORD).unwrap();
        assert_eq!(added.index, 1);
        assert_eq!(added.derivation_paths.native, "m/44'/7731'/1'/0/0");

        // Usable in the current session and after a fresh unlock.
        vault.sign(b"x", NetworkKind::Settlement, 1).unwrap();
        vault.lock();
        let outcome = vault.unlock(PASSWORD, false).unwrap();
        assert_eq!(outcome.accounts.len(), 2);
        assert_eq!(outcome.accounts[1], added);

        let seed = derive_seed(&parse_mnemonic(MNEMONIC).unwrap(), "");
        let expected = AccountKeys::derive(&seed, 1).unwrap().account().unwrap();
        assert_eq!(added, expected);
    }

    #[test]
    fn test_tampered_record_is_invalid_credentials() {
        let (_clock, storage, mut vault) = manager();
        vault.initialize(PASSWORD, MNEMONIC, false).unwrap();
        vault.lock();

        let mut record: VaultRecord = serde_json::from_str(&storage.raw().unwrap()).unwrap();
        record.accounts[0].addresses.native = "tampered".into();
        storage.store(&record).unwrap();
        assert!(matches!(
            vault.unlock(PASSWORD, false),
            Err(VaultError::InvalidCredentials)
        ));

        record.salt = "@@@".into();
        storage.store(&record).unwrap();
        assert!(matches!(
            vault.unlock(PASSWORD, false),
            Err(VaultError::InvalidCredentials)
        ));
    }

    #[test]
    fn test_destroy() {
        let (_clock, storage, mut vault) = manager();
        vault.initialize(PASSWORD, MNEMONIC, false).unwrap();
        assert!(matches!(
            vault.destroy("wrong password"),
            Err(VaultError::InvalidCredentials)
        ));
        assert!(vault.exists().unwrap());

        vault.destroy(PASSWORD).unwrap();
        assert!(!vault.exists().unwrap());
        assert!(!vault.is_unlocked());
        assert!(storage.raw().is_none());
        assert!(matches!(vault.unlock(PASSWORD, false), Err(VaultError::NotFound(_))));
    }
    #[test]
    fn test_weak_kdf_is_refused() {
        let storage = Arc::new(MemoryVaultStorage::new());
        let weak = VaultConfig {
            kdf: KdfParams {
                memory_kib: 8,
                iterations: 1,
                parallelism: 1,
                ..KdfParams::default()
            },
            ..VaultConfig::default()
        };
        let clock = Arc::new(ManualClock::default());
        let mut vault = SecureKeyManager::new(
            Box::new(SharedStorage(storage.clone())),
            clock.clone(),
            weak.clone(),
        );
        assert!(matches!(
            vault.initialize(PASSWORD, MNEMONIC, false),
            Err(VaultError::Crypto(_))
        ));
        assert!(storage.raw().is_none());

        // An existing vault cannot be re-sealed with weak parameters either
        let mut strong = SecureKeyManager::new(
            Box::new(SharedStorage(storage.clone())),
            clock.clone(),
            VaultConfig {
                kdf: KdfParams::insecure_fast(),
                ..VaultConfig::default()
            },
        );
        strong.initialize(PASSWORD, MNEMONIC, false).unwrap();
        let mut vault = SecureKeyManager::new(Box::new(SharedStorage(storage.clone())), clock, weak);
        assert!(matches!(
            vault.change_password(PASSWORD, "another long password"),
            Err(VaultError::Crypto(_))
        ));
        vault.unlock(PASSWORD, false).unwrap();
    }

    #[test]
    fn test_unbounded_auto_lock_saturates() {
        let clock = Arc::new(ManualClock::default());
        let mut vault = SecureKeyManager::new(
            Box::new(MemoryVaultStorage::new()),
            clock.clone(),
            VaultConfig {
                kdf: KdfParams::insecure_fast(),
                auto_lock: Duration::from_secs(u64::MAX),
                ..VaultConfig::default()
            },
        );
        vault.initialize(PASSWORD, MNEMONIC, false).unwrap();
        assert_eq!(vault.time_until_lock_ms(), Some(u64::MAX - clock.now_ms()));

        clock.advance(Duration::from_secs(10 * 365 * 24 * 60 * 60));
        assert!(!vault.tick());
        assert!(vault.is_unlocked());
    }
}
