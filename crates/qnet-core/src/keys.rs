//! Per-network key derivation and signing
//!
//! Both networks derive from the same BIP-39 seed:
//! - Settlement chain: ed25519 via SLIP-10 (all-hardened path), base58 addresses
//! - Native chain: secp256k1 via BIP-32, EON addresses
//!
//! Each network is one [`KeyScheme`] implementation. Callers select it with
//! [`NetworkKind`] instead of matching on network names.

use bitcoin::bip32::{DerivationPath, Xpriv};
use bitcoin::hashes::{sha256, sha512, Hash, HashEngine, Hmac, HmacEngine};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use secp256k1::{ecdsa, Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::memory::SecretBuffer;

/// SLIP-44 coin type of the settlement chain (Solana).
pub const SETTLEMENT_COIN_TYPE: u32 = 501;

/// Coin type used for native-chain (EON) keys.
pub const NATIVE_COIN_TYPE: u32 = 7731;

/// Length of every private key handled by the vault.
pub const SECRET_KEY_LEN: usize = 32;

const HARDENED: u32 = 0x8000_0000;
const EON_MARKER: &str = "eon";
const EON_ADDRESS_LEN: usize = 41;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Derivation failed: {0}")]
    DerivationFailed(String),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Invalid key material: {0}")]
    InvalidKey(String),
    #[error("Invalid key bundle")]
    InvalidBundle,
}

/// The two networks the wallet holds keys for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    /// Chain where 1DEV is burned in Phase 1.
    Settlement,
    /// Chain where nodes are activated and QNC is spent in Phase 2.
    Native,
}

impl NetworkKind {
    pub const ALL: [NetworkKind; 2] = [NetworkKind::Settlement, NetworkKind::Native];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Settlement => "settlement",
            Self::Native => "native",
        }
    }

    /// The key scheme for this network.
    pub fn scheme(self) -> &'static dyn KeyScheme {
        match self {
            Self::Settlement => &Ed25519Slip10,
            Self::Native => &Secp256k1Bip32,
        }
    }

    pub fn derivation_path(self, account: u32) -> String {
        self.scheme().derivation_path(account)
    }
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NetworkKind {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "settlement" | "solana" => Ok(Self::Settlement),
            "native" | "qnet" | "eon" => Ok(Self::Native),
            other => Err(KeyError::InvalidPath(format!("unknown network: {}", other))),
        }
    }
}

/// Derivation, addressing and signing for one network.
pub trait KeyScheme: Send + Sync {
    fn derivation_path(&self, account: u32) -> String;

    /// Derive the 32-byte private key of `account` from a BIP-39 seed.
    fn derive_secret(&self, seed: &[u8; 64], account: u32)
        -> Result<Zeroizing<[u8; 32]>, KeyError>;

    fn public_key(&self, secret: &[u8]) -> Result<Vec<u8>, KeyError>;

    fn address_from_public_key(&self, public_key: &[u8]) -> Result<String, KeyError>;

    fn sign(&self, secret: &[u8], payload: &[u8]) -> Result<Vec<u8>, KeyError>;

    fn verify(&self, public_key: &[u8], payload: &[u8], signature: &[u8]) -> bool;

    /// Export format shown to the user when revealing a private key.
    fn export_secret(&self, secret: &[u8]) -> Result<Zeroizing<String>, KeyError>;

    fn address(&self, secret: &[u8]) -> Result<String, KeyError> {
        let public_key = self.public_key(secret)?;
        self.address_from_public_key(&public_key)
    }
}

fn secret_array(secret: &[u8]) -> Result<&[u8; 32], KeyError> {
    <&[u8; 32]>::try_from(secret)
        .map_err(|_| KeyError::InvalidKey(format!("expected 32 bytes, got {}", secret.len())))
}

// ============================================================================
// Settlement chain: ed25519 / SLIP-10
// ============================================================================

/// SLIP-10 ed25519 derivation with base58 addresses.
#[derive(Debug, Clone, Copy)]
pub struct Ed25519Slip10;

/// SLIP-10 private key derivation for ed25519. Every index is hardened.
fn slip10_ed25519(seed: &[u8], path: &[u32]) -> Zeroizing<[u8; 32]> {
    let mut engine = HmacEngine::<sha512::Hash>::new(b"ed25519 seed");
    engine.input(seed);
    let mut node = Zeroizing::new(Hmac::from_engine(engine).to_byte_array());

    for index in path {
        let mut engine = HmacEngine::<sha512::Hash>::new(&node[32..]);
        engine.input(&[0u8]);
        engine.input(&node[..32]);
        engine.input(&(index | HARDENED).to_be_bytes());
        *node = Hmac::from_engine(engine).to_byte_array();
    }

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&node[..32]);
    key
}

impl KeyScheme for Ed25519Slip10 {
    fn derivation_path(&self, account: u32) -> String {
        format!("m/44'/{}'/{}'/0'", SETTLEMENT_COIN_TYPE, account)
    }

    fn derive_secret(
        &self,
        seed: &[u8; 64],
        account: u32,
    ) -> Result<Zeroizing<[u8; 32]>, KeyError> {
        if account >= HARDENED {
            return Err(KeyError::InvalidPath(format!("account out of range: {}", account)));
        }
        Ok(slip10_ed25519(seed, &[44, SETTLEMENT_COIN_TYPE, account, 0]))
    }

    fn public_key(&self, secret: &[u8]) -> Result<Vec<u8>, KeyError> {
        let signing = SigningKey::from_bytes(secret_array(secret)?);
        Ok(signing.verifying_key().to_bytes().to_vec())
    }

    fn address_from_public_key(&self, public_key: &[u8]) -> Result<String, KeyError> {
        if public_key.len() != 32 {
            return Err(KeyError::InvalidKey("ed25519 public key must be 32 bytes".into()));
        }
        Ok(bitcoin::base58::encode(public_key))
    }

    fn sign(&self, secret: &[u8], payload: &[u8]) -> Result<Vec<u8>, KeyError> {
        let signing = SigningKey::from_bytes(secret_array(secret)?);
        Ok(signing.sign(payload).to_bytes().to_vec())
    }

    fn verify(&self, public_key: &[u8], payload: &[u8], signature: &[u8]) -> bool {
        let Ok(pk) = <&[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(sig) = <&[u8; 64]>::try_from(signature) else {
            return false;
        };
        let Ok(verifying) = VerifyingKey::from_bytes(pk) else {
            return false;
        };
        verifying
            .verify(payload, &ed25519_dalek::Signature::from_bytes(sig))
            .is_ok()
    }

    fn export_secret(&self, secret: &[u8]) -> Result<Zeroizing<String>, KeyError> {
        // Solana wallets import the 64-byte keypair (secret || public) in base58.
        let signing = SigningKey::from_bytes(secret_array(secret)?);
        let keypair = Zeroizing::new(signing.to_keypair_bytes());
        Ok(Zeroizing::new(bitcoin::base58::encode(keypair.as_slice())))
    }
}

// ============================================================================
// Native chain: secp256k1 / BIP-32
// ============================================================================

/// BIP-32 secp256k1 derivation with EON addresses.
#[derive(Debug, Clone, Copy)]
pub struct Secp256k1Bip32;

impl KeyScheme for Secp256k1Bip32 {
    fn derivation_path(&self, account: u32) -> String {
        format!("m/44'/{}'/{}'/0/0", NATIVE_COIN_TYPE, account)
    }

    fn derive_secret(
        &self,
        seed: &[u8; 64],
        account: u32,
    ) -> Result<Zeroizing<[u8; 32]>, KeyError> {
        let master = Xpriv::new_master(bitcoin::Network::Bitcoin, seed)
            .map_err(|e| KeyError::DerivationFailed(e.to_string()))?;

        let path: DerivationPath = self
            .derivation_path(account)
            .parse()
            .map_err(|e: bitcoin::bip32::Error| KeyError::InvalidPath(e.to_string()))?;

        let mut derived = master
            .derive_priv(&Secp256k1::new(), &path)
            .map_err(|e| KeyError::DerivationFailed(e.to_string()))?;

        let secret = Zeroizing::new(derived.private_key.secret_bytes());
        derived.private_key.non_secure_erase();
        Ok(secret)
    }

    fn public_key(&self, secret: &[u8]) -> Result<Vec<u8>, KeyError> {
        let mut sk =
            SecretKey::from_slice(secret).map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        let pk = PublicKey::from_secret_key(&Secp256k1::new(), &sk);
        sk.non_secure_erase();
        Ok(pk.serialize().to_vec())
    }

    fn address_from_public_key(&self, public_key: &[u8]) -> Result<String, KeyError> {
        PublicKey::from_slice(public_key).map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        Ok(eon_address(public_key))
    }

    fn sign(&self, secret: &[u8], payload: &[u8]) -> Result<Vec<u8>, KeyError> {
        let mut sk =
            SecretKey::from_slice(secret).map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        let digest = sha256::Hash::hash(payload).to_byte_array();
        let sig = Secp256k1::new().sign_ecdsa(&Message::from_digest(digest), &sk);
        sk.non_secure_erase();
        Ok(sig.serialize_compact().to_vec())
    }

    fn verify(&self, public_key: &[u8], payload: &[u8], signature: &[u8]) -> bool {
        let Ok(pk) = PublicKey::from_slice(public_key) else {
            return false;
        };
        let Ok(sig) = ecdsa::Signature::from_compact(signature) else {
            return false;
        };
        let digest = sha256::Hash::hash(payload).to_byte_array();
        Secp256k1::verification_only()
            .verify_ecdsa(&Message::from_digest(digest), &sig, &pk)
            .is_ok()
    }

    fn export_secret(&self, secret: &[u8]) -> Result<Zeroizing<String>, KeyError> {
        Ok(Zeroizing::new(hex::encode(secret_array(secret)?)))
    }
}

/// Build an EON address: `{19 hex}eon{15 hex}{4 hex checksum}`.
///
/// The body comes from SHA3-256 of the compressed public key; the checksum is
/// the first two bytes of SHA3-256 over the address without checksum.
pub fn eon_address(public_key: &[u8]) -> String {
    let body = hex::encode(Sha3_256::digest(public_key));
    let unchecked = format!("{}{}{}", &body[..19], EON_MARKER, &body[19..34]);
    let checksum = hex::encode(&Sha3_256::digest(unchecked.as_bytes())[..2]);
    format!("{}{}", unchecked, checksum)
}

/// Check the shape and checksum of an EON address.
pub fn validate_eon_address(address: &str) -> bool {
    if address.len() != EON_ADDRESS_LEN || !address.is_ascii() {
        return false;
    }
    if &address[19..22] != EON_MARKER {
        return false;
    }
    let is_hex = |s: &str| s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
    let (part1, part2, checksum) = (&address[..19], &address[22..37], &address[37..]);
    if !is_hex(part1) || !is_hex(part2) || !is_hex(checksum) {
        return false;
    }
    let unchecked = &address[..37];
    hex::encode(&Sha3_256::digest(unchecked.as_bytes())[..2]) == checksum
}

/// Check that a settlement address decodes to a 32-byte ed25519 key.
pub fn validate_settlement_address(address: &str) -> bool {
    bitcoin::base58::decode(address)
        .map(|bytes| bytes.len() == 32)
        .unwrap_or(false)
}

/// Validate an address for the given network.
pub fn validate_address(network: NetworkKind, address: &str) -> bool {
    match network {
        NetworkKind::Settlement => validate_settlement_address(address),
        NetworkKind::Native => validate_eon_address(address),
    }
}

// ============================================================================
// Accounts
// ============================================================================

/// A value per network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAddresses {
    pub settlement: String,
    pub native: String,
}

impl NetworkAddresses {
    pub fn get(&self, network: NetworkKind) -> &str {
        match network {
            NetworkKind::Settlement => &self.settlement,
            NetworkKind::Native => &self.native,
        }
    }
}

/// Public view of a derived account. Safe to persist and display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub index: u32,
    pub addresses: NetworkAddresses,
    pub derivation_paths: NetworkAddresses,
}

/// Private keys of one account, held in wipeable buffers.
pub struct AccountKeys {
    pub index: u32,
    settlement: SecretBuffer,
    native: SecretBuffer,
}

impl AccountKeys {
    /// Derive both network keys for `index` from a seed.
    pub fn derive(seed: &[u8; 64], index: u32) -> Result<Self, KeyError> {
        let settlement = NetworkKind::Settlement.scheme().derive_secret(seed, index)?;
        let native = NetworkKind::Native.scheme().derive_secret(seed, index)?;
        Ok(Self {
            index,
            settlement: SecretBuffer::from_slice(settlement.as_slice()),
            native: SecretBuffer::from_slice(native.as_slice()),
        })
    }

    pub fn secret(&self, network: NetworkKind) -> &[u8] {
        match network {
            NetworkKind::Settlement => self.settlement.as_slice(),
            NetworkKind::Native => self.native.as_slice(),
        }
    }

    pub fn public_key(&self, network: NetworkKind) -> Result<Vec<u8>, KeyError> {
        network.scheme().public_key(self.secret(network))
    }

    pub fn sign(&self, network: NetworkKind, payload: &[u8]) -> Result<Vec<u8>, KeyError> {
        network.scheme().sign(self.secret(network), payload)
    }

    /// Public account description for these keys.
    pub fn account(&self) -> Result<Account, KeyError> {
        Ok(Account {
            index: self.index,
            addresses: NetworkAddresses {
                settlement: NetworkKind::Settlement
                    .scheme()
                    .address(self.secret(NetworkKind::Settlement))?,
                native: NetworkKind::Native
                    .scheme()
                    .address(self.secret(NetworkKind::Native))?,
            },
            derivation_paths: NetworkAddresses {
                settlement: NetworkKind::Settlement.derivation_path(self.index),
                native: NetworkKind::Native.derivation_path(self.index),
            },
        })
    }

    /// Overwrite both keys with random bytes.
    pub fn wipe(&mut self) {
        self.settlement.wipe();
        self.native.wipe();
    }
}

impl fmt::Debug for AccountKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountKeys")
            .field("index", &self.index)
            .field("settlement", &"<redacted>")
            .field("native", &"<redacted>")
            .finish()
    }
}

const BUNDLE_ENTRY_LEN: usize = 4 + 2 * SECRET_KEY_LEN;

/// Serialize key sets as `[index u32 BE][settlement 32][native 32]...`.
pub fn encode_bundle(keys: &[AccountKeys]) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(keys.len() * BUNDLE_ENTRY_LEN));
    for k in keys {
        out.extend_from_slice(&k.index.to_be_bytes());
        out.extend_from_slice(k.secret(NetworkKind::Settlement));
        out.extend_from_slice(k.secret(NetworkKind::Native));
    }
    out
}

/// Parse a bundle produced by [`encode_bundle`].
pub fn decode_bundle(bytes: &[u8]) -> Result<Vec<AccountKeys>, KeyError> {
    if bytes.is_empty() || bytes.len() % BUNDLE_ENTRY_LEN != 0 {
        return Err(KeyError::InvalidBundle);
    }
    bytes
        .chunks_exact(BUNDLE_ENTRY_LEN)
        .map(|chunk| {
            let mut index = [0u8; 4];
            index.copy_from_slice(&chunk[..4]);
            Ok(AccountKeys {
                index: u32::from_be_bytes(index),
                settlement: SecretBuffer::from_slice(&chunk[4..4 + SECRET_KEY_LEN]),
                native: SecretBuffer::from_slice(&chunk[4 + SECRET_KEY_LEN..]),
            })
        })
        .collect()
}
