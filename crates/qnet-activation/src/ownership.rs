//! Node ownership and the one-node-per-wallet rule
//!
//! The native chain is the only authority on who owns which node. This
//! module caches its answers for display, bypasses the cache before any
//! state change, and signs off on ownership transfers.
//!
//! # Transfer authorization
//!
//! The current owner signs the canonical message
//!
//! ```text
//! TRANSFER:{node_id}:{from}:{to}:{timestamp}
//! ```
//!
//! with the native key whose address is `from`. The timestamp must be within
//! the transfer window of the local clock.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use qnet_core::keys::validate_eon_address;
use qnet_core::{Clock, NetworkKind};
use qnet_network::{NativeChain, NodeOwnership, Phase, RpcError, SubmitReceipt, TransferRequest};

use crate::record::{ActivationStore, OwnershipRecord, StoreError};

pub const DEFAULT_OWNERSHIP_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_TRANSFER_WINDOW: Duration = Duration::from_secs(300);

/// Errors from ownership operations
#[derive(Error, Debug)]
pub enum OwnershipError {
    #[error("Wallet {owner} already owns a node ({})", nodes.join(", "))]
    NodeLimitExceeded { owner: String, nodes: Vec<String> },

    #[error("{claimed} does not own node {node_id}")]
    OwnershipMismatch { node_id: String, claimed: String },

    #[error("Invalid transfer target: {0}")]
    InvalidTransferTarget(String),

    #[error("Invalid transfer authorization: {0}")]
    InvalidAuthorization(String),

    #[error("Remote error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Detached proof that the current owner approved a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAuthorization {
    /// Unix seconds
    pub timestamp: u64,
    /// Hex compressed secp256k1 key
    pub public_key: String,
    /// Hex compact ECDSA signature
    pub signature: String,
}

#[derive(Clone)]
struct Cached<T> {
    value: T,
    fetched_ms: u64,
}

/// Ownership queries and transfers against the native chain.
pub struct OwnershipManager {
    native: Arc<dyn NativeChain>,
    store: Arc<ActivationStore>,
    clock: Arc<dyn Clock>,
    ttl_ms: u64,
    window_secs: u64,
    owners: Mutex<HashMap<String, Cached<Option<NodeOwnership>>>>,
    wallet_nodes: Mutex<HashMap<String, Cached<Vec<String>>>>,
}

impl OwnershipManager {
    pub fn new(
        native: Arc<dyn NativeChain>,
        store: Arc<ActivationStore>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        transfer_window: Duration,
    ) -> Self {
        Self {
            native,
            store,
            clock,
            ttl_ms: ttl.as_millis() as u64,
            window_secs: transfer_window.as_secs(),
            owners: Mutex::new(HashMap::new()),
            wallet_nodes: Mutex::new(HashMap::new()),
        }
    }

    fn owners(&self) -> MutexGuard<'_, HashMap<String, Cached<Option<NodeOwnership>>>> {
        self.owners.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wallets(&self) -> MutexGuard<'_, HashMap<String, Cached<Vec<String>>>> {
        self.wallet_nodes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_fresh(&self, fetched_ms: u64) -> bool {
        self.clock.now_ms().saturating_sub(fetched_ms) < self.ttl_ms
    }

    /// Current owner of `node_id`. `fresh` bypasses the cache.
    pub async fn lookup(
        &self,
        node_id: &str,
        fresh: bool,
    ) -> Result<Option<NodeOwnership>, OwnershipError> {
        if !fresh {
            if let Some(cached) = self.owners().get(node_id) {
                if self.is_fresh(cached.fetched_ms) {
                    return Ok(cached.value.clone());
                }
            }
        }
        let value = self.native.get_node_owner(node_id).await?;
        self.owners().insert(
            node_id.to_string(),
            Cached {
                value: value.clone(),
                fetched_ms: self.clock.now_ms(),
            },
        );
        Ok(value)
    }

    /// Whether `claimed_owner` owns the living node `node_id`.
    pub async fn verify_ownership(
        &self,
        node_id: &str,
        claimed_owner: &str,
        fresh: bool,
    ) -> Result<bool, OwnershipError> {
        Ok(self
            .lookup(node_id, fresh)
            .await?
            .is_some_and(|o| o.owner == claimed_owner && o.status.is_living()))
    }

    /// Living nodes owned by `owner`. `fresh` bypasses the cache.
    pub async fn wallet_nodes(&self, owner: &str, fresh: bool) -> Result<Vec<String>, OwnershipError> {
        if !fresh {
            if let Some(cached) = self.wallets().get(owner) {
                if self.is_fresh(cached.fetched_ms) {
                    return Ok(cached.value.clone());
                }
            }
        }
        let nodes = self.native.get_wallet_nodes(owner).await?;
        self.wallets().insert(
            owner.to_string(),
            Cached {
                value: nodes.clone(),
                fetched_ms: self.clock.now_ms(),
            },
        );
        Ok(nodes)
    }

    /// Refuse to start an activation if `owner` already has a living node.
    ///
    /// Always asks the chain. The check and the later submission are not
    /// atomic; a remote rejection at submission time wins.
    pub async fn enforce_before_activation(
        &self,
        owner: &str,
        phase: Phase,
    ) -> Result<(), OwnershipError> {
        let nodes = self.wallet_nodes(owner, true).await?;
        if !nodes.is_empty() {
            log::warn!(
                "{} activation refused: {} already owns {} node(s)",
                phase,
                short(owner),
                nodes.len()
            );
            return Err(OwnershipError::NodeLimitExceeded {
                owner: owner.to_string(),
                nodes,
            });
        }
        Ok(())
    }

    /// Check a transfer authorization without contacting the chain.
    pub fn check_authorization(
        &self,
        node_id: &str,
        from: &str,
        to: &str,
        auth: &TransferAuthorization,
    ) -> Result<(), OwnershipError> {
        let now = self.clock.now_secs();
        if now.abs_diff(auth.timestamp) > self.window_secs {
            return Err(OwnershipError::InvalidAuthorization(format!(
                "timestamp {} outside the {} s window",
                auth.timestamp, self.window_secs
            )));
        }

        let scheme = NetworkKind::Native.scheme();
        let public_key = hex::decode(&auth.public_key)
            .map_err(|_| OwnershipError::InvalidAuthorization("public key is not hex".into()))?;
        let signature = hex::decode(&auth.signature)
            .map_err(|_| OwnershipError::InvalidAuthorization("signature is not hex".into()))?;

        let signer = scheme
            .address_from_public_key(&public_key)
            .map_err(|e| OwnershipError::InvalidAuthorization(e.to_string()))?;
        if signer != from {
            return Err(OwnershipError::InvalidAuthorization(
                "signing key does not belong to the current owner".into(),
            ));
        }

        let message = TransferRequest::canonical_message(node_id, from, to, auth.timestamp);
        if !scheme.verify(&public_key, message.as_bytes(), &signature) {
            return Err(OwnershipError::InvalidAuthorization(
                "signature does not match".into(),
            ));
        }
        Ok(())
    }

    /// Transfer `node_id` from `from` to `to`.
    ///
    /// On success every cache entry touching the node or either wallet is
    /// dropped and the local history is extended. On failure nothing local
    /// changes.
    pub async fn transfer_node(
        &self,
        node_id: &str,
        from: &str,
        to: &str,
        auth: &TransferAuthorization,
    ) -> Result<SubmitReceipt, OwnershipError> {
        if from == to {
            return Err(OwnershipError::InvalidTransferTarget(
                "destination is the current owner".into(),
            ));
        }
        if !validate_eon_address(to) {
            return Err(OwnershipError::InvalidTransferTarget(format!(
                "{} is not a valid native address",
                to
            )));
        }
        self.check_authorization(node_id, from, to, auth)?;

        let current = self.native.get_node_owner(node_id).await?;
        if !current
            .as_ref()
            .is_some_and(|o| o.owner == from && o.status.is_living())
        {
            return Err(OwnershipError::OwnershipMismatch {
                node_id: node_id.to_string(),
                claimed: from.to_string(),
            });
        }

        let destination_nodes = self.native.get_wallet_nodes(to).await?;
        if !destination_nodes.is_empty() {
            return Err(OwnershipError::InvalidTransferTarget(format!(
                "{} already owns a node",
                short(to)
            )));
        }

        let request = TransferRequest {
            node_id: node_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            timestamp: auth.timestamp,
            public_key: auth.public_key.clone(),
            signature: auth.signature.clone(),
        };
        let receipt = self.native.submit_transfer(&request).await?;

        self.invalidate(node_id);
        {
            let mut wallets = self.wallets();
            wallets.remove(from);
            wallets.remove(to);
        }
        self.store
            .record_transfer(node_id, to, &receipt.tx_hash, self.clock.now_secs())?;
        log::info!(
            "node {} transferred {} -> {} ({})",
            node_id,
            short(from),
            short(to),
            receipt.tx_hash
        );
        Ok(receipt)
    }

    /// Drop every cached answer about `node_id`.
    pub fn invalidate(&self, node_id: &str) {
        self.owners().remove(node_id);
        self.wallets()
            .retain(|_, cached| !cached.value.iter().any(|n| n == node_id));
    }

    /// Drop the cached node list of `owner`.
    pub fn invalidate_wallet(&self, owner: &str) {
        self.wallets().remove(owner);
    }

    /// Local ownership history of `node_id`.
    pub fn ownership_record(&self, node_id: &str) -> Option<OwnershipRecord> {
        self.store.ownership(node_id)
    }
}

/// First characters of an address, for logs.
pub(crate) fn short(address: &str) -> &str {
    let end = address
        .char_indices()
        .nth(12)
        .map(|(i, _)| i)
        .unwrap_or(address.len());
    &address[..end]
}
