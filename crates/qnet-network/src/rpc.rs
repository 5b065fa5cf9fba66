//! Remote chain capabilities
//!
//! The wallet never talks to a chain directly. It holds one
//! [`SettlementChain`] and one [`NativeChain`], both async traits over a
//! shared [`ChainClient`] base, so transports (JSON-RPC, HTTP, in-memory)
//! can be swapped without touching activation logic.
//!
//! Implementations must not retry internally. Transport failures are
//! reported as [`RpcError::Unavailable`] and retried by the caller; every
//! other variant is final.

use async_trait::async_trait;
use qnet_core::NetworkKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pricing::NodeType;

/// Errors from remote chain calls
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// Connection refused, timeout, 5xx. Safe to retry.
    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    /// The chain refused the request. The reason is passed through verbatim.
    #[error("Remote rejected: {0}")]
    Rejected(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RpcError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Unavailable(_))
    }
}

/// Lifecycle of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed(String),
}

/// Node status as reported by the native chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Active,
    Transferred,
    Revoked,
}

impl NodeStatus {
    /// Pending and active nodes count against the one-node limit.
    pub fn is_living(self) -> bool {
        matches!(self, NodeStatus::Pending | NodeStatus::Active)
    }
}

/// Answer of the remote ownership query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOwnership {
    pub node_id: String,
    pub owner: String,
    pub status: NodeStatus,
}

/// 1DEV supply statistics from the settlement chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BurnStats {
    pub total_burned: u64,
    pub total_supply: u64,
}

impl BurnStats {
    pub fn burned_percent(&self) -> f64 {
        if self.total_supply == 0 {
            return 0.0;
        }
        self.total_burned as f64 / self.total_supply as f64 * 100.0
    }
}

/// Native chain facts used for phase detection and Phase 2 pricing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub genesis_timestamp_secs: u64,
    pub active_nodes: u64,
}

/// Activation-related transactions the wallet signs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivationPayload {
    /// Phase 1: burn `amount` 1DEV from `source` on the settlement chain.
    /// `native_owner` binds the burn to the node owner.
    Burn {
        source: String,
        amount: u64,
        node_type: NodeType,
        native_owner: String,
    },
    /// Phase 1: redeem a bridge-issued code on the native chain.
    ActivationCode {
        code: String,
        node_type: NodeType,
        owner: String,
    },
    /// Phase 2: spend `amount` QNC on the native chain.
    NativeSpend {
        owner: String,
        amount: u64,
        node_type: NodeType,
    },
}

impl ActivationPayload {
    /// Network the payload is submitted to.
    pub fn network(&self) -> NetworkKind {
        match self {
            Self::Burn { .. } => NetworkKind::Settlement,
            Self::ActivationCode { .. } | Self::NativeSpend { .. } => NetworkKind::Native,
        }
    }

    /// Address whose key must sign this payload.
    pub fn signer(&self) -> &str {
        match self {
            Self::Burn { source, .. } => source,
            Self::ActivationCode { owner, .. } | Self::NativeSpend { owner, .. } => owner,
        }
    }

    /// Bytes covered by the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        // Field order is fixed by the enum definition, so the encoding is stable.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// A payload with its detached signature. Keys and signatures are hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedActivation {
    pub payload: ActivationPayload,
    pub public_key: String,
    pub signature: String,
}

impl SignedActivation {
    /// Check the signature against the payload's network scheme.
    pub fn verify(&self) -> bool {
        let (Ok(pk), Ok(sig)) = (hex::decode(&self.public_key), hex::decode(&self.signature)) else {
            return false;
        };
        self.payload
            .network()
            .scheme()
            .verify(&pk, &self.payload.signing_bytes(), &sig)
    }

    /// Whether the signing key's address is the payload's signer.
    pub fn signed_by_signer(&self) -> bool {
        let Ok(pk) = hex::decode(&self.public_key) else {
            return false;
        };
        self.payload
            .network()
            .scheme()
            .address_from_public_key(&pk)
            .map(|address| address == self.payload.signer())
            .unwrap_or(false)
    }
}

/// Ownership transfer submitted to the native chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub node_id: String,
    pub from: String,
    pub to: String,
    /// Unix seconds
    pub timestamp: u64,
    pub public_key: String,
    pub signature: String,
}

impl TransferRequest {
    /// The exact text the `from` key signs.
    pub fn canonical_message(node_id: &str, from: &str, to: &str, timestamp: u64) -> String {
        format!("TRANSFER:{}:{}:{}:{}", node_id, from, to, timestamp)
    }

    pub fn message(&self) -> String {
        Self::canonical_message(&self.node_id, &self.from, &self.to, self.timestamp)
    }
}

/// Accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub tx_hash: String,
    /// Assigned by the native chain for activation submissions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// Operations every chain supports.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn kind(&self) -> NetworkKind;

    /// Cheap liveness probe.
    async fn health(&self) -> Result<(), RpcError>;

    /// Balance in whole tokens.
    async fn get_balance(&self, address: &str) -> Result<u64, RpcError>;

    async fn submit_activation(&self, tx: &SignedActivation) -> Result<SubmitReceipt, RpcError>;

    async fn transaction_status(&self, tx_hash: &str) -> Result<TxStatus, RpcError>;
}

/// The chain 1DEV is burned on.
#[async_trait]
pub trait SettlementChain: ChainClient {
    async fn burn_stats(&self) -> Result<BurnStats, RpcError>;
}

/// The chain nodes live on. Authoritative for ownership.
#[async_trait]
pub trait NativeChain: ChainClient {
    async fn network_info(&self) -> Result<NetworkInfo, RpcError>;

    /// `None` if the node is unknown.
    async fn get_node_owner(&self, node_id: &str) -> Result<Option<NodeOwnership>, RpcError>;

    /// Living nodes owned by `owner`.
    async fn get_wallet_nodes(&self, owner: &str) -> Result<Vec<String>, RpcError>;

    async fn submit_transfer(&self, request: &TransferRequest) -> Result<SubmitReceipt, RpcError>;
}
