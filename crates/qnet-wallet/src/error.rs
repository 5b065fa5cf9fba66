//! Wallet error taxonomy
//!
//! Every lower-layer error is folded into [`WalletError`]. Callers branch on
//! [`WalletError::kind`] and [`WalletError::is_retryable`] rather than on
//! messages. Decryption failures never say why.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use qnet_activation::machine::CANCELLED;
use qnet_activation::{ActivationError, OwnershipError, StoreError};
use qnet_core::{RateLimitAction, RateLimited, VaultError};
use qnet_network::RpcError;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Wallet is locked")]
    Locked,

    #[error("Random number generator produced degenerate output")]
    WeakEntropy,

    #[error("A wallet already exists")]
    AlreadyExists,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Wallet {owner} already owns a node ({})", nodes.join(", "))]
    NodeLimitExceeded { owner: String, nodes: Vec<String> },

    #[error("This wallet does not own node {node_id}")]
    OwnershipMismatch { node_id: String },

    #[error("Invalid transfer target: {0}")]
    InvalidTransferTarget(String),

    #[error("Too many {action} attempts, retry in {} s", retry_after.as_secs().max(1))]
    RateLimited {
        action: RateLimitAction,
        retry_after: Duration,
    },

    /// Transport failure, timeout or exhausted retries.
    #[error("Remote service unavailable: {0}")]
    RemoteUnavailable(String),

    /// Refusal by a chain or the bridge, with its own reason.
    #[error("{0}")]
    RemoteRejected(String),

    /// Another operation holds the vault or the same owner's activation.
    #[error("Another operation is in progress")]
    Busy,

    #[error("Password must be at least {min_length} characters")]
    WeakPassword { min_length: usize },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Stable, serializable classification of a [`WalletError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidCredentials,
    Locked,
    WeakEntropy,
    AlreadyExists,
    NotFound,
    NodeLimitExceeded,
    OwnershipMismatch,
    InvalidTransferTarget,
    RateLimited,
    RemoteUnavailable,
    RemoteRejected,
    Busy,
    WeakPassword,
    InvalidInput,
    Storage,
}

impl WalletError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidCredentials => ErrorKind::InvalidCredentials,
            Self::Locked => ErrorKind::Locked,
            Self::WeakEntropy => ErrorKind::WeakEntropy,
            Self::AlreadyExists => ErrorKind::AlreadyExists,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::NodeLimitExceeded { .. } => ErrorKind::NodeLimitExceeded,
            Self::OwnershipMismatch { .. } => ErrorKind::OwnershipMismatch,
            Self::InvalidTransferTarget(_) => ErrorKind::InvalidTransferTarget,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::RemoteUnavailable(_) => ErrorKind::RemoteUnavailable,
            Self::RemoteRejected(_) => ErrorKind::RemoteRejected,
            Self::Busy => ErrorKind::Busy,
            Self::WeakPassword { .. } => ErrorKind::WeakPassword,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether repeating the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteUnavailable(_))
    }
}

impl From<VaultError> for WalletError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::InvalidCredentials => Self::InvalidCredentials,
            VaultError::Locked => Self::Locked,
            VaultError::WeakEntropy => Self::WeakEntropy,
            VaultError::AlreadyExists => Self::AlreadyExists,
            VaultError::NotFound(what) => Self::NotFound(what.to_string()),
            VaultError::WeakPassword { min_length } => Self::WeakPassword { min_length },
            VaultError::UnknownAccount(index) => Self::NotFound(format!("account {}", index)),
            e @ (VaultError::InvalidMnemonic(_) | VaultError::Key(_)) => {
                Self::InvalidInput(e.to_string())
            }
            VaultError::Crypto(msg) => Self::Storage(msg),
            VaultError::Storage(e) => Self::Storage(e.to_string()),
        }
    }
}

impl From<RpcError> for WalletError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Rejected(reason) => Self::RemoteRejected(reason),
            other => Self::RemoteUnavailable(other.to_string()),
        }
    }
}

impl From<StoreError> for WalletError {
    fn from(e: StoreError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<RateLimited> for WalletError {
    fn from(e: RateLimited) -> Self {
        Self::RateLimited {
            action: e.action,
            retry_after: Duration::from_millis(e.retry_after_ms),
        }
    }
}

impl From<OwnershipError> for WalletError {
    fn from(e: OwnershipError) -> Self {
        match e {
            OwnershipError::NodeLimitExceeded { owner, nodes } => {
                Self::NodeLimitExceeded { owner, nodes }
            }
            OwnershipError::OwnershipMismatch { node_id, .. } => Self::OwnershipMismatch { node_id },
            OwnershipError::InvalidTransferTarget(reason) => Self::InvalidTransferTarget(reason),
            OwnershipError::InvalidAuthorization(reason) => Self::InvalidInput(reason),
            OwnershipError::Rpc(e) => e.into(),
            OwnershipError::Store(e) => e.into(),
        }
    }
}

impl From<ActivationError> for WalletError {
    fn from(e: ActivationError) -> Self {
        match e {
            ActivationError::Ownership(e) => e.into(),
            ActivationError::RemoteUnavailable(msg) => Self::RemoteUnavailable(msg),
            ActivationError::Failed(reason) if reason == CANCELLED => {
                Self::InvalidInput("activation was cancelled before payment".into())
            }
            ActivationError::Rejected(reason) | ActivationError::Failed(reason) => {
                Self::RemoteRejected(reason)
            }
            ActivationError::Signer(e) => match e.downcast::<VaultError>() {
                Ok(vault) => (*vault).into(),
                Err(e) => match e.downcast::<WalletError>() {
                    Ok(wallet) => *wallet,
                    Err(e) => Self::InvalidInput(format!("signing failed: {}", e)),
                },
            },
            ActivationError::InvalidRequest(msg) => Self::InvalidInput(msg),
            ActivationError::InProgress(_) => Self::Busy,
            ActivationError::NotFound(id) => Self::NotFound(format!("activation {}", id)),
            ActivationError::Store(e) => e.into(),
        }
    }
}
