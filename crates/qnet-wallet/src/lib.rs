//! QNet Wallet
//!
//! Self-custodial wallet for the QNet settlement and native chains.
//!
//! ```text
//! QNetDualWallet ──► SecureKeyManager      (qnet-core)
//!        │       ──► DualNetworkManager    (qnet-network)
//!        │       ──► ActivationProtocol    (qnet-activation)
//!        │       ──► OwnershipManager      (qnet-activation)
//!        ▼
//!    EventBus ──► listeners
//! ```
//!
//! Configuration comes from TOML ([`WalletConfig`]); the chains, bridge,
//! storage and clock are injected through [`WalletServices`].

pub mod config;
pub mod error;
pub mod events;
pub mod wallet;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::WalletConfig;
pub use error::{ErrorKind, WalletError};
pub use events::{EventBus, LockReason, WalletEvent};
pub use wallet::{Balances, CreatedWallet, QNetDualWallet, VaultSigner, WalletServices};

pub use qnet_core::seed::WordCount;
pub use qnet_core::NetworkKind;
pub use qnet_network::NodeType;
