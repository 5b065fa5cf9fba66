//! QNet Network
//!
//! Remote-chain plumbing for the dual wallet:
//! - [`rpc`]: async capability traits for the settlement and native chains
//! - [`pricing`]: Phase 1 burn tiers and Phase 2 node pricing
//! - [`binding`]: per-network state, active network, cached phase detection
//!
//! The chains are the source of truth. Nothing here persists state.

pub mod binding;
pub mod pricing;
pub mod rpc;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use binding::{detect_phase, Capability, DualNetworkManager, NetworkState, PhaseSnapshot};
pub use pricing::{ActivationQuote, NodeType, PaymentMethod, Phase};
pub use rpc::{
    ActivationPayload, BurnStats, ChainClient, NativeChain, NetworkInfo, NodeOwnership, NodeStatus,
    RpcError, SettlementChain, SignedActivation, SubmitReceipt, TransferRequest, TxStatus,
};
