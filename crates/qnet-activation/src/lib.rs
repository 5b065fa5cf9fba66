//! QNet Activation
//!
//! Node activation for the dual wallet:
//! - [`machine`]: the Phase 1 / Phase 2 activation protocol
//! - [`bridge`]: burn proof to activation code exchange
//! - [`ownership`]: one node per wallet, ownership queries and transfers
//! - [`record`]: persisted activation records and in-flight state
//!
//! The native chain is authoritative for nodes and owners. Local records are
//! written after confirmation and reconciled against the chain.

pub mod bridge;
pub mod machine;
pub mod ownership;
pub mod record;
pub mod retry;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use bridge::{
    ActivationBridge, ActivationBridgeClient, BridgeError, BridgeRequest, BridgeResponse,
    HttpBridge,
};
pub use machine::{
    ActivationConfig, ActivationError, ActivationProtocol, ActivationRequest, ActivationSigner,
    ReconcileReport, SignerError, TransitionObserver,
};
pub use ownership::{OwnershipError, OwnershipManager, TransferAuthorization};
pub use record::{
    ActivationRecord, ActivationState, ActivationStore, OwnershipEvent, OwnershipRecord,
    PendingActivation, StoreError,
};
pub use retry::RetryPolicy;
