//! Test doubles for the activation layer

use async_trait::async_trait;
use sha3::{Digest, Sha3_256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use qnet_core::ManualClock;
use qnet_network::testing::{MockNativeChain, MockSettlementChain};
use qnet_network::{ActivationPayload, DualNetworkManager, NodeType, SignedActivation};

use crate::bridge::{ActivationBridge, ActivationBridgeClient, BridgeError, BridgeRequest, BridgeResponse};
use crate::machine::{
    ActivationConfig, ActivationProtocol, ActivationRequest, ActivationSigner, SignerError,
};
use crate::ownership::{OwnershipManager, DEFAULT_OWNERSHIP_TTL, DEFAULT_TRANSFER_WINDOW};
use crate::record::ActivationStore;
use crate::retry::RetryPolicy;

pub const ALICE: &str = "leader monkey parrot ring guide accident before fence cannon height naive bean";
pub const BOB: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

/// Native chain genesis used by the harness: one year before the default
/// [`ManualClock`] start.
pub const GENESIS_SECS: u64 = 1_735_689_600 - 365 * 24 * 60 * 60;

#[derive(Default)]
struct BridgeState {
    failures: VecDeque<BridgeError>,
    rejections: HashMap<String, String>,
    calls: u32,
    requests: Vec<BridgeRequest>,
    hang: bool,
}

/// In-memory bridge issuing deterministic codes.
#[derive(Default)]
pub struct MockBridge {
    state: Mutex<BridgeState>,
}

impl MockBridge {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Code issued for a burn: `QNET-XXXX-XXXX-XXXX` from the burn hash.
    pub fn code_for(burn_tx_hash: &str) -> String {
        let digest = hex::encode_upper(Sha3_256::digest(burn_tx_hash.as_bytes()));
        format!("QNET-{}-{}-{}", &digest[0..4], &digest[4..8], &digest[8..12])
    }

    /// Queue an error for the next request.
    pub fn fail_next(&self, error: BridgeError) {
        self.state().failures.push_back(error);
    }

    /// Every request for `burn_tx_hash` is rejected with `reason`.
    pub fn reject_burn(&self, burn_tx_hash: &str, reason: &str) {
        self.state()
            .rejections
            .insert(burn_tx_hash.to_string(), reason.to_string());
    }

    /// While set, requests never complete.
    pub fn set_hang(&self, hang: bool) {
        self.state().hang = hang;
    }

    pub fn calls(&self) -> u32 {
        self.state().calls
    }

    pub fn requests(&self) -> Vec<BridgeRequest> {
        self.state().requests.clone()
    }
}

#[async_trait]
impl ActivationBridge for MockBridge {
    async fn request_activation(
        &self,
        request: &BridgeRequest,
    ) -> Result<BridgeResponse, BridgeError> {
        let outcome = {
            let mut state = self.state();
            state.calls += 1;
            state.requests.push(request.clone());
            if state.hang {
                None
            } else if let Some(e) = state.failures.pop_front() {
                Some(Err(e))
            } else if let Some(reason) = state.rejections.get(&request.burn_tx_hash) {
                Some(Err(BridgeError::Rejected(reason.clone())))
            } else {
                Some(Ok(BridgeResponse {
                    activation_code: Self::code_for(&request.burn_tx_hash),
                    expires_at: None,
                }))
            }
        };
        match outcome {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

/// Signs with a fixed set of account keys.
pub struct KeySigner {
    keys: qnet_core::AccountKeys,
}

impl KeySigner {
    pub fn new(keys: qnet_core::AccountKeys) -> Self {
        Self { keys }
    }

    pub fn from_mnemonic(mnemonic: &str) -> Self {
        let mnemonic = match qnet_core::seed::parse_mnemonic(mnemonic) {
            Ok(m) => m,
            Err(e) => panic!("test mnemonic: {}", e),
        };
        let seed = qnet_core::seed::derive_seed(&mnemonic, "");
        match qnet_core::AccountKeys::derive(&seed, 0) {
            Ok(keys) => Self::new(keys),
            Err(e) => panic!("test keys: {}", e),
        }
    }

    pub fn account(&self) -> qnet_core::Account {
        match self.keys.account() {
            Ok(account) => account,
            Err(e) => panic!("test account: {}", e),
        }
    }
}

impl ActivationSigner for KeySigner {
    fn sign(&self, payload: &ActivationPayload) -> Result<SignedActivation, SignerError> {
        let network = payload.network();
        let public_key = self.keys.public_key(network)?;
        let signature = self.keys.sign(network, &payload.signing_bytes())?;
        Ok(SignedActivation {
            payload: payload.clone(),
            public_key: hex::encode(public_key),
            signature: hex::encode(signature),
        })
    }
}

/// A fully wired protocol over in-memory chains and bridge.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub settlement: Arc<MockSettlementChain>,
    pub native: Arc<MockNativeChain>,
    pub bridge: Arc<MockBridge>,
    pub store: Arc<ActivationStore>,
    pub network: Arc<DualNetworkManager>,
    pub ownership: Arc<OwnershipManager>,
    pub protocol: ActivationProtocol,
}

impl Harness {
    /// Fast retries and no confirmation delay.
    pub fn test_config() -> ActivationConfig {
        ActivationConfig {
            retry: RetryPolicy::immediate(3),
            poll_interval: Duration::ZERO,
            max_polls: 5,
        }
    }

    pub fn new(store: ActivationStore, config: ActivationConfig) -> Self {
        let clock = Arc::new(ManualClock::default());
        let settlement = Arc::new(MockSettlementChain::new());
        let native = Arc::new(MockNativeChain::new(GENESIS_SECS));
        let bridge = Arc::new(MockBridge::new());
        let store = Arc::new(store);
        let network = Arc::new(DualNetworkManager::new(
            settlement.clone(),
            native.clone(),
            clock.clone(),
            Duration::from_secs(120),
        ));
        let ownership = Arc::new(OwnershipManager::new(
            native.clone(),
            store.clone(),
            clock.clone(),
            DEFAULT_OWNERSHIP_TTL,
            DEFAULT_TRANSFER_WINDOW,
        ));
        let protocol = ActivationProtocol::new(
            network.clone(),
            ownership.clone(),
            Arc::new(ActivationBridgeClient::new(bridge.clone(), config.retry)),
            store.clone(),
            clock.clone(),
            config,
        );
        Self {
            clock,
            settlement,
            native,
            bridge,
            store,
            network,
            ownership,
            protocol,
        }
    }

    /// A second protocol over the same chains and bridge, as after a restart.
    pub fn restart(&self, store: ActivationStore, config: ActivationConfig) -> ActivationProtocol {
        let store = Arc::new(store);
        let ownership = Arc::new(OwnershipManager::new(
            self.native.clone(),
            store.clone(),
            self.clock.clone(),
            DEFAULT_OWNERSHIP_TTL,
            DEFAULT_TRANSFER_WINDOW,
        ));
        ActivationProtocol::new(
            self.network.clone(),
            ownership,
            Arc::new(ActivationBridgeClient::new(self.bridge.clone(), config.retry)),
            store,
            self.clock.clone(),
            config,
        )
    }

    /// Nothing burned yet: Phase 1 at the base price.
    pub fn phase_one() -> Self {
        Self::new(ActivationStore::in_memory(), Self::test_config())
    }

    /// 95% burned: Phase 2.
    pub fn phase_two() -> Self {
        let h = Self::phase_one();
        h.settlement.set_burn_stats(950_000_000, 1_000_000_000);
        h
    }

    pub fn signer(&self, mnemonic: &str) -> KeySigner {
        KeySigner::from_mnemonic(mnemonic)
    }

    pub fn account(&self, mnemonic: &str) -> qnet_core::Account {
        self.signer(mnemonic).account()
    }

    /// Activation request owned by the mnemonic's native address, paid from
    /// its settlement address.
    pub fn request(&self, mnemonic: &str, node_type: NodeType) -> ActivationRequest {
        let account = self.account(mnemonic);
        ActivationRequest {
            owner: account.addresses.native,
            settlement_source: Some(account.addresses.settlement),
            node_type,
        }
    }
}
