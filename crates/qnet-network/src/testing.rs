//! In-memory chains for tests
//!
//! Both mocks check signatures with the real key schemes, keep balances and
//! node ownership, and accept injected failures. A queued failure is
//! returned by the next call of any kind.

use async_trait::async_trait;
use sha3::{Digest, Sha3_256};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use qnet_core::NetworkKind;

use crate::rpc::{
    ActivationPayload, BurnStats, ChainClient, NativeChain, NetworkInfo, NodeOwnership, NodeStatus,
    RpcError, SettlementChain, SignedActivation, SubmitReceipt, TransferRequest, TxStatus,
};

struct TxEntry {
    final_status: TxStatus,
    polls_left: u32,
}

/// Bookkeeping shared by both mocks.
#[derive(Default)]
struct Ledger {
    unhealthy: bool,
    failures: VecDeque<RpcError>,
    balances: HashMap<String, u64>,
    txs: HashMap<String, TxEntry>,
    pending_polls: u32,
    next_tx_failure: Option<String>,
    counter: u64,
    submissions: Vec<SignedActivation>,
}

impl Ledger {
    fn take_failure(&mut self) -> Result<(), RpcError> {
        match self.failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn health(&mut self) -> Result<(), RpcError> {
        self.take_failure()?;
        if self.unhealthy {
            return Err(RpcError::Unavailable("connection refused".into()));
        }
        Ok(())
    }

    fn new_tx(&mut self, seed: &str) -> String {
        self.counter += 1;
        let mut hasher = Sha3_256::new();
        hasher.update(seed.as_bytes());
        hasher.update(self.counter.to_be_bytes());
        let hash = hex::encode(hasher.finalize());

        let final_status = match self.next_tx_failure.take() {
            Some(reason) => TxStatus::Failed(reason),
            None => TxStatus::Confirmed,
        };
        self.txs.insert(
            hash.clone(),
            TxEntry {
                final_status,
                polls_left: self.pending_polls,
            },
        );
        hash
    }

    fn status(&mut self, tx_hash: &str) -> Result<TxStatus, RpcError> {
        self.take_failure()?;
        let entry = self
            .txs
            .get_mut(tx_hash)
            .ok_or_else(|| RpcError::Rejected(format!("unknown transaction {}", tx_hash)))?;
        if entry.polls_left > 0 {
            entry.polls_left -= 1;
            return Ok(TxStatus::Pending);
        }
        Ok(entry.final_status.clone())
    }

    fn check_signature(&self, tx: &SignedActivation) -> Result<(), RpcError> {
        if !tx.verify() || !tx.signed_by_signer() {
            return Err(RpcError::Rejected("invalid signature".into()));
        }
        Ok(())
    }

    fn debit(&mut self, address: &str, amount: u64, symbol: &str) -> Result<(), RpcError> {
        let balance = self.balances.entry(address.to_string()).or_insert(0);
        if *balance < amount {
            return Err(RpcError::Rejected(format!("insufficient {} balance", symbol)));
        }
        *balance -= amount;
        Ok(())
    }
}

macro_rules! ledger_controls {
    () => {
        fn state(&self) -> MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Queue an error for the next call.
        pub fn fail_next(&self, error: RpcError) {
            self.state().ledger.failures.push_back(error);
        }

        pub fn set_healthy(&self, healthy: bool) {
            self.state().ledger.unhealthy = !healthy;
        }

        pub fn set_balance(&self, address: &str, amount: u64) {
            self.state()
                .ledger
                .balances
                .insert(address.to_string(), amount);
        }

        pub fn balance(&self, address: &str) -> u64 {
            self.state()
                .ledger
                .balances
                .get(address)
                .copied()
                .unwrap_or(0)
        }

        /// New transactions report `Pending` this many times before settling.
        pub fn set_pending_polls(&self, polls: u32) {
            self.state().ledger.pending_polls = polls;
        }

        /// The next accepted transaction will finally report `Failed(reason)`.
        pub fn fail_next_tx(&self, reason: &str) {
            self.state().ledger.next_tx_failure = Some(reason.to_string());
        }

        /// Every activation accepted so far.
        pub fn submissions(&self) -> Vec<SignedActivation> {
            self.state().ledger.submissions.clone()
        }
    };
}

/// State of one mock chain. Settlement mocks only use the ledger and stats.
struct Inner {
    ledger: Ledger,
    stats: BurnStats,
    genesis_timestamp_secs: u64,
    active_nodes: u64,
    nodes: BTreeMap<String, NodeOwnership>,
    used_codes: HashSet<String>,
    transfers: Vec<TransferRequest>,
}

impl Inner {
    fn new(genesis_timestamp_secs: u64) -> Self {
        Self {
            ledger: Ledger::default(),
            stats: BurnStats {
                total_burned: 0,
                total_supply: 1_000_000_000,
            },
            genesis_timestamp_secs,
            active_nodes: 0,
            nodes: BTreeMap::new(),
            used_codes: HashSet::new(),
            transfers: Vec::new(),
        }
    }

    fn living_nodes(&self, owner: &str) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.owner == owner && n.status.is_living())
            .map(|n| n.node_id.clone())
            .collect()
    }

    fn register_node(&mut self, node_id: String, owner: &str) {
        self.nodes.insert(
            node_id.clone(),
            NodeOwnership {
                node_id,
                owner: owner.to_string(),
                status: NodeStatus::Active,
            },
        );
        self.active_nodes += 1;
    }
}

// ============================================================================
// Settlement
// ============================================================================

/// In-memory settlement chain: balances, burns and supply statistics.
pub struct MockSettlementChain {
    inner: Mutex<Inner>,
}

impl Default for MockSettlementChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSettlementChain {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new(0)),
        }
    }

    ledger_controls!();

    pub fn set_burn_stats(&self, total_burned: u64, total_supply: u64) {
        self.state().stats = BurnStats {
            total_burned,
            total_supply,
        };
    }

    pub fn burn_totals(&self) -> BurnStats {
        self.state().stats
    }
}

#[async_trait]
impl ChainClient for MockSettlementChain {
    fn kind(&self) -> NetworkKind {
        NetworkKind::Settlement
    }

    async fn health(&self) -> Result<(), RpcError> {
        self.state().ledger.health()
    }

    async fn get_balance(&self, address: &str) -> Result<u64, RpcError> {
        let mut inner = self.state();
        inner.ledger.take_failure()?;
        Ok(inner.ledger.balances.get(address).copied().unwrap_or(0))
    }

    async fn submit_activation(&self, tx: &SignedActivation) -> Result<SubmitReceipt, RpcError> {
        let mut inner = self.state();
        inner.ledger.take_failure()?;
        inner.ledger.check_signature(tx)?;

        let ActivationPayload::Burn { source, amount, .. } = &tx.payload else {
            return Err(RpcError::Rejected(
                "only burns are accepted on the settlement chain".into(),
            ));
        };
        inner.ledger.debit(source, *amount, "1DEV")?;
        inner.stats.total_burned += amount;

        let tx_hash = inner.ledger.new_tx(&tx.signature);
        inner.ledger.submissions.push(tx.clone());
        Ok(SubmitReceipt {
            tx_hash,
            node_id: None,
        })
    }

    async fn transaction_status(&self, tx_hash: &str) -> Result<TxStatus, RpcError> {
        self.state().ledger.status(tx_hash)
    }
}

#[async_trait]
impl SettlementChain for MockSettlementChain {
    async fn burn_stats(&self) -> Result<BurnStats, RpcError> {
        let mut inner = self.state();
        inner.ledger.take_failure()?;
        Ok(inner.stats)
    }
}

// ============================================================================
// Native
// ============================================================================

/// In-memory native chain: QNC balances, nodes and their owners.
pub struct MockNativeChain {
    inner: Mutex<Inner>,
}

impl MockNativeChain {
    pub fn new(genesis_timestamp_secs: u64) -> Self {
        Self {
            inner: Mutex::new(Inner::new(genesis_timestamp_secs)),
        }
    }

    ledger_controls!();

    pub fn set_active_nodes(&self, active_nodes: u64) {
        self.state().active_nodes = active_nodes;
    }

    /// Seed a node directly, bypassing activation.
    pub fn insert_node(&self, node_id: &str, owner: &str, status: NodeStatus) {
        self.state().nodes.insert(
            node_id.to_string(),
            NodeOwnership {
                node_id: node_id.to_string(),
                owner: owner.to_string(),
                status,
            },
        );
    }

    pub fn node(&self, node_id: &str) -> Option<NodeOwnership> {
        self.state().nodes.get(node_id).cloned()
    }

    pub fn nodes_owned_by(&self, owner: &str) -> Vec<String> {
        self.state().living_nodes(owner)
    }

    pub fn transfers(&self) -> Vec<TransferRequest> {
        self.state().transfers.clone()
    }

    /// Node id the chain assigns when `code` is redeemed.
    pub fn node_id_for_code(code: &str) -> String {
        format!("node_{}", &hex::encode(Sha3_256::digest(code.as_bytes()))[..16])
    }
}

#[async_trait]
impl ChainClient for MockNativeChain {
    fn kind(&self) -> NetworkKind {
        NetworkKind::Native
    }

    async fn health(&self) -> Result<(), RpcError> {
        self.state().ledger.health()
    }

    async fn get_balance(&self, address: &str) -> Result<u64, RpcError> {
        let mut inner = self.state();
        inner.ledger.take_failure()?;
        Ok(inner.ledger.balances.get(address).copied().unwrap_or(0))
    }

    async fn submit_activation(&self, tx: &SignedActivation) -> Result<SubmitReceipt, RpcError> {
        let mut inner = self.state();
        inner.ledger.take_failure()?;
        inner.ledger.check_signature(tx)?;

        let (owner, node_id) = match &tx.payload {
            ActivationPayload::ActivationCode { code, owner, .. } => {
                if inner.used_codes.contains(code) {
                    return Err(RpcError::Rejected("activation code already used".into()));
                }
                (owner, Self::node_id_for_code(code))
            }
            ActivationPayload::NativeSpend { owner, amount, .. } => {
                if !inner.living_nodes(owner).is_empty() {
                    return Err(RpcError::Rejected("wallet already owns an active node".into()));
                }
                inner.ledger.debit(owner, *amount, "QNC")?;
                let node_id = format!("node_{}", &tx.signature[..16.min(tx.signature.len())]);
                (owner, node_id)
            }
            ActivationPayload::Burn { .. } => {
                return Err(RpcError::Rejected(
                    "burns are not accepted on the native chain".into(),
                ))
            }
        };
        if !inner.living_nodes(owner).is_empty() {
            return Err(RpcError::Rejected("wallet already owns an active node".into()));
        }

        if let ActivationPayload::ActivationCode { code, .. } = &tx.payload {
            inner.used_codes.insert(code.clone());
        }
        inner.register_node(node_id.clone(), owner);
        let tx_hash = inner.ledger.new_tx(&tx.signature);
        inner.ledger.submissions.push(tx.clone());
        Ok(SubmitReceipt {
            tx_hash,
            node_id: Some(node_id),
        })
    }

    async fn transaction_status(&self, tx_hash: &str) -> Result<TxStatus, RpcError> {
        self.state().ledger.status(tx_hash)
    }
}

#[async_trait]
impl NativeChain for MockNativeChain {
    async fn network_info(&self) -> Result<NetworkInfo, RpcError> {
        let mut inner = self.state();
        inner.ledger.take_failure()?;
        Ok(NetworkInfo {
            genesis_timestamp_secs: inner.genesis_timestamp_secs,
            active_nodes: inner.active_nodes,
        })
    }

    async fn get_node_owner(&self, node_id: &str) -> Result<Option<NodeOwnership>, RpcError> {
        let mut inner = self.state();
        inner.ledger.take_failure()?;
        Ok(inner.nodes.get(node_id).cloned())
    }

    async fn get_wallet_nodes(&self, owner: &str) -> Result<Vec<String>, RpcError> {
        let mut inner = self.state();
        inner.ledger.take_failure()?;
        Ok(inner.living_nodes(owner))
    }

    async fn submit_transfer(&self, request: &TransferRequest) -> Result<SubmitReceipt, RpcError> {
        let mut inner = self.state();
        inner.ledger.take_failure()?;

        let scheme = NetworkKind::Native.scheme();
        let (Ok(pk), Ok(sig)) = (hex::decode(&request.public_key), hex::decode(&request.signature))
        else {
            return Err(RpcError::Rejected("invalid signature encoding".into()));
        };
        if !scheme.verify(&pk, request.message().as_bytes(), &sig)
            || scheme.address_from_public_key(&pk).ok().as_deref() != Some(request.from.as_str())
        {
            return Err(RpcError::Rejected("invalid transfer signature".into()));
        }
        if !inner.living_nodes(&request.to).is_empty() {
            return Err(RpcError::Rejected("destination already owns a node".into()));
        }
        let node = inner
            .nodes
            .get_mut(&request.node_id)
            .ok_or_else(|| RpcError::Rejected("unknown node".into()))?;
        if node.owner != request.from || !node.status.is_living() {
            return Err(RpcError::Rejected("sender does not own the node".into()));
        }
        node.owner = request.to.clone();

        let tx_hash = inner.ledger.new_tx(&request.signature);
        inner.transfers.push(request.clone());
        Ok(SubmitReceipt {
            tx_hash,
            node_id: Some(request.node_id.clone()),
        })
    }
}
