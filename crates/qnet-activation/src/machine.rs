//! Node activation state machine
//!
//! Drives one activation from quote to confirmed node, persisting every
//! transition so a crashed or cancelled run can be picked up again.
//!
//! # Phase 1 (burn)
//!
//! 1. Burn the tier cost of 1DEV on the settlement chain
//! 2. Wait for the burn to confirm
//! 3. Trade the burn proof for an activation code at the bridge
//! 4. Redeem the code on the native chain and wait for confirmation
//!
//! # Phase 2 (native spend)
//!
//! Re-check single-node enforcement, spend QNC on the native chain, wait for
//! confirmation.
//!
//! Transport failures are retried in place. A rejection from a chain or the
//! bridge moves the activation to `Failed` with the remote's reason; there is
//! no fallback to another phase or node type. A local [`ActivationRecord`] is
//! only written once the native transaction is confirmed.

use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use qnet_core::keys::{validate_eon_address, validate_settlement_address};
use qnet_core::Clock;
use qnet_network::{
    ActivationPayload, ActivationQuote, ChainClient, DualNetworkManager, NodeStatus, NodeType,
    Phase, RpcError, SignedActivation, TxStatus,
};

use crate::bridge::{ActivationBridgeClient, BridgeError, BridgeRequest};
use crate::ownership::{short, OwnershipError, OwnershipManager};
use crate::record::{ActivationRecord, ActivationState, ActivationStore, PendingActivation, StoreError};
use crate::retry::RetryPolicy;

pub use crate::record::CANCELLED;

/// Errors from the activation protocol
#[derive(Error, Debug)]
pub enum ActivationError {
    #[error(transparent)]
    Ownership(OwnershipError),

    /// Transient failure. The activation stays pending and can be resumed.
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// A chain or the bridge refused. The activation is `Failed`.
    #[error("{0}")]
    Rejected(String),

    #[error("Signing failed: {0}")]
    Signer(SignerError),

    #[error("Invalid activation request: {0}")]
    InvalidRequest(String),

    #[error("Activation already in progress: {0}")]
    InProgress(String),

    #[error("Unknown activation: {0}")]
    NotFound(String),

    #[error("Activation failed: {0}")]
    Failed(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ActivationError {
    /// Reason to record when this error ends the activation.
    fn terminal_reason(&self) -> Option<String> {
        match self {
            Self::Rejected(reason) => Some(reason.clone()),
            Self::Ownership(e @ OwnershipError::NodeLimitExceeded { .. }) => Some(e.to_string()),
            _ => None,
        }
    }
}

impl From<RpcError> for ActivationError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Rejected(reason) => Self::Rejected(reason),
            other => Self::RemoteUnavailable(other.to_string()),
        }
    }
}

impl From<BridgeError> for ActivationError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::Rejected(reason) => Self::Rejected(reason),
            other => Self::RemoteUnavailable(other.to_string()),
        }
    }
}

impl From<OwnershipError> for ActivationError {
    fn from(e: OwnershipError) -> Self {
        match e {
            OwnershipError::Rpc(e) => e.into(),
            OwnershipError::Store(e) => Self::Store(e),
            other => Self::Ownership(other),
        }
    }
}

/// Error returned by an [`ActivationSigner`]. Callers may downcast it.
pub type SignerError = Box<dyn std::error::Error + Send + Sync>;

/// Signs activation payloads with the key of the payload's signer.
pub trait ActivationSigner: Send + Sync {
    fn sign(&self, payload: &ActivationPayload) -> Result<SignedActivation, SignerError>;
}

/// Notified after every persisted transition.
pub trait TransitionObserver: Send + Sync {
    fn on_transition(&self, pending: &PendingActivation);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationRequest {
    /// Native address that will own the node
    pub owner: String,
    /// Settlement address paying the burn. Required in Phase 1.
    pub settlement_source: Option<String>,
    pub node_type: NodeType,
}

#[derive(Debug, Clone, Copy)]
pub struct ActivationConfig {
    pub retry: RetryPolicy,
    /// Delay between confirmation polls
    pub poll_interval: Duration,
    /// Polls before a transaction counts as unconfirmed for now
    pub max_polls: u32,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(2),
            max_polls: 90,
        }
    }
}

/// Outcome of [`ActivationProtocol::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Local records whose status changed to match the chain
    pub updated: Vec<(String, NodeStatus)>,
    /// Pending activations finished from their confirmed native tx
    pub completed: Vec<String>,
    /// Pending activations whose native tx failed
    pub failed: Vec<String>,
    /// Nodes the chain assigns to the owner that are not recorded locally
    pub untracked: Vec<String>,
}

/// Marks the activation cancelled if the driving future is dropped before
/// the native transaction exists.
struct CancelGuard {
    store: Arc<ActivationStore>,
    clock: Arc<dyn Clock>,
    id: String,
    armed: bool,
}

impl CancelGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(mut pending) = self.store.pending(&self.id) else {
            return;
        };
        if pending.state.is_terminal() || pending.target_tx_hash.is_some() {
            return;
        }
        log::warn!(
            "activation {} cancelled in state {}",
            self.id,
            pending.state.name()
        );
        pending.state = ActivationState::Failed(CANCELLED.to_string());
        pending.updated_at = self.clock.now_secs();
        if let Err(e) = self.store.put_pending(&pending) {
            log::error!("failed to record cancellation of {}: {}", self.id, e);
        }
    }
}

/// The activation protocol.
pub struct ActivationProtocol {
    network: Arc<DualNetworkManager>,
    ownership: Arc<OwnershipManager>,
    bridge: Arc<ActivationBridgeClient>,
    store: Arc<ActivationStore>,
    clock: Arc<dyn Clock>,
    config: ActivationConfig,
    observer: Option<Arc<dyn TransitionObserver>>,
}

impl ActivationProtocol {
    pub fn new(
        network: Arc<DualNetworkManager>,
        ownership: Arc<OwnershipManager>,
        bridge: Arc<ActivationBridgeClient>,
        store: Arc<ActivationStore>,
        clock: Arc<dyn Clock>,
        config: ActivationConfig,
    ) -> Self {
        Self {
            network,
            ownership,
            bridge,
            store,
            clock,
            config,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransitionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn store(&self) -> &Arc<ActivationStore> {
        &self.store
    }

    pub fn ownership(&self) -> &Arc<OwnershipManager> {
        &self.ownership
    }

    pub fn network(&self) -> &Arc<DualNetworkManager> {
        &self.network
    }

    /// Price an activation with freshly fetched network statistics.
    pub async fn quote(&self, node_type: NodeType) -> Result<ActivationQuote, ActivationError> {
        Ok(self.network.activation_quote(node_type, true).await?)
    }

    /// Start a new activation and drive it to completion.
    pub async fn start(
        &self,
        request: ActivationRequest,
        signer: &dyn ActivationSigner,
    ) -> Result<ActivationRecord, ActivationError> {
        if !validate_eon_address(&request.owner) {
            return Err(ActivationError::InvalidRequest(format!(
                "{} is not a valid native address",
                request.owner
            )));
        }
        if let Some(running) = self
            .store
            .unfinished()
            .into_iter()
            .find(|p| p.owner == request.owner)
        {
            return Err(ActivationError::InProgress(running.id));
        }

        let quote = self.quote(request.node_type).await?;
        if quote.phase == Phase::One {
            check_settlement_source(request.settlement_source.as_deref())?;
        }
        self.ownership
            .enforce_before_activation(&request.owner, quote.phase)
            .await?;

        let now = self.clock.now_secs();
        let pending = PendingActivation {
            id: new_activation_id(),
            owner: request.owner,
            settlement_source: request.settlement_source,
            node_type: quote.node_type,
            phase: quote.phase,
            method: quote.method,
            cost: quote.cost,
            state: ActivationState::Idle,
            burn_tx_hash: None,
            activation_code: None,
            target_tx_hash: None,
            node_id: None,
            created_at: now,
            updated_at: now,
        };
        self.store.put_pending(&pending)?;
        self.notify(&pending);
        log::info!(
            "activation {} started: {} {} node for {} ({} {})",
            pending.id,
            pending.phase,
            pending.node_type.as_str(),
            short(&pending.owner),
            pending.cost,
            quote.token
        );

        self.drive(pending, signer).await
    }

    /// Continue a persisted activation from where it stopped.
    ///
    /// An activation that has not paid yet is priced again against the
    /// current phase before anything is submitted. An activation cancelled
    /// after its burn was submitted is picked up again from the burn; any
    /// other failure is final.
    pub async fn resume(
        &self,
        id: &str,
        signer: &dyn ActivationSigner,
    ) -> Result<ActivationRecord, ActivationError> {
        let mut pending = self
            .store
            .pending(id)
            .ok_or_else(|| ActivationError::NotFound(id.to_string()))?;

        match &pending.state {
            ActivationState::Active => {
                return pending
                    .activation_code
                    .as_deref()
                    .and_then(|code| self.store.record_by_code(code))
                    .ok_or_else(|| ActivationError::NotFound(id.to_string()));
            }
            ActivationState::Failed(reason)
                if reason == CANCELLED && pending.burn_tx_hash.is_some() =>
            {
                log::info!("activation {} resumed after cancellation", id);
                self.transition(&mut pending, ActivationState::BurnSubmitted)?;
            }
            ActivationState::Failed(reason) => return Err(ActivationError::Failed(reason.clone())),
            ActivationState::Idle => {
                if let Err(e) = self.reprice(&mut pending).await {
                    let reason = match &e {
                        ActivationError::InvalidRequest(reason) => Some(reason.clone()),
                        other => other.terminal_reason(),
                    };
                    if let Some(reason) = reason {
                        log::warn!("activation {} failed: {}", id, reason);
                        self.transition(&mut pending, ActivationState::Failed(reason))?;
                    }
                    return Err(e);
                }
            }
            _ => {}
        }
        self.drive(pending, signer).await
    }

    /// Quote an activation that has not paid yet against the current
    /// network and check the owner is still free to activate.
    async fn reprice(&self, pending: &mut PendingActivation) -> Result<(), ActivationError> {
        let quote = self.quote(pending.node_type).await?;
        if quote.phase == Phase::One {
            check_settlement_source(pending.settlement_source.as_deref())?;
        }
        self.ownership
            .enforce_before_activation(&pending.owner, quote.phase)
            .await?;

        if (quote.phase, quote.method, quote.cost) != (pending.phase, pending.method, pending.cost) {
            log::info!(
                "activation {} repriced: {} {} -> {} {}",
                pending.id,
                pending.phase,
                pending.cost,
                quote.phase,
                quote.cost
            );
            pending.phase = quote.phase;
            pending.method = quote.method;
            pending.cost = quote.cost;
            pending.updated_at = self.clock.now_secs();
            self.store.put_pending(pending)?;
            self.notify(pending);
        }
        Ok(())
    }

    /// Activations that have not reached a terminal state.
    pub fn unfinished(&self) -> Vec<PendingActivation> {
        self.store.unfinished()
    }

    async fn drive(
        &self,
        mut pending: PendingActivation,
        signer: &dyn ActivationSigner,
    ) -> Result<ActivationRecord, ActivationError> {
        let mut guard = CancelGuard {
            store: self.store.clone(),
            clock: self.clock.clone(),
            id: pending.id.clone(),
            armed: true,
        };
        let result = self.run(&mut pending, signer).await;
        guard.disarm();

        if let Err(e) = &result {
            match e.terminal_reason() {
                Some(reason) => {
                    log::warn!("activation {} failed: {}", pending.id, reason);
                    self.transition(&mut pending, ActivationState::Failed(reason))?;
                }
                None => log::warn!(
                    "activation {} paused in state {}: {}",
                    pending.id,
                    pending.state.name(),
                    e
                ),
            }
        }
        result
    }

    async fn run(
        &self,
        pending: &mut PendingActivation,
        signer: &dyn ActivationSigner,
    ) -> Result<ActivationRecord, ActivationError> {
        loop {
            match pending.state.clone() {
                ActivationState::Idle => match pending.phase {
                    Phase::One => self.submit_burn(pending, signer).await?,
                    Phase::Two => self.submit_native_spend(pending, signer).await?,
                },
                ActivationState::BurnSubmitted => {
                    let burn = required(&pending.burn_tx_hash, "burn tx hash")?;
                    self.wait_confirmed(&**self.network.settlement(), &burn).await?;
                    self.transition(pending, ActivationState::BridgeVerifying)?;
                }
                ActivationState::BridgeVerifying => self.request_code(pending).await?,
                ActivationState::ActivationTokenIssued => {
                    let code = required(&pending.activation_code, "activation code")?;
                    if let Some(record) = self.store.record_by_code(&code) {
                        pending.node_id = Some(record.node_id.clone());
                        pending.target_tx_hash = Some(record.target_tx_hash.clone());
                        self.transition(pending, ActivationState::Active)?;
                        return Ok(record);
                    }
                    self.redeem_code(pending, &code, signer).await?;
                }
                ActivationState::RemoteActivating => {
                    let target = required(&pending.target_tx_hash, "native tx hash")?;
                    self.wait_confirmed(&**self.network.native(), &target).await?;
                    return self.finish(pending).await;
                }
                ActivationState::Active => {
                    let code = required(&pending.activation_code, "activation code")?;
                    return self
                        .store
                        .record_by_code(&code)
                        .ok_or(ActivationError::NotFound(code));
                }
                ActivationState::Failed(reason) => return Err(ActivationError::Failed(reason)),
            }
        }
    }

    async fn submit_burn(
        &self,
        pending: &mut PendingActivation,
        signer: &dyn ActivationSigner,
    ) -> Result<(), ActivationError> {
        let source = required(&pending.settlement_source, "settlement source")?;
        let payload = ActivationPayload::Burn {
            source,
            amount: pending.cost,
            node_type: pending.node_type,
            native_owner: pending.owner.clone(),
        };
        let signed = &signer.sign(&payload).map_err(ActivationError::Signer)?;
        let settlement = self.network.settlement();
        let receipt = self
            .config
            .retry
            .run(
                "burn submission",
                move || settlement.submit_activation(signed),
                RpcError::is_retryable,
            )
            .await?;

        log::info!("activation {}: burn {} submitted", pending.id, receipt.tx_hash);
        pending.burn_tx_hash = Some(receipt.tx_hash);
        self.transition(pending, ActivationState::BurnSubmitted)?;
        Ok(())
    }

    async fn submit_native_spend(
        &self,
        pending: &mut PendingActivation,
        signer: &dyn ActivationSigner,
    ) -> Result<(), ActivationError> {
        self.ownership
            .enforce_before_activation(&pending.owner, Phase::Two)
            .await?;

        let payload = ActivationPayload::NativeSpend {
            owner: pending.owner.clone(),
            amount: pending.cost,
            node_type: pending.node_type,
        };
        let signed = &signer.sign(&payload).map_err(ActivationError::Signer)?;
        let native = self.network.native();
        let receipt = self
            .config
            .retry
            .run(
                "native activation",
                move || native.submit_activation(signed),
                RpcError::is_retryable,
            )
            .await?;

        pending.activation_code = Some(receipt.tx_hash.clone());
        pending.target_tx_hash = Some(receipt.tx_hash);
        pending.node_id = receipt.node_id;
        self.transition(pending, ActivationState::RemoteActivating)?;
        Ok(())
    }

    async fn request_code(&self, pending: &mut PendingActivation) -> Result<(), ActivationError> {
        let burn = required(&pending.burn_tx_hash, "burn tx hash")?;
        let code = match self.store.code_for_burn(&burn) {
            Some(code) => code,
            None => {
                let request = BridgeRequest {
                    burn_tx_hash: burn.clone(),
                    node_type: pending.node_type,
                    native_owner_address: pending.owner.clone(),
                    settlement_source_address: required(
                        &pending.settlement_source,
                        "settlement source",
                    )?,
                };
                let response = self.bridge.activation_code(&request).await?;
                self.store
                    .remember_burn_code(&burn, &response.activation_code)?
            }
        };
        pending.activation_code = Some(code);
        self.transition(pending, ActivationState::ActivationTokenIssued)?;
        Ok(())
    }

    async fn redeem_code(
        &self,
        pending: &mut PendingActivation,
        code: &str,
        signer: &dyn ActivationSigner,
    ) -> Result<(), ActivationError> {
        self.ownership
            .enforce_before_activation(&pending.owner, Phase::One)
            .await?;

        let payload = ActivationPayload::ActivationCode {
            code: code.to_string(),
            node_type: pending.node_type,
            owner: pending.owner.clone(),
        };
        let signed = &signer.sign(&payload).map_err(ActivationError::Signer)?;
        let native = self.network.native();
        let receipt = self
            .config
            .retry
            .run(
                "activation code submission",
                move || native.submit_activation(signed),
                RpcError::is_retryable,
            )
            .await?;

        pending.target_tx_hash = Some(receipt.tx_hash);
        pending.node_id = receipt.node_id;
        self.transition(pending, ActivationState::RemoteActivating)?;
        Ok(())
    }

    /// Poll `tx_hash` until it settles or the poll budget is spent.
    async fn wait_confirmed<C>(&self, chain: &C, tx_hash: &str) -> Result<(), ActivationError>
    where
        C: ChainClient + ?Sized,
    {
        for poll in 1..=self.config.max_polls.max(1) {
            let status = self
                .config
                .retry
                .run(
                    "transaction status",
                    move || chain.transaction_status(tx_hash),
                    RpcError::is_retryable,
                )
                .await?;
            match status {
                TxStatus::Confirmed => return Ok(()),
                TxStatus::Failed(reason) => return Err(ActivationError::Rejected(reason)),
                TxStatus::Pending => {
                    log::debug!("{} tx {} pending (poll {})", chain.kind(), tx_hash, poll);
                    if !self.config.poll_interval.is_zero() {
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
            }
        }
        Err(ActivationError::RemoteUnavailable(format!(
            "{} tx {} not confirmed after {} polls",
            chain.kind(),
            tx_hash,
            self.config.max_polls
        )))
    }

    /// Write the record for a confirmed native transaction.
    async fn finish(&self, pending: &mut PendingActivation) -> Result<ActivationRecord, ActivationError> {
        let node_id = match pending.node_id.clone() {
            Some(node_id) => node_id,
            None => self
                .ownership
                .wallet_nodes(&pending.owner, true)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    ActivationError::RemoteUnavailable("native chain has not assigned a node id".into())
                })?,
        };
        let code = required(&pending.activation_code, "activation code")?;
        let record = ActivationRecord {
            activation_code: code.clone(),
            node_id: node_id.clone(),
            node_type: pending.node_type,
            owner_address: pending.owner.clone(),
            phase: pending.phase,
            method: pending.method,
            cost: pending.cost,
            created_at: self.clock.now_secs(),
            source_tx_hash: pending.burn_tx_hash.clone(),
            target_tx_hash: required(&pending.target_tx_hash, "native tx hash")?,
            status: NodeStatus::Active,
        };
        let record = if self.store.insert_record(record.clone())? {
            record
        } else {
            self.store.record_by_code(&code).unwrap_or(record)
        };

        self.ownership.invalidate_wallet(&pending.owner);
        pending.node_id = Some(node_id);
        self.transition(pending, ActivationState::Active)?;
        log::info!(
            "activation {} complete: node {} owned by {}",
            pending.id,
            record.node_id,
            short(&record.owner_address)
        );
        Ok(record)
    }

    /// Align local state for `owner` with the native chain.
    ///
    /// Local records take the chain's status. Pending activations waiting on
    /// a native transaction are completed or failed from a single status poll.
    pub async fn reconcile(&self, owner: &str) -> Result<ReconcileReport, ActivationError> {
        let mut report = ReconcileReport::default();

        for mut pending in self.store.unfinished() {
            if pending.owner != owner || pending.state != ActivationState::RemoteActivating {
                continue;
            }
            let Some(target) = pending.target_tx_hash.clone() else {
                continue;
            };
            match self.network.native().transaction_status(&target).await? {
                TxStatus::Confirmed => {
                    self.finish(&mut pending).await?;
                    report.completed.push(pending.id.clone());
                }
                TxStatus::Failed(reason) => {
                    self.transition(&mut pending, ActivationState::Failed(reason))?;
                    report.failed.push(pending.id.clone());
                }
                TxStatus::Pending => {}
            }
        }

        for record in self.store.records() {
            if record.owner_address != owner {
                continue;
            }
            let remote = self.ownership.lookup(&record.node_id, true).await?;
            let status = match remote {
                None => NodeStatus::Revoked,
                Some(o) if o.owner != owner => NodeStatus::Transferred,
                Some(o) => o.status,
            };
            if self.store.update_status(&record.node_id, status)? {
                report.updated.push((record.node_id.clone(), status));
            }
        }

        for node in self.ownership.wallet_nodes(owner, true).await? {
            if self.store.record_by_node(&node).is_none() {
                report.untracked.push(node);
            }
        }
        if !report.untracked.is_empty() {
            log::warn!(
                "{} owns {} node(s) with no local record",
                short(owner),
                report.untracked.len()
            );
        }
        Ok(report)
    }

    fn transition(
        &self,
        pending: &mut PendingActivation,
        next: ActivationState,
    ) -> Result<(), StoreError> {
        log::debug!(
            "activation {}: {} -> {}",
            pending.id,
            pending.state.name(),
            next.name()
        );
        pending.state = next;
        pending.updated_at = self.clock.now_secs();
        self.store.put_pending(pending)?;
        self.notify(pending);
        Ok(())
    }

    fn notify(&self, pending: &PendingActivation) {
        if let Some(observer) = &self.observer {
            observer.on_transition(pending);
        }
    }
}

fn check_settlement_source(source: Option<&str>) -> Result<(), ActivationError> {
    match source {
        Some(source) if validate_settlement_address(source) => Ok(()),
        Some(source) => Err(ActivationError::InvalidRequest(format!(
            "{} is not a valid settlement address",
            source
        ))),
        None => Err(ActivationError::InvalidRequest(
            "phase 1 requires a settlement source address".into(),
        )),
    }
}

fn required(value: &Option<String>, what: &str) -> Result<String, ActivationError> {
    value
        .clone()
        .ok_or_else(|| ActivationError::InvalidRequest(format!("missing {}", what)))
}

fn new_activation_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("act_{}", hex::encode(bytes))
}
