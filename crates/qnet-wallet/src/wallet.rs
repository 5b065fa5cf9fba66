//! The dual-network wallet
//!
//! [`QNetDualWallet`] is the single entry point for callers. It owns the
//! vault session, binds both chains, and runs node activation and transfer
//! on behalf of the primary account (index 0).
//!
//! # Concurrency
//!
//! - The vault sits behind a mutex taken with `try_lock`. A credential
//!   operation that finds it held gets [`WalletError::Busy`].
//! - No vault guard is held across an `.await`. Remote steps sign through
//!   [`VaultSigner`], which takes the guard only for the signature itself.
//! - One activation or transfer per owner at a time. A second attempt while
//!   the first is running gets `Busy`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

use qnet_activation::{
    ActivationBridge, ActivationBridgeClient, ActivationProtocol, ActivationRecord,
    ActivationRequest, ActivationSigner, ActivationStore, HttpBridge, OwnershipManager,
    OwnershipRecord, PendingActivation, ReconcileReport, SignerError, TransferAuthorization,
};
use qnet_core::seed::{generate_mnemonic, WordCount};
use qnet_core::{
    Account, Clock, FileVaultStorage, NetworkKind, RateLimitAction, RateLimiter, SecureKeyManager,
    SystemClock, UnlockOutcome, VaultStorage,
};
use qnet_network::{
    ActivationPayload, ActivationQuote, DualNetworkManager, NativeChain, NetworkState, NodeType,
    PhaseSnapshot, SettlementChain, SignedActivation, SubmitReceipt, TransferRequest,
};

use crate::config::WalletConfig;
use crate::error::WalletError;
use crate::events::{EventBus, LockReason, WalletEvent};

/// Rate-limit identifier for operations against the local vault.
const VAULT_ID: &str = "vault";

/// Account used for node ownership.
const PRIMARY_ACCOUNT: u32 = 0;

/// Everything the wallet talks to.
pub struct WalletServices {
    pub settlement: Arc<dyn SettlementChain>,
    pub native: Arc<dyn NativeChain>,
    pub bridge: Arc<dyn ActivationBridge>,
    pub vault_storage: Box<dyn VaultStorage>,
    pub activation_store: ActivationStore,
    pub clock: Arc<dyn Clock>,
}

impl WalletServices {
    /// File storage under the configured data directory, the HTTP bridge and
    /// the system clock.
    pub fn from_config(
        config: &WalletConfig,
        settlement: Arc<dyn SettlementChain>,
        native: Arc<dyn NativeChain>,
    ) -> anyhow::Result<Self> {
        let bridge = HttpBridge::new(config.network.bridge_url.clone(), config.bridge_timeout())
            .with_context(|| "Failed to set up the bridge client")?;
        let store_path = config.activation_store_path();
        let activation_store = ActivationStore::open(&store_path).with_context(|| {
            format!("Failed to open activation store: {}", store_path.display())
        })?;
        Ok(Self {
            settlement,
            native,
            bridge: Arc::new(bridge),
            vault_storage: Box::new(FileVaultStorage::new(config.vault_path())),
            activation_store,
            clock: Arc::new(SystemClock),
        })
    }
}

/// A freshly generated wallet. Show the mnemonic once, then drop it.
pub struct CreatedWallet {
    pub mnemonic: Zeroizing<String>,
    pub accounts: Vec<Account>,
}

/// Balances of one account. `None` where the chain could not be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balances {
    pub settlement: Option<u64>,
    pub native: Option<u64>,
}

/// Self-custodial wallet over the settlement and native chains.
pub struct QNetDualWallet {
    config: WalletConfig,
    vault: Mutex<SecureKeyManager>,
    network: Arc<DualNetworkManager>,
    ownership: Arc<OwnershipManager>,
    activation: ActivationProtocol,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    events: EventBus,
    in_flight: Mutex<HashSet<String>>,
}

impl QNetDualWallet {
    pub fn new(config: WalletConfig, services: WalletServices) -> Self {
        let WalletServices {
            settlement,
            native,
            bridge,
            vault_storage,
            activation_store,
            clock,
        } = services;

        let vault = SecureKeyManager::new(vault_storage, clock.clone(), config.vault_config());
        let network = Arc::new(DualNetworkManager::new(
            settlement,
            native.clone(),
            clock.clone(),
            config.phase_cache_ttl(),
        ));
        network.switch_network(config.network.default_network);

        let store = Arc::new(activation_store);
        let ownership = Arc::new(OwnershipManager::new(
            native,
            store.clone(),
            clock.clone(),
            config.ownership_cache_ttl(),
            config.transfer_window(),
        ));
        let activation_config = config.activation_config();
        let events = EventBus::new();
        let activation = ActivationProtocol::new(
            network.clone(),
            ownership.clone(),
            Arc::new(ActivationBridgeClient::new(bridge, activation_config.retry)),
            store,
            clock.clone(),
            activation_config,
        )
        .with_observer(Arc::new(events.clone()));

        Self {
            limiter: config.rate_limiter(clock.clone()),
            config,
            vault: Mutex::new(vault),
            network,
            ownership,
            activation,
            clock,
            events,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    fn vault(&self) -> Result<MutexGuard<'_, SecureKeyManager>, WalletError> {
        match self.vault.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(p)) => Ok(p.into_inner()),
            Err(TryLockError::WouldBlock) => Err(WalletError::Busy),
        }
    }

    fn limit(&self, action: RateLimitAction, identifier: &str) -> Result<(), WalletError> {
        self.limiter.check(action, identifier).map_err(|e| {
            log::warn!("{} rate limited, retry after {} ms", action, e.retry_after_ms);
            self.events.publish(WalletEvent::RateLimited {
                action,
                retry_after_ms: e.retry_after_ms,
            });
            e.into()
        })
    }

    // ========================================================================
    // Vault lifecycle
    // ========================================================================

    /// Whether a vault has been created.
    pub fn exists(&self) -> Result<bool, WalletError> {
        Ok(self.vault()?.exists()?)
    }

    /// Generate a new mnemonic and create the vault from it.
    pub fn create(&self, password: &str, words: WordCount) -> Result<CreatedWallet, WalletError> {
        let mnemonic =
            generate_mnemonic(words).map_err(|e| WalletError::InvalidInput(e.to_string()))?;
        let phrase = Zeroizing::new(mnemonic.to_string());
        let accounts = self.import(password, &phrase)?;
        Ok(CreatedWallet {
            mnemonic: phrase,
            accounts,
        })
    }

    /// Create the vault from an existing mnemonic. The wallet is unlocked
    /// afterwards.
    pub fn import(&self, password: &str, mnemonic: &str) -> Result<Vec<Account>, WalletError> {
        let accounts = self
            .vault()?
            .initialize(password, mnemonic, self.config.wallet.persist_seed)?;
        self.events.publish(WalletEvent::Unlocked {
            accounts: accounts.clone(),
        });
        Ok(accounts)
    }

    pub fn unlock(&self, password: &str, reveal_seed: bool) -> Result<UnlockOutcome, WalletError> {
        self.limit(RateLimitAction::Unlock, VAULT_ID)?;
        let outcome = self.vault()?.unlock(password, reveal_seed)?;
        self.limiter.reset(RateLimitAction::Unlock, VAULT_ID);
        self.events.publish(WalletEvent::Unlocked {
            accounts: outcome.accounts.clone(),
        });
        Ok(outcome)
    }

    /// Wipe the session keys. Waits for an operation holding the vault
    /// rather than failing with `Busy`.
    pub fn lock(&self) {
        let mut vault = self.vault.lock().unwrap_or_else(|e| e.into_inner());
        let was_unlocked = vault.is_unlocked();
        vault.lock();
        drop(vault);
        if was_unlocked {
            self.events.publish(WalletEvent::Locked {
                reason: LockReason::Manual,
            });
        }
    }

    pub fn is_unlocked(&self) -> Result<bool, WalletError> {
        Ok(self.vault()?.is_unlocked())
    }

    /// Time left before auto-lock, if unlocked.
    pub fn time_until_lock(&self) -> Result<Option<Duration>, WalletError> {
        Ok(self
            .vault()?
            .time_until_lock_ms()
            .map(Duration::from_millis))
    }

    /// Apply the auto-lock deadline and drop expired rate-limit windows.
    /// Returns `true` if this call locked the wallet.
    pub fn tick(&self) -> bool {
        self.limiter.prune();
        let locked = match self.vault.try_lock() {
            Ok(mut vault) => vault.tick(),
            Err(TryLockError::Poisoned(p)) => p.into_inner().tick(),
            // The holder is using the session, which extends the deadline
            Err(TryLockError::WouldBlock) => false,
        };
        if locked {
            log::info!("wallet auto-locked after inactivity");
            self.events.publish(WalletEvent::Locked {
                reason: LockReason::AutoLock,
            });
        }
        locked
    }

    /// Run [`tick`](Self::tick) every `period` until the wallet is dropped.
    pub fn spawn_auto_lock(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let wallet: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                match wallet.upgrade() {
                    Some(wallet) => {
                        wallet.tick();
                    }
                    None => break,
                }
            }
            log::debug!("auto-lock task stopped");
        })
    }

    /// Accounts from the persisted record. Available while locked.
    pub fn accounts(&self) -> Result<Vec<Account>, WalletError> {
        Ok(self.vault()?.accounts()?)
    }

    pub fn primary_account(&self) -> Result<Account, WalletError> {
        self.accounts()?
            .into_iter()
            .find(|a| a.index == PRIMARY_ACCOUNT)
            .ok_or_else(|| WalletError::NotFound("primary account".into()))
    }

    pub fn sign(
        &self,
        payload: &[u8],
        network: NetworkKind,
        account: u32,
    ) -> Result<Vec<u8>, WalletError> {
        self.limit(RateLimitAction::BulkSigning, VAULT_ID)?;
        Ok(self.vault()?.sign(payload, network, account)?)
    }

    pub fn change_password(&self, old: &str, new: &str) -> Result<(), WalletError> {
        self.limit(RateLimitAction::Unlock, VAULT_ID)?;
        self.vault()?.change_password(old, new)?;
        self.limiter.reset(RateLimitAction::Unlock, VAULT_ID);
        self.events.publish(WalletEvent::PasswordChanged);
        Ok(())
    }

    /// Export one private key. Needs the password even while unlocked.
    pub fn reveal_private_key(
        &self,
        password: &str,
        network: NetworkKind,
        account: u32,
    ) -> Result<Zeroizing<String>, WalletError> {
        self.limit(RateLimitAction::Reveal, VAULT_ID)?;
        Ok(self
            .vault()?
            .reveal_private_key(password, network, account)?)
    }

    /// Derive the next account. Requires a vault created with the seed kept.
    pub fn add_account(&self, password: &str) -> Result<Account, WalletError> {
        self.limit(RateLimitAction::Unlock, VAULT_ID)?;
        let account = self.vault()?.add_account(password)?;
        self.events.publish(WalletEvent::AccountAdded {
            account: account.clone(),
        });
        Ok(account)
    }

    /// Delete the vault after confirming the password. Activation records
    /// are kept: they mirror the chain, not the keys.
    pub fn destroy(&self, password: &str) -> Result<(), WalletError> {
        self.limit(RateLimitAction::Unlock, VAULT_ID)?;
        self.vault()?.destroy(password)?;
        self.events.publish(WalletEvent::Locked {
            reason: LockReason::Manual,
        });
        Ok(())
    }

    // ========================================================================
    // Networks
    // ========================================================================

    pub fn active_network(&self) -> NetworkKind {
        self.network.active_network()
    }

    /// Make `kind` the active network. Returns the previous one.
    pub fn switch_network(&self, kind: NetworkKind) -> NetworkKind {
        let previous = self.network.switch_network(kind);
        if previous != kind {
            self.events.publish(WalletEvent::NetworkSwitched {
                from: previous,
                to: kind,
            });
        }
        previous
    }

    pub fn network_state(&self, kind: NetworkKind) -> NetworkState {
        self.network.network_state(kind)
    }

    /// Probe both chains. Returns `(settlement, native)` reachability.
    pub async fn refresh_connectivity(&self) -> (bool, bool) {
        self.network.refresh_connectivity().await
    }

    /// Fetch both balances of `account`. Fails only if neither chain answers.
    pub async fn refresh_balances(&self, account: u32) -> Result<Balances, WalletError> {
        let account = self
            .accounts()?
            .into_iter()
            .find(|a| a.index == account)
            .ok_or_else(|| WalletError::NotFound(format!("account {}", account)))?;
        self.limit(RateLimitAction::Api, &account.addresses.native)?;

        let (settlement, native) = tokio::join!(
            self.network
                .get_balance(NetworkKind::Settlement, &account.addresses.settlement),
            self.network
                .get_balance(NetworkKind::Native, &account.addresses.native),
        );
        let balances = match (settlement, native) {
            (Err(e), Err(_)) => return Err(e.into()),
            (settlement, native) => Balances {
                settlement: settlement
                    .map_err(|e| log::warn!("settlement balance unavailable: {}", e))
                    .ok(),
                native: native
                    .map_err(|e| log::warn!("native balance unavailable: {}", e))
                    .ok(),
            },
        };
        self.events.publish(WalletEvent::BalancesUpdated {
            settlement: balances.settlement,
            native: balances.native,
        });
        Ok(balances)
    }

    /// Current phase, possibly cached for display.
    pub async fn phase(&self) -> Result<PhaseSnapshot, WalletError> {
        Ok(self.network.phase_snapshot().await?)
    }

    /// Price of activating `node_type` for display. The activation itself
    /// always re-prices from fresh statistics.
    pub async fn activation_cost(&self, node_type: NodeType) -> Result<ActivationQuote, WalletError> {
        Ok(self.network.activation_quote(node_type, false).await?)
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    /// Activate a node owned by the primary account, in whichever phase the
    /// network is in now.
    pub async fn activate_node(&self, node_type: NodeType) -> Result<ActivationRecord, WalletError> {
        if !self.is_unlocked()? {
            return Err(WalletError::Locked);
        }
        let account = self.primary_account()?;
        let owner = account.addresses.native.clone();
        let _in_flight = InFlight::acquire(&self.in_flight, &owner)?;
        self.limit(RateLimitAction::Activation, &owner)?;

        let request = ActivationRequest {
            owner,
            settlement_source: Some(account.addresses.settlement),
            node_type,
        };
        let signer = VaultSigner::new(&self.vault, PRIMARY_ACCOUNT);
        Ok(self.activation.start(request, &signer).await?)
    }

    /// Continue an interrupted activation.
    pub async fn resume_activation(&self, id: &str) -> Result<ActivationRecord, WalletError> {
        let pending = self
            .activation
            .store()
            .pending(id)
            .ok_or_else(|| WalletError::NotFound(format!("activation {}", id)))?;
        let _in_flight = InFlight::acquire(&self.in_flight, &pending.owner)?;
        let signer = VaultSigner::new(&self.vault, PRIMARY_ACCOUNT);
        Ok(self.activation.resume(id, &signer).await?)
    }

    /// Resume every resumable activation of the primary account. Each
    /// outcome is reported separately.
    pub async fn resume_pending_activations(
        &self,
    ) -> Result<Vec<(String, Result<ActivationRecord, WalletError>)>, WalletError> {
        let mut outcomes = Vec::new();
        for pending in self.pending_activations()? {
            let outcome = self.resume_activation(&pending.id).await;
            if let Err(e) = &outcome {
                log::warn!("activation {} not resumed: {}", pending.id, e);
            }
            outcomes.push((pending.id, outcome));
        }
        Ok(outcomes)
    }

    /// Activations of the primary account that [`resume_activation`]
    /// can continue: unfinished ones, and those cancelled after their burn.
    ///
    /// [`resume_activation`]: Self::resume_activation
    pub fn pending_activations(&self) -> Result<Vec<PendingActivation>, WalletError> {
        let owner = self.primary_account()?.addresses.native;
        Ok(self
            .activation
            .store()
            .all_pending()
            .into_iter()
            .filter(|p| p.owner == owner && p.is_resumable())
            .collect())
    }

    /// Persisted activations of the primary account: every unfinished one
    /// and the most recent finished ones.
    pub fn activation_history(&self) -> Result<Vec<PendingActivation>, WalletError> {
        let owner = self.primary_account()?.addresses.native;
        Ok(self
            .activation
            .store()
            .all_pending()
            .into_iter()
            .filter(|p| p.owner == owner)
            .collect())
    }

    /// Local activation records of the primary account.
    pub fn activation_records(&self) -> Result<Vec<ActivationRecord>, WalletError> {
        let owner = self.primary_account()?.addresses.native;
        Ok(self
            .activation
            .store()
            .records()
            .into_iter()
            .filter(|r| r.owner_address == owner)
            .collect())
    }

    /// Nodes the native chain assigns to the primary account.
    pub async fn my_nodes(&self, fresh: bool) -> Result<Vec<String>, WalletError> {
        let owner = self.primary_account()?.addresses.native;
        Ok(self.ownership.wallet_nodes(&owner, fresh).await?)
    }

    pub async fn verify_ownership(&self, node_id: &str, fresh: bool) -> Result<bool, WalletError> {
        let owner = self.primary_account()?.addresses.native;
        Ok(self.ownership.verify_ownership(node_id, &owner, fresh).await?)
    }

    pub fn ownership_record(&self, node_id: &str) -> Option<OwnershipRecord> {
        self.ownership.ownership_record(node_id)
    }

    /// Align local records with the native chain.
    pub async fn reconcile_nodes(&self) -> Result<ReconcileReport, WalletError> {
        let owner = self.primary_account()?.addresses.native;
        self.limit(RateLimitAction::Api, &owner)?;
        Ok(self.activation.reconcile(&owner).await?)
    }

    /// Hand `node_id` to the native address `to`, signed by the primary
    /// account.
    pub async fn transfer_node(&self, node_id: &str, to: &str) -> Result<SubmitReceipt, WalletError> {
        let from = self.primary_account()?.addresses.native;
        let _in_flight = InFlight::acquire(&self.in_flight, &from)?;
        self.limit(RateLimitAction::Transfer, &from)?;

        let timestamp = self.clock.now_secs();
        let message = TransferRequest::canonical_message(node_id, &from, to, timestamp);
        let auth = {
            let mut vault = self.vault()?;
            TransferAuthorization {
                timestamp,
                public_key: hex::encode(vault.public_key(NetworkKind::Native, PRIMARY_ACCOUNT)?),
                signature: hex::encode(vault.sign(
                    message.as_bytes(),
                    NetworkKind::Native,
                    PRIMARY_ACCOUNT,
                )?),
            }
        };

        let receipt = self.ownership.transfer_node(node_id, &from, to, &auth).await?;
        self.events.publish(WalletEvent::NodeTransferred {
            node_id: node_id.to_string(),
            to: to.to_string(),
            tx_hash: receipt.tx_hash.clone(),
        });
        Ok(receipt)
    }
}

/// Marks an owner as busy for as long as it lives.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    owner: String,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, owner: &str) -> Result<Self, WalletError> {
        let inserted = set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(owner.to_string());
        if !inserted {
            return Err(WalletError::Busy);
        }
        Ok(Self {
            set,
            owner: owner.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.owner);
    }
}

/// Signs activation payloads with the vault's session keys.
pub struct VaultSigner<'a> {
    vault: &'a Mutex<SecureKeyManager>,
    account: u32,
}

impl<'a> VaultSigner<'a> {
    pub fn new(vault: &'a Mutex<SecureKeyManager>, account: u32) -> Self {
        Self { vault, account }
    }
}

impl ActivationSigner for VaultSigner<'_> {
    fn sign(&self, payload: &ActivationPayload) -> Result<SignedActivation, SignerError> {
        let mut vault = match self.vault.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(Box::new(WalletError::Busy)),
        };
        let network = payload.network();
        let public_key = vault.public_key(network, self.account)?;
        let signature = vault.sign(&payload.signing_bytes(), network, self.account)?;
        Ok(SignedActivation {
            payload: payload.clone(),
            public_key: hex::encode(public_key),
            signature: hex::encode(signature),
        })
    }
}
