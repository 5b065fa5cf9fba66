//! Dual-network binding and phase detection
//!
//! [`DualNetworkManager`] keeps one [`NetworkState`] per chain, tracks which
//! network is active in the UI sense, and caches the Phase 1 / Phase 2
//! snapshot for display. Activation never trusts the cache: it calls
//! [`DualNetworkManager::refresh_phase`] first.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use qnet_core::{Clock, NetworkKind};

use crate::pricing::{ActivationQuote, NodeType, Phase};
use crate::rpc::{NativeChain, RpcError, SettlementChain};

/// Burned share of 1DEV supply that switches the network to Phase 2.
pub const PHASE2_BURN_THRESHOLD_PERCENT: f64 = 90.0;

/// Network age that switches to Phase 2 regardless of burns.
pub const PHASE2_NETWORK_AGE_SECS: u64 = 5 * 365 * 24 * 60 * 60;

pub const DEFAULT_PHASE_CACHE_TTL: Duration = Duration::from_secs(120);

/// Upper bound on how stale a displayed phase may be.
pub const MAX_PHASE_CACHE_TTL: Duration = Duration::from_secs(300);

/// `Phase::Two` iff burned ≥ 90 % or the network is at least five years old.
pub fn detect_phase(burned_percent: f64, network_age_secs: u64) -> Phase {
    if burned_percent >= PHASE2_BURN_THRESHOLD_PERCENT || network_age_secs >= PHASE2_NETWORK_AGE_SECS {
        Phase::Two
    } else {
        Phase::One
    }
}

/// What a network can be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Balance,
    Burn,
    NodeActivation,
    OwnershipTransfer,
}

/// Static token parameters of a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConstants {
    pub token_symbol: String,
    pub decimals: u8,
    /// Mint (settlement) or asset id (native)
    pub asset_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burn_address: Option<String>,
}

impl NetworkConstants {
    pub fn for_network(kind: NetworkKind) -> Self {
        match kind {
            NetworkKind::Settlement => Self {
                token_symbol: "1DEV".into(),
                decimals: 6,
                asset_id: "62PPztDN8t6dAeh3FvxXfhkDJirpHZjGvCYdHM54FHHJ".into(),
                burn_address: Some("1nc1nerator11111111111111111111111111111111".into()),
            },
            NetworkKind::Native => Self {
                token_symbol: "QNC".into(),
                decimals: 9,
                asset_id: "qnc".into(),
                burn_address: None,
            },
        }
    }
}

/// Connectivity and capabilities of one network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkState {
    pub kind: NetworkKind,
    pub connected: bool,
    pub last_checked_ms: Option<u64>,
    pub capabilities: Vec<Capability>,
    pub constants: NetworkConstants,
}

impl NetworkState {
    fn new(kind: NetworkKind) -> Self {
        let capabilities = match kind {
            NetworkKind::Settlement => vec![Capability::Balance, Capability::Burn],
            NetworkKind::Native => vec![
                Capability::Balance,
                Capability::NodeActivation,
                Capability::OwnershipTransfer,
            ],
        };
        Self {
            kind,
            connected: false,
            last_checked_ms: None,
            capabilities,
            constants: NetworkConstants::for_network(kind),
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Inputs and result of one phase detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseSnapshot {
    pub phase: Phase,
    pub burned_percent: f64,
    pub network_age_secs: u64,
    pub active_nodes: u64,
    pub fetched_at_ms: u64,
}

impl PhaseSnapshot {
    pub fn quote(&self, node_type: NodeType) -> ActivationQuote {
        ActivationQuote::new(self.phase, node_type, self.burned_percent, self.active_nodes)
    }
}

struct BindingState {
    active: NetworkKind,
    settlement: NetworkState,
    native: NetworkState,
}

impl BindingState {
    fn get_mut(&mut self, kind: NetworkKind) -> &mut NetworkState {
        match kind {
            NetworkKind::Settlement => &mut self.settlement,
            NetworkKind::Native => &mut self.native,
        }
    }

    fn get(&self, kind: NetworkKind) -> &NetworkState {
        match kind {
            NetworkKind::Settlement => &self.settlement,
            NetworkKind::Native => &self.native,
        }
    }
}

/// Binds the wallet to both chains.
pub struct DualNetworkManager {
    settlement: Arc<dyn SettlementChain>,
    native: Arc<dyn NativeChain>,
    clock: Arc<dyn Clock>,
    phase_ttl_ms: u64,
    state: Mutex<BindingState>,
    phase_cache: Mutex<Option<PhaseSnapshot>>,
}

impl DualNetworkManager {
    /// `phase_ttl` is clamped to [`MAX_PHASE_CACHE_TTL`].
    pub fn new(
        settlement: Arc<dyn SettlementChain>,
        native: Arc<dyn NativeChain>,
        clock: Arc<dyn Clock>,
        phase_ttl: Duration,
    ) -> Self {
        let phase_ttl = phase_ttl.min(MAX_PHASE_CACHE_TTL);
        Self {
            settlement,
            native,
            clock,
            phase_ttl_ms: phase_ttl.as_millis() as u64,
            state: Mutex::new(BindingState {
                active: NetworkKind::Native,
                settlement: NetworkState::new(NetworkKind::Settlement),
                native: NetworkState::new(NetworkKind::Native),
            }),
            phase_cache: Mutex::new(None),
        }
    }

    pub fn settlement(&self) -> &Arc<dyn SettlementChain> {
        &self.settlement
    }

    pub fn native(&self) -> &Arc<dyn NativeChain> {
        &self.native
    }

    pub fn phase_ttl(&self) -> Duration {
        Duration::from_millis(self.phase_ttl_ms)
    }

    fn state(&self) -> MutexGuard<'_, BindingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cache(&self) -> MutexGuard<'_, Option<PhaseSnapshot>> {
        self.phase_cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn active_network(&self) -> NetworkKind {
        self.state().active
    }

    /// Make `kind` the active network. Returns the previously active one.
    pub fn switch_network(&self, kind: NetworkKind) -> NetworkKind {
        let mut state = self.state();
        let previous = std::mem::replace(&mut state.active, kind);
        if previous != kind {
            log::info!("active network switched {} -> {}", previous, kind);
        }
        previous
    }

    pub fn network_state(&self, kind: NetworkKind) -> NetworkState {
        self.state().get(kind).clone()
    }

    /// Probe both chains and record their connectivity.
    pub async fn refresh_connectivity(&self) -> (bool, bool) {
        let (settlement, native) = tokio::join!(self.settlement.health(), self.native.health());
        let now = self.clock.now_ms();

        let mut state = self.state();
        for (kind, result) in [(NetworkKind::Settlement, &settlement), (NetworkKind::Native, &native)] {
            let entry = state.get_mut(kind);
            let connected = result.is_ok();
            if entry.connected != connected {
                match result {
                    Ok(()) => log::info!("{} network reachable", kind),
                    Err(e) => log::warn!("{} network unreachable: {}", kind, e),
                }
            }
            entry.connected = connected;
            entry.last_checked_ms = Some(now);
        }
        (settlement.is_ok(), native.is_ok())
    }

    /// Balance of `address` on `kind`, in whole tokens.
    pub async fn get_balance(&self, kind: NetworkKind, address: &str) -> Result<u64, RpcError> {
        match kind {
            NetworkKind::Settlement => self.settlement.get_balance(address).await,
            NetworkKind::Native => self.native.get_balance(address).await,
        }
    }

    /// Phase for display. Served from cache while younger than the TTL.
    pub async fn phase_snapshot(&self) -> Result<PhaseSnapshot, RpcError> {
        let now = self.clock.now_ms();
        if let Some(cached) = self.cache().as_ref() {
            if now.saturating_sub(cached.fetched_at_ms) < self.phase_ttl_ms {
                return Ok(cached.clone());
            }
        }
        self.refresh_phase().await
    }

    /// Fetch burn statistics and network info and recompute the phase.
    pub async fn refresh_phase(&self) -> Result<PhaseSnapshot, RpcError> {
        let (stats, info) = tokio::join!(self.settlement.burn_stats(), self.native.network_info());
        let (stats, info) = (stats?, info?);

        let now = self.clock.now_ms();
        let network_age_secs = (now / 1000).saturating_sub(info.genesis_timestamp_secs);
        let burned_percent = stats.burned_percent();
        let snapshot = PhaseSnapshot {
            phase: detect_phase(burned_percent, network_age_secs),
            burned_percent,
            network_age_secs,
            active_nodes: info.active_nodes,
            fetched_at_ms: now,
        };

        let mut cache = self.cache();
        if cache.as_ref().map(|c| c.phase) != Some(snapshot.phase) {
            log::info!(
                "network in {} ({:.1}% burned, {} active nodes)",
                snapshot.phase,
                burned_percent,
                info.active_nodes
            );
        }
        *cache = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Quote an activation. `fresh` bypasses the cache.
    pub async fn activation_quote(
        &self,
        node_type: NodeType,
        fresh: bool,
    ) -> Result<ActivationQuote, RpcError> {
        let snapshot = if fresh {
            self.refresh_phase().await?
        } else {
            self.phase_snapshot().await?
        };
        Ok(snapshot.quote(node_type))
    }

    pub fn invalidate_phase_cache(&self) {
        *self.cache() = None;
    }
}
