//! Local activation records
//!
//! The [`ActivationStore`] mirrors what the native chain knows about this
//! wallet's nodes, plus in-flight activations so a crash mid-protocol can be
//! resumed. It is a single JSON document rewritten atomically on every
//! mutation; the chain stays authoritative and the store is reconciled
//! against it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use qnet_core::storage::write_atomic;
use qnet_network::{NodeStatus, NodeType, PaymentMethod, Phase};

/// Reason recorded when an activation is dropped before reaching the native chain.
pub const CANCELLED: &str = "cancelled";

/// Finished activations kept for history. Older ones are pruned.
pub const FINISHED_HISTORY: usize = 50;

/// Errors from store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A node this wallet activated. Written only after the activation
/// transaction is confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationRecord {
    /// Bridge code (Phase 1) or the native spend tx hash (Phase 2)
    pub activation_code: String,
    pub node_id: String,
    pub node_type: NodeType,
    pub owner_address: String,
    pub phase: Phase,
    pub method: PaymentMethod,
    pub cost: u64,
    /// Unix seconds
    pub created_at: u64,
    /// Burn tx on the settlement chain (Phase 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_tx_hash: Option<String>,
    pub target_tx_hash: String,
    pub status: NodeStatus,
}

/// One ownership change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipEvent {
    pub owner: String,
    pub transferred_at: u64,
    pub tx_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipRecord {
    pub node_id: String,
    pub owner: String,
    pub transferable: bool,
    pub history: Vec<OwnershipEvent>,
}

/// Protocol position of an activation.
///
/// ```text
/// Idle ─► BurnSubmitted ─► BridgeVerifying ─► ActivationTokenIssued ─► RemoteActivating ─► Active
///  │            (Phase 1 only)                                              ▲
///  └──────────────────────── Phase 2 native spend ──────────────────────────┘
///
/// any non-terminal state ─► Failed(reason)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ActivationState {
    Idle,
    BurnSubmitted,
    BridgeVerifying,
    ActivationTokenIssued,
    RemoteActivating,
    Active,
    Failed(String),
}

impl ActivationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActivationState::Active | ActivationState::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::BurnSubmitted => "burn_submitted",
            Self::BridgeVerifying => "bridge_verifying",
            Self::ActivationTokenIssued => "activation_token_issued",
            Self::RemoteActivating => "remote_activating",
            Self::Active => "active",
            Self::Failed(_) => "failed",
        }
    }
}

/// An activation in progress, persisted on every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingActivation {
    pub id: String,
    /// Native address that will own the node
    pub owner: String,
    /// Settlement address paying the burn (Phase 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement_source: Option<String>,
    pub node_type: NodeType,
    pub phase: Phase,
    pub method: PaymentMethod,
    pub cost: u64,
    pub state: ActivationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burn_tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl PendingActivation {
    /// Unfinished, or cancelled after its burn was submitted.
    pub fn is_resumable(&self) -> bool {
        match &self.state {
            ActivationState::Failed(reason) => reason == CANCELLED && self.burn_tx_hash.is_some(),
            state => !state.is_terminal(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreData {
    #[serde(default)]
    records: Vec<ActivationRecord>,
    #[serde(default)]
    pending: BTreeMap<String, PendingActivation>,
    /// burn tx hash -> activation code
    #[serde(default)]
    burn_codes: BTreeMap<String, String>,
    #[serde(default)]
    ownership: BTreeMap<String, OwnershipRecord>,
}

/// Persistent mirror of this wallet's activations.
pub struct ActivationStore {
    path: Option<PathBuf>,
    data: Mutex<StoreData>,
}

impl ActivationStore {
    /// Load from `path`, or start empty if it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            data: Mutex::new(data),
        })
    }

    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(StoreData::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn data(&self) -> MutexGuard<'_, StoreData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, data: &StoreData) -> Result<(), StoreError> {
        if let Some(path) = &self.path {
            let contents = serde_json::to_vec_pretty(data)?;
            write_atomic(path, &contents)?;
        }
        Ok(())
    }

    /// Apply `f` to a copy and persist it. The copy replaces the live data
    /// only once it is on disk, so a failed write leaves the store as it was.
    fn mutate<T>(&self, f: impl FnOnce(&mut StoreData) -> (T, bool)) -> Result<T, StoreError> {
        let mut data = self.data();
        let mut next = data.clone();
        let (value, changed) = f(&mut next);
        if changed {
            self.persist(&next)?;
            *data = next;
        }
        Ok(value)
    }

    // ------------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------------

    /// Insert a confirmed activation. Returns `false` if a record with the
    /// same activation code already exists.
    pub fn insert_record(&self, record: ActivationRecord) -> Result<bool, StoreError> {
        self.mutate(|data| {
            if data
                .records
                .iter()
                .any(|r| r.activation_code == record.activation_code)
            {
                return (false, false);
            }
            data.ownership
                .entry(record.node_id.clone())
                .or_insert_with(|| OwnershipRecord {
                    node_id: record.node_id.clone(),
                    owner: record.owner_address.clone(),
                    transferable: true,
                    history: vec![OwnershipEvent {
                        owner: record.owner_address.clone(),
                        transferred_at: record.created_at,
                        tx_hash: record.target_tx_hash.clone(),
                    }],
                });
            data.records.push(record);
            (true, true)
        })
    }

    pub fn records(&self) -> Vec<ActivationRecord> {
        self.data().records.clone()
    }

    pub fn record_by_code(&self, code: &str) -> Option<ActivationRecord> {
        self.data()
            .records
            .iter()
            .find(|r| r.activation_code == code)
            .cloned()
    }

    pub fn record_by_node(&self, node_id: &str) -> Option<ActivationRecord> {
        self.data()
            .records
            .iter()
            .find(|r| r.node_id == node_id)
            .cloned()
    }

    /// Locally known living nodes of `owner`.
    pub fn living_records(&self, owner: &str) -> Vec<ActivationRecord> {
        self.data()
            .records
            .iter()
            .filter(|r| r.owner_address == owner && r.status.is_living())
            .cloned()
            .collect()
    }

    /// Set the status of a node's record. Returns `false` if unchanged.
    pub fn update_status(&self, node_id: &str, status: NodeStatus) -> Result<bool, StoreError> {
        self.mutate(|data| {
            match data.records.iter_mut().find(|r| r.node_id == node_id) {
                Some(record) if record.status != status => {
                    log::info!(
                        "node {} status {:?} -> {:?}",
                        node_id,
                        record.status,
                        status
                    );
                    record.status = status;
                    (true, true)
                }
                _ => (false, false),
            }
        })
    }

    // ------------------------------------------------------------------------
    // Ownership
    // ------------------------------------------------------------------------

    pub fn ownership(&self, node_id: &str) -> Option<OwnershipRecord> {
        self.data().ownership.get(node_id).cloned()
    }

    /// Record a confirmed transfer of `node_id` to `to`.
    pub fn record_transfer(
        &self,
        node_id: &str,
        to: &str,
        tx_hash: &str,
        at: u64,
    ) -> Result<(), StoreError> {
        self.mutate(|data| {
            let entry = data
                .ownership
                .entry(node_id.to_string())
                .or_insert_with(|| OwnershipRecord {
                    node_id: node_id.to_string(),
                    owner: to.to_string(),
                    transferable: true,
                    history: Vec::new(),
                });
            entry.owner = to.to_string();
            entry.history.push(OwnershipEvent {
                owner: to.to_string(),
                transferred_at: at,
                tx_hash: tx_hash.to_string(),
            });
            if let Some(record) = data.records.iter_mut().find(|r| r.node_id == node_id) {
                if record.owner_address != to {
                    record.status = NodeStatus::Transferred;
                }
            }
            ((), true)
        })
    }

    // ------------------------------------------------------------------------
    // Burn proofs
    // ------------------------------------------------------------------------

    pub fn code_for_burn(&self, burn_tx_hash: &str) -> Option<String> {
        self.data().burn_codes.get(burn_tx_hash).cloned()
    }

    /// Remember the code issued for a burn. The first code wins.
    pub fn remember_burn_code(&self, burn_tx_hash: &str, code: &str) -> Result<String, StoreError> {
        self.mutate(|data| {
            if let Some(existing) = data.burn_codes.get(burn_tx_hash) {
                return (existing.clone(), false);
            }
            data.burn_codes
                .insert(burn_tx_hash.to_string(), code.to_string());
            (code.to_string(), true)
        })
    }

    // ------------------------------------------------------------------------
    // Pending activations
    // ------------------------------------------------------------------------

    /// Save `pending`, pruning the oldest finished activations beyond
    /// [`FINISHED_HISTORY`]. Resumable ones are never pruned.
    pub fn put_pending(&self, pending: &PendingActivation) -> Result<(), StoreError> {
        self.mutate(|data| {
            data.pending.insert(pending.id.clone(), pending.clone());
            if pending.state.is_terminal() {
                prune_finished(&mut data.pending);
            }
            ((), true)
        })
    }

    pub fn pending(&self, id: &str) -> Option<PendingActivation> {
        self.data().pending.get(id).cloned()
    }

    /// Activations that have not reached a terminal state.
    pub fn unfinished(&self) -> Vec<PendingActivation> {
        self.data()
            .pending
            .values()
            .filter(|p| !p.state.is_terminal())
            .cloned()
            .collect()
    }

    /// Every tracked activation, finished or not.
    pub fn all_pending(&self) -> Vec<PendingActivation> {
        self.data().pending.values().cloned().collect()
    }

}

fn prune_finished(pending: &mut BTreeMap<String, PendingActivation>) {
    let mut finished: Vec<(u64, String)> = pending
        .values()
        .filter(|p| p.state.is_terminal() && !p.is_resumable())
        .map(|p| (p.updated_at, p.id.clone()))
        .collect();
    if finished.len() <= FINISHED_HISTORY {
        return;
    }
    finished.sort();
    let excess = finished.len() - FINISHED_HISTORY;
    for (_, id) in finished.into_iter().take(excess) {
        log::debug!("pruning finished activation {}", id);
        pending.remove(&id);
    }
}
