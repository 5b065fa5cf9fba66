//! Wallet events
//!
//! Commands flow down into the wallet; state changes flow back up as
//! [`WalletEvent`]s on a broadcast channel. Every listener gets its own
//! receiver. A slow listener loses the oldest events rather than blocking
//! the wallet.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use qnet_activation::{ActivationState, PendingActivation, TransitionObserver};
use qnet_core::{Account, NetworkKind, RateLimitAction};
use qnet_network::NodeType;

/// Events buffered per receiver before the oldest are dropped.
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockReason {
    Manual,
    AutoLock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalletEvent {
    Unlocked {
        accounts: Vec<Account>,
    },
    Locked {
        reason: LockReason,
    },
    NetworkSwitched {
        from: NetworkKind,
        to: NetworkKind,
    },
    PasswordChanged,
    AccountAdded {
        account: Account,
    },
    BalancesUpdated {
        settlement: Option<u64>,
        native: Option<u64>,
    },
    ActivationProgress {
        id: String,
        state: ActivationState,
    },
    ActivationCompleted {
        id: String,
        node_id: String,
        node_type: NodeType,
    },
    ActivationFailed {
        id: String,
        reason: String,
    },
    NodeTransferred {
        node_id: String,
        to: String,
        tx_hash: String,
    },
    RateLimited {
        action: RateLimitAction,
        retry_after_ms: u64,
    },
}

/// Fan-out of wallet events to any number of listeners.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WalletEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.tx.subscribe()
    }

    /// Send to current listeners. Having none is not an error.
    pub fn publish(&self, event: WalletEvent) {
        log::debug!("event: {:?}", event);
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl TransitionObserver for EventBus {
    fn on_transition(&self, pending: &PendingActivation) {
        let event = match &pending.state {
            ActivationState::Active => WalletEvent::ActivationCompleted {
                id: pending.id.clone(),
                node_id: pending.node_id.clone().unwrap_or_default(),
                node_type: pending.node_type,
            },
            ActivationState::Failed(reason) => WalletEvent::ActivationFailed {
                id: pending.id.clone(),
                reason: reason.clone(),
            },
            state => WalletEvent::ActivationProgress {
                id: pending.id.clone(),
                state: state.clone(),
            },
        };
        self.publish(event);
    }
}
