//! Node lifecycle across two wallets sharing the same chains.
//!
//! Alice creates a wallet, activates a node while the network is in Phase 1,
//! restarts, and hands the node to Bob. Bob's wallet sees the node, Alice's
//! does not, and Alice can then activate again in Phase 2.

use std::path::Path;
use std::sync::Arc;

use qnet_activation::testing::{MockBridge, GENESIS_SECS};
use qnet_activation::ActivationStore;
use qnet_core::{FileVaultStorage, ManualClock};
use qnet_network::testing::{MockNativeChain, MockSettlementChain};
use qnet_network::{NodeStatus, Phase};
use qnet_wallet::testing::{test_config, ALICE, BOB, PASSWORD};
use qnet_wallet::{ErrorKind, NodeType, QNetDualWallet, WalletEvent, WalletServices};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Network {
    clock: Arc<ManualClock>,
    settlement: Arc<MockSettlementChain>,
    native: Arc<MockNativeChain>,
    bridge: Arc<MockBridge>,
}

impl Network {
    fn new() -> Self {
        Self {
            clock: Arc::new(ManualClock::default()),
            settlement: Arc::new(MockSettlementChain::new()),
            native: Arc::new(MockNativeChain::new(GENESIS_SECS)),
            bridge: Arc::new(MockBridge::new()),
        }
    }

    /// A wallet whose vault and activation store live under `dir`.
    fn wallet(&self, dir: &Path) -> QNetDualWallet {
        let mut config = test_config();
        config.wallet.data_dir = dir.to_path_buf();
        let services = WalletServices {
            settlement: self.settlement.clone(),
            native: self.native.clone(),
            bridge: self.bridge.clone(),
            vault_storage: Box::new(FileVaultStorage::new(config.vault_path())),
            activation_store: ActivationStore::open(config.activation_store_path()).unwrap(),
            clock: self.clock.clone(),
        };
        QNetDualWallet::new(config, services)
    }
}

#[tokio::test]
async fn test_activate_restart_transfer_and_reactivate() {
    init_logging();
    let net = Network::new();
    let alice_dir = tempfile::tempdir().unwrap();
    let bob_dir = tempfile::tempdir().unwrap();

    // ------------------------------------------------------------------
    // Alice: import and fund
    // ------------------------------------------------------------------
    let alice = net.wallet(alice_dir.path());
    let alice_account = alice.import(PASSWORD, ALICE).unwrap().remove(0);
    net.settlement
        .set_balance(&alice_account.addresses.settlement, 5_000);
    net.native.set_balance(&alice_account.addresses.native, 50_000);

    // ------------------------------------------------------------------
    // Phase 1 activation
    // ------------------------------------------------------------------
    let quote = alice.activation_cost(NodeType::Super).await.unwrap();
    assert_eq!(quote.phase, Phase::One);
    let record = alice.activate_node(NodeType::Super).await.unwrap();
    assert_eq!(record.cost, quote.cost);
    assert_eq!(record.source_tx_hash.as_deref().map(str::is_empty), Some(false));
    assert_eq!(
        net.settlement.balance(&alice_account.addresses.settlement),
        5_000 - quote.cost
    );
    let node_id = record.node_id.clone();
    drop(alice);

    // ------------------------------------------------------------------
    // Restart: locked, records intact
    // ------------------------------------------------------------------
    let alice = net.wallet(alice_dir.path());
    assert!(!alice.is_unlocked().unwrap());
    assert_eq!(
        alice.transfer_node(&node_id, "anyone").await.unwrap_err().kind(),
        ErrorKind::Locked
    );
    alice.unlock(PASSWORD, false).unwrap();
    assert_eq!(alice.my_nodes(true).await.unwrap(), vec![node_id.clone()]);

    // ------------------------------------------------------------------
    // Bob: create a wallet and receive the node
    // ------------------------------------------------------------------
    let bob = net.wallet(bob_dir.path());
    let bob_account = bob.import(PASSWORD, BOB).unwrap().remove(0);
    let bob_address = bob_account.addresses.native.clone();
    assert!(bob.my_nodes(true).await.unwrap().is_empty());

    let mut alice_events = alice.subscribe();
    let receipt = alice.transfer_node(&node_id, &bob_address).await.unwrap();
    assert!(matches!(
        alice_events.try_recv(),
        Ok(WalletEvent::NodeTransferred { .. })
    ));

    let transfers = net.native.transfers();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].from, alice_account.addresses.native);
    assert_eq!(transfers[0].to, bob_address);

    assert_eq!(bob.my_nodes(true).await.unwrap(), vec![node_id.clone()]);
    assert!(bob.verify_ownership(&node_id, true).await.unwrap());
    assert!(alice.my_nodes(true).await.unwrap().is_empty());

    let history = alice.ownership_record(&node_id).unwrap().history;
    assert_eq!(history.last().unwrap().tx_hash, receipt.tx_hash);

    // Bob already owns a node and cannot activate another
    net.settlement
        .set_balance(&bob_account.addresses.settlement, 5_000);
    let err = bob.activate_node(NodeType::Light).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NodeLimitExceeded);

    // ------------------------------------------------------------------
    // Phase 2: Alice activates again with native tokens
    // ------------------------------------------------------------------
    net.settlement.set_burn_stats(960_000_000, 1_000_000_000);
    let second = alice.activate_node(NodeType::Light).await.unwrap();
    assert_eq!(second.phase, Phase::Two);
    assert_ne!(second.node_id, node_id);
    assert_eq!(
        net.native.balance(&alice_account.addresses.native),
        50_000 - second.cost
    );
    assert_eq!(net.bridge.calls(), 1);

    // Alice's local view: the transferred node and the new one
    let report = alice.reconcile_nodes().await.unwrap();
    assert!(report.untracked.is_empty());
    let records = alice.activation_records().unwrap();
    assert_eq!(records.len(), 2);
    let first = records.iter().find(|r| r.node_id == node_id).unwrap();
    assert_eq!(first.status, NodeStatus::Transferred);
}

#[tokio::test]
async fn test_destroyed_wallet_can_be_restored_from_mnemonic() {
    init_logging();
    let net = Network::new();
    let dir = tempfile::tempdir().unwrap();

    let wallet = net.wallet(dir.path());
    let created = wallet.create(PASSWORD, qnet_wallet::WordCount::Words24).unwrap();
    assert_eq!(created.mnemonic.split_whitespace().count(), 24);
    let address = created.accounts[0].addresses.native.clone();

    let err = wallet.destroy("not the password").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidCredentials);
    wallet.destroy(PASSWORD).unwrap();
    assert!(!wallet.exists().unwrap());
    assert!(!dir.path().join("vault.json").exists());

    let restored = net.wallet(dir.path());
    let accounts = restored.import(PASSWORD, &created.mnemonic).unwrap();
    assert_eq!(accounts[0].addresses.native, address);
}
