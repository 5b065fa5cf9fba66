//! Activation protocol against in-memory chains and bridge.
//!
//! Covers both phases end to end, single-node enforcement, bridge
//! idempotency, crash recovery from the persisted store, cancellation and
//! reconciliation with the native chain.

use std::time::Duration;

use qnet_activation::machine::CANCELLED;
use qnet_activation::testing::{Harness, MockBridge, ALICE, BOB};
use qnet_activation::{
    ActivationConfig, ActivationError, ActivationSigner, ActivationState, ActivationStore,
    BridgeError, OwnershipError, RetryPolicy, SignerError,
};
use qnet_network::testing::MockNativeChain;
use qnet_network::{
    ActivationPayload, NodeStatus, NodeType, PaymentMethod, Phase, RpcError, SignedActivation,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Phase 1 harness with ALICE funded on the settlement chain.
fn funded_phase_one() -> Harness {
    let h = Harness::phase_one();
    let account = h.account(ALICE);
    h.settlement.set_balance(&account.addresses.settlement, 10_000);
    h
}

/// Phase 2 harness with ALICE funded on the native chain.
fn funded_phase_two() -> Harness {
    let h = Harness::phase_two();
    let account = h.account(ALICE);
    h.native.set_balance(&account.addresses.native, 100_000);
    h
}

// ============================================================================
// Phase 1
// ============================================================================

#[tokio::test]
async fn test_phase_one_full_flow() {
    init_logging();
    let h = funded_phase_one();
    let signer = h.signer(ALICE);
    let account = h.account(ALICE);

    let record = h
        .protocol
        .start(h.request(ALICE, NodeType::Full), &signer)
        .await
        .unwrap();

    assert_eq!(record.phase, Phase::One);
    assert_eq!(record.method, PaymentMethod::Burn);
    assert_eq!(record.cost, 1500);
    assert_eq!(record.owner_address, account.addresses.native);
    assert_eq!(record.status, NodeStatus::Active);

    let burn = record.source_tx_hash.clone().unwrap();
    assert_eq!(record.activation_code, MockBridge::code_for(&burn));
    assert_eq!(record.node_id, MockNativeChain::node_id_for_code(&record.activation_code));

    assert_eq!(h.settlement.balance(&account.addresses.settlement), 8_500);
    assert_eq!(h.settlement.burn_totals().total_burned, 1_500);
    assert_eq!(h.bridge.calls(), 1);
    assert_eq!(
        h.native.nodes_owned_by(&account.addresses.native),
        vec![record.node_id.clone()]
    );

    let request = &h.bridge.requests()[0];
    assert_eq!(request.burn_tx_hash, burn);
    assert_eq!(request.native_owner_address, account.addresses.native);
    assert_eq!(request.settlement_source_address, account.addresses.settlement);

    assert!(h.protocol.unfinished().is_empty());
    assert_eq!(h.store.records(), vec![record.clone()]);
    let ownership = h.ownership.ownership_record(&record.node_id).unwrap();
    assert_eq!(ownership.owner, account.addresses.native);
}

#[tokio::test]
async fn test_phase_one_burns_the_current_tier_price() {
    let h = funded_phase_one();
    h.settlement.set_burn_stats(250_000_000, 1_000_000_000);
    let signer = h.signer(ALICE);

    let record = h
        .protocol
        .start(h.request(ALICE, NodeType::Super), &signer)
        .await
        .unwrap();
    assert_eq!(record.cost, 1200);

    let burn = &h.settlement.submissions()[0];
    assert!(matches!(
        burn.payload,
        qnet_network::ActivationPayload::Burn { amount: 1200, .. }
    ));
}

#[tokio::test]
async fn test_phase_one_survives_transient_failures_and_slow_confirmation() {
    let h = funded_phase_one();
    h.settlement.set_pending_polls(2);
    h.native.set_pending_polls(2);
    h.bridge.fail_next(BridgeError::Unavailable("503".into()));
    h.bridge.fail_next(BridgeError::Unavailable("503".into()));
    let signer = h.signer(ALICE);

    let record = h
        .protocol
        .start(h.request(ALICE, NodeType::Light), &signer)
        .await
        .unwrap();
    assert_eq!(record.status, NodeStatus::Active);
    assert_eq!(h.bridge.calls(), 3);
    assert_eq!(h.settlement.submissions().len(), 1);
}

#[tokio::test]
async fn test_bridge_rejection_fails_with_verbatim_reason() {
    let h = funded_phase_one();
    let signer = h.signer(ALICE);
    let account = h.account(ALICE);

    h.bridge.fail_next(BridgeError::Rejected("tier filled".into()));

    let err = h
        .protocol
        .start(h.request(ALICE, NodeType::Full), &signer)
        .await
        .unwrap_err();
    assert!(matches!(err, ActivationError::Rejected(ref r) if r == "tier filled"));

    let pending = h.store.all_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].state, ActivationState::Failed("tier filled".into()));
    assert!(h.store.records().is_empty());
    assert!(h.native.submissions().is_empty());
    assert!(h.native.nodes_owned_by(&account.addresses.native).is_empty());
}

#[tokio::test]
async fn test_failed_burn_transaction_fails_activation() {
    let h = funded_phase_one();
    h.settlement.fail_next_tx("blockhash expired");
    let signer = h.signer(ALICE);

    let err = h
        .protocol
        .start(h.request(ALICE, NodeType::Full), &signer)
        .await
        .unwrap_err();
    assert!(matches!(err, ActivationError::Rejected(ref r) if r == "blockhash expired"));
    assert_eq!(h.bridge.calls(), 0);
}

#[tokio::test]
async fn test_insufficient_burn_balance_is_rejected() {
    let h = Harness::phase_one();
    let signer = h.signer(ALICE);

    let err = h
        .protocol
        .start(h.request(ALICE, NodeType::Full), &signer)
        .await
        .unwrap_err();
    assert!(matches!(err, ActivationError::Rejected(ref r) if r == "insufficient 1DEV balance"));
}

// ============================================================================
// Phase 2
// ============================================================================

#[tokio::test]
async fn test_phase_two_full_flow() {
    init_logging();
    let h = funded_phase_two();
    let signer = h.signer(ALICE);
    let owner = h.account(ALICE).addresses.native;

    let record = h
        .protocol
        .start(h.request(ALICE, NodeType::Light), &signer)
        .await
        .unwrap();

    assert_eq!(record.phase, Phase::Two);
    assert_eq!(record.method, PaymentMethod::Qnc);
    // 5 000 base x 0.5 below 100K active nodes
    assert_eq!(record.cost, 2500);
    assert_eq!(record.activation_code, record.target_tx_hash);
    assert!(record.source_tx_hash.is_none());

    assert_eq!(h.native.balance(&owner), 97_500);
    assert!(h.settlement.submissions().is_empty());
    assert_eq!(h.bridge.calls(), 0);
    assert_eq!(h.native.nodes_owned_by(&owner), vec![record.node_id]);
}

#[tokio::test]
async fn test_phase_two_remote_rejection_is_terminal() {
    let h = Harness::phase_two();
    let signer = h.signer(ALICE);

    let err = h
        .protocol
        .start(h.request(ALICE, NodeType::Super), &signer)
        .await
        .unwrap_err();
    assert!(matches!(err, ActivationError::Rejected(ref r) if r == "insufficient QNC balance"));

    let pending = h.store.all_pending();
    assert_eq!(
        pending[0].state,
        ActivationState::Failed("insufficient QNC balance".into())
    );
    assert!(h.store.records().is_empty());
}

// ============================================================================
// Single-node enforcement
// ============================================================================

#[tokio::test]
async fn test_second_activation_is_refused_in_both_phases() {
    let h = funded_phase_one();
    let signer = h.signer(ALICE);
    h.protocol
        .start(h.request(ALICE, NodeType::Full), &signer)
        .await
        .unwrap();

    let err = h
        .protocol
        .start(h.request(ALICE, NodeType::Light), &signer)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ActivationError::Ownership(OwnershipError::NodeLimitExceeded { .. })
    ));

    h.settlement.set_burn_stats(950_000_000, 1_000_000_000);
    h.native
        .set_balance(&h.account(ALICE).addresses.native, 100_000);
    let err = h
        .protocol
        .start(h.request(ALICE, NodeType::Light), &signer)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ActivationError::Ownership(OwnershipError::NodeLimitExceeded { .. })
    ));

    assert_eq!(h.store.records().len(), 1);
    assert_eq!(h.store.all_pending().len(), 1);
    assert_eq!(h.settlement.submissions().len(), 1);
}

#[tokio::test]
async fn test_other_wallets_are_unaffected() {
    let h = funded_phase_two();
    let bob = h.account(BOB);
    h.native.set_balance(&bob.addresses.native, 100_000);

    h.protocol
        .start(h.request(ALICE, NodeType::Light), &h.signer(ALICE))
        .await
        .unwrap();
    h.protocol
        .start(h.request(BOB, NodeType::Full), &h.signer(BOB))
        .await
        .unwrap();
    assert_eq!(h.store.records().len(), 2);
}

#[tokio::test]
async fn test_node_acquired_mid_protocol_fails_redemption() {
    let h = funded_phase_one();
    let signer = h.signer(ALICE);
    let owner = h.account(ALICE).addresses.native;
    h.bridge.fail_next(BridgeError::Unavailable("timeout".into()));
    h.bridge.fail_next(BridgeError::Unavailable("timeout".into()));
    h.bridge.fail_next(BridgeError::Unavailable("timeout".into()));

    let err = h
        .protocol
        .start(h.request(ALICE, NodeType::Full), &signer)
        .await
        .unwrap_err();
    assert!(matches!(err, ActivationError::RemoteUnavailable(_)));
    let id = h.protocol.unfinished()[0].id.clone();

    // Someone transfers a node to the owner while the bridge was down.
    h.native.insert_node("node_gift", &owner, NodeStatus::Active);

    let err = h.protocol.resume(&id, &signer).await.unwrap_err();
    assert!(matches!(
        err,
        ActivationError::Ownership(OwnershipError::NodeLimitExceeded { .. })
    ));
    assert!(matches!(
        h.store.pending(&id).unwrap().state,
        ActivationState::Failed(_)
    ));
    assert!(h.native.submissions().is_empty());
}

// ============================================================================
// Recovery and idempotency
// ============================================================================

#[tokio::test]
async fn test_resume_after_restart_from_disk() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("activations.json");

    let h = Harness::new(ActivationStore::open(&path).unwrap(), Harness::test_config());
    let account = h.account(ALICE);
    h.settlement.set_balance(&account.addresses.settlement, 10_000);
    let signer = h.signer(ALICE);
    for _ in 0..3 {
        h.bridge.fail_next(BridgeError::Unavailable("connection reset".into()));
    }

    let err = h
        .protocol
        .start(h.request(ALICE, NodeType::Full), &signer)
        .await
        .unwrap_err();
    assert!(matches!(err, ActivationError::RemoteUnavailable(_)));
    let paused = h.protocol.unfinished().remove(0);
    assert_eq!(paused.state, ActivationState::BridgeVerifying);

    let restarted = h.restart(ActivationStore::open(&path).unwrap(), Harness::test_config());
    let unfinished = restarted.unfinished();
    assert_eq!(unfinished.len(), 1);
    assert_eq!(unfinished[0].id, paused.id);

    let record = restarted.resume(&paused.id, &signer).await.unwrap();
    assert_eq!(record.source_tx_hash, paused.burn_tx_hash);
    assert_eq!(h.bridge.calls(), 4);
    assert_eq!(h.settlement.submissions().len(), 1);

    let reopened = ActivationStore::open(&path).unwrap();
    assert_eq!(reopened.records(), vec![record.clone()]);
    assert_eq!(
        reopened.code_for_burn(record.source_tx_hash.as_deref().unwrap()),
        Some(record.activation_code.clone())
    );

    // Resuming a finished activation returns the same record.
    let again = restarted.resume(&paused.id, &signer).await.unwrap();
    assert_eq!(again, record);
}

#[tokio::test]
async fn test_resubmitted_burn_proof_never_creates_a_second_record() {
    let h = funded_phase_one();
    let signer = h.signer(ALICE);
    let record = h
        .protocol
        .start(h.request(ALICE, NodeType::Full), &signer)
        .await
        .unwrap();

    let mut replay = h.store.all_pending().remove(0);
    replay.id = "act_replay".into();
    replay.state = ActivationState::BridgeVerifying;
    replay.activation_code = None;
    replay.target_tx_hash = None;
    replay.node_id = None;
    h.store.put_pending(&replay).unwrap();

    let again = h.protocol.resume("act_replay", &signer).await.unwrap();
    assert_eq!(again, record);
    assert_eq!(h.bridge.calls(), 1);
    assert_eq!(h.store.records().len(), 1);
    assert_eq!(h.native.submissions().len(), 1);
}

#[tokio::test]
async fn test_resume_unknown_and_failed() {
    let h = Harness::phase_two();
    let signer = h.signer(ALICE);
    assert!(matches!(
        h.protocol.resume("act_missing", &signer).await,
        Err(ActivationError::NotFound(_))
    ));

    let _ = h
        .protocol
        .start(h.request(ALICE, NodeType::Light), &signer)
        .await;
    let id = h.store.all_pending()[0].id.clone();
    assert!(matches!(
        h.protocol.resume(&id, &signer).await,
        Err(ActivationError::Failed(ref r)) if r == "insufficient QNC balance"
    ));
}

/// Signer whose key is unavailable, as when the vault locks mid-flow.
struct Unplugged;

impl ActivationSigner for Unplugged {
    fn sign(&self, _: &ActivationPayload) -> Result<SignedActivation, SignerError> {
        Err("vault is locked".into())
    }
}

/// Start an activation that stops in `Idle` before anything is submitted.
async fn stalled_activation(h: &Harness, node_type: NodeType) -> String {
    let err = h
        .protocol
        .start(h.request(ALICE, node_type), &Unplugged)
        .await
        .unwrap_err();
    assert!(matches!(err, ActivationError::Signer(_)));

    let pending = h.protocol.unfinished().remove(0);
    assert_eq!(pending.state, ActivationState::Idle);
    assert_eq!(pending.phase, Phase::One);
    assert_eq!(pending.cost, 1500);
    pending.id
}

#[tokio::test]
async fn test_resume_from_idle_burns_the_current_price() {
    init_logging();
    let h = funded_phase_one();
    let account = h.account(ALICE);
    let id = stalled_activation(&h, NodeType::Full).await;
    assert!(h.settlement.submissions().is_empty());

    h.settlement.set_burn_stats(350_000_000, 1_000_000_000);
    let record = h.protocol.resume(&id, &h.signer(ALICE)).await.unwrap();

    assert_eq!(record.phase, Phase::One);
    assert_eq!(record.cost, 1050);
    assert_eq!(h.settlement.balance(&account.addresses.settlement), 8_950);
    assert!(matches!(
        h.settlement.submissions()[0].payload,
        ActivationPayload::Burn { amount: 1050, .. }
    ));
}

#[tokio::test]
async fn test_resume_from_idle_follows_the_phase_change() {
    let h = funded_phase_one();
    let account = h.account(ALICE);
    h.native.set_balance(&account.addresses.native, 100_000);
    let id = stalled_activation(&h, NodeType::Full).await;

    h.settlement.set_burn_stats(950_000_000, 1_000_000_000);
    let quote = h.protocol.quote(NodeType::Full).await.unwrap();
    assert_eq!(quote.phase, Phase::Two);

    let record = h.protocol.resume(&id, &h.signer(ALICE)).await.unwrap();
    assert_eq!(record.phase, Phase::Two);
    assert_eq!(record.method, PaymentMethod::Qnc);
    assert_eq!(record.cost, quote.cost);
    assert!(h.settlement.submissions().is_empty());
    assert_eq!(
        h.native.balance(&account.addresses.native),
        100_000 - quote.cost
    );
}

#[tokio::test]
async fn test_resume_from_idle_enforces_the_node_limit() {
    let h = funded_phase_one();
    let owner = h.account(ALICE).addresses.native;
    let id = stalled_activation(&h, NodeType::Light).await;

    h.native.insert_node("acquired", &owner, NodeStatus::Active);
    let err = h.protocol.resume(&id, &h.signer(ALICE)).await.unwrap_err();
    assert!(matches!(
        err,
        ActivationError::Ownership(OwnershipError::NodeLimitExceeded { .. })
    ));

    assert!(h.settlement.submissions().is_empty());
    assert!(h.protocol.unfinished().is_empty());
    let pending = h.store.pending(&id).unwrap();
    assert!(matches!(pending.state, ActivationState::Failed(_)));
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_before_native_tx_marks_cancelled_and_keeps_the_burn() {
    let h = funded_phase_one();
    let signer = h.signer(ALICE);
    let account = h.account(ALICE);
    h.bridge.set_hang(true);

    let started = tokio::time::timeout(
        Duration::from_millis(100),
        h.protocol.start(h.request(ALICE, NodeType::Full), &signer),
    )
    .await;
    assert!(started.is_err());

    let pending = h.store.all_pending().remove(0);
    assert_eq!(pending.state, ActivationState::Failed(CANCELLED.into()));
    assert!(pending.burn_tx_hash.is_some());
    assert!(h.protocol.unfinished().is_empty());

    // The burn is not lost: the cancelled activation picks up from it.
    h.bridge.set_hang(false);
    let record = h.protocol.resume(&pending.id, &signer).await.unwrap();
    assert_eq!(record.source_tx_hash, pending.burn_tx_hash);
    assert_eq!(h.settlement.submissions().len(), 1);
    assert_eq!(h.settlement.balance(&account.addresses.settlement), 8_500);
}

#[tokio::test]
async fn test_cancel_after_native_tx_stays_pending() {
    let config = ActivationConfig {
        retry: RetryPolicy::immediate(3),
        poll_interval: Duration::from_millis(50),
        max_polls: 10,
    };
    let h = Harness::new(ActivationStore::in_memory(), config);
    h.settlement.set_burn_stats(950_000_000, 1_000_000_000);
    h.native.set_balance(&h.account(ALICE).addresses.native, 100_000);
    h.native.set_pending_polls(3);
    let signer = h.signer(ALICE);

    let started = tokio::time::timeout(
        Duration::from_millis(20),
        h.protocol.start(h.request(ALICE, NodeType::Light), &signer),
    )
    .await;
    assert!(started.is_err());

    let pending = h.protocol.unfinished().remove(0);
    assert_eq!(pending.state, ActivationState::RemoteActivating);
    assert!(pending.target_tx_hash.is_some());

    let record = h.protocol.resume(&pending.id, &signer).await.unwrap();
    assert_eq!(Some(record.target_tx_hash), pending.target_tx_hash);
}

// ============================================================================
// Reconciliation
// ============================================================================

#[tokio::test]
async fn test_reconcile_follows_the_chain() {
    let h = funded_phase_two();
    let signer = h.signer(ALICE);
    let owner = h.account(ALICE).addresses.native;
    let record = h
        .protocol
        .start(h.request(ALICE, NodeType::Light), &signer)
        .await
        .unwrap();

    let report = h.protocol.reconcile(&owner).await.unwrap();
    assert!(report.updated.is_empty());
    assert!(report.untracked.is_empty());

    h.native
        .insert_node(&record.node_id, "elsewhere", NodeStatus::Active);
    h.native.insert_node("node_unknown", &owner, NodeStatus::Active);

    let report = h.protocol.reconcile(&owner).await.unwrap();
    assert_eq!(
        report.updated,
        vec![(record.node_id.clone(), NodeStatus::Transferred)]
    );
    assert_eq!(report.untracked, vec!["node_unknown".to_string()]);
    assert!(h.store.living_records(&owner).is_empty());
}

#[tokio::test]
async fn test_reconcile_completes_unconfirmed_activation() {
    let config = ActivationConfig {
        max_polls: 1,
        ..Harness::test_config()
    };
    let h = Harness::new(ActivationStore::in_memory(), config);
    h.settlement.set_burn_stats(950_000_000, 1_000_000_000);
    let owner = h.account(ALICE).addresses.native;
    h.native.set_balance(&owner, 100_000);
    h.native.set_pending_polls(1);
    let signer = h.signer(ALICE);

    let err = h
        .protocol
        .start(h.request(ALICE, NodeType::Light), &signer)
        .await
        .unwrap_err();
    assert!(matches!(err, ActivationError::RemoteUnavailable(_)));
    assert!(h.store.records().is_empty());

    let report = h.protocol.reconcile(&owner).await.unwrap();
    assert_eq!(report.completed.len(), 1);
    assert_eq!(h.store.records().len(), 1);
    assert!(h.protocol.unfinished().is_empty());
}

#[tokio::test]
async fn test_transient_failure_before_start_leaves_nothing_behind() {
    let h = funded_phase_two();
    let signer = h.signer(ALICE);
    h.native.fail_next(RpcError::Unavailable("timeout".into()));

    let err = h
        .protocol
        .start(h.request(ALICE, NodeType::Light), &signer)
        .await
        .unwrap_err();
    assert!(matches!(err, ActivationError::RemoteUnavailable(_)));
    assert!(h.store.all_pending().is_empty());

    h.protocol
        .start(h.request(ALICE, NodeType::Light), &signer)
        .await
        .unwrap();
}
