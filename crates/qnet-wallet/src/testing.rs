//! A wallet wired to in-memory chains, bridge and storage

use std::path::Path;
use std::sync::Arc;

use qnet_activation::testing::{MockBridge, GENESIS_SECS};
use qnet_activation::ActivationStore;
use qnet_core::{ManualClock, MemoryVaultStorage, VaultStorage};
use qnet_network::testing::{MockNativeChain, MockSettlementChain};

use crate::config::WalletConfig;
use crate::wallet::{QNetDualWallet, WalletServices};

pub use qnet_activation::testing::{ALICE, BOB};

pub const PASSWORD: &str = "correct horse battery";

/// Cheap KDF, immediate retries, no confirmation delay.
pub fn test_config() -> WalletConfig {
    let mut config = WalletConfig::default();
    let kdf = qnet_core::KdfParams::insecure_fast();
    config.kdf.memory_kib = kdf.memory_kib;
    config.kdf.iterations = kdf.iterations;
    config.kdf.parallelism = kdf.parallelism;
    config.activation.max_attempts = 3;
    config.activation.initial_backoff_ms = 0;
    config.activation.max_backoff_ms = 0;
    config.activation.poll_interval_ms = 0;
    config.activation.max_polls = 5;
    config
}

pub struct TestWallet {
    pub wallet: Arc<QNetDualWallet>,
    pub clock: Arc<ManualClock>,
    pub settlement: Arc<MockSettlementChain>,
    pub native: Arc<MockNativeChain>,
    pub bridge: Arc<MockBridge>,
}

impl TestWallet {
    pub fn new() -> Self {
        Self::build(
            test_config(),
            Box::new(MemoryVaultStorage::new()),
            ActivationStore::in_memory(),
        )
    }

    /// Vault and activation store under `dir`, as a real installation.
    pub fn on_disk(dir: &Path) -> Self {
        let mut config = test_config();
        config.wallet.data_dir = dir.to_path_buf();
        let storage = Box::new(qnet_core::FileVaultStorage::new(config.vault_path()));
        let store = match ActivationStore::open(config.activation_store_path()) {
            Ok(store) => store,
            Err(e) => panic!("activation store: {}", e),
        };
        Self::build(config, storage, store)
    }

    pub fn build(config: WalletConfig, storage: Box<dyn VaultStorage>, store: ActivationStore) -> Self {
        let clock = Arc::new(ManualClock::default());
        let settlement = Arc::new(MockSettlementChain::new());
        let native = Arc::new(MockNativeChain::new(GENESIS_SECS));
        let bridge = Arc::new(MockBridge::new());
        let services = WalletServices {
            settlement: settlement.clone(),
            native: native.clone(),
            bridge: bridge.clone(),
            vault_storage: storage,
            activation_store: store,
            clock: clock.clone(),
        };
        Self {
            wallet: Arc::new(QNetDualWallet::new(config, services)),
            clock,
            settlement,
            native,
            bridge,
        }
    }

    /// Import `mnemonic` under [`PASSWORD`] and fund both of its addresses.
    pub fn funded(mnemonic: &str) -> Self {
        let t = Self::new();
        t.import_and_fund(mnemonic);
        t
    }

    pub fn import_and_fund(&self, mnemonic: &str) {
        let accounts = match self.wallet.import(PASSWORD, mnemonic) {
            Ok(accounts) => accounts,
            Err(e) => panic!("import: {}", e),
        };
        let addresses = &accounts[0].addresses;
        self.settlement.set_balance(&addresses.settlement, 10_000);
        self.native.set_balance(&addresses.native, 100_000);
    }

    /// 95% of the supply burned.
    pub fn enter_phase_two(&self) {
        self.settlement.set_burn_stats(950_000_000, 1_000_000_000);
    }
}

impl Default for TestWallet {
    fn default() -> Self {
        Self::new()
    }
}
