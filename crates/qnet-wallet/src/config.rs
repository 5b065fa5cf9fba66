//! Wallet configuration, parsed from TOML with environment overrides.
//!
//! Priority: environment variables > config file > defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use qnet_activation::{ActivationConfig, RetryPolicy};
use qnet_core::crypto::KdfAlgorithm;
use qnet_core::password::PasswordPolicy;
use qnet_core::{Clock, KdfParams, LimitProfile, NetworkKind, RateLimitAction, RateLimiter, VaultConfig};

/// File name of the vault record inside the data directory.
pub const VAULT_FILE: &str = "vault.json";

/// File name of the activation store inside the data directory.
pub const ACTIVATIONS_FILE: &str = "activations.json";

/// Longest accepted inactivity timeout: one day.
pub const MAX_AUTO_LOCK_SECS: u64 = 24 * 60 * 60;

/// Top-level wallet configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletConfig {
    #[serde(default)]
    pub wallet: WalletSection,

    /// Password KDF cost for new and re-encrypted vaults
    #[serde(default)]
    pub kdf: KdfSection,

    #[serde(default)]
    pub network: NetworkSection,

    #[serde(default)]
    pub activation: ActivationSection,

    /// Per-action overrides, keyed by action name (`unlock`, `activation`, ...)
    #[serde(default)]
    pub rate_limits: HashMap<String, LimitProfile>,
}

/// Vault and session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletSection {
    /// Directory holding the vault record and activation store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Inactivity before the session keys are wiped (default: 15 minutes)
    #[serde(default = "default_auto_lock")]
    pub auto_lock_secs: u64,

    #[serde(default = "default_min_password_length")]
    pub min_password_length: usize,

    /// Keep the encrypted mnemonic in the vault so accounts can be added later
    #[serde(default = "default_true")]
    pub persist_seed: bool,
}

impl Default for WalletSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            auto_lock_secs: default_auto_lock(),
            min_password_length: default_min_password_length(),
            persist_seed: default_true(),
        }
    }
}

/// Argon2id parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfSection {
    #[serde(default = "default_kdf_memory")]
    pub memory_kib: u32,

    #[serde(default = "default_kdf_iterations")]
    pub iterations: u32,

    #[serde(default = "default_kdf_parallelism")]
    pub parallelism: u32,
}

impl Default for KdfSection {
    fn default() -> Self {
        Self {
            memory_kib: default_kdf_memory(),
            iterations: default_kdf_iterations(),
            parallelism: default_kdf_parallelism(),
        }
    }
}

/// Remote services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// Network selected when the wallet starts
    #[serde(default = "default_network")]
    pub default_network: NetworkKind,

    /// Activation bridge base URL
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,

    #[serde(default = "default_bridge_timeout")]
    pub bridge_timeout_secs: u64,

    /// How long a phase snapshot is shown before refetching (capped at 300)
    #[serde(default = "default_phase_ttl")]
    pub phase_cache_ttl_secs: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            default_network: default_network(),
            bridge_url: default_bridge_url(),
            bridge_timeout_secs: default_bridge_timeout(),
            phase_cache_ttl_secs: default_phase_ttl(),
        }
    }
}

/// Activation protocol tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationSection {
    /// Attempts per remote step, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_polls")]
    pub max_polls: u32,

    #[serde(default = "default_ownership_ttl")]
    pub ownership_cache_ttl_secs: u64,

    /// Accepted clock skew of a transfer authorization, either direction
    #[serde(default = "default_transfer_window")]
    pub transfer_window_secs: u64,
}

impl Default for ActivationSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            poll_interval_ms: default_poll_interval(),
            max_polls: default_max_polls(),
            ownership_cache_ttl_secs: default_ownership_ttl(),
            transfer_window_secs: default_transfer_window(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_data_dir() -> PathBuf {
    PathBuf::from(".qnet-wallet")
}

fn default_auto_lock() -> u64 {
    900 // 15 minutes
}

fn default_min_password_length() -> usize {
    qnet_core::password::DEFAULT_MIN_LENGTH
}

fn default_true() -> bool {
    true
}

fn default_kdf_memory() -> u32 {
    KdfParams::default().memory_kib
}

fn default_kdf_iterations() -> u32 {
    KdfParams::default().iterations
}

fn default_kdf_parallelism() -> u32 {
    KdfParams::default().parallelism
}

fn default_network() -> NetworkKind {
    NetworkKind::Native
}

fn default_bridge_url() -> String {
    "https://bridge.qnet.io".to_string()
}

fn default_bridge_timeout() -> u64 {
    30
}

fn default_phase_ttl() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    8_000
}

fn default_poll_interval() -> u64 {
    2_000
}

fn default_max_polls() -> u32 {
    90
}

fn default_ownership_ttl() -> u64 {
    300
}

fn default_transfer_window() -> u64 {
    300
}

// ============================================================================
// Loading & environment override
// ============================================================================

impl WalletConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).with_context(|| "Failed to parse TOML config")
    }

    /// Defaults with every file under `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.wallet.data_dir = data_dir.into();
        config
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `QNET_DATA_DIR`
    /// - `QNET_AUTO_LOCK_SECS`
    /// - `QNET_DEFAULT_NETWORK`
    /// - `QNET_BRIDGE_URL`
    /// - `QNET_BRIDGE_TIMEOUT_SECS`
    /// - `QNET_PHASE_CACHE_TTL_SECS`
    /// - `QNET_KDF_MEMORY_KIB`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("QNET_DATA_DIR") {
            self.wallet.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("QNET_AUTO_LOCK_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                self.wallet.auto_lock_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("QNET_DEFAULT_NETWORK") {
            match v.parse::<NetworkKind>() {
                Ok(kind) => self.network.default_network = kind,
                Err(e) => log::warn!("ignoring QNET_DEFAULT_NETWORK: {}", e),
            }
        }
        if let Ok(v) = std::env::var("QNET_BRIDGE_URL") {
            self.network.bridge_url = v;
        }
        if let Ok(v) = std::env::var("QNET_BRIDGE_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                self.network.bridge_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("QNET_PHASE_CACHE_TTL_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                self.network.phase_cache_ttl_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("QNET_KDF_MEMORY_KIB") {
            if let Ok(kib) = v.parse::<u32>() {
                self.kdf.memory_kib = kib;
            }
        }
    }

    /// Validate that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.wallet.auto_lock_secs > 0 && self.wallet.auto_lock_secs <= MAX_AUTO_LOCK_SECS,
            "wallet.auto_lock_secs must be between 1 and {}",
            MAX_AUTO_LOCK_SECS
        );
        anyhow::ensure!(
            self.wallet.min_password_length >= 1,
            "wallet.min_password_length must be >= 1"
        );

        // Argon2 needs at least 8 KiB per lane
        anyhow::ensure!(
            self.kdf.parallelism >= 1 && self.kdf.iterations >= 1,
            "kdf.parallelism and kdf.iterations must be >= 1"
        );
        anyhow::ensure!(
            self.kdf.memory_kib >= 8 * self.kdf.parallelism,
            "kdf.memory_kib must be at least 8 x kdf.parallelism"
        );
        self.kdf_params()
            .check_strength()
            .context("kdf parameters are too weak")?;

        anyhow::ensure!(
            self.network.bridge_url.starts_with("http://")
                || self.network.bridge_url.starts_with("https://"),
            "network.bridge_url must be an http(s) URL"
        );
        anyhow::ensure!(
            self.network.bridge_timeout_secs > 0,
            "network.bridge_timeout_secs must be > 0"
        );

        anyhow::ensure!(
            self.activation.max_attempts >= 1,
            "activation.max_attempts must be >= 1"
        );
        anyhow::ensure!(
            self.activation.max_polls >= 1,
            "activation.max_polls must be >= 1"
        );
        anyhow::ensure!(
            self.activation.initial_backoff_ms <= self.activation.max_backoff_ms,
            "activation.initial_backoff_ms must not exceed activation.max_backoff_ms"
        );

        for (name, profile) in &self.rate_limits {
            anyhow::ensure!(
                action_by_name(name).is_some(),
                "rate_limits.{}: unknown action",
                name
            );
            anyhow::ensure!(
                profile.max_attempts > 0 && profile.window_ms > 0,
                "rate_limits.{}: max_attempts and window_ms must be > 0",
                name
            );
        }

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Derived component settings
    // ------------------------------------------------------------------------

    pub fn vault_path(&self) -> PathBuf {
        self.wallet.data_dir.join(VAULT_FILE)
    }

    pub fn activation_store_path(&self) -> PathBuf {
        self.wallet.data_dir.join(ACTIVATIONS_FILE)
    }

    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            algorithm: KdfAlgorithm::Argon2id,
            memory_kib: self.kdf.memory_kib,
            iterations: self.kdf.iterations,
            parallelism: self.kdf.parallelism,
        }
    }

    pub fn vault_config(&self) -> VaultConfig {
        VaultConfig {
            kdf: self.kdf_params(),
            auto_lock: Duration::from_secs(self.wallet.auto_lock_secs),
            password_policy: PasswordPolicy {
                min_length: self.wallet.min_password_length,
            },
        }
    }

    pub fn activation_config(&self) -> ActivationConfig {
        let a = &self.activation;
        ActivationConfig {
            retry: RetryPolicy {
                max_attempts: a.max_attempts,
                initial_delay: Duration::from_millis(a.initial_backoff_ms),
                max_delay: Duration::from_millis(a.max_backoff_ms),
            },
            poll_interval: Duration::from_millis(a.poll_interval_ms),
            max_polls: a.max_polls,
        }
    }

    pub fn phase_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.network.phase_cache_ttl_secs)
    }

    pub fn ownership_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.activation.ownership_cache_ttl_secs)
    }

    pub fn transfer_window(&self) -> Duration {
        Duration::from_secs(self.activation.transfer_window_secs)
    }

    pub fn bridge_timeout(&self) -> Duration {
        Duration::from_secs(self.network.bridge_timeout_secs)
    }

    /// Limiter with the default profiles and this config's overrides.
    pub fn rate_limiter(&self, clock: Arc<dyn Clock>) -> RateLimiter {
        self.rate_limits
            .iter()
            .fold(RateLimiter::new(clock), |limiter, (name, profile)| {
                match action_by_name(name) {
                    Some(action) => limiter.with_profile(action, *profile),
                    None => {
                        log::warn!("ignoring rate limit for unknown action {}", name);
                        limiter
                    }
                }
            })
    }
}

fn action_by_name(name: &str) -> Option<RateLimitAction> {
    RateLimitAction::ALL
        .into_iter()
        .find(|a| a.as_str() == name)
}

// ============================================================================
// Tests
// ============================================================================
