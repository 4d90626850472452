//! Service configuration for the coupon node.
//!
//! Provides [`NodeConfig`] with defaults for the data directory, cooldown
//! window, sweep interval and recycling policy. Binaries fill it from the
//! environment or command-line flags.

use std::path::PathBuf;
use std::time::Duration;

use coupon_core::constants::{DEFAULT_COOLDOWN_SECS, DEFAULT_SEED_CODES, DEFAULT_SWEEP_INTERVAL_SECS};
use coupon_core::coordinator::{ClaimConfig, RecyclePolicy};

/// Configuration shared by everything that opens the code database.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Minimum time between successful claims per throttling key, in seconds.
    pub cooldown_secs: u64,
    /// Interval between expiry sweeps, in seconds.
    pub sweep_interval_secs: u64,
    pub policy: RecyclePolicy,
    /// Codes inserted when the pool is empty at startup.
    pub seed_codes: Vec<String>,
    /// Salt mixed into IP hashes.
    pub ip_salt: String,
    /// Derive the IP + cookie + user-agent composite key.
    pub composite_keys: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".coupon-drop");

        Self {
            data_dir,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            policy: RecyclePolicy::default(),
            seed_codes: DEFAULT_SEED_CODES.iter().map(|s| s.to_string()).collect(),
            ip_salt: "coupon-drop".to_string(),
            composite_keys: false,
        }
    }
}

impl NodeConfig {
    /// Path to the RocksDB directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn claim_config(&self) -> ClaimConfig {
        ClaimConfig {
            cooldown: self.cooldown(),
            policy: self.policy,
        }
    }
}
