//! Service composition.
//!
//! [`CouponNode`] opens the RocksDB store once, seeds it, and hands the same
//! store handle to the claim coordinator and the sweeper. Nothing here is
//! global: every consumer receives the handle at construction.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use coupon_core::coordinator::ClaimCoordinator;
use coupon_core::error::CouponError;
use coupon_core::identity::IdentityResolver;
use coupon_core::store::CouponStore;

use crate::config::NodeConfig;
use crate::storage::RocksStore;
use crate::sweeper::Sweeper;

/// A running coupon service: store, coordinator and (policy permitting) sweeper.
pub struct CouponNode {
    store: Arc<dyn CouponStore>,
    coordinator: Arc<ClaimCoordinator>,
    config: NodeConfig,
}

impl CouponNode {
    /// Open the database under `config.db_path()` and build the service.
    pub fn open(config: NodeConfig) -> Result<Self, CouponError> {
        let store = RocksStore::open(config.db_path())?;
        Self::with_store(Arc::new(store), config)
    }

    /// Open a database at an explicit path.
    pub fn open_at(path: impl AsRef<Path>, config: NodeConfig) -> Result<Self, CouponError> {
        let store = RocksStore::open(path)?;
        Self::with_store(Arc::new(store), config)
    }

    /// Build the service on top of an existing store and seed it if empty.
    pub fn with_store(store: Arc<dyn CouponStore>, config: NodeConfig) -> Result<Self, CouponError> {
        let resolver = IdentityResolver::new(config.ip_salt.clone()).with_composite(config.composite_keys);
        let coordinator = Arc::new(ClaimCoordinator::new(
            Arc::clone(&store),
            resolver,
            config.claim_config(),
        ));

        coordinator.pool().seed(&config.seed_codes, Utc::now())?;
        let stats = coordinator.pool().stats()?;
        info!(
            total = stats.total,
            available = stats.available,
            policy = %config.policy,
            cooldown_secs = config.cooldown_secs,
            "coupon node ready"
        );

        Ok(Self {
            store,
            coordinator,
            config,
        })
    }

    pub fn coordinator(&self) -> Arc<ClaimCoordinator> {
        Arc::clone(&self.coordinator)
    }

    pub fn store(&self) -> Arc<dyn CouponStore> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Start the sweeper if the recycling policy calls for one.
    pub fn spawn_sweeper(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if !self.config.policy.runs_sweeper() {
            info!(policy = %self.config.policy, "sweeper disabled by recycle policy");
            return None;
        }
        let sweeper = Sweeper::new(
            self.coordinator.pool().clone(),
            self.config.cooldown(),
            self.config.sweep_interval(),
        );
        Some(sweeper.spawn(shutdown))
    }
}
