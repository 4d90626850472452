//! # coupon-node: RocksDB storage, sweeper, composition.
//!
//! Composes the coupon-core components into a running service:
//! - [`storage::RocksStore`]: persistent pool and ledger backed by RocksDB
//! - [`sweeper::Sweeper`]: periodic release of expired claims
//! - [`node::CouponNode`]: store, coordinator and sweeper wired together
//! - [`config::NodeConfig`]: service configuration

pub mod config;
pub mod node;
pub mod storage;
pub mod sweeper;

pub use config::NodeConfig;
pub use node::CouponNode;
pub use storage::RocksStore;
pub use sweeper::Sweeper;
