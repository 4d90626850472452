//! Periodic release of expired claims.
//!
//! Each tick calls [`CodePool::release_expired`] with `now - window`. Store
//! failures are logged and the next tick simply tries again; the task only
//! ends when the shutdown signal flips.
//!
//! The threshold is strict: a code claimed at `T` is released by the first
//! tick after `T + window`. The claimant's cooldown already ends at exactly
//! `T + window`, so the code can lag its claimant by up to one interval.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use coupon_core::error::CouponError;
use coupon_core::pool::CodePool;

/// Returns claimed codes to the pool once their claim outlives the window.
#[derive(Clone)]
pub struct Sweeper {
    pool: CodePool,
    window: Duration,
    interval: Duration,
}

impl Sweeper {
    pub fn new(pool: CodePool, window: Duration, interval: Duration) -> Self {
        Self {
            pool,
            window,
            interval,
        }
    }

    /// Oldest claim time that is still considered live at `now`.
    pub fn threshold(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Run one sweep, returning how many codes were released.
    pub fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize, CouponError> {
        self.pool.release_expired(self.threshold(now))
    }

    /// Spawn the sweep loop. It exits once `shutdown` reads `true` or its
    /// sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = self.interval.as_secs(),
                window_secs = self.window.as_secs(),
                "sweeper: started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let sweeper = self.clone();
                match tokio::task::spawn_blocking(move || sweeper.sweep_once(Utc::now())).await {
                    Ok(Ok(0)) => debug!("sweeper: nothing to release"),
                    Ok(Ok(released)) => info!(released, "sweeper: released expired codes"),
                    Ok(Err(e)) => warn!(error = %e, "sweeper: sweep failed, retrying next tick"),
                    Err(e) => error!(error = %e, "sweeper: sweep task panicked"),
                }
            }

            info!("sweeper: stopped");
        })
    }
}
