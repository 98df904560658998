//! Periodic intermediate renewal
//!
//! The scheduler is the retry layer for renewal: it never retries within a
//! tick, the next tick is the retry.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::{CaManager, LifecycleState};
use crate::Error;

/// Spawns the renewal loop for a [`CaManager`]
pub struct RenewalScheduler;

impl RenewalScheduler {
    /// Call `renew_intermediate` every `period` until `cancel` fires
    ///
    /// Ticks are skipped while the manager is not initialized or this node
    /// is not the leader.
    pub fn spawn(
        manager: Arc<CaManager>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_secs = period.as_secs(), "intermediate renewal scheduler started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tick(&manager, &cancel).await;
            }

            info!("intermediate renewal scheduler stopped");
        })
    }
}

async fn tick(manager: &CaManager, cancel: &CancellationToken) {
    if manager.state() != LifecycleState::Initialized {
        debug!(state = %manager.state(), "skipping renewal check");
        return;
    }
    if !manager.is_leader() {
        debug!("not the leader, skipping renewal check");
        return;
    }

    match manager.renew_intermediate(cancel, false).await {
        Ok(()) => {}
        Err(Error::Busy { operation }) => {
            debug!(%operation, "renewal check skipped, another operation is running");
        }
        Err(Error::Cancelled) => {}
        Err(e) => {
            warn!(error = %e, retryable = e.is_retryable(), "scheduled renewal failed");
        }
    }
}
