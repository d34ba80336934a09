//! Periodic lease-expiry sweep.
//!
//! Claimed jobs carry a wall-clock lease. If a worker crashes (or a whole
//! process dies) mid-job, nothing transitions the row out of `processing`;
//! this sweep is the sole recovery mechanism. It runs on an interval and
//! returns expired rows to `pending`, charging one retry against the
//! budget per recovery.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::store::JobStore;

/// Background service that sweeps expired leases.
pub struct LeaseReclaimer {
    store: Arc<dyn JobStore>,
    interval: Duration,
}

impl LeaseReclaimer {
    pub fn new(store: Arc<dyn JobStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Run the sweep until the shutdown token fires.
    pub async fn run(self, shutdown: CancellationToken) {
        debug!(interval_ms = self.interval.as_millis() as u64, "lease reclaimer starting");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.store.reclaim_expired_leases().await {
                Ok(0) => {}
                Ok(reclaimed) => {
                    warn!(reclaimed, "recovered jobs with expired leases");
                }
                Err(e) => {
                    error!(error = %e, "lease reclaim sweep failed");
                }
            }
        }

        debug!("lease reclaimer stopped");
    }
}
