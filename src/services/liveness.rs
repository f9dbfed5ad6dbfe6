//! Background liveness sweep for the device inventory

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::store::DeviceStore;
use crate::Result;

/// Periodically flips `online` off for devices whose last inform is older
/// than the offline threshold. The sweep never touches `last_inform`.
pub struct LivenessSweeper {
    store: Arc<DeviceStore>,
    offline_threshold_secs: u64,
    sweep_interval_secs: u64,
}

impl LivenessSweeper {
    pub fn new(
        store: Arc<DeviceStore>,
        offline_threshold_secs: u64,
        sweep_interval_secs: u64,
    ) -> Self {
        Self {
            store,
            offline_threshold_secs,
            sweep_interval_secs,
        }
    }

    /// Run the sweep loop until the token is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.sweep_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Liveness sweeper running every {}s (offline threshold {}s)",
            self.sweep_interval_secs, self.offline_threshold_secs
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!("Liveness sweep failed: {}", e);
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Liveness sweeper stopped");
                    break;
                }
            }
        }
    }

    /// One idempotent sweep pass; returns how many devices were flipped
    pub async fn sweep(&self) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.offline_threshold_secs as i64);
        let flipped = self.store.sweep_offline(cutoff).await?;
        if flipped > 0 {
            info!("Marked {} device(s) offline", flipped);
        }
        Ok(flipped)
    }
}
