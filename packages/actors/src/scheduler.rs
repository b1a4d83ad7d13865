//! Registry-wide scheduler tick.
//!
//! A single long-lived Tokio task that runs idle checks and cron restarts
//! for every handler at a fixed cadence.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::registry::WeakRegistry;

pub(crate) struct SchedulerTick {
    registry: WeakRegistry,
    interval: Duration,
}

impl SchedulerTick {
    pub(crate) fn new(registry: WeakRegistry, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Run until `cancel` fires or the registry is dropped.
    pub(crate) async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            "Scheduler tick started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Scheduler tick shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let Some(registry) = self.registry.upgrade() else {
                        tracing::debug!("Registry dropped, scheduler tick exiting");
                        break;
                    };
                    registry.tick().await;
                }
            }
        }
    }
}
