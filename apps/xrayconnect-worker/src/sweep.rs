use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};
use xrayconnect_db::ProvisioningStore;
use xrayconnect_queue::TaskPublisher;
use xrayconnect_shared::Task;

/// Periodically queues an `update_traffic` task for every live, provisioned
/// connection.
pub struct TrafficSweep {
    store: Arc<dyn ProvisioningStore>,
    queue: Arc<dyn TaskPublisher>,
    period: Duration,
}

impl TrafficSweep {
    pub fn new(store: Arc<dyn ProvisioningStore>, queue: Arc<dyn TaskPublisher>, period: Duration) -> Self {
        Self { store, queue, period }
    }

    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) {
        info!(period_secs = self.period.as_secs(), "Starting traffic sweep");
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; let the worker settle first.
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!("Traffic sweep error: {:#}", e);
                    }
                }
            }
        }
        info!("Traffic sweep stopped");
    }

    pub async fn sweep_once(&self) -> Result<usize> {
        let connections = self.store.list_provisioned_connections().await?;
        let mut queued = 0usize;
        for conn in &connections {
            let task = Task::update_traffic(conn.user_id, conn.server_id, conn.id);
            match self.queue.publish_task(&task).await {
                Ok(()) => queued += 1,
                Err(e) => error!(connection_id = %conn.id, "Failed to queue traffic update: {}", e),
            }
        }
        if queued > 0 {
            info!("Queued traffic updates for {} connections", queued);
        }
        Ok(queued)
    }
}
