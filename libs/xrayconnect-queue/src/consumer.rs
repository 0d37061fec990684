use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use xrayconnect_shared::{Lane, Task};

use crate::{Delivery, TaskConsumer};

/// How a handler wants its message settled.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Redelivery may succeed; the message is requeued.
    #[error("{0:#}")]
    Retryable(anyhow::Error),
    /// Redelivery cannot help; the message is dropped.
    #[error("{0:#}")]
    Terminal(anyhow::Error),
}

/// Handlers report their own permanent failures; the delivery loop only
/// settles the message.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    /// Pause before a retryable failure goes back on the lane.
    pub requeue_delay: Duration,
    /// Idle wait between polls of an empty lane.
    pub poll_interval: Duration,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            requeue_delay: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Pulls messages from `lane` one at a time until `shutdown` flips to true
/// or its sender is dropped.
pub async fn consume_tasks<H>(
    queue: Arc<dyn TaskConsumer>,
    lane: Lane,
    handler: Arc<H>,
    options: ConsumeOptions,
    mut shutdown: watch::Receiver<bool>,
) where
    H: TaskHandler + ?Sized,
{
    info!(lane = %lane, "Consumer started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            next = queue.next_delivery(lane, options.poll_interval) => next,
        };

        match next {
            Ok(Some(delivery)) => settle(queue.as_ref(), handler.as_ref(), &options, delivery).await,
            Ok(None) => {}
            Err(e) => {
                error!(lane = %lane, "Failed to fetch task: {}", e);
                tokio::time::sleep(options.poll_interval).await;
            }
        }
    }
    info!(lane = %lane, "Consumer stopped");
}

async fn settle<H>(queue: &dyn TaskConsumer, handler: &H, options: &ConsumeOptions, delivery: Delivery)
where
    H: TaskHandler + ?Sized,
{
    let task: Task = match serde_json::from_str(&delivery.payload) {
        Ok(task) => task,
        Err(e) => {
            warn!(lane = %delivery.lane, "Dropping undecodable task: {}", e);
            if let Err(e) = queue.nack(&delivery, false).await {
                error!("Failed to drop poison message: {}", e);
            }
            return;
        }
    };

    let task_type = task.task_type.clone();
    let outcome = match handler.handle(task).await {
        Ok(()) => {
            debug!(task_type = %task_type, "Task processed");
            queue.ack(&delivery).await
        }
        Err(HandlerError::Retryable(e)) => {
            warn!(task_type = %task_type, "Task failed, requeueing: {:#}", e);
            tokio::time::sleep(options.requeue_delay).await;
            queue.nack(&delivery, true).await
        }
        Err(HandlerError::Terminal(e)) => {
            debug!(task_type = %task_type, "Dropping task after permanent failure: {:#}", e);
            queue.nack(&delivery, false).await
        }
    };

    if let Err(e) = outcome {
        error!(task_type = %task_type, "Failed to settle task: {}", e);
    }
}
