use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, info};
use xrayconnect_shared::{Lane, Task};

use crate::error::Result;
use crate::{Delivery, TaskConsumer, TaskPublisher};

/// Reliable queue on Redis lists.
///
/// Producers `LPUSH` onto `{prefix}:queue:{lane}`. A consumer atomically moves
/// the oldest message into its own processing list and removes it from there
/// on ack. Messages left in a processing list by a crashed consumer are
/// returned to the lane by [`RedisTaskQueue::recover_in_flight`].
#[derive(Clone)]
pub struct RedisTaskQueue {
    conn: ConnectionManager,
    prefix: String,
    consumer_id: String,
}

impl RedisTaskQueue {
    pub async fn connect(redis_url: &str, prefix: &str, consumer_id: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        info!(prefix, consumer_id, "Task queue connected to Redis");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            consumer_id: consumer_id.to_string(),
        })
    }

    pub fn pending_key(&self, lane: Lane) -> String {
        pending_key(&self.prefix, lane)
    }

    pub fn processing_key(&self, lane: Lane) -> String {
        processing_key(&self.prefix, lane, &self.consumer_id)
    }

    /// Moves everything this consumer left unsettled back onto the lane,
    /// ahead of newer messages.
    pub async fn recover_in_flight(&self, lane: Lane) -> Result<usize> {
        let mut conn = self.conn.clone();
        let processing = self.processing_key(lane);
        let pending = self.pending_key(lane);
        let mut recovered = 0usize;
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&processing)
                .arg(&pending)
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        if recovered > 0 {
            info!(lane = %lane, recovered, "Recovered unacknowledged tasks");
        }
        Ok(recovered)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskPublisher for RedisTaskQueue {
    async fn publish_task(&self, task: &Task) -> Result<()> {
        let payload = serde_json::to_string(task)?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(self.pending_key(task.lane()))
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        debug!(task_type = %task.task_type, lane = %task.lane(), "Task published");
        Ok(())
    }
}

#[async_trait]
impl TaskConsumer for RedisTaskQueue {
    async fn next_delivery(&self, lane: Lane, wait: Duration) -> Result<Option<Delivery>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = redis::cmd("LMOVE")
            .arg(self.pending_key(lane))
            .arg(self.processing_key(lane))
            .arg("RIGHT")
            .arg("LEFT")
            .query_async(&mut conn)
            .await?;

        match payload {
            Some(payload) => Ok(Some(Delivery { lane, payload })),
            None => {
                // Multiplexed connections must not issue blocking pops.
                tokio::time::sleep(wait).await;
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LREM")
            .arg(self.processing_key(delivery.lane))
            .arg(1)
            .arg(&delivery.payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        if !requeue {
            return self.ack(delivery).await;
        }
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(self.processing_key(delivery.lane))
            .arg(1)
            .arg(&delivery.payload)
            .ignore()
            .cmd("RPUSH")
            .arg(self.pending_key(delivery.lane))
            .arg(&delivery.payload)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

fn pending_key(prefix: &str, lane: Lane) -> String {
    format!("{prefix}:queue:{lane}")
}

fn processing_key(prefix: &str, lane: Lane, consumer_id: &str) -> String {
    format!("{prefix}:queue:{lane}:processing:{consumer_id}")
}
