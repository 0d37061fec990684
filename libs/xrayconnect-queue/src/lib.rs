pub mod consumer;
pub mod error;
pub mod memory;
pub mod redis_queue;

pub use consumer::{ConsumeOptions, HandlerError, TaskHandler, consume_tasks};
pub use error::QueueError;
pub use memory::MemoryTaskQueue;
pub use redis_queue::RedisTaskQueue;

use std::time::Duration;

use async_trait::async_trait;
use xrayconnect_shared::{Lane, Task};

/// A message taken off a lane but not yet settled. It stays recoverable
/// until the consumer acks or nacks it.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub lane: Lane,
    pub payload: String,
}

#[async_trait]
pub trait TaskPublisher: Send + Sync {
    /// Durably appends `task` to the lane its type routes to.
    async fn publish_task(&self, task: &Task) -> error::Result<()>;
}

#[async_trait]
pub trait TaskConsumer: Send + Sync {
    /// Waits up to `wait` for the next message on `lane`.
    async fn next_delivery(&self, lane: Lane, wait: Duration) -> error::Result<Option<Delivery>>;
    async fn ack(&self, delivery: &Delivery) -> error::Result<()>;
    /// With `requeue` the message becomes the next one handed out on its lane.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> error::Result<()>;
}
