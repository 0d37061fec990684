use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("task encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("queue is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, QueueError>;
