use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::task::Task;

pub const CONNECTION_READY: &str = "connection_ready";
pub const CONNECTION_FAILED: &str = "connection_failed";
pub const TRAFFIC_LIMIT_REACHED: &str = "traffic_limit_reached";

const FALLBACK_TYPE: &str = "websocket_notification";

/// Message pushed to live WebSocket clients. `user_id` absent means broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl NotificationMessage {
    pub fn new(message_type: &str, user_id: Option<Uuid>, data: Value) -> Self {
        Self {
            message_type: message_type.to_string(),
            user_id,
            timestamp: Utc::now(),
            data,
        }
    }

    /// Converts a `websocket_notification` task into the client-facing shape.
    pub fn from_task(task: &Task) -> Self {
        let message_type = task
            .data
            .get("message_type")
            .and_then(Value::as_str)
            .unwrap_or(FALLBACK_TYPE);
        let data = task
            .data
            .get("payload")
            .cloned()
            .unwrap_or_else(|| Value::Object(task.data.clone()));
        let user_id = (!task.user_id.is_nil()).then_some(task.user_id);

        Self::new(message_type, user_id, data)
    }

    pub fn is_for(&self, user_id: Uuid) -> bool {
        self.user_id.is_none_or(|target| target == user_id)
    }
}
