use async_trait::async_trait;
use tracing::{debug, warn};
use xrayconnect_queue::{HandlerError, TaskHandler};
use xrayconnect_shared::{NotificationMessage, Task, TaskType};

use crate::hub::HubHandle;

/// Turns tasks from the notification lane into hub broadcasts.
pub struct NotificationForwarder {
    hub: HubHandle,
}

impl NotificationForwarder {
    pub fn new(hub: HubHandle) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl TaskHandler for NotificationForwarder {
    async fn handle(&self, task: Task) -> Result<(), HandlerError> {
        if task.task_type != TaskType::WebsocketNotification {
            warn!(task_type = %task.task_type, "Ignoring non-notification task on notification lane");
            return Ok(());
        }

        let msg = NotificationMessage::from_task(&task);
        debug!(message_type = %msg.message_type, user_id = ?msg.user_id, "Forwarding notification");
        self.hub
            .broadcast(msg)
            .await
            .map_err(|e| HandlerError::Retryable(e.into()))
    }
}
