use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Queue lanes. Notification tasks travel on their own lane so the
/// WebSocket notifier never competes with provisioning work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Tasks,
    WebsocketNotifications,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::Tasks, Lane::WebsocketNotifications];

    pub fn name(&self) -> &'static str {
        match self {
            Lane::Tasks => "tasks",
            Lane::WebsocketNotifications => "websocket_notifications",
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskType {
    CreateConnection,
    DeleteConnection,
    UpdateTraffic,
    WebsocketNotification,
    /// Anything a newer or older producer sent that this build does not know.
    Other(String),
}

impl TaskType {
    pub fn as_str(&self) -> &str {
        match self {
            TaskType::CreateConnection => "create_connection",
            TaskType::DeleteConnection => "delete_connection",
            TaskType::UpdateTraffic => "update_traffic",
            TaskType::WebsocketNotification => "websocket_notification",
            TaskType::Other(name) => name,
        }
    }

    pub fn lane(&self) -> Lane {
        match self {
            TaskType::WebsocketNotification => Lane::WebsocketNotifications,
            _ => Lane::Tasks,
        }
    }
}

impl From<String> for TaskType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "create_connection" => TaskType::CreateConnection,
            "delete_connection" => TaskType::DeleteConnection,
            "update_traffic" => TaskType::UpdateTraffic,
            "websocket_notification" => TaskType::WebsocketNotification,
            _ => TaskType::Other(value),
        }
    }
}

impl From<TaskType> for String {
    fn from(value: TaskType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One queued side effect. Immutable once published; consumers must be able
/// to process the same task more than once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub user_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nil_as_none")]
    pub server_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nil_as_none")]
    pub connection_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Map::is_empty", deserialize_with = "null_as_empty")]
    pub data: Map<String, Value>,
}

impl Task {
    pub fn create_connection(
        user_id: Uuid,
        server_id: Uuid,
        connection_id: Uuid,
        server_name: &str,
        protocol: &str,
    ) -> Self {
        let mut data = Map::new();
        data.insert("server_name".into(), Value::String(server_name.to_string()));
        data.insert("protocol".into(), Value::String(protocol.to_string()));
        Self {
            task_type: TaskType::CreateConnection,
            user_id,
            server_id: Some(server_id),
            connection_id: Some(connection_id),
            data,
        }
    }

    pub fn delete_connection(user_id: Uuid, server_id: Uuid, connection_id: Uuid) -> Self {
        Self {
            task_type: TaskType::DeleteConnection,
            user_id,
            server_id: Some(server_id),
            connection_id: Some(connection_id),
            data: Map::new(),
        }
    }

    pub fn update_traffic(user_id: Uuid, server_id: Uuid, connection_id: Uuid) -> Self {
        Self {
            task_type: TaskType::UpdateTraffic,
            user_id,
            server_id: Some(server_id),
            connection_id: Some(connection_id),
            data: Map::new(),
        }
    }

    /// `user_id = None` broadcasts to every connected client.
    pub fn notification(user_id: Option<Uuid>, message_type: &str, payload: Value) -> Self {
        let mut data = Map::new();
        data.insert("message_type".into(), Value::String(message_type.to_string()));
        data.insert("payload".into(), payload);
        Self {
            task_type: TaskType::WebsocketNotification,
            user_id: user_id.unwrap_or(Uuid::nil()),
            server_id: None,
            connection_id: None,
            data,
        }
    }

    pub fn lane(&self) -> Lane {
        self.task_type.lane()
    }
}

// Older producers serialise absent ids as the nil UUID.
fn nil_as_none<'de, D>(deserializer: D) -> Result<Option<Uuid>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Uuid>::deserialize(deserializer)?.filter(|id| !id.is_nil()))
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}
