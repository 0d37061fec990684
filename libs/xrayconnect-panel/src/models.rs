use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Standard 3x-ui response envelope.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    pub success: bool,
    #[serde(default)]
    pub msg: String,
    pub obj: Option<T>,
}

/// An inbound as the panel returns it. Fields not modelled here are kept in
/// `extra` so an update writes them back untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inbound {
    pub id: i64,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub port: i64,
    /// JSON document encoded as a string; holds the `clients` array.
    #[serde(default)]
    pub settings: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundClient {
    /// Client UUID for vless and vmess.
    #[serde(default)]
    pub id: String,
    /// Credential for trojan.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    pub email: String,
    #[serde(rename = "totalGB", default)]
    pub total_bytes: i64,
    #[serde(rename = "expiryTime", default)]
    pub expiry_time: i64,
    #[serde(default)]
    pub enable: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InboundClient {
    pub fn new(email: &str, uuid: &str, expiry_millis: i64, total_bytes: i64) -> Self {
        Self {
            id: uuid.to_string(),
            password: String::new(),
            email: email.to_string(),
            total_bytes,
            expiry_time: expiry_millis,
            enable: true,
            extra: Map::new(),
        }
    }

    /// The secret a share link embeds.
    pub fn credential(&self) -> &str {
        if self.id.is_empty() { &self.password } else { &self.id }
    }
}

impl Inbound {
    fn settings_map(&self) -> Result<Map<String, Value>> {
        if self.settings.trim().is_empty() {
            return Ok(Map::new());
        }
        Ok(serde_json::from_str(&self.settings)?)
    }

    pub fn clients(&self) -> Result<Vec<InboundClient>> {
        match self.settings_map()?.remove("clients") {
            Some(clients) => Ok(serde_json::from_value(clients)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn set_clients(&mut self, clients: &[InboundClient]) -> Result<()> {
        let mut settings = self.settings_map()?;
        settings.insert("clients".into(), serde_json::to_value(clients)?);
        self.settings = serde_json::to_string(&settings)?;
        Ok(())
    }
}

/// Result of adding a client. `position` is 1-based, so 0 never names a client.
#[derive(Debug, Clone, PartialEq)]
pub struct AddedClient {
    pub position: i32,
    pub uuid: String,
    /// True when a client with the same email already existed and was reused.
    pub reused: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ClientTraffic {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub up: i64,
    #[serde(default)]
    pub down: i64,
    #[serde(default)]
    pub total: i64,
}

impl ClientTraffic {
    pub fn used(&self) -> i64 {
        self.up.saturating_add(self.down)
    }
}
