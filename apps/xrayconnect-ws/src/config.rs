use serde::Deserialize;
use xrayconnect_shared::settings::{LoggingSettings, RedisSettings, ServerSettings};

pub const DEFAULT_PORT: u16 = 8081;

#[derive(Debug, Clone, Deserialize)]
pub struct WsConfig {
    pub redis: RedisSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub notifier: NotifierSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifierSettings {
    pub consumer_name: String,
    /// Messages buffered per socket before it is considered stale.
    pub client_buffer: usize,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            consumer_name: "ws-1".to_string(),
            client_buffer: 64,
        }
    }
}

impl WsConfig {
    pub fn bind_addr(&self) -> String {
        self.server.bind_addr(DEFAULT_PORT)
    }
}
