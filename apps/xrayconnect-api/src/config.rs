use serde::Deserialize;
use xrayconnect_shared::settings::{DatabaseSettings, LoggingSettings, RedisSettings, ServerSettings};

pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl ApiConfig {
    pub fn bind_addr(&self) -> String {
        self.server.bind_addr(DEFAULT_PORT)
    }
}
