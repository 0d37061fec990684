//! Layered configuration shared by the binaries: optional TOML file, then
//! `XRAYCONNECT__SECTION__KEY` environment variables, then the well-known
//! `DATABASE_URL`, `REDIS_URL` and `LISTEN_PORT`.

use std::env;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use serde::de::DeserializeOwned;

pub const DEFAULT_CONFIG_PATH: &str = "config/xrayconnect.toml";
const ENV_PREFIX: &str = "XRAYCONNECT";

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl ServerSettings {
    pub fn bind_addr(&self, default_port: u16) -> String {
        format!(
            "{}:{}",
            self.host.as_deref().unwrap_or("0.0.0.0"),
            self.port.unwrap_or(default_port)
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: Option<String>,
    /// Also write logs to this file.
    pub file: Option<String>,
}

fn default_max_connections() -> u32 {
    20
}

fn default_key_prefix() -> String {
    "xrayconnect".to_string()
}

pub fn load<T: DeserializeOwned>(path: &str) -> Result<T> {
    let _ = dotenvy::dotenv();

    let config = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .set_override_option("database.url", env::var("DATABASE_URL").ok())?
        .set_override_option("redis.url", env::var("REDIS_URL").ok())?
        .set_override_option("server.port", env::var("LISTEN_PORT").ok())?
        .build()
        .with_context(|| format!("Failed to read configuration from {path}"))?;

    config.try_deserialize().context("Invalid configuration")
}
