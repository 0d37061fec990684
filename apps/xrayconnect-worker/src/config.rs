use std::time::Duration;

use serde::Deserialize;
use xrayconnect_shared::settings::{DatabaseSettings, LoggingSettings, RedisSettings};

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub panel: PanelSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Processing-list owner; must be unique per running worker process.
    pub consumer_name: String,
    pub concurrency: usize,
    pub requeue_delay_ms: u64,
    pub subscription_base_url: String,
    /// 0 disables the periodic traffic sweep.
    pub traffic_sync_interval_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            consumer_name: "worker-1".to_string(),
            concurrency: 1,
            requeue_delay_ms: 1000,
            subscription_base_url: "https://api.xray-service.io".to_string(),
            traffic_sync_interval_secs: 600,
        }
    }
}

impl WorkerSettings {
    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }

    pub fn traffic_sync_interval(&self) -> Option<Duration> {
        (self.traffic_sync_interval_secs > 0).then(|| Duration::from_secs(self.traffic_sync_interval_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PanelSettings {
    pub timeout_secs: u64,
}

impl Default for PanelSettings {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}
