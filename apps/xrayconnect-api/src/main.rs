use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use xrayconnect_api::config::ApiConfig;
use xrayconnect_api::{AppState, ConnectionService, router};
use xrayconnect_db::PgStore;
use xrayconnect_queue::RedisTaskQueue;
use xrayconnect_shared::settings::{self, DEFAULT_CONFIG_PATH};
use xrayconnect_shared::telemetry::init_tracing;

#[derive(Parser)]
#[command(name = "xrayconnect-api")]
#[command(about = "HTTP API for VPN connections", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config: ApiConfig = settings::load(&cli.config)?;
    let _log_guard = init_tracing("xrayconnect_api=debug,tower_http=info,sqlx=warn", &config.logging);
    let _ = rustls::crypto::ring::default_provider().install_default();

    let pool = xrayconnect_db::connect(&config.database.url, config.database.max_connections).await?;
    let store = Arc::new(PgStore::new(pool));
    let queue = Arc::new(RedisTaskQueue::connect(&config.redis.url, &config.redis.key_prefix, "api").await?);

    let state = AppState {
        connection_service: Arc::new(ConnectionService::new(store, queue)),
    };

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down API...");
        })
        .await?;
    Ok(())
}
