use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use xrayconnect_queue::{ConsumeOptions, RedisTaskQueue, TaskConsumer, consume_tasks};
use xrayconnect_shared::Lane;
use xrayconnect_shared::settings::{self, DEFAULT_CONFIG_PATH};
use xrayconnect_shared::telemetry::init_tracing;
use xrayconnect_ws::config::WsConfig;
use xrayconnect_ws::{NotificationForwarder, router, spawn_hub};

#[derive(Parser)]
#[command(name = "xrayconnect-ws")]
#[command(about = "Pushes notifications to connected clients over WebSocket", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config: WsConfig = settings::load(&cli.config)?;
    let _log_guard = init_tracing("xrayconnect_ws=debug,xrayconnect_queue=info", &config.logging);
    let _ = rustls::crypto::ring::default_provider().install_default();

    let queue = Arc::new(
        RedisTaskQueue::connect(&config.redis.url, &config.redis.key_prefix, &config.notifier.consumer_name).await?,
    );
    queue.recover_in_flight(Lane::WebsocketNotifications).await?;

    let (hub, hub_task) = spawn_hub(config.notifier.client_buffer);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumer_queue: Arc<dyn TaskConsumer> = queue;
    let consumer = tokio::spawn(consume_tasks(
        consumer_queue,
        Lane::WebsocketNotifications,
        Arc::new(NotificationForwarder::new(hub.clone())),
        ConsumeOptions::default(),
        shutdown_rx,
    ));

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("WebSocket notifier listening on {}", addr);

    axum::serve(listener, router(hub))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down notifier...");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = consumer.await {
        error!("Notification consumer panicked: {}", e);
    }
    hub_task.abort();
    Ok(())
}
