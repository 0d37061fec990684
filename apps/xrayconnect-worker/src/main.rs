use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use xrayconnect_db::PgStore;
use xrayconnect_queue::{ConsumeOptions, RedisTaskQueue, TaskConsumer, consume_tasks};
use xrayconnect_shared::Lane;
use xrayconnect_shared::settings::{self, DEFAULT_CONFIG_PATH};
use xrayconnect_shared::telemetry::init_tracing;
use xrayconnect_worker::config::WorkerConfig;
use xrayconnect_worker::{HttpPanelConnector, Provisioner, TrafficSweep};

#[derive(Parser)]
#[command(name = "xrayconnect-worker")]
#[command(about = "Provisions VPN connections on Xray panels", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config: WorkerConfig = settings::load(&cli.config)?;
    let _log_guard = init_tracing(
        "xrayconnect_worker=debug,xrayconnect_queue=info,sqlx=warn",
        &config.logging,
    );
    let _ = rustls::crypto::ring::default_provider().install_default();

    let pool = xrayconnect_db::connect(&config.database.url, config.database.max_connections).await?;
    let store = Arc::new(PgStore::new(pool));
    let queue = Arc::new(
        RedisTaskQueue::connect(&config.redis.url, &config.redis.key_prefix, &config.worker.consumer_name).await?,
    );
    queue.recover_in_flight(Lane::Tasks).await?;

    let panels = Arc::new(HttpPanelConnector::new(Duration::from_secs(config.panel.timeout_secs)));
    let provisioner = Arc::new(Provisioner::new(
        store.clone(),
        queue.clone(),
        panels,
        &config.worker.subscription_base_url,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let options = ConsumeOptions {
        requeue_delay: config.worker.requeue_delay(),
        ..ConsumeOptions::default()
    };

    let mut handles = Vec::new();
    for _ in 0..config.worker.concurrency.max(1) {
        let consumer: Arc<dyn TaskConsumer> = queue.clone();
        handles.push(tokio::spawn(consume_tasks(
            consumer,
            Lane::Tasks,
            provisioner.clone(),
            options.clone(),
            shutdown_rx.clone(),
        )));
    }

    if let Some(period) = config.worker.traffic_sync_interval() {
        let sweep = TrafficSweep::new(store.clone(), queue.clone(), period);
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { sweep.start(rx).await }));
    }

    info!(
        consumers = config.worker.concurrency.max(1),
        "Worker started, waiting for tasks"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down worker...");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Worker task panicked: {}", e);
        }
    }
    Ok(())
}
