mod health;
mod shutdown;

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use viz_worker_engine::config::{LogFormat, WorkerConfig};
use viz_worker_engine::start_worker;

use crate::shutdown::{spawn_signal_handler, ShutdownController, ShutdownEvent};

fn init_tracing(config: &WorkerConfig) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::parse();
    init_tracing(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        broker_url = %config.broker_url,
        consumer_name = %config.consumer_name,
        "starting visualization-transform worker"
    );

    // §4.H startup order: object store → broker/consumer → health endpoints → fetch loop.
    let worker = start_worker(config.clone()).await?;

    let health_router = health::router(worker.readiness.clone(), worker.metrics_handle());
    let health_addr = format!("0.0.0.0:{}", config.health_port);
    let listener = tokio::net::TcpListener::bind(&health_addr).await?;
    tracing::info!(addr = %health_addr, "health endpoints listening");
    let health_task = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, health_router).await {
            tracing::error!(error = %err, "health server exited");
        }
    });

    let shutdown_controller = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_signal_handler(shutdown_controller, shutdown_tx);

    let mut metrics_ticker = tokio::time::interval(Duration::from_secs(60));
    metrics_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            ev = shutdown_rx.recv() => {
                match ev {
                    Some(ShutdownEvent::Graceful) => {
                        tracing::info!("shutdown requested, draining in-flight jobs");
                        worker.request_stop();
                        break;
                    }
                    Some(ShutdownEvent::Immediate) => {
                        tracing::warn!("second shutdown signal received, exiting immediately");
                        health_task.abort();
                        std::process::exit(130);
                    }
                    None => break,
                }
            }
            _ = metrics_ticker.tick() => {
                tracing::debug!(active_jobs = worker.active_job_count(), "heartbeat");
            }
        }
    }

    health_task.abort();
    worker.wait().await?;
    Ok(())
}
