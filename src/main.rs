mod config;
mod db;
mod downloader;
mod router;
mod storage;
mod util;

use std::{sync::Arc, time::Duration};

use color_eyre::eyre::WrapErr;
use db::init_database;
use downloader::{BroadcastNotifier, Engine, TaskQueue};
use router::{AppState, create_router};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Periodically pumps every domain with pending transfers, so admission
/// catches up even when a re-pump task was lost
async fn pump_ticker(engine: Arc<Engine>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        match engine.pump_all().await {
            Ok(0) => {}
            Ok(promoted) => tracing::debug!(promoted, "Pump tick admitted transfers"),
            Err(e) => tracing::warn!(error = %e, "Pump tick failed"),
        }
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Could not listen for shutdown signal");
    }
    tracing::info!("Shutting down");
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    color_eyre::install()?;

    let config = config::config();
    let db = init_database(&config.db_config)
        .await
        .wrap_err("Failed to initialize database")?;

    let settings = config.engine_settings();
    tokio::fs::create_dir_all(&settings.storage_root)
        .await
        .wrap_err_with(|| format!("Failed to create {}", settings.storage_root.display()))?;
    tokio::fs::create_dir_all(&settings.tmp_dir)
        .await
        .wrap_err_with(|| format!("Failed to create {}", settings.tmp_dir.display()))?;

    let queue = TaskQueue::new(config.retry_policy());
    let notifier = Arc::new(BroadcastNotifier::default());
    let engine = Arc::new(Engine::new(
        db,
        settings,
        queue.scheduler(),
        notifier.clone(),
    )?);

    let recovered = engine.recover().await?;
    if recovered > 0 {
        tracing::info!(recovered, "Resuming interrupted transfers");
    }

    let shutdown = CancellationToken::new();
    let transfer = &config.transfer_config;
    let workers = queue.run(
        engine.clone(),
        transfer.transfer_workers,
        transfer.chunk_workers,
        shutdown.clone(),
    );
    let ticker = tokio::spawn(pump_ticker(
        engine.clone(),
        Duration::from_secs(transfer.pump_interval_seconds.max(1)),
        shutdown.clone(),
    ));

    let app = create_router(AppState {
        engine,
        events: notifier,
        shutdown: shutdown.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.host)
        .await
        .wrap_err_with(|| format!("Failed to bind {}", config.host))?;
    tracing::info!("Listening on: {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // Workers stop between tasks, interrupted chunks resume on the next start
    shutdown.cancel();
    for worker in workers {
        worker.await?;
    }
    ticker.await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
