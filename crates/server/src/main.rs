mod api;
mod config;
mod error;
mod main_lib;
mod notifier;
mod scheduler;
mod telegram;

use api::app_router;
use config::Config;
use main_lib::{build_state, init_tracing};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    init_tracing(config.log.format);
    let state = build_state(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = config
        .scheduler
        .enabled
        .then(|| scheduler::start_scheduler(state.clone(), config.scheduler.clone(), shutdown_rx));

    let router = app_router(state.clone(), &config.server);
    tracing::info!("Listening on {}", config.server.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.server.listen_addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    if let Some(handle) = scheduler {
        handle.await?;
    }
    if let Some(ledger) = &state.ledger {
        ledger.close().await;
    }
    Ok(())
}
