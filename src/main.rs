use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use ddui_core::{
    run_drift_and_auto_devops_pass, run_fleet_scanner_loop, run_iac_scanner_loop, AppContext,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("starting dd-ui core");

    let ctx = Arc::new(AppContext::bootstrap().await?);
    let shutdown = CancellationToken::new();

    let fleet_scanner = tokio::spawn(run_fleet_scanner_loop(ctx.clone(), shutdown.clone()));
    let iac_scanner = tokio::spawn(run_iac_scanner_loop(ctx.clone(), shutdown.clone()));
    let drift_loop = tokio::spawn(run_drift_loop(ctx.clone(), shutdown.clone()));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping tickers");
    shutdown.cancel();

    let _ = tokio::join!(fleet_scanner, iac_scanner, drift_loop);

    info!("closing database connection pool");
    match Arc::try_unwrap(ctx) {
        Ok(ctx) => ctx.db.close().await,
        Err(_) => info!("context still referenced elsewhere, skipping explicit pool close"),
    }

    info!("shutdown complete");
    Ok(())
}

/// Runs the Drift Engine + Auto-DevOps pass on the same cadence as the IaC
/// scanner, since drift can only change after a scan observed something.
async fn run_drift_loop(ctx: Arc<AppContext>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.config.scan.iac_scan_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_drift_and_auto_devops_pass(&ctx).await;
            }
            _ = shutdown.cancelled() => {
                info!("drift/auto-devops ticker stopped");
                return;
            }
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
