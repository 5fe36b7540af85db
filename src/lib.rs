//! Core library: configuration, storage, and the four subsystems
//! (Fleet Scanner, IaC Catalog Scanner, Drift Engine, Deployment
//! Orchestrator) that `main.rs` schedules.

pub mod config;
pub mod db;
pub mod docker;
pub mod drift;
pub mod error;
pub mod hash;
pub mod host_directory;
pub mod iac;
pub mod orchestrator;
pub mod policy;
pub mod scanner;
pub mod sops;
pub mod ssh;
pub mod stager;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::error::CoreError;

/// Everything a running instance needs, handed to every ticker task.
pub struct AppContext {
    pub config: Config,
    pub db: Database,
}

impl AppContext {
    pub async fn bootstrap() -> Result<Self, CoreError> {
        let config = Config::load()?;
        let db = Database::connect(&config.db).await?;
        if config.db.migrate {
            db.migrate().await?;
        }
        Ok(Self { config, db })
    }
}

/// Run the Fleet Scanner on a ticker until `shutdown` is cancelled. Fires
/// once immediately if `config.scan.on_start`, then on every tick of
/// `config.scan.interval`.
pub async fn run_fleet_scanner_loop(ctx: Arc<AppContext>, shutdown: CancellationToken) {
    if ctx.config.scan.on_start {
        run_fleet_scan_once(&ctx).await;
    }

    let mut ticker = tokio::time::interval(ctx.config.scan.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_fleet_scan_once(&ctx).await;
            }
            _ = shutdown.cancelled() => {
                info!("fleet scanner ticker stopped");
                return;
            }
        }
    }
}

async fn run_fleet_scan_once(ctx: &AppContext) {
    if !ctx.config.scan.auto {
        return;
    }
    match scanner::scan(ctx.db.pool(), &ctx.config).await {
        Ok(outcome) => info!(?outcome, "fleet scan pass complete"),
        Err(e) => error!(error = %e, "fleet scan pass failed"),
    }
}

/// Run the IaC Catalog Scanner on its own ticker until `shutdown` is
/// cancelled.
pub async fn run_iac_scanner_loop(ctx: Arc<AppContext>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.config.scan.iac_scan_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_iac_scan_once(&ctx).await;
            }
            _ = shutdown.cancelled() => {
                info!("iac scanner ticker stopped");
                return;
            }
        }
    }
}

async fn run_iac_scan_once(ctx: &AppContext) {
    if !ctx.config.scan.iac_scan_auto {
        return;
    }
    match iac::scanner::scan(ctx.db.pool(), &ctx.config.iac, &ctx.config.sops_bin).await {
        Ok(outcome) => info!(?outcome, "iac scan pass complete"),
        Err(e) => error!(error = %e, "iac scan pass failed"),
    }
}

/// Evaluate drift for every known IaC stack and, where Auto-DevOps allows
/// it, trigger a redeploy. Run on the same cadence as the IaC scanner:
/// drift can only change after an IaC scan or a Fleet scan observed
/// something new.
pub async fn run_drift_and_auto_devops_pass(ctx: &AppContext) {
    let repos = match db::models::iac_repo::IacRepo::list_enabled(ctx.db.pool()).await {
        Ok(repos) => repos,
        Err(e) => {
            error!(error = %e, "could not list iac repos for drift pass");
            return;
        }
    };

    for repo in repos {
        let stacks = match db::models::iac_stack::IacStack::list_for_repo(ctx.db.pool(), repo.id).await {
            Ok(stacks) => stacks,
            Err(e) => {
                error!(repo_id = repo.id, error = %e, "could not list stacks for drift pass");
                continue;
            }
        };

        for stack in stacks {
            if !stack.iac_enabled {
                continue;
            }
            match drift::check(ctx.db.pool(), stack.id).await {
                Ok(result) if result.drift_detected => {
                    info!(stack_id = stack.id, reason = %result.reason, "drift detected, evaluating auto-deploy");
                    match orchestrator::deploy(ctx.db.pool(), &ctx.config, stack.id, false).await {
                        Ok(outcome) => info!(stack_id = stack.id, ?outcome, "auto-devops deploy attempt finished"),
                        Err(e) => warn!(stack_id = stack.id, error = %e, "auto-devops deploy attempt failed"),
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(stack_id = stack.id, error = %e, "drift check failed"),
            }
        }
    }
}
