//! Deployment Orchestrator: the `deploy(stack_id, manual?)` operation that
//! gates on policy, stages the workspace, shells out to Compose, and
//! refreshes every bit of state downstream deploys and drift checks read.

use std::time::Duration;

use sqlx::PgPool;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::{Config, DockerConfig};
use crate::db::models::container::Container;
use crate::db::models::deployment_stamp::{DeploymentMethod, DeploymentStamp, DeploymentStatus};
use crate::db::models::enrollment::ServiceEnrollment;
use crate::db::models::host::Host;
use crate::db::models::iac_stack::{IacStack, ScopeKind};
use crate::db::models::runtime_stack::RuntimeStack;
use crate::docker;
use crate::drift;
use crate::error::CoreError;
use crate::hash;
use crate::host_directory;
use crate::policy;
use crate::stager::{self, StagedStack};

const ASSOCIATION_RETRY_DELAYS: &[Duration] =
    &[Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(3), Duration::from_secs(5)];

/// What happened when `deploy` was asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    /// Applied successfully; carries the stamp id.
    Applied { stamp_id: i64 },
    /// Auto-DevOps policy disallowed this (non-manual) deploy.
    PolicyDenied { origin: String },
    /// Nothing to deploy: no compose files tracked for this stack.
    NothingToStage,
    /// Bundle hash matches the latest successful stamp; nothing changed.
    NoChange,
}

/// Deploy a stack. `manual` bypasses the Auto-DevOps policy gate (an
/// explicit user-triggered deploy is always allowed); otherwise the policy
/// chain decides.
pub async fn deploy(pool: &PgPool, cfg: &Config, stack_id: i64, manual: bool) -> Result<DeployOutcome, CoreError> {
    let stack = IacStack::find_by_id(pool, stack_id)
        .await?
        .ok_or_else(|| CoreError::stage_failed(format!("stack {stack_id} not found")))?;

    if !manual {
        let decision = policy::resolve(pool, &cfg.policy, &stack).await?;
        if !decision.enabled {
            return Ok(DeployOutcome::PolicyDenied { origin: decision.origin.as_str().to_string() });
        }
    }

    let Some(mut staged) = stager::stage(pool, &cfg.iac, &cfg.sops_bin, &cfg.docker_bin, stack_id).await? else {
        return Ok(DeployOutcome::NothingToStage);
    };

    let outcome = run_staged(pool, cfg, &stack, manual, &mut staged).await;
    staged.cleanup();
    outcome
}

async fn run_staged(
    pool: &PgPool,
    cfg: &Config,
    stack: &IacStack,
    manual: bool,
    staged: &mut StagedStack,
) -> Result<DeployOutcome, CoreError> {
    let stack_id = stack.id;
    if !manual {
        if let Some(latest) = DeploymentStamp::latest_success(pool, stack_id).await? {
            if latest.deployment_hash == staged.bundle_hash {
                return Ok(DeployOutcome::NoChange);
            }
        }
    }

    let stamp = DeploymentStamp::create_pending(
        pool,
        stack_id,
        &staged.bundle_hash,
        DeploymentMethod::Compose,
        None,
        None,
    )
    .await?;

    let mut args: Vec<String> = vec!["compose".to_string(), "-p".to_string(), staged.project.clone()];
    for file in &staged.compose_files {
        args.push("-f".to_string());
        args.push(file.display().to_string());
    }
    args.push("up".to_string());
    args.push("-d".to_string());
    args.push("--remove-orphans".to_string());

    let output = Command::new(&cfg.docker_bin)
        .args(&args)
        .current_dir(&staged.workspace_dir)
        .output()
        .await
        .map_err(|e| CoreError::compose_failed(format!("spawning docker compose: {e}")))?;

    if !output.status.success() {
        DeploymentStamp::finish(pool, stamp.id, DeploymentStatus::Failed).await?;
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(CoreError::compose_failed(format!(
            "docker compose up failed for project {}: {stderr}",
            staged.project
        )));
    }

    DeploymentStamp::finish(pool, stamp.id, DeploymentStatus::Success).await?;
    info!(stack_id, project = %staged.project, stamp_id = stamp.id, "deployment applied");

    tokio::spawn(associate_containers(
        pool.clone(),
        cfg.docker.clone(),
        stack.scope_kind(),
        stack.scope_name.clone(),
        staged.project.clone(),
        stamp.id,
        staged.bundle_hash.clone(),
    ));

    for (service_name, plan) in &staged.service_labels {
        ServiceEnrollment::record_deploy(pool, stack_id, service_name, &plan.deploy_uid, &plan.spec_digest)
            .await?;
    }

    // The drift cache must be seeded with the same hash space Tier 2 reads
    // off running containers (the `com.docker.compose.config-hash` label),
    // not this crate's own spec digest. Ask Compose for it directly; if the
    // call fails, skip the cache refresh rather than poison it with the
    // wrong kind of hash; the next scheduled drift check will see a stale
    // cache and re-resolve it then.
    match hash::resolved_compose_hashes(&cfg.docker_bin, &staged.project, &staged.compose_files, &staged.workspace_dir)
        .await
    {
        Ok((_, per_service_hashes)) => {
            drift::refresh_after_deploy(pool, stack_id, &staged.bundle_hash, &per_service_hashes).await?;
        }
        Err(e) => {
            warn!(
                stack_id,
                project = %staged.project,
                error = %e,
                "could not resolve compose config hashes after deploy, leaving drift cache stale"
            );
        }
    }

    Ok(DeployOutcome::Applied { stamp_id: stamp.id })
}

/// Batch-associate the project's containers with the stamp, retrying on a
/// bounded backoff. Each attempt first reconciles live containers straight
/// off the target Docker daemon for host-scoped stacks (the Fleet Scanner's
/// own ticker may not have run since the deploy), then associates from the
/// `containers` table, which the reconciliation step just brought current.
/// Spawned as a detached background task so the user-facing deploy call
/// returns as soon as Compose reports success; errors are logged, never
/// propagated.
#[allow(clippy::too_many_arguments)]
async fn associate_containers(
    pool: PgPool,
    docker_cfg: DockerConfig,
    scope_kind: ScopeKind,
    scope_name: String,
    project: String,
    stamp_id: i64,
    deployment_hash: String,
) {
    for delay in ASSOCIATION_RETRY_DELAYS {
        sleep(*delay).await;

        if let Err(e) = reconcile_live_containers(&pool, &docker_cfg, scope_kind, &scope_name, &project).await {
            warn!(project, stamp_id, error = %e, "live container reconciliation failed, falling back to db state");
        }

        match Container::associate_with_stamp(&pool, &project, stamp_id, &deployment_hash).await {
            Ok(n) if n > 0 => return,
            Ok(_) => continue,
            Err(e) => {
                warn!(project, stamp_id, error = %e, "container association attempt failed");
            }
        }
    }
    warn!(project, stamp_id, "no containers associated with stamp after all retries");
}

/// Dial a host-scoped stack's own Docker daemon and upsert whatever it
/// reports for `project` right now, so the association query above has
/// fresh rows to match even on a deploy that lands between Fleet Scanner
/// ticks. Group-scoped stacks have no single host to dial and are left to
/// the scanner's own cadence.
async fn reconcile_live_containers(
    pool: &PgPool,
    docker_cfg: &DockerConfig,
    scope_kind: ScopeKind,
    scope_name: &str,
    project: &str,
) -> Result<(), CoreError> {
    if scope_kind != ScopeKind::Host {
        return Ok(());
    }

    let Some(host) = Host::find_by_name(pool, scope_name).await? else {
        return Ok(());
    };

    if host_directory::should_skip_local(&host, docker_cfg) {
        return Ok(());
    }

    let descriptor = host_directory::resolve(&host, docker_cfg)?;
    let handle = docker::connect(&descriptor, docker_cfg).await?;
    let containers = docker::list_containers_by_project(&handle.client, project).await?;

    if containers.is_empty() {
        return Ok(());
    }

    let runtime_stack_id = RuntimeStack::upsert(pool, host.id, project).await?.id;
    for scanned in &containers {
        Container::upsert(pool, host.id, Some(runtime_stack_id), scanned).await?;
    }

    Ok(())
}

/// Sanitize a stack name into a Compose project name the same way the
/// Stager does, for callers that only have a stack row and not a
/// [`StagedStack`] (e.g. the Drift Engine's standalone checks).
pub fn project_name(stack_name: &str) -> String {
    hash::sanitize_project_name(stack_name)
}
