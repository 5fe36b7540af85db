//! Fleet Scanner: periodic, bounded-concurrency container discovery across
//! every host, reconciled into the relational store with prune semantics.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::config::{Config, DockerConfig};
use crate::db::models::container::Container;
use crate::db::models::host::Host;
use crate::db::models::runtime_stack::RuntimeStack;
use crate::docker;
use crate::error::CoreError;
use crate::host_directory;

const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
const SWARM_NAMESPACE_LABEL: &str = "com.docker.stack.namespace";

/// Outcome of one per-host scan.
#[derive(Debug, Clone, PartialEq, Eq)]
enum HostOutcome {
    Scanned { containers_saved: usize },
    Skipped,
    Failed,
}

/// Aggregate outcome of one full pass over every host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub scanned: usize,
    pub skipped: usize,
    pub failed: usize,
    pub total_containers_saved: usize,
}

/// Run one fleet scan pass across every known host, honoring the configured
/// per-host concurrency bound and per-host deadline.
pub async fn scan(pool: &PgPool, cfg: &Config) -> Result<ScanOutcome, CoreError> {
    let hosts = Host::list_all(pool).await?;
    let semaphore = Arc::new(Semaphore::new(cfg.scan.concurrency.max(1)));
    let mut joins = JoinSet::new();

    for host in hosts {
        let semaphore = Arc::clone(&semaphore);
        let pool = pool.clone();
        let docker_cfg = cfg.docker.clone();
        let host_timeout = cfg.scan.host_timeout;

        joins.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            let host_name = host.name.clone();
            let outcome = match tokio::time::timeout(host_timeout, scan_host(&pool, &host, &docker_cfg)).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    warn!(host = %host_name, error = %e, "host scan failed");
                    HostOutcome::Failed
                }
                Err(_) => {
                    warn!(host = %host_name, "host scan exceeded deadline");
                    HostOutcome::Failed
                }
            };
            outcome
        });
    }

    let mut result = ScanOutcome::default();
    while let Some(joined) = joins.join_next().await {
        match joined {
            Ok(HostOutcome::Scanned { containers_saved }) => {
                result.scanned += 1;
                result.total_containers_saved += containers_saved;
            }
            Ok(HostOutcome::Skipped) => result.skipped += 1,
            Ok(HostOutcome::Failed) => result.failed += 1,
            Err(e) => {
                warn!(error = %e, "host scan task panicked");
                result.failed += 1;
            }
        }
    }

    info!(
        scanned = result.scanned,
        skipped = result.skipped,
        failed = result.failed,
        containers = result.total_containers_saved,
        "fleet scan complete"
    );

    Ok(result)
}

#[instrument(skip(pool, docker_cfg), fields(host = %host.name))]
async fn scan_host(pool: &PgPool, host: &Host, docker_cfg: &DockerConfig) -> Result<HostOutcome, CoreError> {
    if host_directory::should_skip_local(host, docker_cfg) {
        warn!(host = %host.name, "refusing local-socket scan of non-local host");
        return Ok(HostOutcome::Skipped);
    }

    let descriptor = host_directory::resolve(host, docker_cfg)?;
    let handle = docker::connect(&descriptor, docker_cfg).await?;
    docker::ping(&handle.client, Duration::from_secs(10)).await?;

    let containers = docker::list_all_containers(&handle.client).await?;
    let mut seen_ids = Vec::with_capacity(containers.len());
    let mut saved = 0usize;

    for mut scanned in containers {
        scanned.env = docker::inspect_container_env(&handle.client, &scanned.container_id)
            .await
            .unwrap_or_default();

        let project = scanned
            .labels
            .get(COMPOSE_PROJECT_LABEL)
            .or_else(|| scanned.labels.get(SWARM_NAMESPACE_LABEL))
            .cloned();

        let stack_id = match &project {
            Some(project) => Some(RuntimeStack::upsert(pool, host.id, project).await?.id),
            None => None,
        };

        seen_ids.push(scanned.container_id.clone());
        Container::upsert(pool, host.id, stack_id, &scanned).await?;
        saved += 1;
    }

    Container::prune_missing(pool, host.id, &seen_ids).await?;

    Ok(HostOutcome::Scanned { containers_saved: saved })
}
