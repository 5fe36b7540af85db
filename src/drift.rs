//! Drift Engine: a cheap two-tier check for whether a stack's running
//! containers still match the IaC that described them, without rendering
//! compose on every call.

use std::collections::HashMap;

use sqlx::PgPool;
use tracing::debug;

use crate::db::models::container::Container;
use crate::db::models::drift_cache::StackDriftCache;
use crate::db::models::iac_file::IacFile;
use crate::db::models::iac_stack::IacStack;
use crate::error::CoreError;
use crate::hash;

const CONFIG_HASH_LABEL: &str = "com.docker.compose.config-hash";

/// Result of one drift check: whether the stack has drifted, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftResult {
    pub drift_detected: bool,
    pub reason: String,
}

impl DriftResult {
    fn clean() -> Self {
        Self { drift_detected: false, reason: "No drift detected".to_string() }
    }

    fn drifted(reason: impl Into<String>) -> Self {
        Self { drift_detected: true, reason: reason.into() }
    }

    fn unknown(reason: impl Into<String>) -> Self {
        Self { drift_detected: false, reason: reason.into() }
    }
}

/// Check one stack for drift. Tier 1 compares the current bundle hash
/// against the cached one; Tier 2, only reached when Tier 1 is clean,
/// compares per-service Docker config-hash labels against what is cached.
pub async fn check(pool: &PgPool, stack_id: i64) -> Result<DriftResult, CoreError> {
    let stack = IacStack::find_by_id(pool, stack_id)
        .await?
        .ok_or_else(|| CoreError::query_failed(format!("stack {stack_id} not found")))?;

    let files = IacFile::list_for_stack(pool, stack_id).await?;
    let bundle_hash = hash::bundle_hash(&files);

    let previous = StackDriftCache::find(pool, stack_id).await?;
    let bundle_changed = previous.as_ref().map(|c| c.bundle_hash != bundle_hash).unwrap_or(false);
    let never_seen_before = previous.is_none();

    let cache = StackDriftCache::refresh_bundle_hash(pool, stack_id, &bundle_hash).await?;

    if bundle_changed {
        return Ok(DriftResult::drifted("IaC files changed since last deployment"));
    }

    // A stack observed for the first time has no prior baseline to compare
    // against; establish one below instead of reporting Tier 1 drift.
    let cache_was_cleared = never_seen_before;

    let project = hash::sanitize_project_name(&stack.stack_name);
    let containers = match Container::list_by_project(pool, &project).await {
        Ok(containers) => containers,
        Err(e) => {
            debug!(stack_id, error = %e, "could not list containers for drift check");
            return Ok(DriftResult::unknown("Unable to verify container state"));
        }
    };

    let running: Vec<&Container> = containers.iter().filter(|c| c.state == "running").collect();

    if !files.is_empty() && stack.iac_enabled && running.is_empty() {
        return Ok(DriftResult::drifted("Stack is enabled but has no running containers"));
    }

    let observed: HashMap<String, String> = running
        .iter()
        .filter_map(|c| {
            let name = c.label("com.docker.compose.service")?;
            let cfg_hash = c.label(CONFIG_HASH_LABEL)?;
            Some((name.to_string(), cfg_hash.to_string()))
        })
        .collect();

    // First time this stack has ever been checked: nothing to compare
    // against yet, so treat the observed map as the baseline rather than
    // drift.
    if cache_was_cleared {
        StackDriftCache::replace_service_cache(pool, stack_id, &observed).await?;
        return Ok(DriftResult::clean());
    }

    if cache.docker_config_cache.0 != observed {
        StackDriftCache::replace_service_cache(pool, stack_id, &observed).await?;
        return Ok(DriftResult::drifted("Container configurations changed"));
    }

    Ok(DriftResult::clean())
}

/// Refresh both tiers after a successful deployment: the new bundle hash
/// and the freshly-observed per-service config hashes are written
/// together so the next [`check`] call starts from a known-good baseline.
pub async fn refresh_after_deploy(
    pool: &PgPool,
    stack_id: i64,
    bundle_hash: &str,
    service_config_hashes: &HashMap<String, String>,
) -> Result<(), CoreError> {
    StackDriftCache::refresh_bundle_hash(pool, stack_id, bundle_hash).await?;
    StackDriftCache::replace_service_cache(pool, stack_id, service_config_hashes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::host::Host;
    use crate::db::models::iac_file::IacFileRole;
    use crate::db::models::iac_repo::IacRepo;
    use crate::db::models::iac_stack::{DeployKind, ScopeKind, SopsStatus};
    use crate::db::models::container::{PortMapping, ScannedContainer};
    use std::collections::HashMap as Map;

    async fn sample_stack(pool: &PgPool) -> IacStack {
        let repo = IacRepo::upsert(pool, "compose", "/data/docker-compose").await.unwrap();
        IacStack::upsert(
            pool,
            repo.id,
            ScopeKind::Host,
            "h1",
            "web",
            "h1/web",
            Some("docker-compose.yml"),
            DeployKind::Compose,
            SopsStatus::None,
        )
        .await
        .unwrap()
    }

    fn running_container(project: &str, service: &str, config_hash: &str) -> ScannedContainer {
        let mut labels = Map::new();
        labels.insert("com.docker.compose.project".to_string(), project.to_string());
        labels.insert("com.docker.compose.service".to_string(), service.to_string());
        labels.insert(CONFIG_HASH_LABEL.to_string(), config_hash.to_string());
        ScannedContainer {
            container_id: format!("{project}-{service}"),
            name: format!("/{project}-{service}-1"),
            image: "nginx:latest".to_string(),
            state: "running".to_string(),
            status: "Up 2 hours".to_string(),
            ports: Vec::<PortMapping>::new(),
            labels,
            env: vec![],
            networks: serde_json::json!({}),
            mounts: vec![],
            created_ts: Some(chrono::Utc::now()),
            ip_addr: None,
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn no_files_and_no_containers_is_clean(pool: PgPool) {
        let stack = sample_stack(&pool).await;
        let result = check(&pool, stack.id).await.unwrap();
        assert!(!result.drift_detected);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn bundle_hash_change_reports_iac_drift(pool: PgPool) {
        let stack = sample_stack(&pool).await;
        IacFile::upsert(&pool, stack.id, IacFileRole::Compose, "docker-compose.yml", false, "aaaa", 10)
            .await
            .unwrap();
        let host = Host::upsert(&pool, "h1", "10.0.0.1", &Map::new(), &[], None).await.unwrap();
        let project = hash::sanitize_project_name(&stack.stack_name);
        Container::upsert(&pool, host.id, None, &running_container(&project, "api", "cfg-1"))
            .await
            .unwrap();

        // First check establishes the baseline bundle hash against a stack
        // that already has a running container, so only Tier 1 is exercised.
        let first = check(&pool, stack.id).await.unwrap();
        assert!(!first.drift_detected);

        IacFile::upsert(&pool, stack.id, IacFileRole::Compose, "docker-compose.yml", false, "bbbb", 11)
            .await
            .unwrap();

        let second = check(&pool, stack.id).await.unwrap();
        assert!(second.drift_detected);
        assert_eq!(second.reason, "IaC files changed since last deployment");
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn config_hash_mismatch_reports_runtime_drift(pool: PgPool) {
        let stack = sample_stack(&pool).await;
        IacFile::upsert(&pool, stack.id, IacFileRole::Compose, "docker-compose.yml", false, "aaaa", 10)
            .await
            .unwrap();
        let host = Host::upsert(&pool, "h1", "10.0.0.1", &Map::new(), &[], None).await.unwrap();
        let project = hash::sanitize_project_name(&stack.stack_name);
        Container::upsert(&pool, host.id, None, &running_container(&project, "api", "cfg-1"))
            .await
            .unwrap();

        let first = check(&pool, stack.id).await.unwrap();
        assert!(!first.drift_detected);

        Container::upsert(&pool, host.id, None, &running_container(&project, "api", "cfg-2"))
            .await
            .unwrap();

        let second = check(&pool, stack.id).await.unwrap();
        assert!(second.drift_detected);
        assert_eq!(second.reason, "Container configurations changed");
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn enabled_stack_with_no_running_containers_drifts(pool: PgPool) {
        let stack = sample_stack(&pool).await;
        IacFile::upsert(&pool, stack.id, IacFileRole::Compose, "docker-compose.yml", false, "aaaa", 10)
            .await
            .unwrap();

        let result = check(&pool, stack.id).await.unwrap();
        assert!(result.drift_detected);
        assert_eq!(result.reason, "Stack is enabled but has no running containers");
    }
}
