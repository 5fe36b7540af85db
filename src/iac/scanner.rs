//! IaC Catalog Scanner: walks `<root>/<dirname>/<scope>/<stack>/…` and
//! materializes a typed, hashable model of stacks/services/files.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::IacConfig;
use crate::db::models::enrollment::ServiceEnrollment;
use crate::db::models::host::Host;
use crate::db::models::iac_file::{IacFile, IacFileRole};
use crate::db::models::iac_repo::IacRepo;
use crate::db::models::iac_service::IacService;
use crate::db::models::iac_stack::{DeployKind, IacStack, ScopeKind, SopsStatus};
use crate::error::CoreError;
use crate::iac::compose_model;
use crate::sops;

const COMPOSE_FILE_CANDIDATES: &[&str] =
    &["docker-compose.yml", "docker-compose.yaml", "compose.yml", "compose.yaml"];

const SCRIPT_NAMES: &[&str] = &["deploy.sh", "pre.sh", "post.sh"];

/// Outcome of one full pass over the configured IaC root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IacScanOutcome {
    pub stacks_seen: usize,
    pub stacks_pruned: u64,
    pub stacks_pruned_empty: usize,
}

/// Run one IaC scan pass: upsert every stack found under the configured
/// root, then prune anything no longer on disk.
pub async fn scan(pool: &PgPool, cfg: &IacConfig, sops_bin: &str) -> Result<IacScanOutcome, CoreError> {
    let repo = IacRepo::upsert(pool, "local", &cfg.root.display().to_string()).await?;
    let walk_root = cfg.repo_dir();

    if !walk_root.is_dir() {
        warn!(root = %walk_root.display(), "iac root does not exist, nothing to scan");
        IacRepo::mark_scanned(pool, repo.id).await?;
        return Ok(IacScanOutcome::default());
    }

    let mut seen_stack_ids = Vec::new();

    for scope_dir in list_dirs(&walk_root) {
        let scope_name = match scope_dir.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };

        for stack_dir in list_dirs(&scope_dir) {
            let stack_name = match stack_dir.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };

            let rel_path = format!("{}/{}/{}", cfg.dirname, scope_name, stack_name);
            match scan_stack_dir(pool, &repo, &cfg.dirname, &scope_name, &stack_name, &stack_dir, &rel_path, sops_bin)
                .await
            {
                Ok(stack_id) => seen_stack_ids.push(stack_id),
                Err(e) => warn!(stack = %rel_path, error = %e, "failed to scan iac stack, skipping"),
            }
        }
    }

    let stacks_pruned = IacStack::prune_missing(pool, repo.id, &seen_stack_ids).await?;

    let empty = IacStack::find_empty(pool, repo.id).await?;
    for stack in &empty {
        warn!(
            stack_id = stack.id,
            stack = %stack.stack_name,
            "iac stack has no tracked files and no compose file, pruning"
        );
        IacStack::delete(pool, stack.id).await?;
    }

    IacRepo::mark_scanned(pool, repo.id).await?;

    info!(
        stacks_seen = seen_stack_ids.len(),
        stacks_pruned,
        stacks_pruned_empty = empty.len(),
        "iac scan complete"
    );

    Ok(IacScanOutcome {
        stacks_seen: seen_stack_ids.len(),
        stacks_pruned,
        stacks_pruned_empty: empty.len(),
    })
}

fn list_dirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

#[allow(clippy::too_many_arguments)]
async fn scan_stack_dir(
    pool: &PgPool,
    repo: &IacRepo,
    dirname: &str,
    scope_name: &str,
    stack_name: &str,
    stack_dir: &Path,
    rel_path: &str,
    sops_bin: &str,
) -> Result<i64, CoreError> {
    let _ = dirname;
    let scope_kind = if Host::find_by_name(pool, scope_name).await?.is_some() {
        ScopeKind::Host
    } else {
        ScopeKind::Group
    };

    let compose_file = COMPOSE_FILE_CANDIDATES
        .iter()
        .find(|name| stack_dir.join(name).is_file())
        .copied();

    let has_script = SCRIPT_NAMES.iter().any(|name| stack_dir.join(name).is_file());

    let deploy_kind = if compose_file.is_some() {
        DeployKind::Compose
    } else if has_script {
        DeployKind::Script
    } else {
        DeployKind::Unmanaged
    };

    // Walk every file under the stack directory so nested config/secret
    // directories get tracked too, not just the top level.
    let mut tracked_files = Vec::new();
    for entry in WalkDir::new(stack_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let file_rel_path = path
            .strip_prefix(stack_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        tracked_files.push((path.to_path_buf(), file_rel_path));
    }
    tracked_files.sort_by(|a, b| a.1.cmp(&b.1));

    let mut total_env_files = 0usize;
    let mut sops_env_files = 0usize;
    let mut seen_rel_paths = Vec::with_capacity(tracked_files.len());
    let mut env_sops_by_path: std::collections::HashMap<String, bool> = std::collections::HashMap::new();

    for (abs_path, file_rel_path) in &tracked_files {
        let role = classify_file(file_rel_path, compose_file);
        let sops_encrypted = sops::looks_encrypted(abs_path).await;

        if matches!(role, IacFileRole::Env) {
            total_env_files += 1;
            if sops_encrypted {
                sops_env_files += 1;
            }
            env_sops_by_path.insert(file_rel_path.clone(), sops_encrypted);
        }

        if hash_file(abs_path).is_err() {
            warn!(file = %file_rel_path, "failed to hash tracked file, skipping");
            continue;
        }

        let _ = role;
        seen_rel_paths.push(file_rel_path.clone());
    }

    let sops_status = SopsStatus::summarize(total_env_files, sops_env_files);

    let stack = IacStack::upsert(
        pool,
        repo.id,
        scope_kind,
        scope_name,
        stack_name,
        rel_path,
        compose_file,
        deploy_kind,
        sops_status,
    )
    .await?;

    for (abs_path, file_rel_path) in &tracked_files {
        let role = classify_file(file_rel_path, compose_file);
        let sops_encrypted = env_sops_by_path.get(file_rel_path).copied().unwrap_or(false);
        if let Ok((sha256_hex, size_bytes)) = hash_file(abs_path) {
            IacFile::upsert(pool, stack.id, role, file_rel_path, sops_encrypted, &sha256_hex, size_bytes)
                .await?;
        }
    }
    IacFile::prune_missing(pool, stack.id, &seen_rel_paths).await?;

    if let Some(compose_name) = compose_file {
        let compose_path = stack_dir.join(compose_name);
        match sops::read_maybe_encrypted(&compose_path, None, sops_bin).await {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(text) => match compose_model::parse_compose(&text) {
                    Ok(mut services) => {
                        for svc in &mut services {
                            for env_file in &mut svc.env_files {
                                if let Some(sops_flag) = env_sops_by_path.get(&env_file.path) {
                                    env_file.sops = *sops_flag;
                                }
                            }
                        }
                        let seen_services: Vec<String> =
                            services.iter().map(|s| s.service_name.clone()).collect();
                        for svc in &services {
                            IacService::upsert(pool, stack.id, svc).await?;
                            ServiceEnrollment::ensure_seen(pool, stack.id, &svc.service_name).await?;
                        }
                        IacService::prune_missing(pool, stack.id, &seen_services).await?;
                    }
                    Err(e) => warn!(stack = %rel_path, error = %e, "failed to parse compose file"),
                },
                Err(e) => warn!(stack = %rel_path, error = %e, "compose file is not valid utf-8"),
            },
            Err(e) => {
                debug!(stack = %rel_path, error = %e, "could not read/decrypt compose file for service parsing")
            }
        }
    }

    Ok(stack.id)
}

fn classify_file(rel_path: &str, compose_file: Option<&str>) -> IacFileRole {
    if let Some(compose_name) = compose_file {
        if rel_path == compose_name {
            return IacFileRole::Compose;
        }
    }
    let basename = rel_path.rsplit('/').next().unwrap_or(rel_path);
    if SCRIPT_NAMES.contains(&basename) {
        return IacFileRole::Script;
    }
    if basename.eq_ignore_ascii_case(".env") || basename.to_ascii_lowercase().ends_with(".env") {
        return IacFileRole::Env;
    }
    IacFileRole::Other
}

fn hash_file(path: &Path) -> Result<(String, i64), CoreError> {
    let bytes = std::fs::read(path)
        .map_err(|e| CoreError::stage_failed(format!("reading {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok((hex::encode(hasher.finalize()), bytes.len() as i64))
}

/// Visible tracked files for a stack: everything except `.comments.json`
/// sidecars, which are tracked and hashed like any other file but excluded
/// from user-facing listings.
pub async fn list_visible_files(pool: &PgPool, stack_id: i64) -> Result<Vec<IacFile>, CoreError> {
    IacFile::list_for_stack_visible(pool, stack_id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_file_detects_compose_scripts_and_env() {
        assert_eq!(
            classify_file("docker-compose.yml", Some("docker-compose.yml")),
            IacFileRole::Compose
        );
        assert_eq!(classify_file("deploy.sh", None), IacFileRole::Script);
        assert_eq!(classify_file(".env", None), IacFileRole::Env);
        assert_eq!(classify_file("db_secret.env", None), IacFileRole::Env);
        assert_eq!(classify_file("README.md", None), IacFileRole::Other);
    }

    #[test]
    fn classify_file_nested_env() {
        assert_eq!(classify_file("config/api.env", None), IacFileRole::Env);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn full_scan_upserts_stack_service_and_files(pool: PgPool) {
        let dir = tempfile::tempdir().unwrap();
        let stack_dir = dir.path().join("docker-compose/h1/web");
        tokio::fs::create_dir_all(&stack_dir).await.unwrap();
        tokio::fs::write(
            stack_dir.join("docker-compose.yml"),
            "services:\n  api:\n    image: nginx:latest\n    env_file: .env\n",
        )
        .await
        .unwrap();
        tokio::fs::write(stack_dir.join(".env"), "FOO=bar\n").await.unwrap();

        let cfg = IacConfig { root: dir.path().to_path_buf(), dirname: "docker-compose".to_string() };

        let outcome = scan(&pool, &cfg, "sops").await.unwrap();
        assert_eq!(outcome.stacks_seen, 1);
        assert_eq!(outcome.stacks_pruned, 0);
        assert_eq!(outcome.stacks_pruned_empty, 0);

        let repo = IacRepo::upsert(&pool, "local", &cfg.root.display().to_string()).await.unwrap();
        let stacks = IacStack::list_for_repo(&pool, repo.id).await.unwrap();
        assert_eq!(stacks.len(), 1);
        let stack = &stacks[0];
        assert_eq!(stack.scope_name, "h1");
        assert_eq!(stack.stack_name, "web");
        assert_eq!(stack.compose_file.as_deref(), Some("docker-compose.yml"));

        let services = IacService::list_for_stack(&pool, stack.id).await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].service_name, "api");

        let files = IacFile::list_for_stack(&pool, stack.id).await.unwrap();
        let rel_paths: Vec<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();
        assert!(rel_paths.contains(&"docker-compose.yml"));
        assert!(rel_paths.contains(&".env"));

        let enrolled = ServiceEnrollment::find(&pool, stack.id, "api").await.unwrap().unwrap();
        assert!(!enrolled.enrolled);

        // Remove the stack directory; a second pass prunes it entirely.
        tokio::fs::remove_dir_all(&stack_dir).await.unwrap();
        let outcome2 = scan(&pool, &cfg, "sops").await.unwrap();
        assert_eq!(outcome2.stacks_seen, 0);
        assert_eq!(outcome2.stacks_pruned, 1);
        assert!(IacStack::list_for_repo(&pool, repo.id).await.unwrap().is_empty());
    }
}
