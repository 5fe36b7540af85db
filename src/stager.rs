//! Stager: materializes a stack's tracked IaC files into a private,
//! SOPS-decrypted temporary workspace ready for `docker compose up`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tracing::debug;

use crate::config::IacConfig;
use crate::db::models::enrollment::ServiceEnrollment;
use crate::db::models::iac_file::{IacFile, IacFileRole};
use crate::db::models::iac_stack::IacStack;
use crate::error::CoreError;
use crate::hash;
use crate::iac::compose_model;
use crate::sops;

/// What the overlay will stamp onto one service's containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLabelPlan {
    pub spec_digest: String,
    pub deploy_uid: String,
    /// Whether `deploy_uid` is newly minted (spec changed) vs. reused.
    pub is_new_deploy_uid: bool,
}

/// The staged result of [`stage`]. `compose_files` is the ordered `-f` list;
/// `substitution_env_files` are stack-level `.env` files materialized for
/// `--env-file`, not part of the `-f` list. Dropping this value (or calling
/// [`StagedStack::cleanup`]) removes the workspace.
pub struct StagedStack {
    pub workspace_dir: PathBuf,
    pub compose_files: Vec<PathBuf>,
    pub substitution_env_files: Vec<PathBuf>,
    pub project: String,
    pub bundle_hash: String,
    pub service_labels: HashMap<String, ServiceLabelPlan>,
    _tempdir: Option<tempfile::TempDir>,
}

impl StagedStack {
    /// Remove the workspace. Idempotent: a second call is a no-op.
    pub fn cleanup(&mut self) {
        if let Some(dir) = self._tempdir.take() {
            if let Err(e) = dir.close() {
                debug!(error = %e, "failed to remove stager workspace (already gone?)");
            }
        }
    }
}

/// Stage a stack for deployment. Returns `Ok(None)` if the stack has no
/// compose files tracked (nothing to deploy).
pub async fn stage(
    pool: &PgPool,
    iac_cfg: &IacConfig,
    sops_bin: &str,
    docker_bin: &str,
    stack_id: i64,
) -> Result<Option<StagedStack>, CoreError> {
    let stack = IacStack::find_by_id(pool, stack_id)
        .await?
        .ok_or_else(|| CoreError::stage_failed(format!("stack {stack_id} not found")))?;

    let all_files = IacFile::list_for_stack(pool, stack_id).await?;
    let mut compose_tracked: Vec<&IacFile> =
        all_files.iter().filter(|f| f.role() == IacFileRole::Compose).collect();
    if compose_tracked.is_empty() {
        return Ok(None);
    }
    compose_tracked.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

    let stack_dir_on_disk = iac_cfg.repo_dir().join(&stack.rel_path);

    let tempdir = tempfile::Builder::new()
        .prefix("ddui-stage-")
        .tempdir()
        .map_err(|e| CoreError::stage_failed(format!("creating workspace: {e}")))?;
    set_restrictive_permissions(tempdir.path());

    let mut compose_files = Vec::new();
    let mut parsed_services = Vec::new();

    for file in &compose_tracked {
        let source = stack_dir_on_disk.join(&file.rel_path);
        let bytes = sops::read_maybe_encrypted(&source, None, sops_bin).await?;
        let basename = Path::new(&file.rel_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| file.rel_path.clone());
        let dest = tempdir.path().join(&basename);
        tokio::fs::write(&dest, &bytes)
            .await
            .map_err(|e| CoreError::stage_failed(format!("writing {}: {e}", dest.display())))?;
        compose_files.push(dest);

        let text = String::from_utf8(bytes)
            .map_err(|e| CoreError::stage_failed(format!("{} is not valid utf-8: {e}", source.display())))?;
        let services = compose_model::parse_compose(&text)?;
        parsed_services.extend(services);
    }

    // Per-service env_file references get SOPS-decrypted and rewritten under
    // a content-hashed name so identical content is staged once.
    let mut override_services: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut materialized_by_source: HashMap<String, String> = HashMap::new();

    for svc in &parsed_services {
        if svc.env_files.is_empty() {
            continue;
        }
        let mut workspace_paths = Vec::new();
        for env_ref in &svc.env_files {
            let workspace_name = match materialized_by_source.get(&env_ref.path) {
                Some(name) => name.clone(),
                None => {
                    let source = resolve_relative(&stack_dir_on_disk, &env_ref.path);
                    let decoded = sops::read_dotenv(&source, sops_bin).await?;
                    let name = content_hashed_name(&env_ref.path, &decoded);
                    let dest = tempdir.path().join(&name);
                    tokio::fs::write(&dest, &decoded)
                        .await
                        .map_err(|e| CoreError::stage_failed(format!("writing {}: {e}", dest.display())))?;
                    materialized_by_source.insert(env_ref.path.clone(), name.clone());
                    name
                }
            };
            workspace_paths.push(workspace_name);
        }
        override_services.insert(svc.service_name.clone(), workspace_paths);
    }

    if !override_services.is_empty() {
        let overlay = EnvFilesOverlay {
            services: override_services
                .into_iter()
                .map(|(name, files)| (name, EnvFilesOverride { env_file: files }))
                .collect(),
        };
        let yaml = serde_yaml::to_string(&overlay)
            .map_err(|e| CoreError::stage_failed(format!("rendering override.envfiles.yaml: {e}")))?;
        let dest = tempdir.path().join("override.envfiles.yaml");
        tokio::fs::write(&dest, yaml)
            .await
            .map_err(|e| CoreError::stage_failed(format!("writing {}: {e}", dest.display())))?;
        compose_files.push(dest);
    }

    // Stack-level substitution env files: every role=env tracked file,
    // decrypted but otherwise untouched, for `--env-file` use.
    let mut substitution_env_files = Vec::new();
    for file in all_files.iter().filter(|f| f.role() == IacFileRole::Env) {
        let source = stack_dir_on_disk.join(&file.rel_path);
        let decoded = sops::read_dotenv(&source, sops_bin).await?;
        let name = content_hashed_name(&file.rel_path, &decoded);
        let dest = tempdir.path().join(&name);
        tokio::fs::write(&dest, &decoded)
            .await
            .map_err(|e| CoreError::stage_failed(format!("writing {}: {e}", dest.display())))?;
        substitution_env_files.push(dest);
    }

    let project = hash::sanitize_project_name(&stack.stack_name);
    let bundle_hash = hash::bundle_hash(&all_files);

    // The Service Spec Digest is meant to hash the fully-resolved service
    // spec (env substitution, merged across every `-f` file). Ask Compose
    // itself for that projection; if the binary is missing or the call
    // fails, fall back to the hand-parsed model from this stack's own
    // compose file rather than aborting the stage.
    let resolved_services: HashMap<String, serde_json::Value> =
        match hash::resolved_compose_config(docker_bin, &project, &compose_files, tempdir.path()).await {
            Ok(doc) => doc
                .get("services")
                .and_then(|v| v.as_object())
                .map(|services| services.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
            Err(e) => {
                debug!(
                    stack_id,
                    error = %e,
                    "could not resolve compose config via docker compose, falling back to hand-parsed service spec"
                );
                HashMap::new()
            }
        };

    let mut service_labels = HashMap::new();
    for svc in &parsed_services {
        let service_json = resolved_services.get(&svc.service_name).cloned().unwrap_or_else(|| {
            serde_json::json!({
                "image": svc.image,
                "container_name": svc.container_name,
                "labels": svc.labels,
                "env_keys": svc.env_keys,
                "ports": svc.ports,
                "volumes": svc.volumes,
                "deploy": svc.deploy,
            })
        });
        let spec_digest = hash::service_spec_digest(&project, &bundle_hash, &svc.service_name, &service_json);

        let previous = ServiceEnrollment::find(pool, stack_id, &svc.service_name).await?;
        let (deploy_uid, is_new) = match &previous {
            Some(p) if p.last_spec_digest.as_deref() == Some(spec_digest.as_str()) => {
                (p.last_deploy_uid.clone().unwrap_or_else(hash::new_deploy_uid), false)
            }
            _ => (hash::new_deploy_uid(), true),
        };

        service_labels.insert(
            svc.service_name.clone(),
            ServiceLabelPlan { spec_digest, deploy_uid, is_new_deploy_uid: is_new },
        );
    }

    let overlay_yaml = render_overlay(stack_id, &service_labels)?;
    let overlay_dest = tempdir.path().join("ddui.overlay.yml");
    tokio::fs::write(&overlay_dest, overlay_yaml)
        .await
        .map_err(|e| CoreError::stage_failed(format!("writing {}: {e}", overlay_dest.display())))?;
    compose_files.push(overlay_dest);

    Ok(Some(StagedStack {
        workspace_dir: tempdir.path().to_path_buf(),
        compose_files,
        substitution_env_files,
        project,
        bundle_hash,
        service_labels,
        _tempdir: Some(tempdir),
    }))
}

fn resolve_relative(stack_dir: &Path, rel_or_abs: &str) -> PathBuf {
    let p = Path::new(rel_or_abs);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        stack_dir.join(p)
    }
}

fn content_hashed_name(original_path: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hex::encode(hasher.finalize());
    let ext = Path::new(original_path)
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "env".to_string());
    format!("env-{}.{}", &digest[..16], ext)
}

fn set_restrictive_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = std::fs::metadata(path) {
            let mut perms = meta.permissions();
            perms.set_mode(0o700);
            let _ = std::fs::set_permissions(path, perms);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

#[derive(Debug, Serialize)]
struct EnvFilesOverride {
    env_file: Vec<String>,
}

#[derive(Debug, Serialize)]
struct EnvFilesOverlay {
    services: BTreeMap<String, EnvFilesOverride>,
}

#[derive(Debug, Serialize)]
struct OverlayService {
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct Overlay {
    services: BTreeMap<String, OverlayService>,
}

fn render_overlay(
    stack_id: i64,
    service_labels: &HashMap<String, ServiceLabelPlan>,
) -> Result<String, CoreError> {
    let mut services = BTreeMap::new();
    for (service_name, plan) in service_labels {
        let labels = hash::management_labels(stack_id, service_name, &plan.spec_digest, &plan.deploy_uid)
            .into_iter()
            .collect();
        services.insert(service_name.clone(), OverlayService { labels });
    }
    serde_yaml::to_string(&Overlay { services })
        .map_err(|e| CoreError::stage_failed(format!("rendering ddui.overlay.yml: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::iac_repo::IacRepo;
    use crate::db::models::iac_stack::{DeployKind, ScopeKind, SopsStatus};

    #[test]
    fn content_hashed_name_is_stable_for_same_content() {
        let a = content_hashed_name("secrets.env", "FOO=bar");
        let b = content_hashed_name("other.env", "FOO=bar");
        assert_eq!(a, b);
    }

    #[test]
    fn content_hashed_name_preserves_extension() {
        let name = content_hashed_name("secrets.env.enc", "FOO=bar");
        assert!(name.ends_with(".enc"));
    }

    #[test]
    fn resolve_relative_joins_against_stack_dir() {
        let stack_dir = Path::new("/data/docker-compose/h1/web");
        assert_eq!(
            resolve_relative(stack_dir, ".env"),
            PathBuf::from("/data/docker-compose/h1/web/.env")
        );
        assert_eq!(resolve_relative(stack_dir, "/etc/global.env"), PathBuf::from("/etc/global.env"));
    }

    #[test]
    fn render_overlay_embeds_management_labels() {
        let mut labels = HashMap::new();
        labels.insert(
            "api".to_string(),
            ServiceLabelPlan {
                spec_digest: "digest123".to_string(),
                deploy_uid: "uid456".to_string(),
                is_new_deploy_uid: true,
            },
        );
        let yaml = render_overlay(5, &labels).unwrap();
        assert!(yaml.contains("dd-ui.managed"));
        assert!(yaml.contains("digest123"));
        assert!(yaml.contains("uid456"));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn stage_produces_ordered_compose_files_and_overlay(pool: PgPool) {
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

        let repo = IacRepo::upsert(&pool, "compose", dir.path().join("docker-compose").to_str().unwrap())
            .await
            .unwrap();
        let stack = IacStack::upsert(
            &pool,
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
        .unwrap();

        IacFile::upsert(&pool, stack.id, IacFileRole::Compose, "docker-compose.yml", false, "aaaa", 10)
            .await
            .unwrap();
        IacFile::upsert(&pool, stack.id, IacFileRole::Env, ".env", false, "bbbb", 7)
            .await
            .unwrap();

        let iac_cfg = IacConfig { root: dir.path().to_path_buf(), dirname: "docker-compose".to_string() };

        let staged = stage(&pool, &iac_cfg, "sops", "docker", stack.id).await.unwrap().unwrap();

        assert_eq!(staged.project, "web");
        assert!(staged.compose_files.last().unwrap().ends_with("ddui.overlay.yml"));
        assert!(!staged.substitution_env_files.is_empty());
        assert!(staged.service_labels.contains_key("api"));

        let overlay_contents = tokio::fs::read_to_string(staged.compose_files.last().unwrap())
            .await
            .unwrap();
        assert!(overlay_contents.contains("dd-ui.spec-digest"));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn stage_returns_none_when_no_compose_files(pool: PgPool) {
        let dir = tempfile::tempdir().unwrap();
        let repo = IacRepo::upsert(&pool, "compose", "/data/docker-compose").await.unwrap();
        let stack = IacStack::upsert(
            &pool,
            repo.id,
            ScopeKind::Group,
            "prod",
            "script-only",
            "prod/script-only",
            None,
            DeployKind::Script,
            SopsStatus::None,
        )
        .await
        .unwrap();

        let iac_cfg = IacConfig { root: dir.path().to_path_buf(), dirname: "docker-compose".to_string() };
        let staged = stage(&pool, &iac_cfg, "sops", "docker", stack.id).await.unwrap();
        assert!(staged.is_none());
    }
}
