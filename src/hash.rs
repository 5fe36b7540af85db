//! Hash Engine: the three deterministic hashes the Drift Engine and
//! Deployment Orchestrator compare against, plus the compose project name
//! sanitizer every subprocess invocation and label filter must agree on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::process::Command;

use crate::db::models::iac_file::IacFile;
use crate::error::CoreError;

/// `com.docker.compose.project = sanitize(stack_name)`. Lowercase, spaces
/// become `_`, anything outside `[a-z0-9_-]` becomes `_`, leading/trailing
/// `-`/`_` are trimmed, and an empty result falls back to `default`.
pub fn sanitize_project_name(stack_name: &str) -> String {
    let lower = stack_name.to_ascii_lowercase().replace(' ', "_");
    let cleaned: String = lower
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '-' || c == '_');
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Bundle hash over a stack's tracked files: sort `(lowercase role,
/// rel_path, lowercase sha256, size)` tuples, join with `\n`, SHA-256. Pure
/// function of file metadata, independent of scan order.
pub fn bundle_hash(files: &[IacFile]) -> String {
    let mut rows: Vec<String> = files
        .iter()
        .map(|f| {
            format!(
                "{}\n{}\n{}\n{}",
                f.role.to_ascii_lowercase(),
                f.rel_path,
                f.sha256_hex.to_ascii_lowercase(),
                f.size_bytes
            )
        })
        .collect();
    rows.sort();

    let mut hasher = Sha256::new();
    hasher.update(rows.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}

/// Rendered config hash: the raw, newline-separated output of
/// `docker compose config --hash`, trimmed/deduped/sorted per-line and then
/// SHA-256'd as one block. The subprocess call itself lives in
/// [`crate::orchestrator`]; this is the pure post-processing step.
pub fn rendered_config_hash(raw_output: &str) -> String {
    let mut lines: Vec<&str> = raw_output
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect();
    lines.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(lines.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}

/// Service spec digest: a stable function of `(project, files_digest,
/// service_name, resolved_spec_json)`, embedded as the `dd-ui.spec-digest`
/// label.
pub fn service_spec_digest(
    project: &str,
    files_digest: &str,
    service_name: &str,
    resolved_spec: &serde_json::Value,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project.as_bytes());
    hasher.update(b"\0");
    hasher.update(files_digest.as_bytes());
    hasher.update(b"\0");
    hasher.update(service_name.as_bytes());
    hasher.update(b"\0");
    hasher.update(resolved_spec.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// A fresh random 128-bit deploy-uid, generated whenever a service's spec
/// digest changes from what Service Enrollment State last recorded.
pub fn new_deploy_uid() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Invoke `docker compose -p <project> -f … config --format json` against a
/// staged workspace and return the parsed document, whose `services` map
/// holds each service's fully resolved spec (env-substituted, merged across
/// every `-f` file) — the input the Service Spec Digest is meant to hash,
/// per spec 4.5/4.6.
pub async fn resolved_compose_config(
    docker_bin: &str,
    project: &str,
    compose_files: &[PathBuf],
    workspace_dir: &Path,
) -> Result<serde_json::Value, CoreError> {
    let args = compose_args(project, compose_files, &["config", "--format", "json"]);
    let output = Command::new(docker_bin)
        .args(&args)
        .current_dir(workspace_dir)
        .output()
        .await
        .map_err(|e| CoreError::compose_failed(format!("spawning docker compose config: {e}")))?;

    if !output.status.success() {
        return Err(CoreError::compose_failed(format!(
            "docker compose config --format json failed for project {project}: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    serde_json::from_slice(&output.stdout)
        .map_err(|e| CoreError::compose_failed(format!("parsing compose config json: {e}")))
}

/// Invoke `docker compose -p <project> -f … config --hash='*'` against a
/// staged workspace. Returns the stack-level rendered config hash (the
/// sorted-and-rehashed post-processing [`rendered_config_hash`] defines) and
/// the raw per-service hashes, in the same label space as the
/// `com.docker.compose.config-hash` label the Drift Engine reads off
/// running containers.
pub async fn resolved_compose_hashes(
    docker_bin: &str,
    project: &str,
    compose_files: &[PathBuf],
    workspace_dir: &Path,
) -> Result<(String, HashMap<String, String>), CoreError> {
    let args = compose_args(project, compose_files, &["config", "--hash", "*"]);
    let output = Command::new(docker_bin)
        .args(&args)
        .current_dir(workspace_dir)
        .output()
        .await
        .map_err(|e| CoreError::compose_failed(format!("spawning docker compose config --hash: {e}")))?;

    if !output.status.success() {
        return Err(CoreError::compose_failed(format!(
            "docker compose config --hash failed for project {project}: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let raw = String::from_utf8_lossy(&output.stdout).to_string();
    Ok((rendered_config_hash(&raw), parse_per_service_hashes(&raw)))
}

fn compose_args(project: &str, compose_files: &[PathBuf], subcommand: &[&str]) -> Vec<String> {
    let mut args = vec!["compose".to_string(), "-p".to_string(), project.to_string()];
    for file in compose_files {
        args.push("-f".to_string());
        args.push(file.display().to_string());
    }
    args.extend(subcommand.iter().map(|s| s.to_string()));
    args
}

/// Parse `docker compose config --hash` output, one `<service> <hash>` pair
/// per line, into a map.
fn parse_per_service_hashes(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(2, char::is_whitespace);
            let service = parts.next()?.trim();
            let hash = parts.next()?.trim();
            if service.is_empty() || hash.is_empty() {
                return None;
            }
            Some((service.to_string(), hash.to_string()))
        })
        .collect()
}

/// Aggregate status of a compose project as reported by `docker compose ls`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeProjectStatus {
    Created,
    Running,
    Exited,
    Unknown,
}

/// Map a `docker compose ls` status string (`"running(2)"`, `"exited(1)"`,
/// `"created(1)"`) to a [`ComposeProjectStatus`].
pub fn status_convert(status: &str) -> ComposeProjectStatus {
    let lower = status.to_ascii_lowercase();
    if lower.starts_with("created") {
        ComposeProjectStatus::Created
    } else if lower.contains("exited") {
        ComposeProjectStatus::Exited
    } else if lower.starts_with("running") {
        ComposeProjectStatus::Running
    } else {
        ComposeProjectStatus::Unknown
    }
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ComposeListItem {
    name: String,
    status: String,
}

/// List every compose project `docker compose ls --all --format json` knows
/// about, keyed by project name. Used as a cheap read helper alongside the
/// Fleet Scanner's zero-running-container check; returns an empty map
/// (rather than an error) on a non-zero exit so a host with no Compose CLI
/// reachable simply contributes nothing.
pub async fn list_compose_projects(
    docker_bin: &str,
    docker_host: Option<&str>,
) -> Result<HashMap<String, ComposeProjectStatus>, CoreError> {
    let mut cmd = Command::new(docker_bin);
    cmd.args(["compose", "ls", "--all", "--format", "json"]);
    if let Some(host) = docker_host {
        cmd.env("DOCKER_HOST", host);
    }

    let output = cmd
        .output()
        .await
        .map_err(|e| CoreError::compose_failed(format!("spawning docker compose ls: {e}")))?;

    if !output.status.success() {
        return Ok(HashMap::new());
    }

    let items: Vec<ComposeListItem> = match serde_json::from_slice(&output.stdout) {
        Ok(items) => items,
        Err(_) => return Ok(HashMap::new()),
    };

    Ok(items
        .into_iter()
        .map(|item| (item.name, status_convert(&item.status)))
        .collect())
}

/// Management labels the overlay writes for one service, per spec 4.5.
pub fn management_labels(
    stack_id: i64,
    service_name: &str,
    spec_digest: &str,
    deploy_uid: &str,
) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert("dd-ui.managed".to_string(), "true".to_string());
    labels.insert("dd-ui.stack-id".to_string(), stack_id.to_string());
    labels.insert("dd-ui.service".to_string(), service_name.to_string());
    labels.insert("dd-ui.spec-digest".to_string(), spec_digest.to_string());
    labels.insert("dd-ui.deploy-uid".to_string(), deploy_uid.to_string());
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_lowercases_and_replaces_spaces() {
        assert_eq!(sanitize_project_name("My Stack"), "my_stack");
    }

    #[test]
    fn sanitize_replaces_invalid_chars_and_trims() {
        assert_eq!(sanitize_project_name("--Foo/Bar!!--"), "foo_bar");
    }

    #[test]
    fn sanitize_empty_result_falls_back_to_default() {
        assert_eq!(sanitize_project_name("---"), "default");
        assert_eq!(sanitize_project_name(""), "default");
    }

    #[test]
    fn bundle_hash_is_order_independent() {
        let files_a = vec![file("compose", "a/b.yml", "aaaa", 10), file("env", "a/.env", "bbbb", 5)];
        let files_b = vec![file("env", "a/.env", "bbbb", 5), file("compose", "a/b.yml", "aaaa", 10)];
        assert_eq!(bundle_hash(&files_a), bundle_hash(&files_b));
    }

    #[test]
    fn bundle_hash_changes_when_a_hash_changes() {
        let a = vec![file("compose", "a/b.yml", "aaaa", 10)];
        let b = vec![file("compose", "a/b.yml", "ffff", 10)];
        assert_ne!(bundle_hash(&a), bundle_hash(&b));
    }

    #[test]
    fn rendered_config_hash_ignores_line_order_and_blanks() {
        let a = "line2\n\nline1\n";
        let b = "line1\nline2";
        assert_eq!(rendered_config_hash(a), rendered_config_hash(b));
    }

    #[test]
    fn parse_per_service_hashes_splits_service_and_hash() {
        let raw = "api 1a2b3c\ndb 4d5e6f\n";
        let parsed = parse_per_service_hashes(raw);
        assert_eq!(parsed.get("api"), Some(&"1a2b3c".to_string()));
        assert_eq!(parsed.get("db"), Some(&"4d5e6f".to_string()));
    }

    #[test]
    fn parse_per_service_hashes_ignores_blank_lines() {
        let raw = "api 1a2b3c\n\n  \n";
        let parsed = parse_per_service_hashes(raw);
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn compose_args_orders_project_then_files_then_subcommand() {
        let files = vec![PathBuf::from("/tmp/a.yml"), PathBuf::from("/tmp/b.yml")];
        let args = compose_args("web", &files, &["config", "--hash", "*"]);
        assert_eq!(
            args,
            vec!["compose", "-p", "web", "-f", "/tmp/a.yml", "-f", "/tmp/b.yml", "config", "--hash", "*"]
        );
    }

    #[test]
    fn spec_digest_changes_with_any_input() {
        let spec = serde_json::json!({"image": "nginx:latest"});
        let d1 = service_spec_digest("web", "filesdigest", "api", &spec);
        let d2 = service_spec_digest("web", "filesdigest", "db", &spec);
        assert_ne!(d1, d2);
    }

    #[test]
    fn deploy_uid_is_16_bytes_hex() {
        let uid = new_deploy_uid();
        assert_eq!(uid.len(), 32);
        assert!(uid.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn status_convert_maps_known_prefixes() {
        assert_eq!(status_convert("running(2)"), ComposeProjectStatus::Running);
        assert_eq!(status_convert("exited(1)"), ComposeProjectStatus::Exited);
        assert_eq!(status_convert("created(1)"), ComposeProjectStatus::Created);
        assert_eq!(status_convert("Running(2)"), ComposeProjectStatus::Running);
    }

    #[test]
    fn status_convert_defaults_to_unknown() {
        assert_eq!(status_convert("paused(1)"), ComposeProjectStatus::Unknown);
        assert_eq!(status_convert(""), ComposeProjectStatus::Unknown);
    }

    fn file(role: &str, rel_path: &str, sha: &str, size: i64) -> IacFile {
        IacFile {
            id: 1,
            stack_id: 1,
            role: role.to_string(),
            rel_path: rel_path.to_string(),
            sops: false,
            sha256_hex: sha.to_string(),
            size_bytes: size,
            updated_at: chrono::Utc::now(),
        }
    }
}
