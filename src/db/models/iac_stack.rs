//! IaC stacks: one row per `<dir>/<scope>/<stack>` directory on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeKind {
    Host,
    Group,
}

impl ScopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScopeKind::Host => "host",
            ScopeKind::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "host" => Some(ScopeKind::Host),
            "group" => Some(ScopeKind::Group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeployKind {
    Compose,
    Script,
    Unmanaged,
}

impl DeployKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeployKind::Compose => "compose",
            DeployKind::Script => "script",
            DeployKind::Unmanaged => "unmanaged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "compose" => Some(DeployKind::Compose),
            "script" => Some(DeployKind::Script),
            "unmanaged" => Some(DeployKind::Unmanaged),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SopsStatus {
    All,
    Partial,
    None,
}

impl SopsStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SopsStatus::All => "all",
            SopsStatus::Partial => "partial",
            SopsStatus::None => "none",
        }
    }

    /// Summarize from the fraction of env files detected as SOPS-encrypted.
    pub fn summarize(total_env_files: usize, sops_env_files: usize) -> Self {
        if total_env_files == 0 || sops_env_files == 0 {
            SopsStatus::None
        } else if sops_env_files == total_env_files {
            SopsStatus::All
        } else {
            SopsStatus::Partial
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IacStack {
    pub id: i64,
    pub repo_id: i64,
    pub scope_kind: String,
    pub scope_name: String,
    pub stack_name: String,
    pub rel_path: String,
    pub compose_file: Option<String>,
    pub deploy_kind: String,
    pub pull_policy: Option<String>,
    pub sops_status: String,
    pub iac_enabled: bool,
    pub auto_devops_override: Option<String>,
    pub last_scan_at: Option<DateTime<Utc>>,
}

impl IacStack {
    pub fn scope_kind(&self) -> ScopeKind {
        ScopeKind::parse(&self.scope_kind).unwrap_or(ScopeKind::Group)
    }

    pub fn deploy_kind(&self) -> DeployKind {
        DeployKind::parse(&self.deploy_kind).unwrap_or(DeployKind::Unmanaged)
    }

    pub fn sops_status(&self) -> SopsStatus {
        match self.sops_status.as_str() {
            "all" => SopsStatus::All,
            "partial" => SopsStatus::Partial,
            _ => SopsStatus::None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert(
        pool: &PgPool,
        repo_id: i64,
        scope_kind: ScopeKind,
        scope_name: &str,
        stack_name: &str,
        rel_path: &str,
        compose_file: Option<&str>,
        deploy_kind: DeployKind,
        sops_status: SopsStatus,
    ) -> Result<Self, CoreError> {
        sqlx::query_as::<_, IacStack>(
            r#"
            INSERT INTO iac_stacks (
                repo_id, scope_kind, scope_name, stack_name, rel_path,
                compose_file, deploy_kind, sops_status, iac_enabled, last_scan_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, true, now())
            ON CONFLICT (repo_id, scope_kind, scope_name, stack_name) DO UPDATE SET
                rel_path = EXCLUDED.rel_path,
                compose_file = EXCLUDED.compose_file,
                deploy_kind = EXCLUDED.deploy_kind,
                sops_status = EXCLUDED.sops_status,
                last_scan_at = now()
            RETURNING *
            "#,
        )
        .bind(repo_id)
        .bind(scope_kind.as_str())
        .bind(scope_name)
        .bind(stack_name)
        .bind(rel_path)
        .bind(compose_file)
        .bind(deploy_kind.as_str())
        .bind(sops_status.as_str())
        .fetch_one(pool)
        .await
        .map_err(CoreError::from)
    }

    pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<Self>, CoreError> {
        sqlx::query_as::<_, IacStack>("SELECT * FROM iac_stacks WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(CoreError::from)
    }

    pub async fn list_for_repo(pool: &PgPool, repo_id: i64) -> Result<Vec<Self>, CoreError> {
        sqlx::query_as::<_, IacStack>("SELECT * FROM iac_stacks WHERE repo_id = $1")
            .bind(repo_id)
            .fetch_all(pool)
            .await
            .map_err(CoreError::from)
    }

    /// Delete stacks under `repo_id` whose id is not in `seen_ids`.
    /// Children (services, files) cascade; this is the last prune step.
    pub async fn prune_missing(
        pool: &PgPool,
        repo_id: i64,
        seen_ids: &[i64],
    ) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM iac_stacks WHERE repo_id = $1 AND NOT (id = ANY($2))")
            .bind(repo_id)
            .bind(seen_ids)
            .execute(pool)
            .await
            .map_err(CoreError::from)?;
        Ok(result.rows_affected())
    }

    /// Stacks with neither a compose file nor any tracked files. Per the
    /// resolution of the "no files but compose field set" open question,
    /// these are pruned rather than flagged — callers should log before
    /// deleting.
    pub async fn find_empty(pool: &PgPool, repo_id: i64) -> Result<Vec<Self>, CoreError> {
        sqlx::query_as::<_, IacStack>(
            r#"
            SELECT s.* FROM iac_stacks s
            WHERE s.repo_id = $1
              AND s.compose_file IS NULL
              AND NOT EXISTS (SELECT 1 FROM iac_files f WHERE f.stack_id = s.id)
            "#,
        )
        .bind(repo_id)
        .fetch_all(pool)
        .await
        .map_err(CoreError::from)
    }

    /// Remove a single stack by id, e.g. after [`Self::find_empty`] flags
    /// it. Children cascade via the foreign key.
    pub async fn delete(pool: &PgPool, id: i64) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM iac_stacks WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await
            .map_err(CoreError::from)?;
        Ok(())
    }

    pub async fn set_auto_devops_override(
        pool: &PgPool,
        id: i64,
        value: Option<&str>,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE iac_stacks SET auto_devops_override = $1 WHERE id = $2")
            .bind(value)
            .bind(id)
            .execute(pool)
            .await
            .map_err(CoreError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::iac_repo::IacRepo;

    #[test]
    fn sops_status_summarize() {
        assert_eq!(SopsStatus::summarize(0, 0), SopsStatus::None);
        assert_eq!(SopsStatus::summarize(3, 0), SopsStatus::None);
        assert_eq!(SopsStatus::summarize(3, 3), SopsStatus::All);
        assert_eq!(SopsStatus::summarize(3, 1), SopsStatus::Partial);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn upsert_and_prune(pool: PgPool) {
        let repo = IacRepo::upsert(&pool, "compose", "/data/docker-compose")
            .await
            .unwrap();

        let s1 = IacStack::upsert(
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

        let s2 = IacStack::upsert(
            &pool,
            repo.id,
            ScopeKind::Host,
            "h1",
            "db",
            "h1/db",
            Some("docker-compose.yml"),
            DeployKind::Compose,
            SopsStatus::None,
        )
        .await
        .unwrap();

        assert_eq!(IacStack::list_for_repo(&pool, repo.id).await.unwrap().len(), 2);

        let pruned = IacStack::prune_missing(&pool, repo.id, &[s1.id]).await.unwrap();
        assert_eq!(pruned, 1);

        let remaining = IacStack::list_for_repo(&pool, repo.id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, s1.id);
        let _ = s2;
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn find_empty_detects_stacks_with_no_files(pool: PgPool) {
        let repo = IacRepo::upsert(&pool, "compose", "/data/docker-compose")
            .await
            .unwrap();

        let empty = IacStack::upsert(
            &pool,
            repo.id,
            ScopeKind::Group,
            "prod",
            "orphan",
            "prod/orphan",
            None,
            DeployKind::Unmanaged,
            SopsStatus::None,
        )
        .await
        .unwrap();

        let found = IacStack::find_empty(&pool, repo.id).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, empty.id);
    }
}
