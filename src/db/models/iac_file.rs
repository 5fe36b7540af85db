//! Tracked files under a stack directory: compose file, env files, scripts,
//! and anything else the catalog scanner walked past.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IacFileRole {
    Compose,
    Env,
    Script,
    Other,
}

impl IacFileRole {
    pub fn as_str(self) -> &'static str {
        match self {
            IacFileRole::Compose => "compose",
            IacFileRole::Env => "env",
            IacFileRole::Script => "script",
            IacFileRole::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "compose" => Some(IacFileRole::Compose),
            "env" => Some(IacFileRole::Env),
            "script" => Some(IacFileRole::Script),
            "other" => Some(IacFileRole::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IacFile {
    pub id: i64,
    pub stack_id: i64,
    pub role: String,
    pub rel_path: String,
    pub sops: bool,
    pub sha256_hex: String,
    pub size_bytes: i64,
    pub updated_at: DateTime<Utc>,
}

impl IacFile {
    pub fn role(&self) -> IacFileRole {
        IacFileRole::parse(&self.role).unwrap_or(IacFileRole::Other)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert(
        pool: &PgPool,
        stack_id: i64,
        role: IacFileRole,
        rel_path: &str,
        sops: bool,
        sha256_hex: &str,
        size_bytes: i64,
    ) -> Result<Self, CoreError> {
        sqlx::query_as::<_, IacFile>(
            r#"
            INSERT INTO iac_files (stack_id, role, rel_path, sops, sha256_hex, size_bytes, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, now())
            ON CONFLICT (stack_id, rel_path) DO UPDATE SET
                role = EXCLUDED.role,
                sops = EXCLUDED.sops,
                sha256_hex = EXCLUDED.sha256_hex,
                size_bytes = EXCLUDED.size_bytes,
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(stack_id)
        .bind(role.as_str())
        .bind(rel_path)
        .bind(sops)
        .bind(sha256_hex)
        .bind(size_bytes)
        .fetch_one(pool)
        .await
        .map_err(CoreError::from)
    }

    pub async fn list_for_stack(pool: &PgPool, stack_id: i64) -> Result<Vec<Self>, CoreError> {
        sqlx::query_as::<_, IacFile>(
            "SELECT * FROM iac_files WHERE stack_id = $1 ORDER BY rel_path",
        )
        .bind(stack_id)
        .fetch_all(pool)
        .await
        .map_err(CoreError::from)
    }

    /// Files visible in user-facing listings: anything that isn't a
    /// `.comments.json` sidecar.
    pub async fn list_for_stack_visible(
        pool: &PgPool,
        stack_id: i64,
    ) -> Result<Vec<Self>, CoreError> {
        Ok(Self::list_for_stack(pool, stack_id)
            .await?
            .into_iter()
            .filter(|f| !f.rel_path.ends_with(".comments.json"))
            .collect())
    }

    pub async fn prune_missing(
        pool: &PgPool,
        stack_id: i64,
        seen_rel_paths: &[String],
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "DELETE FROM iac_files WHERE stack_id = $1 AND NOT (rel_path = ANY($2))",
        )
        .bind(stack_id)
        .bind(seen_rel_paths)
        .execute(pool)
        .await
        .map_err(CoreError::from)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::iac_repo::IacRepo;
    use crate::db::models::iac_stack::{DeployKind, IacStack, ScopeKind, SopsStatus};

    async fn sample_stack(pool: &PgPool) -> IacStack {
        let repo = IacRepo::upsert(pool, "compose", "/data/docker-compose")
            .await
            .unwrap();
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

    #[test]
    fn role_round_trips() {
        for role in [
            IacFileRole::Compose,
            IacFileRole::Env,
            IacFileRole::Script,
            IacFileRole::Other,
        ] {
            assert_eq!(IacFileRole::parse(role.as_str()), Some(role));
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn upsert_prune_and_visible_filter(pool: PgPool) {
        let stack = sample_stack(&pool).await;

        IacFile::upsert(
            &pool,
            stack.id,
            IacFileRole::Compose,
            "docker-compose.yml",
            false,
            "deadbeef",
            512,
        )
        .await
        .unwrap();
        IacFile::upsert(
            &pool,
            stack.id,
            IacFileRole::Other,
            ".comments.json",
            false,
            "cafef00d",
            64,
        )
        .await
        .unwrap();

        let all = IacFile::list_for_stack(&pool, stack.id).await.unwrap();
        assert_eq!(all.len(), 2);

        let visible = IacFile::list_for_stack_visible(&pool, stack.id).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].rel_path, "docker-compose.yml");

        let pruned = IacFile::prune_missing(&pool, stack.id, &["docker-compose.yml".to_string()])
            .await
            .unwrap();
        assert_eq!(pruned, 1);
    }
}
